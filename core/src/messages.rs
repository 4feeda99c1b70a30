//! Timestamped measurements and the queue that orders them.
//!
//! Measurements may arrive out of order from different sensors. The
//! [`MeasurementQueue`] hands them back in timestamp order, with arrival order
//! breaking ties, so the single writer owning the filter can apply them
//! deterministically.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt::{self, Debug};

use crate::measurements::MeasurementModel;

/// A measurement together with the time it was taken.
///
/// ## Example
///
/// ```
/// use hippocampus::messages::TimedMeasurement;
/// use hippocampus::measurements::DepthMeasurement;
///
/// let depth = TimedMeasurement::new(1.25, DepthMeasurement { depth: -0.4, noise_std: 0.01 });
/// assert_eq!(depth.stamp_s, 1.25);
/// ```
pub struct TimedMeasurement {
    /// Measurement time (seconds)
    pub stamp_s: f64,
    pub meas: Box<dyn MeasurementModel + Send>,
}

impl TimedMeasurement {
    pub fn new<M: MeasurementModel + Send>(stamp_s: f64, meas: M) -> Self {
        TimedMeasurement {
            stamp_s,
            meas: Box::new(meas),
        }
    }
}

impl Debug for TimedMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimedMeasurement")
            .field("stamp_s", &self.stamp_s)
            .field("meas", &self.meas)
            .finish()
    }
}

/// An input to the estimator, in the order it was produced.
#[derive(Debug)]
pub enum Event {
    /// Advance the estimate to `stamp_s`, applying queued measurements on the way.
    Predict { stamp_s: f64 },
    /// A new measurement to queue.
    Measurement(TimedMeasurement),
}

impl Event {
    pub fn stamp_s(&self) -> f64 {
        match self {
            Event::Predict { stamp_s } => *stamp_s,
            Event::Measurement(m) => m.stamp_s,
        }
    }
}

struct QueueEntry {
    sequence: u64,
    measurement: TimedMeasurement,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // reversed: BinaryHeap is a max-heap, the earliest stamp must pop first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .measurement
            .stamp_s
            .total_cmp(&self.measurement.stamp_s)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Min-heap of measurements keyed on timestamp.
#[derive(Default)]
pub struct MeasurementQueue {
    heap: BinaryHeap<QueueEntry>,
    next_sequence: u64,
}

impl Debug for MeasurementQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeasurementQueue")
            .field("len", &self.heap.len())
            .field("oldest_s", &self.oldest_stamp())
            .finish()
    }
}

impl MeasurementQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, measurement: TimedMeasurement) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(QueueEntry {
            sequence,
            measurement,
        });
    }

    /// Stamp of the earliest queued measurement.
    pub fn oldest_stamp(&self) -> Option<f64> {
        self.heap.peek().map(|e| e.measurement.stamp_s)
    }

    /// Pop the earliest measurement if it was taken at or before `stamp_s`.
    pub fn pop_until(&mut self, stamp_s: f64) -> Option<TimedMeasurement> {
        match self.oldest_stamp() {
            Some(oldest) if oldest <= stamp_s => self.heap.pop().map(|e| e.measurement),
            _ => None,
        }
    }

    /// Pop the earliest measurement regardless of its stamp.
    pub fn pop(&mut self) -> Option<TimedMeasurement> {
        self.heap.pop().map(|e| e.measurement)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
