//! Estimator context: lifecycle, measurement ordering and reset handling.
//!
//! A [`Localization`] owns everything one vehicle's estimator needs: the
//! filter, the queue of pending measurements, the configuration it was built
//! from and the time of the last applied prediction. Nothing is global, so
//! several vehicles can be estimated side by side in one process.
//!
//! ## Measurement ordering
//!
//! Measurements are queued and applied in timestamp order when the estimator
//! is advanced. A measurement stamped earlier than the last applied
//! prediction is rejected with [`EstimatorError::StaleMeasurement`]; the
//! estimator never rolls its state back.

use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};

use crate::NavigationFilter;
use crate::config::EstimatorConfig;
use crate::error::EstimatorError;
use crate::kalman::ExtendedKalmanFilter;
use crate::messages::{Event, MeasurementQueue, TimedMeasurement};
use crate::state::Twist;

/// Snapshot of the estimate, as published on the pose output.
#[derive(Clone, Debug, PartialEq)]
pub struct PoseEstimate {
    pub stamp_s: f64,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub twist: Option<Twist>,
    pub covariance_diagonal: Vec<f64>,
}

/// Outcome of advancing the estimator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepSummary {
    /// Measurements fused into the estimate
    pub applied: usize,
    /// Measurements skipped with the error that caused it
    pub skipped: Vec<EstimatorError>,
}

/// Running counters over the estimator lifetime (cleared on reset).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalizationStats {
    pub predictions: u64,
    pub updates: u64,
    pub stale: u64,
    pub singular: u64,
    pub non_finite: u64,
    pub incompatible: u64,
}

#[derive(Debug)]
pub struct Localization {
    vehicle_name: String,
    config: EstimatorConfig,
    filter: ExtendedKalmanFilter,
    queue: MeasurementQueue,
    last_applied_s: Option<f64>,
    stats: LocalizationStats,
}

impl Localization {
    /// Build an estimator at the configured prior.
    pub fn new(vehicle_name: &str, config: EstimatorConfig) -> Result<Self, EstimatorError> {
        let filter = config.build_filter()?;
        info!(
            "[{}] Localization initialized with {} process model",
            vehicle_name, config.process_model
        );
        Ok(Localization {
            vehicle_name: vehicle_name.to_string(),
            config,
            filter,
            queue: MeasurementQueue::new(),
            last_applied_s: None,
            stats: LocalizationStats::default(),
        })
    }

    pub fn vehicle_name(&self) -> &str {
        &self.vehicle_name
    }

    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    pub fn filter(&self) -> &ExtendedKalmanFilter {
        &self.filter
    }

    pub fn stats(&self) -> &LocalizationStats {
        &self.stats
    }

    /// Time of the last applied prediction, `None` before the first one.
    pub fn last_applied_s(&self) -> Option<f64> {
        self.last_applied_s
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue a measurement for the next [`Localization::advance_to`].
    pub fn enqueue(&mut self, measurement: TimedMeasurement) -> Result<(), EstimatorError> {
        if !measurement.stamp_s.is_finite() {
            return Err(EstimatorError::InvalidInput(format!(
                "measurement stamp must be finite, got {}",
                measurement.stamp_s
            )));
        }
        if let Some(last_applied_s) = self.last_applied_s
            && measurement.stamp_s < last_applied_s
        {
            self.stats.stale += 1;
            let err = EstimatorError::StaleMeasurement {
                stamp_s: measurement.stamp_s,
                last_applied_s,
            };
            warn!("[{}] Dropping measurement: {}", self.vehicle_name, err);
            return Err(err);
        }
        self.queue.push(measurement);
        Ok(())
    }

    /// Apply every queued measurement stamped at or before `stamp_s` in
    /// timestamp order, then predict forward to `stamp_s`.
    ///
    /// # Arguments
    /// * `stamp_s` - Time (s) to advance the estimate to.
    ///
    /// # Returns
    /// * `Ok(StepSummary)` - Number of fused measurements and the errors of
    ///   the skipped ones. Recoverable failures (while predicting to a
    ///   measurement's stamp or while fusing it) are logged, counted and
    ///   reported here; the estimate keeps its prior for those measurements.
    /// * `Err(EstimatorError)` - The final prediction to `stamp_s` failed;
    ///   the estimate and clock are left as they were after the last
    ///   successful step.
    pub fn advance_to(&mut self, stamp_s: f64) -> Result<StepSummary, EstimatorError> {
        let mut summary = StepSummary::default();
        while let Some(measurement) = self.queue.pop_until(stamp_s) {
            let result = self
                .predict_to(measurement.stamp_s)
                .and_then(|()| self.filter.update(&*measurement.meas));
            match result {
                Ok(report) => {
                    self.stats.updates += 1;
                    summary.applied += 1;
                    debug!(
                        "[{}] Fused {:?} at t={:.3} (NIS {:.3})",
                        self.vehicle_name,
                        measurement.meas,
                        measurement.stamp_s,
                        report.normalized_innovation_squared
                    );
                }
                Err(err) => {
                    self.count_failure(&err);
                    warn!(
                        "[{}] Skipping measurement at t={:.3}: {}",
                        self.vehicle_name, measurement.stamp_s, err
                    );
                    summary.skipped.push(err);
                }
            }
        }
        self.predict_to(stamp_s)?;
        Ok(summary)
    }

    fn count_failure(&mut self, err: &EstimatorError) {
        match err {
            EstimatorError::SingularCovariance => self.stats.singular += 1,
            EstimatorError::NonFinite(_) => self.stats.non_finite += 1,
            EstimatorError::IncompatibleModel(_) => self.stats.incompatible += 1,
            _ => {}
        }
    }

    fn predict_to(&mut self, stamp_s: f64) -> Result<(), EstimatorError> {
        if !stamp_s.is_finite() {
            return Err(EstimatorError::InvalidInput(format!(
                "prediction stamp must be finite, got {}",
                stamp_s
            )));
        }
        if let Some(last_applied_s) = self.last_applied_s {
            let dt = stamp_s - last_applied_s;
            self.filter.predict(dt)?;
            if dt > 0.0 {
                self.stats.predictions += 1;
            }
        }
        self.last_applied_s = Some(stamp_s);
        Ok(())
    }

    /// Dispatch a single event.
    pub fn handle(&mut self, event: Event) -> Result<StepSummary, EstimatorError> {
        match event {
            Event::Predict { stamp_s } => self.advance_to(stamp_s),
            Event::Measurement(measurement) => {
                self.enqueue(measurement)?;
                Ok(StepSummary::default())
            }
        }
    }

    /// Return to the configured prior and drop pending measurements.
    pub fn reset(&mut self) -> Result<(), EstimatorError> {
        let prior = self.config.prior()?;
        self.filter
            .set_estimate(prior, self.config.initial_covariance_matrix())?;
        self.filter
            .set_process_noise(self.config.process_noise_matrix())?;
        self.queue.clear();
        self.last_applied_s = None;
        self.stats = LocalizationStats::default();
        info!("[{}] Localization reset to prior", self.vehicle_name);
        Ok(())
    }

    /// Change noise parameters and the prior while keeping the current estimate.
    ///
    /// Switching the process model changes the state dimension and is rejected
    /// with [`EstimatorError::IncompatibleModel`]; use
    /// [`Localization::reset_with`] instead. A rejected request leaves the
    /// running estimator untouched.
    pub fn reconfigure(&mut self, config: EstimatorConfig) -> Result<(), EstimatorError> {
        if config.process_model != self.config.process_model {
            let err = EstimatorError::IncompatibleModel(format!(
                "switching from {} to {} requires a reset",
                self.config.process_model, config.process_model
            ));
            warn!("[{}] Reconfiguration rejected: {}", self.vehicle_name, err);
            return Err(err);
        }
        config.validate()?;
        self.filter
            .set_process_noise(config.process_noise_matrix())?;
        self.config = config;
        info!("[{}] Localization reconfigured", self.vehicle_name);
        Ok(())
    }

    /// Replace the configuration, including the process model, and reset.
    pub fn reset_with(&mut self, config: EstimatorConfig) -> Result<(), EstimatorError> {
        let filter = config.build_filter()?;
        info!(
            "[{}] Localization reset with {} process model",
            self.vehicle_name, config.process_model
        );
        self.filter = filter;
        self.config = config;
        self.queue.clear();
        self.last_applied_s = None;
        self.stats = LocalizationStats::default();
        Ok(())
    }

    /// Current estimate, stamped with the last applied prediction time.
    pub fn estimate(&self) -> PoseEstimate {
        let state = self.filter.state();
        let (roll, pitch, yaw) = state.orientation.euler_angles();
        PoseEstimate {
            stamp_s: self.last_applied_s.unwrap_or(0.0),
            position: state.position,
            orientation: state.orientation,
            roll,
            pitch,
            yaw,
            twist: state.twist,
            covariance_diagonal: self.filter.get_certainty().diagonal().iter().copied().collect(),
        }
    }
}
