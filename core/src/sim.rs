//! Replay of recorded measurements and synthetic data generation.
//!
//! A replay file is a CSV of [`MeasurementRecord`]s. Measurement rows are
//! queued on the estimator, `predict` rows advance it and produce one
//! [`NavigationResult`] each:
//!
//! ```text
//! time,kind,x,y,z,qw,qx,qy,qz,noise_std,orientation_noise_std
//! 0.0,pose,0.0,0.0,-0.5,1.0,0.0,0.0,0.0,0.05,0.02
//! 0.0,predict,,,,,,,,,
//! 0.1,depth,,,-0.52,,,,,0.01,
//! 0.1,predict,,,,,,,,,
//! ```
//!
//! Empty noise columns fall back to the configured measurement noise.
use std::fmt::{self, Display};
use std::io;
use std::path::Path;

use log::{debug, warn};
use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::MeasurementNoise;
use crate::error::EstimatorError;
use crate::localization::{Localization, PoseEstimate};
use crate::measurements::{
    DepthMeasurement, OrientationMeasurement, PoseMeasurement, PositionMeasurement,
    VelocityMeasurement,
};
use crate::messages::{Event, TimedMeasurement};

/// Row type of a replay file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Advance the estimator to the row's time
    Predict,
    Pose,
    Position,
    Orientation,
    Velocity,
    Depth,
}

impl Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordKind::Predict => "predict",
            RecordKind::Pose => "pose",
            RecordKind::Position => "position",
            RecordKind::Orientation => "orientation",
            RecordKind::Velocity => "velocity",
            RecordKind::Depth => "depth",
        };
        write!(f, "{}", name)
    }
}

/// One row of a replay file.
///
/// `x`, `y`, `z` carry the position (or the velocity for `velocity` rows);
/// `depth` rows use `z`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Time (s)
    pub time: f64,
    pub kind: RecordKind,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub qw: Option<f64>,
    pub qx: Option<f64>,
    pub qy: Option<f64>,
    pub qz: Option<f64>,
    pub noise_std: Option<f64>,
    pub orientation_noise_std: Option<f64>,
}

impl MeasurementRecord {
    /// A row carrying no values, filled in by the caller.
    pub fn new(time: f64, kind: RecordKind) -> Self {
        MeasurementRecord {
            time,
            kind,
            x: None,
            y: None,
            z: None,
            qw: None,
            qx: None,
            qy: None,
            qz: None,
            noise_std: None,
            orientation_noise_std: None,
        }
    }

    pub fn predict(time: f64) -> Self {
        Self::new(time, RecordKind::Predict)
    }

    pub fn pose(time: f64, position: &Vector3<f64>, orientation: &UnitQuaternion<f64>) -> Self {
        let mut record = Self::new(time, RecordKind::Pose);
        record.set_vector(position);
        record.set_quaternion(orientation);
        record
    }

    fn set_vector(&mut self, v: &Vector3<f64>) {
        self.x = Some(v.x);
        self.y = Some(v.y);
        self.z = Some(v.z);
    }

    fn set_quaternion(&mut self, q: &UnitQuaternion<f64>) {
        let q = q.quaternion();
        self.qw = Some(q.w);
        self.qx = Some(q.i);
        self.qy = Some(q.j);
        self.qz = Some(q.k);
    }

    /// Reads measurement records from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in rdr.deserialize() {
            let record: Self = result?;
            records.push(record);
        }
        Ok(records)
    }

    /// Writes measurement records to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }

    fn field(&self, value: Option<f64>, name: &str) -> Result<f64, EstimatorError> {
        value.ok_or_else(|| {
            EstimatorError::InvalidInput(format!(
                "{} record at t={} is missing '{}'",
                self.kind, self.time, name
            ))
        })
    }

    fn vector(&self) -> Result<Vector3<f64>, EstimatorError> {
        Ok(Vector3::new(
            self.field(self.x, "x")?,
            self.field(self.y, "y")?,
            self.field(self.z, "z")?,
        ))
    }

    fn quaternion(&self) -> Result<UnitQuaternion<f64>, EstimatorError> {
        let q = Quaternion::new(
            self.field(self.qw, "qw")?,
            self.field(self.qx, "qx")?,
            self.field(self.qy, "qy")?,
            self.field(self.qz, "qz")?,
        );
        if !(q.norm() > f64::EPSILON) || !q.norm().is_finite() {
            return Err(EstimatorError::InvalidInput(format!(
                "{} record at t={} has a degenerate quaternion",
                self.kind, self.time
            )));
        }
        Ok(UnitQuaternion::from_quaternion(q))
    }

    /// Convert into an estimator event.
    pub fn to_event(&self, defaults: &MeasurementNoise) -> Result<Event, EstimatorError> {
        Ok(match self.to_measurement(defaults)? {
            Some(measurement) => Event::Measurement(measurement),
            None => Event::Predict { stamp_s: self.time },
        })
    }

    /// Convert into a timestamped measurement. `predict` rows carry none.
    pub fn to_measurement(
        &self,
        defaults: &MeasurementNoise,
    ) -> Result<Option<TimedMeasurement>, EstimatorError> {
        let measurement = match self.kind {
            RecordKind::Predict => return Ok(None),
            RecordKind::Pose => TimedMeasurement::new(
                self.time,
                PoseMeasurement {
                    position: self.vector()?,
                    orientation: self.quaternion()?,
                    position_noise_std: self.noise_std.unwrap_or(defaults.position_std),
                    orientation_noise_std: self
                        .orientation_noise_std
                        .unwrap_or(defaults.orientation_std),
                },
            ),
            RecordKind::Position => TimedMeasurement::new(
                self.time,
                PositionMeasurement {
                    position: self.vector()?,
                    noise_std: self.noise_std.unwrap_or(defaults.position_std),
                },
            ),
            RecordKind::Orientation => TimedMeasurement::new(
                self.time,
                OrientationMeasurement {
                    orientation: self.quaternion()?,
                    noise_std: self
                        .orientation_noise_std
                        .or(self.noise_std)
                        .unwrap_or(defaults.orientation_std),
                },
            ),
            RecordKind::Velocity => TimedMeasurement::new(
                self.time,
                VelocityMeasurement {
                    velocity: self.vector()?,
                    noise_std: self.noise_std.unwrap_or(defaults.velocity_std),
                },
            ),
            RecordKind::Depth => TimedMeasurement::new(
                self.time,
                DepthMeasurement {
                    depth: self.field(self.z, "z")?,
                    noise_std: self.noise_std.unwrap_or(defaults.depth_std),
                },
            ),
        };
        Ok(Some(measurement))
    }
}

/// Estimate written after each prediction of a replay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationResult {
    pub time: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub qw: f64,
    pub qx: f64,
    pub qy: f64,
    pub qz: f64,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub yaw_deg: f64,
    pub vx: Option<f64>,
    pub vy: Option<f64>,
    pub vz: Option<f64>,
    pub var_x: f64,
    pub var_y: f64,
    pub var_z: f64,
    /// Measurements fused since the previous result
    pub applied: usize,
    /// Measurements skipped since the previous result
    pub skipped: usize,
}

impl NavigationResult {
    pub fn from_estimate(estimate: &PoseEstimate, applied: usize, skipped: usize) -> Self {
        let q = estimate.orientation.quaternion();
        let variance = |i: usize| estimate.covariance_diagonal.get(i).copied().unwrap_or(f64::NAN);
        NavigationResult {
            time: estimate.stamp_s,
            x: estimate.position.x,
            y: estimate.position.y,
            z: estimate.position.z,
            qw: q.w,
            qx: q.i,
            qy: q.j,
            qz: q.k,
            roll_deg: estimate.roll.to_degrees(),
            pitch_deg: estimate.pitch.to_degrees(),
            yaw_deg: estimate.yaw.to_degrees(),
            vx: estimate.twist.map(|t| t.linear.x),
            vy: estimate.twist.map(|t| t.linear.y),
            vz: estimate.twist.map(|t| t.linear.z),
            var_x: variance(0),
            var_y: variance(1),
            var_z: variance(2),
            applied,
            skipped,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Writes navigation results to a CSV file.
    pub fn to_csv<P: AsRef<Path>>(results: &[Self], path: P) -> io::Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for result in results {
            writer.serialize(result)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads navigation results from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, Box<dyn std::error::Error>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut results = Vec::new();
        for result in rdr.deserialize() {
            results.push(result?);
        }
        Ok(results)
    }
}

/// Feed records through the estimator in file order.
///
/// Invalid rows, stale measurements and failed predictions are logged and
/// skipped. Measurements still queued after the last row are applied by a
/// final prediction to the latest record time.
///
/// # Arguments
/// * `localization` - Estimator to drive; keeps its state afterwards.
/// * `records` - Measurement and predict rows in file order.
///
/// # Returns
/// * One [`NavigationResult`] per successful predict row.
pub fn run_replay(localization: &mut Localization, records: &[MeasurementRecord]) -> Vec<NavigationResult> {
    let defaults = localization.config().measurement_noise.clone();
    let mut results = Vec::new();
    let mut rejected = 0;
    let mut latest = f64::NEG_INFINITY;

    for record in records {
        latest = latest.max(record.time);
        let event = match record.to_event(&defaults) {
            Ok(event) => event,
            Err(err) => {
                warn!("Skipping record: {}", err);
                rejected += 1;
                continue;
            }
        };
        let is_predict = matches!(event, Event::Predict { .. });
        match localization.handle(event) {
            Ok(summary) if is_predict => {
                results.push(NavigationResult::from_estimate(
                    &localization.estimate(),
                    summary.applied,
                    summary.skipped.len() + rejected,
                ));
                rejected = 0;
            }
            Ok(_) => {}
            // stale measurements are logged by the estimator
            Err(_) if !is_predict => rejected += 1,
            Err(err) => warn!("Prediction to t={} failed: {}", record.time, err),
        }
    }
    if localization.queued() > 0 && latest.is_finite() {
        debug!("Flushing {} queued measurement(s)", localization.queued());
        match localization.advance_to(latest) {
            Ok(summary) => results.push(NavigationResult::from_estimate(
                &localization.estimate(),
                summary.applied,
                summary.skipped.len() + rejected,
            )),
            Err(err) => warn!("Prediction to t={} failed: {}", latest, err),
        }
    }
    results
}

/// Parameters of a synthetic constant-velocity track.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackConfig {
    pub duration_s: f64,
    pub rate_hz: f64,
    pub initial_position: [f64; 3],
    /// World-frame velocity (m/s)
    pub velocity: [f64; 3],
    /// Constant yaw rate (rad/s)
    pub yaw_rate: f64,
    pub position_noise_std: f64,
    pub orientation_noise_std: f64,
    pub seed: u64,
}

impl Default for TrackConfig {
    fn default() -> Self {
        TrackConfig {
            duration_s: 10.0,
            rate_hz: 10.0,
            initial_position: [0.0, 0.0, -0.5],
            velocity: [0.3, 0.0, 0.0],
            yaw_rate: 0.05,
            position_noise_std: 0.05,
            orientation_noise_std: 0.01,
            seed: 42,
        }
    }
}

/// True pose at a sample time.
#[derive(Clone, Debug, PartialEq)]
pub struct TruthSample {
    pub time: f64,
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
}

#[derive(Clone, Debug)]
pub struct SyntheticTrack {
    pub truth: Vec<TruthSample>,
    /// A noisy pose row followed by a predict row at every sample time
    pub records: Vec<MeasurementRecord>,
}

/// Largest number of samples a synthetic track may hold.
pub const MAX_TRACK_SAMPLES: usize = 1_000_000;

/// Generate a seeded track and its noisy visual pose measurements.
///
/// The vehicle moves at constant world-frame velocity and constant yaw rate.
/// Every sample produces a noisy pose row followed by a predict row.
///
/// # Arguments
/// * `config` - Track duration, sample rate, motion, noise and seed.
///
/// # Returns
/// * `Ok(SyntheticTrack)` - The truth and the replay records, identical for
///   identical configurations.
/// * `Err(EstimatorError::InvalidInput)` - A non-positive rate, a negative or
///   non-finite duration, an invalid noise level, or more than
///   [`MAX_TRACK_SAMPLES`] samples.
pub fn synthesize_track(config: &TrackConfig) -> Result<SyntheticTrack, EstimatorError> {
    if !(config.rate_hz > 0.0) || !config.rate_hz.is_finite() {
        return Err(EstimatorError::InvalidInput(format!(
            "rate_hz must be positive, got {}",
            config.rate_hz
        )));
    }
    if !(config.duration_s >= 0.0) || !config.duration_s.is_finite() {
        return Err(EstimatorError::InvalidInput(format!(
            "duration_s must be non-negative, got {}",
            config.duration_s
        )));
    }
    let noise = |std: f64, name: &str| {
        Normal::new(0.0, std).map_err(|e| {
            EstimatorError::InvalidInput(format!("invalid {} ({}): {}", name, std, e))
        })
    };
    let position_noise = noise(config.position_noise_std, "position_noise_std")?;
    let orientation_noise = noise(config.orientation_noise_std, "orientation_noise_std")?;
    let mut rng = StdRng::seed_from_u64(config.seed);

    let p0 = Vector3::from(config.initial_position);
    let velocity = Vector3::from(config.velocity);
    let steps = (config.duration_s * config.rate_hz).round();
    if !steps.is_finite() || steps >= MAX_TRACK_SAMPLES as f64 {
        return Err(EstimatorError::InvalidInput(format!(
            "{} s at {} Hz exceeds {} samples",
            config.duration_s, config.rate_hz, MAX_TRACK_SAMPLES
        )));
    }
    let steps = steps as usize;
    let mut truth = Vec::with_capacity(steps + 1);
    let mut records = Vec::with_capacity(2 * (steps + 1));

    for k in 0..=steps {
        let time = k as f64 / config.rate_hz;
        let position = p0 + velocity * time;
        let orientation = UnitQuaternion::from_euler_angles(0.0, 0.0, config.yaw_rate * time);

        let measured_position = position
            + Vector3::new(
                position_noise.sample(&mut rng),
                position_noise.sample(&mut rng),
                position_noise.sample(&mut rng),
            );
        let perturbation = Vector3::new(
            orientation_noise.sample(&mut rng),
            orientation_noise.sample(&mut rng),
            orientation_noise.sample(&mut rng),
        );
        let measured_orientation = UnitQuaternion::from_scaled_axis(perturbation) * orientation;

        let mut pose = MeasurementRecord::pose(time, &measured_position, &measured_orientation);
        pose.noise_std = Some(config.position_noise_std);
        pose.orientation_noise_std = Some(config.orientation_noise_std);
        records.push(pose);
        records.push(MeasurementRecord::predict(time));
        truth.push(TruthSample {
            time,
            position,
            orientation,
        });
    }
    Ok(SyntheticTrack { truth, records })
}

/// Root mean square position error of results against the truth sampled at the same times.
pub fn rms_position_error(results: &[NavigationResult], truth: &[TruthSample]) -> Option<f64> {
    let mut sum = 0.0;
    let mut count = 0usize;
    for result in results {
        if let Some(sample) = truth.iter().find(|s| (s.time - result.time).abs() < 1e-9) {
            sum += (result.position() - sample.position).norm_squared();
            count += 1;
        }
    }
    (count > 0).then(|| (sum / count as f64).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimatorConfig;
    use crate::process::ProcessModel;
    use assert_approx_eq::assert_approx_eq;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("hippocampus_sim_{}_{}", std::process::id(), name))
    }

    #[test]
    fn record_conversion() {
        let defaults = MeasurementNoise::default();
        assert!(MeasurementRecord::predict(1.0)
            .to_measurement(&defaults)
            .unwrap()
            .is_none());

        let mut depth = MeasurementRecord::new(2.0, RecordKind::Depth);
        depth.z = Some(-0.7);
        let m = depth.to_measurement(&defaults).unwrap().unwrap();
        assert_eq!(m.stamp_s, 2.0);
        assert_eq!(m.meas.get_vector()[0], -0.7);
        assert_approx_eq!(m.meas.get_noise()[(0, 0)], defaults.depth_std.powi(2));

        let incomplete = MeasurementRecord::new(3.0, RecordKind::Position);
        assert!(matches!(
            incomplete.to_measurement(&defaults),
            Err(EstimatorError::InvalidInput(_))
        ));
    }

    #[test]
    fn degenerate_quaternion_is_rejected() {
        let mut record = MeasurementRecord::new(0.0, RecordKind::Orientation);
        record.qw = Some(0.0);
        record.qx = Some(0.0);
        record.qy = Some(0.0);
        record.qz = Some(0.0);
        assert!(record.to_measurement(&MeasurementNoise::default()).is_err());
    }

    #[test]
    fn records_csv_round_trip() {
        let path = temp_path("records.csv");
        let track = synthesize_track(&TrackConfig {
            duration_s: 0.5,
            ..Default::default()
        })
        .unwrap();
        MeasurementRecord::to_csv(&track.records, &path).unwrap();
        let loaded = MeasurementRecord::from_csv(&path).unwrap();
        assert_eq!(loaded.len(), track.records.len());
        assert_eq!(loaded[1].kind, RecordKind::Predict);
        assert_eq!(loaded[1].x, None);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn synthesized_track_is_reproducible() {
        let config = TrackConfig::default();
        let a = synthesize_track(&config).unwrap();
        let b = synthesize_track(&config).unwrap();
        assert_eq!(a.records, b.records);
        assert_eq!(a.truth.len(), 101);
        assert_eq!(a.records.len(), 202);
        assert_approx_eq!(a.truth[100].position.x, 3.0, 1e-9);
    }

    #[test]
    fn invalid_track_config() {
        let config = TrackConfig {
            rate_hz: 0.0,
            ..Default::default()
        };
        assert!(synthesize_track(&config).is_err());
        let config = TrackConfig {
            position_noise_std: -1.0,
            ..Default::default()
        };
        assert!(synthesize_track(&config).is_err());
    }

    #[test]
    fn oversized_track_is_rejected() {
        for (duration_s, rate_hz) in [(1e300, 10.0), (1e6, 1e3), (10.0, 1e300)] {
            let config = TrackConfig {
                duration_s,
                rate_hz,
                ..Default::default()
            };
            assert!(matches!(
                synthesize_track(&config),
                Err(EstimatorError::InvalidInput(_))
            ));
        }
        let config = TrackConfig {
            duration_s: MAX_TRACK_SAMPLES as f64,
            rate_hz: 1.0,
            ..Default::default()
        };
        assert!(synthesize_track(&config).is_err());
    }

    #[test]
    fn replay_tracks_synthetic_truth() {
        let track = synthesize_track(&TrackConfig::default()).unwrap();
        let config = EstimatorConfig::default().with_process_model(ProcessModel::Velocities);
        let mut localization = Localization::new("uuv00", config).unwrap();
        let results = run_replay(&mut localization, &track.records);
        assert_eq!(results.len(), track.truth.len());
        assert!(results.iter().all(|r| r.applied == 1 && r.skipped == 0));
        let rms = rms_position_error(&results, &track.truth).unwrap();
        assert!(rms < 0.1, "rms position error {}", rms);
        let last = results.last().unwrap();
        assert!(last.vx.is_some());
    }

    #[test]
    fn replay_counts_stale_and_flushes_queue() {
        let mut localization = Localization::new("uuv00", EstimatorConfig::default()).unwrap();
        let mut late = MeasurementRecord::new(0.5, RecordKind::Position);
        late.x = Some(1.0);
        late.y = Some(0.0);
        late.z = Some(0.0);
        let mut pending = late.clone();
        pending.time = 2.0;
        let records = vec![MeasurementRecord::predict(1.0), late, pending];
        let results = run_replay(&mut localization, &records);
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].time, 2.0);
        assert_eq!(results[1].applied, 1);
        assert_eq!(results[1].skipped, 1);
    }

    #[test]
    fn results_csv_round_trip() {
        let path = temp_path("results.csv");
        let mut localization = Localization::new("uuv00", EstimatorConfig::default()).unwrap();
        let results = run_replay(&mut localization, &[MeasurementRecord::predict(0.0)]);
        NavigationResult::to_csv(&results, &path).unwrap();
        let loaded = NavigationResult::from_csv(&path).unwrap();
        assert_eq!(loaded, results);
        assert_eq!(loaded[0].vx, None);
        let _ = std::fs::remove_file(path);
    }
}
