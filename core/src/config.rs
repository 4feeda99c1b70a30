//! Estimator configuration and its file formats.
//!
//! An [`EstimatorConfig`] selects the process model and provides the prior,
//! the initial covariance, the process noise rate and the default measurement
//! noise. It can be stored as JSON, YAML or TOML; the format is chosen from
//! the file extension.
//!
//! ```toml
//! process_model = "velocities"
//!
//! [initial_state]
//! position = [0.0, 0.0, -0.5]
//! orientation = [1.0, 0.0, 0.0, 0.0]
//!
//! [initial_covariance]
//! position = 1.0
//! orientation = 0.1
//! linear_velocity = 0.25
//! angular_velocity = 0.1
//! ```

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;
use crate::kalman::ExtendedKalmanFilter;
use crate::process::ProcessModel;
use crate::state::{
    ANGULAR_VELOCITY, InitialState, LINEAR_VELOCITY, ORIENTATION, POSITION, VehicleState,
};

/// Per-block variances used to build diagonal state covariances.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateNoise {
    /// Variance of each position component (m², or m²/s for process noise)
    pub position: f64,
    /// Variance of each quaternion component
    pub orientation: f64,
    /// Variance of each linear velocity component
    #[serde(default)]
    pub linear_velocity: f64,
    /// Variance of each angular velocity component
    #[serde(default)]
    pub angular_velocity: f64,
}

impl StateNoise {
    /// Diagonal covariance sized for `model`.
    pub fn to_matrix(&self, model: ProcessModel) -> DMatrix<f64> {
        let mut diagonal = DVector::<f64>::zeros(model.dimension());
        diagonal.rows_mut(POSITION, 3).fill(self.position);
        diagonal.rows_mut(ORIENTATION, 4).fill(self.orientation);
        if model.has_twist() {
            diagonal.rows_mut(LINEAR_VELOCITY, 3).fill(self.linear_velocity);
            diagonal.rows_mut(ANGULAR_VELOCITY, 3).fill(self.angular_velocity);
        }
        DMatrix::from_diagonal(&diagonal)
    }

    fn validate(&self, name: &str) -> Result<(), EstimatorError> {
        for (block, value) in [
            ("position", self.position),
            ("orientation", self.orientation),
            ("linear_velocity", self.linear_velocity),
            ("angular_velocity", self.angular_velocity),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EstimatorError::Configuration(format!(
                    "{}.{} must be a finite, non-negative variance (got {})",
                    name, block, value
                )));
            }
        }
        Ok(())
    }
}

/// Default measurement noise (standard deviations) for sources that do not
/// report their own.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MeasurementNoise {
    pub position_std: f64,
    pub orientation_std: f64,
    pub velocity_std: f64,
    pub depth_std: f64,
}

impl Default for MeasurementNoise {
    fn default() -> Self {
        MeasurementNoise {
            position_std: 0.05,
            orientation_std: 0.02,
            velocity_std: 0.05,
            depth_std: 0.02,
        }
    }
}

impl MeasurementNoise {
    fn validate(&self) -> Result<(), EstimatorError> {
        for (name, value) in [
            ("position_std", self.position_std),
            ("orientation_std", self.orientation_std),
            ("velocity_std", self.velocity_std),
            ("depth_std", self.depth_std),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EstimatorError::Configuration(format!(
                    "measurement_noise.{} must be finite and non-negative (got {})",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

fn default_initial_covariance() -> StateNoise {
    StateNoise {
        position: 1.0,
        orientation: 0.1,
        linear_velocity: 0.25,
        angular_velocity: 0.1,
    }
}

fn default_process_noise() -> StateNoise {
    StateNoise {
        position: 1e-2,
        orientation: 1e-3,
        linear_velocity: 1e-2,
        angular_velocity: 1e-2,
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Propagation equations; immutable for the lifetime of a filter.
    #[serde(default)]
    pub process_model: ProcessModel,
    /// Prior the estimator starts from and returns to on reset.
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default = "default_initial_covariance")]
    pub initial_covariance: StateNoise,
    /// Process noise rate, scaled by the elapsed time on every prediction.
    #[serde(default = "default_process_noise")]
    pub process_noise: StateNoise,
    #[serde(default)]
    pub measurement_noise: MeasurementNoise,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig {
            process_model: ProcessModel::default(),
            initial_state: InitialState::default(),
            initial_covariance: default_initial_covariance(),
            process_noise: default_process_noise(),
            measurement_noise: MeasurementNoise::default(),
        }
    }
}

impl EstimatorConfig {
    pub fn with_process_model(mut self, process_model: ProcessModel) -> Self {
        self.process_model = process_model;
        self
    }

    /// Reject values that would make the filter meaningless.
    pub fn validate(&self) -> Result<(), EstimatorError> {
        self.initial_covariance.validate("initial_covariance")?;
        self.process_noise.validate("process_noise")?;
        self.measurement_noise.validate()?;
        self.prior().map(|_| ()).map_err(|e| {
            EstimatorError::Configuration(format!("initial_state: {}", e))
        })
    }

    /// Prior state in the layout of the configured model.
    pub fn prior(&self) -> Result<VehicleState, EstimatorError> {
        let values = self
            .initial_state
            .position
            .iter()
            .chain(self.initial_state.linear_velocity.iter())
            .chain(self.initial_state.angular_velocity.iter());
        if values.into_iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("initial_state".to_string()));
        }
        self.initial_state
            .to_state(self.process_model.has_twist())
    }

    pub fn initial_covariance_matrix(&self) -> DMatrix<f64> {
        self.initial_covariance.to_matrix(self.process_model)
    }

    pub fn process_noise_matrix(&self) -> DMatrix<f64> {
        self.process_noise.to_matrix(self.process_model)
    }

    /// Validate and build a filter at the configured prior.
    pub fn build_filter(&self) -> Result<ExtendedKalmanFilter, EstimatorError> {
        self.validate()?;
        ExtendedKalmanFilter::new(
            self.process_model,
            self.prior()?,
            self.initial_covariance_matrix(),
            self.process_noise_matrix(),
        )
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }

    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }

    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "hippocampus-config-{}-{}",
            std::process::id(),
            name
        ))
    }

    #[test]
    fn default_is_valid() {
        let config = EstimatorConfig::default();
        config.validate().unwrap();
        assert_eq!(config.process_model, ProcessModel::Simple);
        assert_eq!(config.initial_covariance_matrix().shape(), (7, 7));
        let velocities = config.with_process_model(ProcessModel::Velocities);
        let q = velocities.process_noise_matrix();
        assert_eq!(q.shape(), (13, 13));
        assert_approx_eq!(q[(LINEAR_VELOCITY, LINEAR_VELOCITY)], 1e-2);
        assert_approx_eq!(q[(ORIENTATION, ORIENTATION)], 1e-3);
    }

    #[test]
    fn negative_variance_rejected() {
        let mut config = EstimatorConfig::default();
        config.process_noise.position = -1.0;
        assert!(matches!(
            config.validate(),
            Err(EstimatorError::Configuration(_))
        ));
    }

    #[test]
    fn zero_quaternion_rejected() {
        let mut config = EstimatorConfig::default();
        config.initial_state.orientation = [0.0; 4];
        assert!(matches!(
            config.build_filter(),
            Err(EstimatorError::Configuration(_))
        ));
    }

    #[test]
    fn unknown_process_model_rejected() {
        let err = toml::from_str::<EstimatorConfig>("process_model = \"ukf\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn partial_toml_uses_defaults() {
        let config: EstimatorConfig = toml::from_str(
            "process_model = \"velocities\"\n[initial_state]\nposition = [1.0, 2.0, 3.0]\n",
        )
        .unwrap();
        assert_eq!(config.process_model, ProcessModel::Velocities);
        assert_eq!(config.initial_state.orientation, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(config.measurement_noise, MeasurementNoise::default());
        let ekf = config.build_filter().unwrap();
        assert_eq!(ekf.state_size(), 13);
        assert_approx_eq!(ekf.state().position.z, 3.0);
    }

    #[test]
    fn file_round_trips() {
        let config = EstimatorConfig::default().with_process_model(ProcessModel::Velocities);
        for ext in ["json", "yaml", "toml"] {
            let path = temp_path(&format!("round-trip.{}", ext));
            config.to_file(&path).unwrap();
            let loaded = EstimatorConfig::from_file(&path).unwrap();
            assert_eq!(loaded, config);
            let _ = std::fs::remove_file(&path);
        }
    }

    #[test]
    fn unsupported_extension() {
        let err = EstimatorConfig::default()
            .to_file(temp_path("config.ini"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        let err = EstimatorConfig::from_file("config.xml").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
