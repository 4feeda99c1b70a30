//! Error type shared by the estimator, its lifecycle and the launch layer.

use std::fmt;
use std::io;

/// Errors reported by the localization toolbox.
///
/// Numerical variants (`SingularCovariance`, `NonFinite`) and `StaleMeasurement`
/// are recoverable: the estimator keeps its prior estimate and continues.
#[derive(Debug, Clone, PartialEq)]
pub enum EstimatorError {
    /// Malformed argument, e.g. a negative time step or a state layout that
    /// does not match the process model.
    InvalidInput(String),
    /// The innovation covariance could not be inverted.
    SingularCovariance,
    /// A measurement is older than the last applied prediction.
    StaleMeasurement { stamp_s: f64, last_applied_s: f64 },
    /// The request is not compatible with the active process model.
    IncompatibleModel(String),
    /// NaN or infinity found in a measurement or in an updated estimate.
    NonFinite(String),
    /// Startup configuration is missing or invalid.
    Configuration(String),
    /// I/O failure while reading or writing configuration or data files.
    Io(String),
    /// The localization worker is no longer running.
    Disconnected(String),
}

impl fmt::Display for EstimatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorError::InvalidInput(msg) => write!(f, "invalid input: {}", msg),
            EstimatorError::SingularCovariance => {
                write!(f, "innovation covariance is singular")
            }
            EstimatorError::StaleMeasurement {
                stamp_s,
                last_applied_s,
            } => write!(
                f,
                "stale measurement at t={:.6} s (estimator already at t={:.6} s)",
                stamp_s, last_applied_s
            ),
            EstimatorError::IncompatibleModel(msg) => write!(f, "incompatible model: {}", msg),
            EstimatorError::NonFinite(msg) => write!(f, "non-finite value: {}", msg),
            EstimatorError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            EstimatorError::Io(msg) => write!(f, "I/O error: {}", msg),
            EstimatorError::Disconnected(msg) => write!(f, "disconnected: {}", msg),
        }
    }
}

impl std::error::Error for EstimatorError {}

impl From<io::Error> for EstimatorError {
    fn from(err: io::Error) -> Self {
        EstimatorError::Io(err.to_string())
    }
}

impl EstimatorError {
    /// True for failures that leave the estimator usable with its prior estimate.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            EstimatorError::SingularCovariance
                | EstimatorError::NonFinite(_)
                | EstimatorError::StaleMeasurement { .. }
        )
    }
}
