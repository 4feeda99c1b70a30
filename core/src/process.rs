//! Process models and the state predictor.
//!
//! Two propagation models are supported and selected once when a filter is
//! constructed:
//!
//! - [`ProcessModel::Simple`]: random walk. The predicted state equals the
//!   prior state and the covariance grows by the process noise,
//!   $P^- = P + Q\\,\Delta t$.
//! - [`ProcessModel::Velocities`]: constant-velocity point mass. Position
//!   integrates the world-frame linear velocity, orientation integrates the
//!   body angular rate, velocities are held. The covariance is propagated
//!   through the Jacobian, $P^- = F P F^T + Q\\,\Delta t$.
//!
//! The process noise `Q` is a rate: its entries are variances per second.

use std::fmt::{self, Display};
use std::str::FromStr;

use clap::ValueEnum;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;
use crate::linalg::symmetrize;
use crate::linearize::{
    rotation_increment, simple_transition_jacobian, velocities_transition_jacobian,
};
use crate::state::{POSE_DIMENSION, TWIST_DIMENSION, VehicleState};

/// Selectable propagation equations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ProcessModel {
    /// Identity propagation, process noise only.
    #[default]
    Simple,
    /// Constant linear and angular velocity.
    Velocities,
}

impl Display for ProcessModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessModel::Simple => write!(f, "simple"),
            ProcessModel::Velocities => write!(f, "velocities"),
        }
    }
}

impl FromStr for ProcessModel {
    type Err = EstimatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(ProcessModel::Simple),
            "velocities" => Ok(ProcessModel::Velocities),
            other => Err(EstimatorError::Configuration(format!(
                "unknown process_model '{}' (expected 'simple' or 'velocities')",
                other
            ))),
        }
    }
}

impl ProcessModel {
    /// Length of the state vector this model propagates.
    pub fn dimension(&self) -> usize {
        match self {
            ProcessModel::Simple => POSE_DIMENSION,
            ProcessModel::Velocities => TWIST_DIMENSION,
        }
    }

    /// Whether the state carries linear and angular velocities.
    pub fn has_twist(&self) -> bool {
        matches!(self, ProcessModel::Velocities)
    }

    /// Check that a state has the layout this model expects.
    pub fn check_state(&self, state: &VehicleState) -> Result<(), EstimatorError> {
        if state.dimension() != self.dimension() {
            return Err(EstimatorError::InvalidInput(format!(
                "{} model expects a {}-element state, got {}",
                self,
                self.dimension(),
                state.dimension()
            )));
        }
        Ok(())
    }

    /// Propagate the mean forward by `dt` seconds.
    pub fn propagate(&self, state: &VehicleState, dt: f64) -> VehicleState {
        match self {
            ProcessModel::Simple => state.clone(),
            ProcessModel::Velocities => {
                let mut next = state.clone();
                if let Some(twist) = &state.twist {
                    next.position += twist.linear * dt;
                    next.orientation = state.orientation * rotation_increment(&twist.angular, dt);
                }
                next
            }
        }
    }

    /// Propagate a flattened state vector. Invalid vectors are returned unchanged.
    pub fn propagate_vector(&self, x: &DVector<f64>, dt: f64) -> DVector<f64> {
        match VehicleState::from_vector(x) {
            Ok(state) => self.propagate(&state, dt).to_vector(),
            Err(_) => x.clone(),
        }
    }

    /// State transition Jacobian evaluated at the prior state.
    pub fn jacobian(&self, state: &VehicleState, dt: f64) -> DMatrix<f64> {
        match self {
            ProcessModel::Simple => simple_transition_jacobian(self.dimension()),
            ProcessModel::Velocities => velocities_transition_jacobian(state, dt),
        }
    }
}

/// Advance a state and its covariance by `dt` seconds.
///
/// A zero time step returns the inputs unchanged. Negative or non-finite time
/// steps, and states or matrices whose size does not match the model, fail
/// with [`EstimatorError::InvalidInput`].
///
/// # Arguments
/// * `model` - Process model selecting the state layout and transition.
/// * `state` - Prior state.
/// * `covariance` - Prior covariance, `model.dimension()` square.
/// * `process_noise` - Process noise rate Q, scaled by `dt`.
/// * `dt` - Elapsed time in seconds.
///
/// # Returns
/// * The predicted state and its symmetrized covariance.
pub fn predict(
    model: ProcessModel,
    state: &VehicleState,
    covariance: &DMatrix<f64>,
    process_noise: &DMatrix<f64>,
    dt: f64,
) -> Result<(VehicleState, DMatrix<f64>), EstimatorError> {
    if !dt.is_finite() || dt < 0.0 {
        return Err(EstimatorError::InvalidInput(format!(
            "elapsed time must be finite and non-negative, got {}",
            dt
        )));
    }
    model.check_state(state)?;
    let n = model.dimension();
    if covariance.shape() != (n, n) || process_noise.shape() != (n, n) {
        return Err(EstimatorError::InvalidInput(format!(
            "{} model expects {}x{} covariance and process noise, got {:?} and {:?}",
            model,
            n,
            n,
            covariance.shape(),
            process_noise.shape()
        )));
    }
    if dt == 0.0 {
        return Ok((state.clone(), covariance.clone()));
    }

    let predicted_covariance = match model {
        ProcessModel::Simple => covariance + process_noise * dt,
        ProcessModel::Velocities => {
            let f = model.jacobian(state, dt);
            &f * covariance * f.transpose() + process_noise * dt
        }
    };
    let predicted_state = model.propagate(state, dt);
    Ok((predicted_state, symmetrize(&predicted_covariance)))
}
