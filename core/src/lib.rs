//! Pose estimation toolbox for HippoCampus vehicles
//!
//! This crate provides the localization core that a HippoCampus vehicle launch
//! brings up next to its tf publisher and orientation-conversion nodes: an
//! Extended Kalman Filter over the vehicle pose, the lifecycle object that owns
//! it, and the launch composition that wires everything into a per-vehicle
//! namespace.
//!
//! ## Crate overview
//!
//! - [state]: Vehicle state and its flattened vector layout.
//! - [process]: Selectable process models (`simple`, `velocities`) and the predictor.
//! - [linearize]: Analytic Jacobians of the process and measurement models.
//! - [measurements]: Measurement models (visual pose, position, orientation, velocity, depth).
//! - [kalman]: The Extended Kalman Filter.
//! - [linalg]: Covariance helpers (symmetrization, checked SPD solve, Joseph form).
//! - [messages]: Timestamped measurements and their ordering queue.
//! - [localization]: The estimator context (queueing, reset, reconfiguration).
//! - [config]: Estimator configuration and file formats.
//! - [node]: Parameter server, node helpers and the threaded localization node.
//! - [launch]: Launch arguments and the resolved per-vehicle launch plan.
//! - [sim]: CSV replay and synthetic data generation.
//!
//! ## State definition
//!
//! $$
//! x = [p_x, p_y, p_z, q_w, q_x, q_y, q_z, v_x, v_y, v_z, \omega_x, \omega_y, \omega_z]
//! $$
//!
//! The velocity block is only present with the `velocities` process model. The
//! quaternion is kept at unit norm after every correction.
//!
//! ## Measurement policy
//!
//! Measurements are applied in timestamp order. Anything older than the last
//! applied prediction is rejected as stale; the estimator does not roll back.
pub mod config;
pub mod error;
pub mod kalman;
pub mod launch;
pub mod linalg;
pub mod linearize;
pub mod localization;
pub mod measurements;
pub mod messages;
pub mod node;
pub mod process;
pub mod sim;
pub mod state;

use nalgebra::{DMatrix, DVector};

pub use crate::error::EstimatorError;
use crate::measurements::MeasurementModel;

/// Generic Bayesian navigation filter trait
///
/// Predict and update are fallible: a rejected step must leave the estimate
/// exactly as it was.
pub trait NavigationFilter {
    /// Diagnostics returned by a successful update.
    type Report;
    fn predict(&mut self, dt: f64) -> Result<(), EstimatorError>;
    fn update<M: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &M,
    ) -> Result<Self::Report, EstimatorError>;
    fn get_estimate(&self) -> DVector<f64>;
    fn get_certainty(&self) -> DMatrix<f64>;
}
