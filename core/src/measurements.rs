//! Measurement models fused by the localization filter.
//!
//! This module defines the generic [`MeasurementModel`] trait and the
//! observations a HippoCampus vehicle typically feeds into its estimator:
//! full visual pose fixes (e.g. from fiducial detection on the vertical
//! camera), position-only and orientation-only fixes, linear velocity and
//! pressure depth.

use std::any::Any;
use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};

use crate::linearize;
use crate::state::{LINEAR_VELOCITY, ORIENTATION, POSITION};

/// Generic measurement model trait for all types of measurements
pub trait MeasurementModel: Any + Debug {
    /// Downcast helper method to allow for type-safe downcasting
    fn as_any(&self) -> &dyn Any;
    /// Get the dimension of the measurement vector
    fn get_dimension(&self) -> usize;
    /// Get the measurement in a vector format
    fn get_vector(&self) -> DVector<f64>;
    /// Get the measurement noise characteristics in a matrix format
    fn get_noise(&self) -> DMatrix<f64>;
    /// Get the expected measurements from the state. Measurement model function
    /// that maps the state values to measurement space.
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64>;
    /// Jacobian of [`MeasurementModel::get_expected_measurement`] for a state
    /// of the given dimension.
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64>;
    /// Smallest state dimension this measurement can be applied to.
    fn required_state_dimension(&self) -> usize {
        crate::state::POSE_DIMENSION
    }
    /// Innovation `z − h(x)`.
    fn innovation(&self, expected: &DVector<f64>) -> DVector<f64> {
        self.get_vector() - expected
    }
}

/// Flip the sign of a measured `[w, x, y, z]` block so it lies in the same
/// hemisphere as the expected quaternion; `q` and `−q` are the same rotation.
fn align_quaternion_block(measured: &mut DVector<f64>, expected: &DVector<f64>, offset: usize) {
    let dot: f64 = (0..4)
        .map(|i| measured[offset + i] * expected[offset + i])
        .sum();
    if dot < 0.0 {
        for i in 0..4 {
            measured[offset + i] = -measured[offset + i];
        }
    }
}

fn quaternion_components(q: &UnitQuaternion<f64>) -> [f64; 4] {
    let q = q.quaternion();
    [q.w, q.i, q.j, q.k]
}

/// Full pose fix: position and orientation.
#[derive(Clone, Debug)]
pub struct PoseMeasurement {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    /// Standard deviation of each position component (m)
    pub position_noise_std: f64,
    /// Standard deviation of each quaternion component
    pub orientation_noise_std: f64,
}
impl Display for PoseMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        write!(
            f,
            "PoseMeasurement(pos: [{}, {}, {}], rpy: [{}, {}, {}], pos_noise: {}, ori_noise: {})",
            self.position.x,
            self.position.y,
            self.position.z,
            roll,
            pitch,
            yaw,
            self.position_noise_std,
            self.orientation_noise_std
        )
    }
}
impl MeasurementModel for PoseMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        7
    }
    fn get_vector(&self) -> DVector<f64> {
        let [w, x, y, z] = quaternion_components(&self.orientation);
        DVector::from_vec(vec![
            self.position.x,
            self.position.y,
            self.position.z,
            w,
            x,
            y,
            z,
        ])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        let p = self.position_noise_std.powi(2);
        let o = self.orientation_noise_std.powi(2);
        DMatrix::from_diagonal(&DVector::from_vec(vec![p, p, p, o, o, o, o]))
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        state.rows(POSITION, 7).clone_owned()
    }
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64> {
        linearize::pose_jacobian(state_dimension)
    }
    fn innovation(&self, expected: &DVector<f64>) -> DVector<f64> {
        let mut z = self.get_vector();
        align_quaternion_block(&mut z, expected, 3);
        z - expected
    }
}

/// Position-only fix.
#[derive(Clone, Debug, Default)]
pub struct PositionMeasurement {
    pub position: Vector3<f64>,
    pub noise_std: f64,
}
impl Display for PositionMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PositionMeasurement(x: {}, y: {}, z: {}, noise: {})",
            self.position.x, self.position.y, self.position.z, self.noise_std
        )
    }
}
impl MeasurementModel for PositionMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.position.as_slice())
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::<f64>::identity(3, 3) * self.noise_std.powi(2)
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        state.rows(POSITION, 3).clone_owned()
    }
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64> {
        linearize::position_jacobian(state_dimension)
    }
}

/// Orientation-only fix, e.g. from an AHRS.
#[derive(Clone, Debug)]
pub struct OrientationMeasurement {
    pub orientation: UnitQuaternion<f64>,
    pub noise_std: f64,
}
impl Display for OrientationMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        write!(
            f,
            "OrientationMeasurement(rpy: [{}, {}, {}], noise: {})",
            roll, pitch, yaw, self.noise_std
        )
    }
}
impl MeasurementModel for OrientationMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        4
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(quaternion_components(&self.orientation).to_vec())
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::<f64>::identity(4, 4) * self.noise_std.powi(2)
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        state.rows(ORIENTATION, 4).clone_owned()
    }
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64> {
        linearize::orientation_jacobian(state_dimension)
    }
    fn innovation(&self, expected: &DVector<f64>) -> DVector<f64> {
        let mut z = self.get_vector();
        align_quaternion_block(&mut z, expected, 0);
        z - expected
    }
}

/// World-frame linear velocity, e.g. from a DVL rotated into the world frame.
///
/// Only applicable when the velocities process model is active.
#[derive(Clone, Debug, Default)]
pub struct VelocityMeasurement {
    pub velocity: Vector3<f64>,
    pub noise_std: f64,
}
impl Display for VelocityMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VelocityMeasurement(vx: {}, vy: {}, vz: {}, noise: {})",
            self.velocity.x, self.velocity.y, self.velocity.z, self.noise_std
        )
    }
}
impl MeasurementModel for VelocityMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        3
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_column_slice(self.velocity.as_slice())
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::<f64>::identity(3, 3) * self.noise_std.powi(2)
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        state.rows(LINEAR_VELOCITY, 3).clone_owned()
    }
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64> {
        linearize::linear_velocity_jacobian(state_dimension)
    }
    fn required_state_dimension(&self) -> usize {
        crate::state::TWIST_DIMENSION
    }
}

/// Depth below the surface from a pressure sensor, mapped onto the z position.
#[derive(Clone, Debug, Default)]
pub struct DepthMeasurement {
    pub depth: f64,
    pub noise_std: f64,
}
impl Display for DepthMeasurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DepthMeasurement(depth: {}, noise: {})",
            self.depth, self.noise_std
        )
    }
}
impl MeasurementModel for DepthMeasurement {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn get_dimension(&self) -> usize {
        1
    }
    fn get_vector(&self) -> DVector<f64> {
        DVector::from_vec(vec![self.depth])
    }
    fn get_noise(&self) -> DMatrix<f64> {
        DMatrix::from_vec(1, 1, vec![self.noise_std.powi(2)])
    }
    fn get_expected_measurement(&self, state: &DVector<f64>) -> DVector<f64> {
        DVector::from_vec(vec![state[POSITION + 2]])
    }
    fn get_jacobian(&self, state_dimension: usize) -> DMatrix<f64> {
        linearize::depth_jacobian(state_dimension)
    }
}
