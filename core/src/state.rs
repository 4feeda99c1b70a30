//! Vehicle state representation and its flattened vector layout.
//!
//! The filter works on a plain `DVector<f64>`; this module owns the mapping
//! between that vector and the typed [`VehicleState`]:
//!
//! ```text
//! simple:     x = [px, py, pz, qw, qx, qy, qz]                              (7)
//! velocities: x = [px, py, pz, qw, qx, qy, qz, vx, vy, vz, wx, wy, wz]      (13)
//! ```
//!
//! Linear velocity is expressed in the world frame, angular velocity in the
//! body frame.

use std::fmt::{self, Display};

use nalgebra::{DVector, Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::EstimatorError;

/// Index of the first position component.
pub const POSITION: usize = 0;
/// Index of the quaternion scalar component (`w`, followed by `x`, `y`, `z`).
pub const ORIENTATION: usize = 3;
/// Index of the first linear velocity component.
pub const LINEAR_VELOCITY: usize = 7;
/// Index of the first angular velocity component.
pub const ANGULAR_VELOCITY: usize = 10;

/// State size without velocities.
pub const POSE_DIMENSION: usize = 7;
/// State size with linear and angular velocities.
pub const TWIST_DIMENSION: usize = 13;

/// Linear and angular velocity of the vehicle.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Twist {
    pub linear: Vector3<f64>,
    pub angular: Vector3<f64>,
}

/// Position, orientation and (optionally) velocities of a single vehicle.
#[derive(Clone, Debug, PartialEq)]
pub struct VehicleState {
    pub position: Vector3<f64>,
    pub orientation: UnitQuaternion<f64>,
    pub twist: Option<Twist>,
}

impl Default for VehicleState {
    fn default() -> Self {
        VehicleState {
            position: Vector3::zeros(),
            orientation: UnitQuaternion::identity(),
            twist: None,
        }
    }
}

impl Display for VehicleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = self.orientation.euler_angles();
        write!(
            f,
            "VehicleState(pos: [{:.3}, {:.3}, {:.3}], rpy: [{:.3}, {:.3}, {:.3}]",
            self.position.x, self.position.y, self.position.z, roll, pitch, yaw
        )?;
        if let Some(twist) = &self.twist {
            write!(
                f,
                ", vel: [{:.3}, {:.3}, {:.3}], rate: [{:.3}, {:.3}, {:.3}]",
                twist.linear.x,
                twist.linear.y,
                twist.linear.z,
                twist.angular.x,
                twist.angular.y,
                twist.angular.z
            )?;
        }
        write!(f, ")")
    }
}

impl VehicleState {
    pub fn new(position: Vector3<f64>, orientation: UnitQuaternion<f64>) -> Self {
        VehicleState {
            position,
            orientation,
            twist: None,
        }
    }

    pub fn with_twist(mut self, linear: Vector3<f64>, angular: Vector3<f64>) -> Self {
        self.twist = Some(Twist { linear, angular });
        self
    }

    /// Length of the flattened state vector.
    pub fn dimension(&self) -> usize {
        if self.twist.is_some() {
            TWIST_DIMENSION
        } else {
            POSE_DIMENSION
        }
    }

    /// Flatten into the filter's state vector layout.
    pub fn to_vector(&self) -> DVector<f64> {
        let mut x = DVector::<f64>::zeros(self.dimension());
        x.fixed_rows_mut::<3>(POSITION).copy_from(&self.position);
        let q = self.orientation.quaternion();
        x[ORIENTATION] = q.w;
        x[ORIENTATION + 1] = q.i;
        x[ORIENTATION + 2] = q.j;
        x[ORIENTATION + 3] = q.k;
        if let Some(twist) = &self.twist {
            x.fixed_rows_mut::<3>(LINEAR_VELOCITY).copy_from(&twist.linear);
            x.fixed_rows_mut::<3>(ANGULAR_VELOCITY)
                .copy_from(&twist.angular);
        }
        x
    }

    /// Rebuild a state from a flattened vector, re-normalizing the quaternion.
    pub fn from_vector(x: &DVector<f64>) -> Result<Self, EstimatorError> {
        if x.len() != POSE_DIMENSION && x.len() != TWIST_DIMENSION {
            return Err(EstimatorError::InvalidInput(format!(
                "state vector must have {} or {} elements, got {}",
                POSE_DIMENSION,
                TWIST_DIMENSION,
                x.len()
            )));
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EstimatorError::NonFinite("state vector".to_string()));
        }
        let position = Vector3::new(x[POSITION], x[POSITION + 1], x[POSITION + 2]);
        let orientation = normalized_quaternion(
            x[ORIENTATION],
            x[ORIENTATION + 1],
            x[ORIENTATION + 2],
            x[ORIENTATION + 3],
        )?;
        let twist = if x.len() == TWIST_DIMENSION {
            Some(Twist {
                linear: Vector3::new(
                    x[LINEAR_VELOCITY],
                    x[LINEAR_VELOCITY + 1],
                    x[LINEAR_VELOCITY + 2],
                ),
                angular: Vector3::new(
                    x[ANGULAR_VELOCITY],
                    x[ANGULAR_VELOCITY + 1],
                    x[ANGULAR_VELOCITY + 2],
                ),
            })
        } else {
            None
        };
        Ok(VehicleState {
            position,
            orientation,
            twist,
        })
    }
}

/// Build a unit quaternion from `w, x, y, z`, rejecting a (near) zero norm.
pub fn normalized_quaternion(
    w: f64,
    x: f64,
    y: f64,
    z: f64,
) -> Result<UnitQuaternion<f64>, EstimatorError> {
    let q = Quaternion::new(w, x, y, z);
    let norm = q.norm();
    if !norm.is_finite() || norm < 1e-9 {
        return Err(EstimatorError::InvalidInput(format!(
            "quaternion [{}, {}, {}, {}] cannot be normalized",
            w, x, y, z
        )));
    }
    Ok(UnitQuaternion::from_quaternion(q))
}

/// Re-normalize the quaternion block of a flattened state in place.
pub fn renormalize_orientation(x: &mut DVector<f64>) -> Result<(), EstimatorError> {
    let q = normalized_quaternion(
        x[ORIENTATION],
        x[ORIENTATION + 1],
        x[ORIENTATION + 2],
        x[ORIENTATION + 3],
    )?;
    let q = q.quaternion();
    x[ORIENTATION] = q.w;
    x[ORIENTATION + 1] = q.i;
    x[ORIENTATION + 2] = q.j;
    x[ORIENTATION + 3] = q.k;
    Ok(())
}

/// Serializable initial state, angles stored as a `[w, x, y, z]` quaternion.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialState {
    #[serde(default)]
    pub position: [f64; 3],
    #[serde(default = "identity_quaternion")]
    pub orientation: [f64; 4],
    #[serde(default)]
    pub linear_velocity: [f64; 3],
    #[serde(default)]
    pub angular_velocity: [f64; 3],
}

fn identity_quaternion() -> [f64; 4] {
    [1.0, 0.0, 0.0, 0.0]
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState {
            position: [0.0; 3],
            orientation: identity_quaternion(),
            linear_velocity: [0.0; 3],
            angular_velocity: [0.0; 3],
        }
    }
}

impl InitialState {
    /// Convert to a [`VehicleState`], with or without the velocity block.
    pub fn to_state(&self, with_twist: bool) -> Result<VehicleState, EstimatorError> {
        let [w, x, y, z] = self.orientation;
        let state = VehicleState::new(
            Vector3::from(self.position),
            normalized_quaternion(w, x, y, z)?,
        );
        Ok(if with_twist {
            state.with_twist(
                Vector3::from(self.linear_velocity),
                Vector3::from(self.angular_velocity),
            )
        } else {
            state
        })
    }
}
