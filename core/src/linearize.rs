//! Analytic Jacobians for the process and measurement models.
//!
//! All Jacobians are expressed with respect to the flattened state layout
//! defined in [`crate::state`]. Quaternion products use the Hamilton
//! convention with scalar-first ordering:
//!
//! $$
//! p \otimes q = L(p)\\,q = R(q)\\,p
//! $$

use nalgebra::{DMatrix, Matrix4, UnitQuaternion, Vector3};

use crate::state::{ANGULAR_VELOCITY, LINEAR_VELOCITY, ORIENTATION, POSITION, VehicleState};

/// Left-multiplication matrix `L(p)` so that `p ⊗ q = L(p) q`.
pub fn quaternion_left_matrix(p: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let p = p.quaternion();
    let (w, x, y, z) = (p.w, p.i, p.j, p.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, -z, y, //
        y, z, w, -x, //
        z, -y, x, w,
    )
}

/// Right-multiplication matrix `R(q)` so that `p ⊗ q = R(q) p`.
pub fn quaternion_right_matrix(q: &UnitQuaternion<f64>) -> Matrix4<f64> {
    let q = q.quaternion();
    let (w, x, y, z) = (q.w, q.i, q.j, q.k);
    Matrix4::new(
        w, -x, -y, -z, //
        x, w, z, -y, //
        y, -z, w, x, //
        z, y, -x, w,
    )
}

/// Rotation increment `exp(ω·dt/2)` for a body angular rate held over `dt`.
pub fn rotation_increment(angular_rate: &Vector3<f64>, dt: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_scaled_axis(angular_rate * dt)
}

/// State transition Jacobian of the `simple` model: the identity.
pub fn simple_transition_jacobian(dimension: usize) -> DMatrix<f64> {
    DMatrix::<f64>::identity(dimension, dimension)
}

/// State transition Jacobian of the `velocities` model.
///
/// ```text
///        p     q        v      ω
/// p  [   I     0      I·dt     0        ]
/// q  [   0   R(δq)     0    ½·dt·L(q)·E ]
/// v  [   0     0       I       0        ]
/// ω  [   0     0       0       I        ]
/// ```
///
/// where `δq = exp(ω·dt/2)` and `E = [0; I₃]` lifts a vector into a pure
/// quaternion. The `∂q/∂ω` block is the first-order small-angle term.
pub fn velocities_transition_jacobian(state: &VehicleState, dt: f64) -> DMatrix<f64> {
    let n = crate::state::TWIST_DIMENSION;
    let mut f = DMatrix::<f64>::identity(n, n);
    let angular = state.twist.map(|t| t.angular).unwrap_or_else(Vector3::zeros);

    for i in 0..3 {
        f[(POSITION + i, LINEAR_VELOCITY + i)] = dt;
    }

    let delta = rotation_increment(&angular, dt);
    let dq_dq = quaternion_right_matrix(&delta);
    f.view_mut((ORIENTATION, ORIENTATION), (4, 4))
        .copy_from(&dq_dq);

    let left = quaternion_left_matrix(&state.orientation);
    let dq_dw = 0.5 * dt * left.fixed_columns::<3>(1);
    f.view_mut((ORIENTATION, ANGULAR_VELOCITY), (4, 3))
        .copy_from(&dq_dw);
    f
}

/// Selection Jacobian picking `len` consecutive states starting at `offset`.
pub fn selection_jacobian(state_dimension: usize, offset: usize, len: usize) -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(len, state_dimension);
    for i in 0..len {
        h[(i, offset + i)] = 1.0;
    }
    h
}

/// Jacobian of a position fix.
pub fn position_jacobian(state_dimension: usize) -> DMatrix<f64> {
    selection_jacobian(state_dimension, POSITION, 3)
}

/// Jacobian of an orientation fix (quaternion components).
pub fn orientation_jacobian(state_dimension: usize) -> DMatrix<f64> {
    selection_jacobian(state_dimension, ORIENTATION, 4)
}

/// Jacobian of a full pose fix: position then orientation, contiguous in the state.
pub fn pose_jacobian(state_dimension: usize) -> DMatrix<f64> {
    selection_jacobian(state_dimension, POSITION, 7)
}

/// Jacobian of a world-frame linear velocity measurement.
pub fn linear_velocity_jacobian(state_dimension: usize) -> DMatrix<f64> {
    selection_jacobian(state_dimension, LINEAR_VELOCITY, 3)
}

/// Jacobian of a depth (vertical position) measurement.
pub fn depth_jacobian(state_dimension: usize) -> DMatrix<f64> {
    selection_jacobian(state_dimension, POSITION + 2, 1)
}
