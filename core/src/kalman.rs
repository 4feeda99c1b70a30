//! Extended Kalman filter for vehicle pose estimation
//!
//! This module contains the EKF that backs the localization node. It builds on
//! the process models in [`crate::process`] and the measurement models in
//! [`crate::measurements`].

use std::fmt::{self, Debug, Display};

use nalgebra::{DMatrix, DVector};

use crate::error::EstimatorError;
use crate::linalg::{SolveOptions, all_finite, checked_spd_solve, joseph_update, symmetrize};
use crate::measurements::MeasurementModel;
use crate::process::{ProcessModel, predict};
use crate::state::{VehicleState, renormalize_orientation};
use crate::NavigationFilter;

/// Diagnostics of a successful measurement update.
#[derive(Clone, Debug)]
pub struct InnovationReport {
    /// Measurement residual `z − h(x̄)`
    pub innovation: DVector<f64>,
    /// Innovation covariance `H P̄ Hᵀ + R`
    pub innovation_covariance: DMatrix<f64>,
    /// Normalized innovation squared `νᵀ S⁻¹ ν`
    pub normalized_innovation_squared: f64,
}

/// Extended Kalman Filter (EKF) over the vehicle pose
///
/// ## Predict Step
///
/// $$
/// \begin{aligned}
/// \bar{x}_{k+1} &= f(x_k, \Delta t) \\\\
/// \bar{P}_{k+1} &= F_k P_k F_k^T + Q \Delta t
/// \end{aligned}
/// $$
///
/// ## Update Step
///
/// $$
/// \begin{aligned}
/// S_k &= H_k \bar{P}_k H_k^T + R_k \\\\
/// K_k &= \bar{P}_k H_k^T S_k^{-1} \\\\
/// x_k &= \bar{x}_k + K_k (z_k - h(\bar{x}_k)) \\\\
/// P_k &= (I - K_k H_k) \bar{P}_k (I - K_k H_k)^T + K_k R_k K_k^T
/// \end{aligned}
/// $$
///
/// The quaternion block of the state is re-normalized after every correction.
/// Failed updates leave the estimate untouched.
///
/// # Example
///
/// ```rust
/// use hippocampus::NavigationFilter;
/// use hippocampus::kalman::ExtendedKalmanFilter;
/// use hippocampus::measurements::PositionMeasurement;
/// use hippocampus::process::ProcessModel;
/// use hippocampus::state::VehicleState;
/// use nalgebra::{DMatrix, Vector3};
///
/// let mut ekf = ExtendedKalmanFilter::new(
///     ProcessModel::Simple,
///     VehicleState::default(),
///     DMatrix::identity(7, 7),
///     DMatrix::identity(7, 7) * 1e-3,
/// )
/// .unwrap();
/// ekf.predict(0.1).unwrap();
/// let fix = PositionMeasurement { position: Vector3::new(0.5, 0.0, 0.0), noise_std: 0.1 };
/// ekf.update(&fix).unwrap();
/// assert!(ekf.state().position.x > 0.4);
/// ```
#[derive(Clone)]
pub struct ExtendedKalmanFilter {
    /// Active propagation model
    model: ProcessModel,
    /// State estimate vector (7 or 13 elements)
    mean_state: DVector<f64>,
    /// State covariance matrix
    covariance: DMatrix<f64>,
    /// Process noise covariance rate (per second)
    process_noise: DMatrix<f64>,
    /// Size of the state vector
    state_size: usize,
    solve_options: SolveOptions,
}

impl Debug for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EKF")
            .field("model", &self.model)
            .field("mean_state", &self.mean_state)
            .field("covariance", &self.covariance)
            .field("process_noise", &self.process_noise)
            .field("state_size", &self.state_size)
            .finish()
    }
}

impl Display for ExtendedKalmanFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExtendedKalmanFilter({}, {}-state, trace(P) = {:.6})",
            self.model,
            self.state_size,
            self.covariance.trace()
        )
    }
}

impl ExtendedKalmanFilter {
    /// Create a new filter from a prior state and covariance.
    ///
    /// Fails with [`EstimatorError::InvalidInput`] when the state layout or
    /// matrix sizes do not match `model`, or when a matrix is not finite.
    ///
    /// # Arguments
    /// * `model` - Process model used by `predict`.
    /// * `initial_state` - Prior state; its quaternion is normalized.
    /// * `covariance` - Prior covariance.
    /// * `process_noise` - Process noise rate Q.
    pub fn new(
        model: ProcessModel,
        initial_state: VehicleState,
        covariance: DMatrix<f64>,
        process_noise: DMatrix<f64>,
    ) -> Result<ExtendedKalmanFilter, EstimatorError> {
        model.check_state(&initial_state)?;
        let state_size = model.dimension();
        check_square("covariance", &covariance, state_size)?;
        check_square("process noise", &process_noise, state_size)?;
        Ok(ExtendedKalmanFilter {
            model,
            mean_state: initial_state.to_vector(),
            covariance: symmetrize(&covariance),
            process_noise: symmetrize(&process_noise),
            state_size,
            solve_options: SolveOptions::default(),
        })
    }

    pub fn model(&self) -> ProcessModel {
        self.model
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Current estimate as a typed state.
    pub fn state(&self) -> VehicleState {
        // mean_state is only ever written from validated, normalized vectors
        VehicleState::from_vector(&self.mean_state).unwrap_or_default()
    }

    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }

    /// Replace the process noise rate without touching the estimate.
    pub fn set_process_noise(&mut self, process_noise: DMatrix<f64>) -> Result<(), EstimatorError> {
        check_square("process noise", &process_noise, self.state_size)?;
        self.process_noise = symmetrize(&process_noise);
        Ok(())
    }

    /// Overwrite state and covariance, e.g. on reset.
    pub fn set_estimate(
        &mut self,
        state: VehicleState,
        covariance: DMatrix<f64>,
    ) -> Result<(), EstimatorError> {
        self.model.check_state(&state)?;
        check_square("covariance", &covariance, self.state_size)?;
        self.mean_state = state.to_vector();
        self.covariance = symmetrize(&covariance);
        Ok(())
    }
}

fn check_square(name: &str, m: &DMatrix<f64>, n: usize) -> Result<(), EstimatorError> {
    if m.shape() != (n, n) {
        return Err(EstimatorError::InvalidInput(format!(
            "{} must be {}x{}, got {:?}",
            name,
            n,
            n,
            m.shape()
        )));
    }
    if !all_finite(m) {
        return Err(EstimatorError::NonFinite(name.to_string()));
    }
    Ok(())
}

impl NavigationFilter for ExtendedKalmanFilter {
    type Report = InnovationReport;

    /// Propagate state and covariance by `dt` seconds with the active model.
    fn predict(&mut self, dt: f64) -> Result<(), EstimatorError> {
        let state = VehicleState::from_vector(&self.mean_state)?;
        let (next_state, next_covariance) =
            predict(self.model, &state, &self.covariance, &self.process_noise, dt)?;
        if !all_finite(&next_covariance) {
            return Err(EstimatorError::NonFinite("predicted covariance".to_string()));
        }
        self.mean_state = next_state.to_vector();
        self.covariance = next_covariance;
        Ok(())
    }

    /// Fuse a measurement into the estimate.
    ///
    /// The correction is computed on copies and only committed when every step
    /// succeeds, so a singular innovation covariance or a non-finite result
    /// leaves the prior estimate untouched.
    fn update<M: MeasurementModel + ?Sized>(
        &mut self,
        measurement: &M,
    ) -> Result<InnovationReport, EstimatorError> {
        if measurement.required_state_dimension() > self.state_size {
            return Err(EstimatorError::IncompatibleModel(format!(
                "{:?} needs a {}-element state but the {} model has {}",
                measurement,
                measurement.required_state_dimension(),
                self.model,
                self.state_size
            )));
        }
        let z = measurement.get_vector();
        let r = measurement.get_noise();
        let m = measurement.get_dimension();
        if z.len() != m || r.shape() != (m, m) {
            return Err(EstimatorError::InvalidInput(format!(
                "measurement of dimension {} reported a {}-vector and {:?} noise",
                m,
                z.len(),
                r.shape()
            )));
        }
        if z.iter().any(|v| !v.is_finite()) || !all_finite(&r) {
            return Err(EstimatorError::NonFinite(format!("{:?}", measurement)));
        }

        let h = measurement.get_jacobian(self.state_size);
        let z_hat = measurement.get_expected_measurement(&self.mean_state);
        let innovation = measurement.innovation(&z_hat);

        // Innovation covariance: S = H * P * H^T + R
        let p_ht = &self.covariance * h.transpose();
        let s = symmetrize(&(&h * &p_ht + &r));

        // Kalman gain from S * K^T = (P * H^T)^T
        let kt = checked_spd_solve(&s, &p_ht.transpose(), self.solve_options)
            .ok_or(EstimatorError::SingularCovariance)?;
        let k = kt.transpose();

        let mut mean_state = &self.mean_state + &k * &innovation;
        renormalize_orientation(&mut mean_state)
            .map_err(|e| EstimatorError::NonFinite(e.to_string()))?;
        let covariance = joseph_update(&self.covariance, &k, &h, &r);

        if mean_state.iter().any(|v| !v.is_finite()) || !all_finite(&covariance) {
            return Err(EstimatorError::NonFinite("updated estimate".to_string()));
        }

        let innovation_column = DMatrix::from_column_slice(m, 1, innovation.as_slice());
        let normalized_innovation_squared =
            checked_spd_solve(&s, &innovation_column, self.solve_options)
                .map(|s_inv_nu| innovation.dot(&s_inv_nu.column(0)))
                .unwrap_or(f64::NAN);

        self.mean_state = mean_state;
        self.covariance = covariance;
        Ok(InnovationReport {
            innovation,
            innovation_covariance: s,
            normalized_innovation_squared,
        })
    }

    fn get_estimate(&self) -> DVector<f64> {
        self.mean_state.clone()
    }

    fn get_certainty(&self) -> DMatrix<f64> {
        self.covariance.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::{is_symmetric, min_eigenvalue};
    use crate::measurements::{
        DepthMeasurement, OrientationMeasurement, PoseMeasurement, PositionMeasurement,
        VelocityMeasurement,
    };
    use crate::state::ORIENTATION;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::{UnitQuaternion, Vector3};

    fn diag(n: usize, value: f64) -> DMatrix<f64> {
        DMatrix::<f64>::identity(n, n) * value
    }

    fn simple_ekf() -> ExtendedKalmanFilter {
        ExtendedKalmanFilter::new(
            ProcessModel::Simple,
            VehicleState::default(),
            diag(7, 1.0),
            diag(7, 1e-3),
        )
        .unwrap()
    }

    fn velocities_ekf(velocity: Vector3<f64>) -> ExtendedKalmanFilter {
        ExtendedKalmanFilter::new(
            ProcessModel::Velocities,
            VehicleState::default().with_twist(velocity, Vector3::zeros()),
            diag(13, 0.5),
            diag(13, 0.0),
        )
        .unwrap()
    }

    fn quaternion_norm(x: &DVector<f64>) -> f64 {
        x.fixed_rows::<4>(ORIENTATION).norm()
    }

    #[test]
    fn ekf_construction() {
        let ekf = simple_ekf();
        assert_eq!(ekf.state_size(), 7);
        assert_eq!(ekf.get_estimate().len(), 7);
        assert_eq!(ekf.get_certainty().shape(), (7, 7));
        let velocities = velocities_ekf(Vector3::zeros());
        assert_eq!(velocities.state_size(), 13);
    }

    #[test]
    fn ekf_construction_rejects_mismatch() {
        let err = ExtendedKalmanFilter::new(
            ProcessModel::Velocities,
            VehicleState::default(),
            diag(13, 1.0),
            diag(13, 1.0),
        )
        .unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidInput(_)));
        let err = ExtendedKalmanFilter::new(
            ProcessModel::Simple,
            VehicleState::default(),
            diag(6, 1.0),
            diag(7, 1.0),
        )
        .unwrap_err();
        assert!(matches!(err, EstimatorError::InvalidInput(_)));
    }

    #[test]
    fn ekf_debug_display() {
        let ekf = simple_ekf();
        assert!(format!("{:?}", ekf).starts_with("EKF"));
        assert!(ekf.to_string().contains("simple, 7-state"));
    }

    #[test]
    fn ekf_predict_velocities_example() {
        let mut ekf = velocities_ekf(Vector3::new(1.0, 0.0, 0.0));
        ekf.predict(2.0).unwrap();
        let state = ekf.state();
        assert_approx_eq!(state.position.x, 2.0, 1e-12);
        assert_approx_eq!(state.position.y, 0.0, 1e-12);
        assert_approx_eq!(state.position.z, 0.0, 1e-12);
    }

    #[test]
    fn ekf_predict_zero_dt_is_noop() {
        let mut ekf = velocities_ekf(Vector3::new(1.0, 2.0, 3.0));
        let before = (ekf.get_estimate(), ekf.get_certainty());
        ekf.predict(0.0).unwrap();
        assert_eq!(ekf.get_estimate(), before.0);
        assert_eq!(ekf.get_certainty(), before.1);
    }

    #[test]
    fn ekf_predict_negative_dt_fails() {
        let mut ekf = simple_ekf();
        assert!(matches!(
            ekf.predict(-1.0),
            Err(EstimatorError::InvalidInput(_))
        ));
    }

    #[test]
    fn ekf_position_update_moves_towards_measurement() {
        let mut ekf = simple_ekf();
        let fix = PositionMeasurement {
            position: Vector3::new(1.0, -1.0, 0.5),
            noise_std: 1.0,
        };
        let report = ekf.update(&fix).unwrap();
        let state = ekf.state();
        // equal prior and measurement variance: halfway
        assert_approx_eq!(state.position.x, 0.5, 1e-9);
        assert_approx_eq!(state.position.y, -0.5, 1e-9);
        assert_approx_eq!(ekf.get_certainty()[(0, 0)], 0.5, 1e-9);
        assert_eq!(report.innovation.len(), 3);
        assert!(report.normalized_innovation_squared > 0.0);
    }

    #[test]
    fn ekf_covariance_reduction() {
        let mut ekf = simple_ekf();
        let before = ekf.get_certainty().trace();
        for _ in 0..10 {
            ekf.predict(0.1).unwrap();
            ekf.update(&PositionMeasurement {
                position: Vector3::zeros(),
                noise_std: 0.1,
            })
            .unwrap();
        }
        assert!(ekf.get_certainty().trace() < before);
    }

    #[test]
    fn ekf_pose_update_keeps_invariants() {
        let mut ekf = velocities_ekf(Vector3::new(0.2, 0.0, 0.0));
        let target = UnitQuaternion::from_euler_angles(0.2, -0.1, 1.2);
        for i in 0..25 {
            ekf.predict(0.05).unwrap();
            let meas = PoseMeasurement {
                position: Vector3::new(0.01 * i as f64, 0.0, -0.5),
                orientation: target,
                position_noise_std: 0.05,
                orientation_noise_std: 0.02,
            };
            ekf.update(&meas).unwrap();
            let p = ekf.get_certainty();
            assert!(is_symmetric(&p, 1e-9));
            assert!(min_eigenvalue(&p) > -1e-9);
            assert_approx_eq!(quaternion_norm(&ekf.get_estimate()), 1.0, 1e-9);
        }
        assert!(ekf.state().orientation.angle_to(&target) < 0.05);
    }

    #[test]
    fn ekf_orientation_update_normalizes() {
        let mut ekf = simple_ekf();
        ekf.update(&OrientationMeasurement {
            orientation: UnitQuaternion::from_euler_angles(0.0, 0.0, 2.0),
            noise_std: 0.3,
        })
        .unwrap();
        assert_approx_eq!(quaternion_norm(&ekf.get_estimate()), 1.0, 1e-12);
    }

    #[test]
    fn ekf_singular_innovation_leaves_estimate() {
        let mut ekf = ExtendedKalmanFilter::new(
            ProcessModel::Simple,
            VehicleState::default(),
            DMatrix::<f64>::zeros(7, 7),
            DMatrix::<f64>::zeros(7, 7),
        )
        .unwrap();
        let before = (ekf.get_estimate(), ekf.get_certainty());
        let err = ekf
            .update(&PositionMeasurement {
                position: Vector3::new(3.0, 0.0, 0.0),
                noise_std: 0.0,
            })
            .unwrap_err();
        assert_eq!(err, EstimatorError::SingularCovariance);
        assert_eq!(ekf.get_estimate(), before.0);
        assert_eq!(ekf.get_certainty(), before.1);
    }

    #[test]
    fn ekf_non_finite_measurement_rejected() {
        let mut ekf = simple_ekf();
        let before = ekf.get_estimate();
        let err = ekf
            .update(&DepthMeasurement {
                depth: f64::NAN,
                noise_std: 0.1,
            })
            .unwrap_err();
        assert!(matches!(err, EstimatorError::NonFinite(_)));
        assert_eq!(ekf.get_estimate(), before);
    }

    #[test]
    fn ekf_velocity_measurement_needs_velocities_model() {
        let mut ekf = simple_ekf();
        let err = ekf
            .update(&VelocityMeasurement {
                velocity: Vector3::new(1.0, 0.0, 0.0),
                noise_std: 0.1,
            })
            .unwrap_err();
        assert!(matches!(err, EstimatorError::IncompatibleModel(_)));

        let mut ekf = velocities_ekf(Vector3::zeros());
        ekf.update(&VelocityMeasurement {
            velocity: Vector3::new(1.0, 0.0, 0.0),
            noise_std: 0.5,
        })
        .unwrap();
        assert!(ekf.state().twist.unwrap().linear.x > 0.4);
    }

    #[test]
    fn ekf_set_estimate_and_noise() {
        let mut ekf = simple_ekf();
        let state = VehicleState::new(Vector3::new(4.0, 0.0, 0.0), UnitQuaternion::identity());
        ekf.set_estimate(state.clone(), diag(7, 2.0)).unwrap();
        assert_eq!(ekf.state(), state);
        assert!(ekf.set_process_noise(diag(13, 1.0)).is_err());
        ekf.set_process_noise(diag(7, 0.5)).unwrap();
        assert_approx_eq!(ekf.process_noise()[(0, 0)], 0.5);
    }
}
