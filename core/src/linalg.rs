//! Linear algebra helpers for keeping covariances well formed.
//!
//! Public API:
//!     pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64>
//!     pub fn checked_spd_solve(a, b, opt) -> Option<DMatrix<f64>>
//!     pub fn joseph_update(p, k, h, r) -> DMatrix<f64>
//!
//! Strategy for the innovation solve:
//! 1) Reject non-finite input
//! 2) Symmetrize A ← 0.5 (A + Aᵀ)
//! 3) Cholesky (no jitter, a failing factorization means the update is skipped)
//! 4) Reject factors whose pivot spread exceeds the configured condition bound

use nalgebra::DMatrix;
use nalgebra::linalg::{Cholesky, SymmetricEigen};

/// Symmetrize a matrix: P ← 0.5 (P + Pᵀ)
///
/// Simple matrix symmetrization function that reduces round-off errors associated
/// with floating point arithmetic.
#[inline]
pub fn symmetrize(m: &DMatrix<f64>) -> DMatrix<f64> {
    0.5 * (m + m.transpose())
}

/// Largest absolute difference between `m` and its transpose.
pub fn asymmetry(m: &DMatrix<f64>) -> f64 {
    (m - m.transpose()).amax()
}

/// True when `m` is square and `‖M − Mᵀ‖∞ < tol`.
pub fn is_symmetric(m: &DMatrix<f64>, tol: f64) -> bool {
    m.is_square() && asymmetry(m) < tol
}

/// True when every entry is finite.
pub fn all_finite(m: &DMatrix<f64>) -> bool {
    m.iter().all(|x| x.is_finite())
}

/// Smallest eigenvalue of the symmetrized matrix.
pub fn min_eigenvalue(m: &DMatrix<f64>) -> f64 {
    SymmetricEigen::new(symmetrize(m)).eigenvalues.min()
}

#[derive(Debug, Clone, Copy)]
pub struct SolveOptions {
    /// Upper bound on the ratio of the largest to smallest Cholesky pivot.
    pub max_condition: f64,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self { max_condition: 1e14 }
    }
}

/// Solve A X = B for symmetric positive definite A.
///
/// Returns None when A is not positive definite, is numerically singular
/// under `opt.max_condition`, or contains non-finite entries. No jitter is
/// applied: a singular innovation covariance must surface to the caller.
///
/// # Arguments
/// * `a` - Square, nominally symmetric positive definite matrix.
/// * `b` - Right-hand side with as many rows as `a`.
/// * `opt` - Condition bound on the Cholesky pivots.
///
/// # Returns
/// * `Some(X)` - The solution.
/// * `None` - When the solve would not be trustworthy.
pub fn checked_spd_solve(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    opt: SolveOptions,
) -> Option<DMatrix<f64>> {
    if !a.is_square() || a.nrows() != b.nrows() || a.nrows() == 0 {
        return None;
    }
    if !all_finite(a) || !all_finite(b) {
        return None;
    }
    let a_sym = symmetrize(a);
    let ch = Cholesky::new(a_sym)?;
    let pivots = ch.l_dirty().diagonal().map(|d| d * d);
    let largest = pivots.max();
    let smallest = pivots.min();
    if smallest <= 0.0 || largest / smallest > opt.max_condition {
        return None;
    }
    Some(ch.solve(b))
}

/// Joseph-form covariance update: P = (I − KH) P (I − KH)ᵀ + K R Kᵀ
///
/// Keeps P symmetric positive semi-definite for any gain K, at the cost of a
/// few extra products compared to P = (I − KH) P.
///
/// # Arguments
/// * `p` - Prior covariance (n × n).
/// * `k` - Kalman gain (n × m).
/// * `h` - Measurement Jacobian (m × n).
/// * `r` - Measurement noise (m × m).
///
/// # Returns
/// * The symmetrized posterior covariance.
pub fn joseph_update(
    p: &DMatrix<f64>,
    k: &DMatrix<f64>,
    h: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> DMatrix<f64> {
    let n = p.nrows();
    let i_kh = DMatrix::<f64>::identity(n, n) - k * h;
    let updated = &i_kh * p * i_kh.transpose() + k * r * k.transpose();
    symmetrize(&updated)
}

/* =============================== Tests ==================================== */

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &DMatrix<f64>, b: &DMatrix<f64>, tol: f64) -> bool {
        if a.shape() != b.shape() {
            return false;
        }
        (a - b).amax() <= tol
    }

    #[test]
    fn t_symmetrize() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 0.0, 3.0]);
        let s = symmetrize(&m);
        let s_expected = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 3.0]);
        assert!(approx_eq(&s, &s_expected, 1e-15));
        assert!(is_symmetric(&s, 1e-15));
        assert!(!is_symmetric(&m, 1e-3));
    }

    #[test]
    fn t_checked_spd_solve_basic() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 2.0, 2.0, 3.0]);
        let b = DMatrix::from_row_slice(2, 1, &[6.0, 5.0]);
        let x = checked_spd_solve(&a, &b, SolveOptions::default()).expect("SPD solve");
        assert!(approx_eq(&(&a * &x), &b, 1e-10));
    }

    #[test]
    fn t_checked_spd_solve_rejects_zero() {
        let a = DMatrix::<f64>::zeros(3, 3);
        let b = DMatrix::<f64>::identity(3, 3);
        assert!(checked_spd_solve(&a, &b, SolveOptions::default()).is_none());
    }

    #[test]
    fn t_checked_spd_solve_rejects_rank_deficient() {
        // eigenvalues {2, 0}
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        let b = DMatrix::<f64>::identity(2, 2);
        assert!(checked_spd_solve(&a, &b, SolveOptions::default()).is_none());
    }

    #[test]
    fn t_checked_spd_solve_rejects_ill_conditioned() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 0.0, 0.0, 1e-20]);
        let b = DMatrix::<f64>::identity(2, 2);
        assert!(checked_spd_solve(&a, &b, SolveOptions::default()).is_none());
        let loose = SolveOptions {
            max_condition: 1e30,
        };
        assert!(checked_spd_solve(&a, &b, loose).is_some());
    }

    #[test]
    fn t_checked_spd_solve_rejects_nan_and_shape() {
        let mut a = DMatrix::<f64>::identity(2, 2);
        a[(0, 0)] = f64::NAN;
        let b = DMatrix::<f64>::identity(2, 2);
        assert!(checked_spd_solve(&a, &b, SolveOptions::default()).is_none());
        let a = DMatrix::<f64>::identity(2, 2);
        let b = DMatrix::<f64>::identity(3, 3);
        assert!(checked_spd_solve(&a, &b, SolveOptions::default()).is_none());
    }

    #[test]
    fn t_joseph_update_stays_psd() {
        let p = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let r = DMatrix::from_row_slice(1, 1, &[0.5]);
        // deliberately suboptimal gain
        let k = DMatrix::from_row_slice(2, 1, &[0.9, -0.4]);
        let updated = joseph_update(&p, &k, &h, &r);
        assert!(is_symmetric(&updated, 1e-14));
        assert!(min_eigenvalue(&updated) >= -1e-12);
    }

    #[test]
    fn t_joseph_matches_optimal_form() {
        let p = DMatrix::from_row_slice(2, 2, &[2.0, 0.3, 0.3, 1.0]);
        let h = DMatrix::from_row_slice(1, 2, &[1.0, 0.0]);
        let r = DMatrix::from_row_slice(1, 1, &[0.5]);
        let s = &h * &p * h.transpose() + &r;
        let k = &p * h.transpose() / s[(0, 0)];
        let joseph = joseph_update(&p, &k, &h, &r);
        let simple = (DMatrix::<f64>::identity(2, 2) - &k * &h) * &p;
        assert!(approx_eq(&joseph, &symmetrize(&simple), 1e-12));
    }

    #[test]
    fn t_min_eigenvalue() {
        let m = DMatrix::from_row_slice(3, 3, &[-1.0, 0.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 3.0]);
        assert!((min_eigenvalue(&m) + 1.0).abs() < 1e-12);
    }
}
