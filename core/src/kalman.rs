//! Generic fixed-size extended Kalman filter correction step.
//!
//! Both estimators in this crate ([`crate::ahrs`], [`crate::ins`]) reduce
//! every aiding measurement to the same linear-algebra kernel: given the
//! measurement Jacobian `C`, measurement noise `R`, and a precomputed
//! innovation, fold the measurement into the state and covariance. The kernel
//! is generic over the state and measurement dimensions so each call site is
//! fully stack allocated and monomorphized.
//!
//! The innovation covariance `E = C P Cᵀ + R` is inverted in closed form for
//! the 1×1 and 2×2 measurements that dominate this crate (heading, tilt) and
//! by LU decomposition for anything larger (the 6-dimensional GPS fix). A
//! singular `E` leaves the state and covariance untouched and surfaces as an
//! error so the caller can skip the sample.

use std::error::Error;
use std::fmt;

use nalgebra::{SMatrix, SVector};

/// Determinant magnitude below which the innovation covariance is treated as
/// singular rather than inverted.
const SINGULAR_DET: f64 = 1e-12;

/// A measurement update that could not be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KalmanError {
    /// The innovation covariance `C P Cᵀ + R` was not invertible. The filter
    /// state was not modified.
    SingularInnovation,
}

impl fmt::Display for KalmanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KalmanError::SingularInnovation => {
                write!(f, "singular innovation covariance; update skipped")
            }
        }
    }
}

impl Error for KalmanError {}

/// Force exact symmetry of a covariance matrix by averaging with its
/// transpose. Repeated propagate/correct cycles otherwise let round-off
/// asymmetry grow without bound.
pub fn symmetrize<const N: usize>(p: &mut SMatrix<f64, N, N>) {
    *p = (*p + p.transpose()) / 2.0;
}

/// Invert the innovation covariance, dispatching on the measurement size.
fn invert_innovation<const M: usize>(
    e: &SMatrix<f64, M, M>,
) -> Result<SMatrix<f64, M, M>, KalmanError> {
    match M {
        1 => {
            let d = e[(0, 0)];
            if d.abs() < SINGULAR_DET {
                return Err(KalmanError::SingularInnovation);
            }
            let mut inv = SMatrix::<f64, M, M>::zeros();
            inv[(0, 0)] = 1.0 / d;
            Ok(inv)
        }
        2 => {
            let det = e[(0, 0)] * e[(1, 1)] - e[(0, 1)] * e[(1, 0)];
            if det.abs() < SINGULAR_DET {
                return Err(KalmanError::SingularInnovation);
            }
            let mut inv = SMatrix::<f64, M, M>::zeros();
            inv[(0, 0)] = e[(1, 1)] / det;
            inv[(0, 1)] = -e[(0, 1)] / det;
            inv[(1, 0)] = -e[(1, 0)] / det;
            inv[(1, 1)] = e[(0, 0)] / det;
            Ok(inv)
        }
        _ => e.try_inverse().ok_or(KalmanError::SingularInnovation),
    }
}

/// Apply one EKF measurement update in place.
///
/// `x` and `p` are the state and covariance, `c` the measurement Jacobian
/// evaluated at the current state, `r` the measurement noise covariance, and
/// `innovation` the (already wrapped, where angular) residual
/// `measured − predicted`.
///
/// Computes the gain `K = P Cᵀ (C P Cᵀ + R)⁻¹`, then
/// `x += K ν` and `P -= K C P`, re-symmetrizing `P` afterwards. On a singular
/// innovation covariance, returns [`KalmanError::SingularInnovation`] with
/// `x` and `p` unmodified.
pub fn kalman_update<const N: usize, const M: usize>(
    x: &mut SVector<f64, N>,
    p: &mut SMatrix<f64, N, N>,
    c: &SMatrix<f64, M, N>,
    r: &SMatrix<f64, M, M>,
    innovation: &SVector<f64, M>,
) -> Result<(), KalmanError> {
    let pct = *p * c.transpose();
    let e = c * pct + r;
    let e_inv = invert_innovation(&e)?;

    let k = pct * e_inv;
    *x += k * innovation;
    *p -= k * (c * *p);
    symmetrize(p);
    Ok(())
}
