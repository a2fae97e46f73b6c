//! EKF-based attitude and navigation estimation core for a small autonomous
//! helicopter.
//!
//! This crate fuses gyroscope, accelerometer, compass, and GPS measurements
//! arriving at different, asynchronous rates into a continuously updated
//! estimate of vehicle attitude, body rates, gyro bias, and (in the GPS-aided
//! variant) position and velocity. It also carries the rigid-body truth model
//! used to drive and validate the filters during development.
//!
//! The crate is primarily built off of these dependencies:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): fixed-size vectors and
//!   matrices for all of the filter mathematics. State vectors and covariances
//!   are compile-time sized and stack allocated; there is no dynamic
//!   allocation in the propagation or correction hot paths.
//! - [`nav-types`](https://crates.io/crates/nav-types): WGS84/ECEF coordinate
//!   types used to project GPS geodetic fixes into the local tangent plane.
//! - [`rand`](https://crates.io/crates/rand) and
//!   [`rand_distr`](https://crates.io/crates/rand_distr): Gaussian noise
//!   injection when synthesizing sensor streams from the truth model.
//!
//! ## Crate overview
//!
//! - [rotation]: conversions between Euler angles, quaternions, and direction
//!   cosine matrices, plus the rate matrices used by the filters.
//! - [kalman]: the generic fixed-size EKF correction step shared by every
//!   aiding measurement.
//! - [ahrs]: the 7-state (quaternion + gyro bias) attitude estimator.
//! - [ins]: the 14-state GPS-aided navigation estimator.
//! - [sixdof]: the six-degree-of-freedom rigid-body truth model and synthetic
//!   sensor generation.
//! - [sensors]: ASCII sensor-line decoders (IMU ADC, compass, NMEA GPS, radio
//!   PPM) producing timestamped samples.
//! - [fusion]: the multi-rate scheduler that interleaves asynchronous sensor
//!   arrivals into one filter timeline.
//! - [frames]: frame-tagged vector quantities and geodetic-to-tangent-plane
//!   projection.
//! - [telemetry]: the typed state datagram codec and UDP link.
//!
//! ## Conventions
//!
//! The body frame is front-right-down, the navigation frame is North-East-Down
//! (NED). Attitude is canonically a unit quaternion `q = (q0, q1, q2, q3)`
//! with the scalar part first; Euler angles (roll φ, pitch θ, yaw ψ) and the
//! 3×3 direction cosine matrix are derived views. Every quaternion integration
//! step renormalizes, and every covariance update re-symmetrizes, so that the
//! unit-norm and symmetry invariants hold throughout a run. Angles live in
//! (−π, π] and are wrapped by the shortest path, never by naive modulo, so a
//! heading crossing ±180° does not excite the filters.

pub mod ahrs;
pub mod frames;
pub mod fusion;
pub mod ins;
pub mod kalman;
pub mod rotation;
pub mod sensors;
pub mod sixdof;
pub mod telemetry;

/// Standard gravitational acceleration in m/s^2, the default for the truth
/// model and the estimators' gravity seed.
pub const GRAVITY: f64 = 9.81;

/// Wrap an angle in radians into (−π, π] by the shortest path.
///
/// A propagation step that crosses the ±π boundary is pulled back by one full
/// revolution rather than reduced modulo 2π, so repeated wrapping near the
/// boundary cannot accumulate error.
///
/// # Example
/// ```rust
/// use rotornav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    let mut wrapped = angle;
    while wrapped > std::f64::consts::PI {
        wrapped -= 2.0 * std::f64::consts::PI;
    }
    while wrapped <= -std::f64::consts::PI {
        wrapped += 2.0 * std::f64::consts::PI;
    }
    wrapped
}

/// Shortest-angle innovation `measured − predicted`, wrapped into (−π, π].
///
/// Used by every heading-type correction so that a measurement at +179° and a
/// prediction at −179° produce a 2° innovation, not 358°.
pub fn angle_innovation(measured: f64, predicted: f64) -> f64 {
    wrap_to_pi(measured - predicted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::PI;

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI), PI, 1e-12);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_approx_eq!(wrap_to_pi(PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(3.0 * PI / 2.0), -PI / 2.0, 1e-12);
    }

    #[test]
    fn test_angle_innovation_shortest_path() {
        // +179 deg measured against -179 deg predicted is a 2 deg error
        let measured = 179.0_f64.to_radians();
        let predicted = -179.0_f64.to_radians();
        assert_approx_eq!(
            angle_innovation(measured, predicted),
            -2.0_f64.to_radians(),
            1e-12
        );
        assert_approx_eq!(
            angle_innovation(predicted, measured),
            2.0_f64.to_radians(),
            1e-12
        );
    }

    #[test]
    fn test_angle_innovation_plain() {
        assert_approx_eq!(angle_innovation(0.3, 0.1), 0.2, 1e-12);
    }
}
