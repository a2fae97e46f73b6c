//! Rotation representations and their derivatives.
//!
//! Conversions between Euler angles (roll φ, pitch θ, yaw ψ), unit
//! quaternions `q = (q0, q1, q2, q3)` (scalar first), and 3×3 direction
//! cosine matrices, plus the angular-rate cross matrix, the quaternion rate
//! matrix, and the strapdown matrix used in state propagation. Everything in
//! this module is a pure, deterministic map with no hidden state; callers are
//! responsible for renormalizing quaternions after integrating a rate.
//!
//! The rotation sequence is the standard aerospace [φ][θ][ψ] from NED to the
//! body frame: `v_body = dcm * v_ned`.

use nalgebra::{Matrix3, Matrix4, Vector3, Vector4};

/// Direction cosine matrix from Euler angles, mapping NED to body frame.
pub fn euler_to_dcm(euler: &Vector3<f64>) -> Matrix3<f64> {
    let (phi, theta, psi) = (euler[0], euler[1], euler[2]);

    let (sphi, cphi) = phi.sin_cos();
    let (stheta, ctheta) = theta.sin_cos();
    let (spsi, cpsi) = psi.sin_cos();

    Matrix3::new(
        cpsi * ctheta,
        spsi * ctheta,
        -stheta,
        -spsi * cphi + cpsi * stheta * sphi,
        cpsi * cphi + spsi * stheta * sphi,
        ctheta * sphi,
        spsi * sphi + cpsi * stheta * cphi,
        -cpsi * sphi + spsi * stheta * cphi,
        ctheta * cphi,
    )
}

/// Direction cosine matrix from a unit quaternion, mapping NED to body frame.
pub fn quat_to_dcm(q: &Vector4<f64>) -> Matrix3<f64> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);

    Matrix3::new(
        1.0 - 2.0 * (q2 * q2 + q3 * q3),
        2.0 * (q1 * q2 + q0 * q3),
        2.0 * (q1 * q3 - q0 * q2),
        2.0 * (q1 * q2 - q0 * q3),
        1.0 - 2.0 * (q1 * q1 + q3 * q3),
        2.0 * (q2 * q3 + q0 * q1),
        2.0 * (q1 * q3 + q0 * q2),
        2.0 * (q2 * q3 - q0 * q1),
        1.0 - 2.0 * (q1 * q1 + q2 * q2),
    )
}

/// Euler angles (roll, pitch, yaw) from a unit quaternion.
///
/// The pitch asin argument is clamped into [−1, 1] so that a quaternion
/// driven exactly onto the gimbal boundary by round-off still converts.
pub fn quat_to_euler(q: &Vector4<f64>) -> Vector3<f64> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);

    let theta = -(2.0 * (q1 * q3 - q0 * q2)).clamp(-1.0, 1.0).asin();
    let phi = (2.0 * (q2 * q3 + q0 * q1)).atan2(1.0 - 2.0 * (q1 * q1 + q2 * q2));
    let psi = (2.0 * (q1 * q2 + q0 * q3)).atan2(1.0 - 2.0 * (q2 * q2 + q3 * q3));

    Vector3::new(phi, theta, psi)
}

/// Unit quaternion from Euler angles (roll, pitch, yaw), radians.
pub fn euler_to_quat(euler: &Vector3<f64>) -> Vector4<f64> {
    let (sphi, cphi) = (euler[0] / 2.0).sin_cos();
    let (stheta, ctheta) = (euler[1] / 2.0).sin_cos();
    let (spsi, cpsi) = (euler[2] / 2.0).sin_cos();

    Vector4::new(
        cphi * ctheta * cpsi + sphi * stheta * spsi,
        -cphi * stheta * spsi + sphi * ctheta * cpsi,
        cphi * stheta * cpsi + sphi * ctheta * spsi,
        cphi * ctheta * spsi - sphi * stheta * cpsi,
    )
}

/// Skew-symmetric cross-product matrix Ω such that `Ω * v == pqr × v`.
pub fn rate_cross(pqr: &Vector3<f64>) -> Matrix3<f64> {
    let (p, q, r) = (pqr[0], pqr[1], pqr[2]);

    Matrix3::new(0.0, -r, q, r, 0.0, -p, -q, p, 0.0)
}

/// Quaternion rate matrix W such that `q̇ = W(pqr) * q`.
///
/// The conventional ½ factor is folded into the matrix entries.
pub fn quat_rate(pqr: &Vector3<f64>) -> Matrix4<f64> {
    let p = pqr[0] / 2.0;
    let q = pqr[1] / 2.0;
    let r = pqr[2] / 2.0;

    Matrix4::new(
        0.0, -p, -q, -r, //
        p, 0.0, r, -q, //
        q, -r, 0.0, p, //
        r, q, -p, 0.0,
    )
}

/// Strapdown matrix mapping body rates to Euler-angle rates.
///
/// Singular at θ = ±90°; callers propagating Euler angles directly must keep
/// pitch away from the gimbal boundary.
pub fn strapdown_matrix(euler: &Vector3<f64>) -> Matrix3<f64> {
    let (sphi, cphi) = euler[0].sin_cos();
    let (stheta, ctheta) = euler[1].sin_cos();
    let ttheta = stheta / ctheta;

    Matrix3::new(
        1.0,
        sphi * ttheta,
        cphi * ttheta,
        0.0,
        cphi,
        -sphi,
        0.0,
        sphi / ctheta,
        cphi / ctheta,
    )
}

/// Roll and pitch implied by a gravity-dominated accelerometer reading.
///
/// At rest the specific force is the negated gravity vector rotated into the
/// body frame, so the tilt can be read back out with atan2/asin. The asin
/// argument is clamped for readings whose magnitude dips under 1 g.
pub fn accel_to_roll_pitch(accel: &Vector3<f64>) -> (f64, f64) {
    let g = accel.norm();
    let roll = (-accel[1]).atan2(-accel[2]);
    let pitch = if g > 0.0 {
        (accel[0] / g).clamp(-1.0, 1.0).asin()
    } else {
        0.0
    };
    (roll, pitch)
}

/// ∂φ/∂q — row of the tilt measurement Jacobian for roll.
pub fn droll_dq(q: &Vector4<f64>) -> Vector4<f64> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);

    let s = 2.0 * (q2 * q3 + q0 * q1);
    let c = 1.0 - 2.0 * (q1 * q1 + q2 * q2);
    let d = s * s + c * c;

    Vector4::new(
        2.0 * q1 * c / d,
        (2.0 * q0 * c + 4.0 * q1 * s) / d,
        (2.0 * q3 * c + 4.0 * q2 * s) / d,
        2.0 * q2 * c / d,
    )
}

/// ∂θ/∂q — row of the tilt measurement Jacobian for pitch.
///
/// Returns `None` within `GIMBAL_GUARD` of θ = ±90°, where the derivative
/// blows up; the caller skips the tilt correction for that sample.
pub fn dpitch_dq(q: &Vector4<f64>) -> Option<Vector4<f64>> {
    const GIMBAL_GUARD: f64 = 1e-6;

    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);

    let u = 2.0 * (q1 * q3 - q0 * q2);
    let w = 1.0 - u * u;
    if w < GIMBAL_GUARD {
        return None;
    }
    let err = -2.0 / w.sqrt();

    Some(Vector4::new(-err * q2, err * q3, -err * q0, err * q1))
}

/// ∂ψ/∂q — row of the heading measurement Jacobian.
pub fn dyaw_dq(q: &Vector4<f64>) -> Vector4<f64> {
    let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);

    let t1 = 1.0 - 2.0 * (q2 * q2 + q3 * q3);
    let t2 = 2.0 * (q1 * q2 + q0 * q3);
    let err = 2.0 / (t1 * t1 + t2 * t2);

    Vector4::new(
        err * q3 * t1,
        err * q2 * t1,
        err * (q1 * t1 + 2.0 * q2 * t2),
        err * (q0 * t1 + 2.0 * q3 * t2),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn euler_quat_round_trip() {
        let euler = Vector3::new(0.1, 0.2, 0.3);
        let back = quat_to_euler(&euler_to_quat(&euler));
        assert_approx_eq!(back[0], 0.1, 1e-9);
        assert_approx_eq!(back[1], 0.2, 1e-9);
        assert_approx_eq!(back[2], 0.3, 1e-9);
    }

    #[test]
    fn quat_dcm_matches_euler_dcm() {
        let euler = Vector3::new(-0.4, 0.25, 1.1);
        let from_euler = euler_to_dcm(&euler);
        let from_quat = quat_to_dcm(&euler_to_quat(&euler));
        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(from_euler[(i, j)], from_quat[(i, j)], 1e-12);
            }
        }
    }

    #[test]
    fn dcm_is_orthonormal() {
        let dcm = euler_to_dcm(&Vector3::new(0.3, -0.2, 2.5));
        let should_be_eye = dcm * dcm.transpose();
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(should_be_eye[(i, j)], expected, 1e-12);
            }
        }
    }

    #[test]
    fn rate_cross_matches_cross_product() {
        let pqr = Vector3::new(0.1, -0.2, 0.3);
        let v = Vector3::new(1.0, 2.0, -0.5);
        let by_matrix = rate_cross(&pqr) * v;
        let by_cross = pqr.cross(&v);
        for i in 0..3 {
            assert_approx_eq!(by_matrix[i], by_cross[i], 1e-15);
        }
    }

    #[test]
    fn quat_rate_is_skew() {
        let w = quat_rate(&Vector3::new(0.2, -0.7, 1.3));
        let sum = w + w.transpose();
        for i in 0..4 {
            for j in 0..4 {
                assert_approx_eq!(sum[(i, j)], 0.0, 1e-15);
            }
        }
    }

    #[test]
    fn strapdown_identity_at_level() {
        let e = strapdown_matrix(&Vector3::zeros());
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(e[(i, j)], expected, 1e-15);
            }
        }
    }

    #[test]
    fn accel_tilt_at_rest() {
        let (roll, pitch) = accel_to_roll_pitch(&Vector3::new(0.0, 0.0, -9.81));
        assert_approx_eq!(roll, 0.0, 1e-12);
        assert_approx_eq!(pitch, 0.0, 1e-12);
    }

    #[test]
    fn accel_tilt_rolled() {
        // 30 deg right roll: gravity shows up on the body y axis
        let phi = 30.0_f64.to_radians();
        let accel = Vector3::new(0.0, -9.81 * phi.sin(), -9.81 * phi.cos());
        let (roll, pitch) = accel_to_roll_pitch(&accel);
        assert_approx_eq!(roll, phi, 1e-12);
        assert_approx_eq!(pitch, 0.0, 1e-12);
    }

    /// Central-difference check of an analytic quaternion derivative row.
    fn check_derivative(
        q: &Vector4<f64>,
        row: &Vector4<f64>,
        f: impl Fn(&Vector4<f64>) -> f64,
    ) {
        let h = 1e-7;
        for i in 0..4 {
            let mut plus = *q;
            let mut minus = *q;
            plus[i] += h;
            minus[i] -= h;
            let numeric = (f(&plus) - f(&minus)) / (2.0 * h);
            assert_approx_eq!(row[i], numeric, 1e-5);
        }
    }

    #[test]
    fn tilt_and_heading_jacobian_rows() {
        let q = euler_to_quat(&Vector3::new(0.2, -0.3, 0.9));
        check_derivative(&q, &droll_dq(&q), |q| quat_to_euler(q)[0]);
        check_derivative(&q, &dpitch_dq(&q).unwrap(), |q| quat_to_euler(q)[1]);
        check_derivative(&q, &dyaw_dq(&q), |q| quat_to_euler(q)[2]);
    }

    #[test]
    fn pitch_jacobian_guards_gimbal() {
        let q = euler_to_quat(&Vector3::new(0.0, std::f64::consts::FRAC_PI_2, 0.0));
        assert!(dpitch_dq(&q).is_none());
    }
}
