//! Seven-state attitude and heading reference system.
//!
//! The state vector is `X = [q0, q1, q2, q3, bp, bq, br]`: the attitude
//! quaternion (scalar first) and the three-axis gyro bias, modeled as a
//! random walk. Gyro samples propagate the state, accelerometer samples
//! correct roll and pitch through the gravity direction, and compass samples
//! correct yaw. The filter holds two invariants across every operation: the
//! quaternion block stays unit norm (renormalized after each propagation and
//! correction) and the covariance stays symmetric.
//!
//! Corrections that cannot be applied — a singular innovation covariance, or
//! a tilt Jacobian evaluated at the gimbal boundary — skip the sample and
//! leave the state untouched rather than propagating a bad update.

use log::{debug, warn};
use nalgebra::{SMatrix, SVector, Vector3, Vector4};

use crate::kalman::{kalman_update, symmetrize, KalmanError};
use crate::rotation::{
    accel_to_roll_pitch, droll_dq, dpitch_dq, dyaw_dq, euler_to_quat, quat_rate, quat_to_euler,
};
use crate::{angle_innovation, wrap_to_pi};

const N: usize = 7;

/// Noise and initial-uncertainty parameters for [`Ahrs`].
///
/// Process noise densities are continuous-time (scaled by dt during
/// propagation); measurement variances are per sample.
#[derive(Debug, Clone, Copy)]
pub struct AhrsConfig {
    /// Process noise density on each quaternion component.
    pub q_attitude: f64,
    /// Process noise density on each gyro bias component, rad²/s³.
    pub q_bias: f64,
    /// Accelerometer-derived roll/pitch measurement variance, rad².
    pub r_tilt: f64,
    /// Compass heading measurement variance, rad².
    pub r_heading: f64,
    /// Initial variance on each quaternion component.
    pub p_attitude: f64,
    /// Initial variance on each gyro bias component, (rad/s)².
    pub p_bias: f64,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        AhrsConfig {
            q_attitude: 1e-7,
            q_bias: 1e-8,
            r_tilt: 0.03,
            r_heading: 0.05,
            p_attitude: 1.0,
            p_bias: 0.01,
        }
    }
}

/// Quaternion-plus-gyro-bias attitude estimator.
#[derive(Debug, Clone)]
pub struct Ahrs {
    x: SVector<f64, N>,
    p: SMatrix<f64, N, N>,
    config: AhrsConfig,
    /// Bias-corrected body rates from the most recent gyro sample.
    pqr: Vector3<f64>,
    /// Corrections skipped because they could not be applied safely.
    skipped: u64,
}

impl Ahrs {
    /// Build a filter and initialize it from a static accelerometer reading,
    /// the current body rates, and an initial heading in radians.
    pub fn new(config: AhrsConfig, accel: &Vector3<f64>, pqr: &Vector3<f64>, heading: f64) -> Self {
        let mut ahrs = Ahrs {
            x: SVector::zeros(),
            p: SMatrix::zeros(),
            config,
            pqr: Vector3::zeros(),
            skipped: 0,
        };
        ahrs.initialize(accel, pqr, heading);
        ahrs
    }

    /// Re-derive the attitude from a gravity-dominated accelerometer reading
    /// and a heading, zero the bias estimate, and reseed the covariance. The
    /// rate sample seeds the exposed body rates only; the bias states start
    /// at zero and are learned in flight.
    pub fn initialize(&mut self, accel: &Vector3<f64>, pqr: &Vector3<f64>, heading: f64) {
        let (roll, pitch) = accel_to_roll_pitch(accel);
        let q = euler_to_quat(&Vector3::new(roll, pitch, wrap_to_pi(heading)));

        self.x = SVector::zeros();
        self.x.fixed_rows_mut::<4>(0).copy_from(&q);
        self.pqr = *pqr;

        self.p = SMatrix::zeros();
        for i in 0..4 {
            self.p[(i, i)] = self.config.p_attitude;
        }
        for i in 4..N {
            self.p[(i, i)] = self.config.p_bias;
        }
    }

    /// State transition Jacobian at the current state for the given
    /// bias-corrected rates: the quaternion rate block, plus the sensitivity
    /// of the quaternion rate to the bias states.
    fn make_a_matrix(&self, pqr: &Vector3<f64>) -> SMatrix<f64, N, N> {
        let q = self.quaternion();
        let mut a = SMatrix::<f64, N, N>::zeros();

        a.fixed_view_mut::<4, 4>(0, 0).copy_from(&quat_rate(pqr));

        // d(qdot)/d(bias) = -d(qdot)/d(pqr)
        let (q0, q1, q2, q3) = (q[0], q[1], q[2], q[3]);
        a.fixed_view_mut::<4, 3>(0, 4).copy_from(
            &(SMatrix::<f64, 4, 3>::new(
                q1, q2, q3, //
                -q0, q3, -q2, //
                -q3, -q0, q1, //
                q2, -q1, -q0,
            ) / 2.0),
        );

        a
    }

    /// Propagate the state and covariance through one gyro sample.
    ///
    /// The raw rates are debiased by the current bias estimate, the
    /// quaternion is integrated by forward Euler and renormalized, and the
    /// covariance follows `P += (A P + P Aᵀ + Q) dt`.
    pub fn imu_propagate(&mut self, gyro: &Vector3<f64>, dt: f64) {
        let pqr = gyro - self.bias();
        let a = self.make_a_matrix(&pqr);

        let q = self.quaternion();
        let q_new = (q + quat_rate(&pqr) * q * dt).normalize();
        self.x.fixed_rows_mut::<4>(0).copy_from(&q_new);
        self.pqr = pqr;

        let mut q_noise = SMatrix::<f64, N, N>::zeros();
        for i in 0..4 {
            q_noise[(i, i)] = self.config.q_attitude;
        }
        for i in 4..N {
            q_noise[(i, i)] = self.config.q_bias;
        }

        self.p += (a * self.p + self.p * a.transpose() + q_noise) * dt;
        symmetrize(&mut self.p);
    }

    /// Correct roll and pitch against the tilt implied by an accelerometer
    /// sample. Skipped near the gimbal boundary, where the pitch Jacobian is
    /// undefined.
    pub fn accel_correct(&mut self, accel: &Vector3<f64>) -> Result<(), KalmanError> {
        let q = self.quaternion();
        let Some(dpitch) = dpitch_dq(&q) else {
            self.skipped += 1;
            debug!("tilt correction skipped at gimbal boundary");
            return Ok(());
        };

        let (roll_meas, pitch_meas) = accel_to_roll_pitch(accel);
        let predicted = quat_to_euler(&q);
        let innovation = SVector::<f64, 2>::new(
            angle_innovation(roll_meas, predicted[0]),
            angle_innovation(pitch_meas, predicted[1]),
        );

        let droll = droll_dq(&q);
        let mut c = SMatrix::<f64, 2, N>::zeros();
        c.fixed_view_mut::<1, 4>(0, 0).copy_from(&droll.transpose());
        c.fixed_view_mut::<1, 4>(1, 0)
            .copy_from(&dpitch.transpose());

        let r = SMatrix::<f64, 2, 2>::identity() * self.config.r_tilt;
        self.apply_update(&c, &r, &innovation)
    }

    /// Correct yaw against a compass heading in radians.
    pub fn compass_correct(&mut self, heading: f64) -> Result<(), KalmanError> {
        let q = self.quaternion();
        let predicted = quat_to_euler(&q)[2];
        let innovation = SVector::<f64, 1>::new(angle_innovation(heading, predicted));

        let mut c = SMatrix::<f64, 1, N>::zeros();
        c.fixed_view_mut::<1, 4>(0, 0)
            .copy_from(&dyaw_dq(&q).transpose());

        let r = SMatrix::<f64, 1, 1>::new(self.config.r_heading);
        self.apply_update(&c, &r, &innovation)
    }

    fn apply_update<const M: usize>(
        &mut self,
        c: &SMatrix<f64, M, N>,
        r: &SMatrix<f64, M, M>,
        innovation: &SVector<f64, M>,
    ) -> Result<(), KalmanError> {
        match kalman_update(&mut self.x, &mut self.p, c, r, innovation) {
            Ok(()) => {
                let q = self.quaternion().normalize();
                self.x.fixed_rows_mut::<4>(0).copy_from(&q);
                Ok(())
            }
            Err(e) => {
                self.skipped += 1;
                warn!("attitude correction skipped: {e}");
                Err(e)
            }
        }
    }

    /// Recover from a corrupted state: if the quaternion block has gone
    /// non-finite or collapsed to zero norm, fall back to level attitude with
    /// zero bias and reseed the covariance. Returns whether a hard reset was
    /// required.
    pub fn reset(&mut self) -> bool {
        let q = self.quaternion();
        let norm = q.norm();
        if !norm.is_finite() || norm < 1e-6 || !self.p.iter().all(|v| v.is_finite()) {
            self.initialize(&Vector3::new(0.0, 0.0, -crate::GRAVITY), &Vector3::zeros(), 0.0);
            return true;
        }
        self.x.fixed_rows_mut::<4>(0).copy_from(&(q / norm));
        false
    }

    /// Current attitude quaternion, scalar first.
    pub fn quaternion(&self) -> Vector4<f64> {
        self.x.fixed_rows::<4>(0).into_owned()
    }

    /// Current attitude as Euler angles (roll, pitch, yaw), radians.
    pub fn theta(&self) -> Vector3<f64> {
        quat_to_euler(&self.quaternion())
    }

    /// Bias-corrected body rates from the most recent gyro sample, rad/s.
    pub fn pqr(&self) -> Vector3<f64> {
        self.pqr
    }

    /// Current gyro bias estimate, rad/s.
    pub fn bias(&self) -> Vector3<f64> {
        self.x.fixed_rows::<3>(4).into_owned()
    }

    /// Trace of the covariance, a cheap scalar health indicator.
    pub fn covariance_trace(&self) -> f64 {
        self.p.trace()
    }

    /// Corrections skipped so far (singular innovation or gimbal guard).
    pub fn skipped_corrections(&self) -> u64 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use crate::GRAVITY;

    fn static_accel() -> Vector3<f64> {
        Vector3::new(0.0, 0.0, -GRAVITY)
    }

    #[test]
    fn initializes_level_from_static_accel() {
        let ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        let euler = ahrs.theta();
        assert_approx_eq!(euler[0], 0.0, 1e-9);
        assert_approx_eq!(euler[1], 0.0, 1e-9);
        assert_approx_eq!(euler[2], 0.0, 1e-9);
        assert_approx_eq!(ahrs.quaternion().norm(), 1.0, 1e-12);
    }

    #[test]
    fn quaternion_stays_unit_under_propagation() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        let gyro = Vector3::new(0.1, -0.2, 0.3);
        for _ in 0..500 {
            ahrs.imu_propagate(&gyro, 0.01);
        }
        assert_approx_eq!(ahrs.quaternion().norm(), 1.0, 1e-12);
    }

    #[test]
    fn covariance_grows_without_aiding() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        let before = ahrs.covariance_trace();
        for _ in 0..100 {
            ahrs.imu_propagate(&Vector3::zeros(), 0.01);
        }
        assert!(ahrs.covariance_trace() > before);
    }

    #[test]
    fn covariance_stays_symmetric() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.5);
        for _ in 0..50 {
            ahrs.imu_propagate(&Vector3::new(0.05, 0.02, -0.04), 0.02);
            ahrs.accel_correct(&static_accel()).unwrap();
            ahrs.compass_correct(0.5).unwrap();
        }
        for i in 0..7 {
            for j in 0..7 {
                assert_eq!(ahrs.p[(i, j)], ahrs.p[(j, i)]);
            }
        }
    }

    #[test]
    fn accel_correction_pulls_roll_toward_measurement() {
        // start with a deliberate 10 deg roll error against a level truth
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        let wrong = euler_to_quat(&Vector3::new(10.0_f64.to_radians(), 0.0, 0.0));
        ahrs.x.fixed_rows_mut::<4>(0).copy_from(&wrong);

        let before = ahrs.theta()[0].abs();
        ahrs.accel_correct(&static_accel()).unwrap();
        let after = ahrs.theta()[0].abs();
        assert!(after < before);
    }

    #[test]
    fn heading_correction_crosses_the_wrap() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 179.0_f64.to_radians());
        let target = -179.0_f64.to_radians();
        ahrs.compass_correct(target).unwrap();

        // the estimate must move the short way, through +/-180
        let err = angle_innovation(target, ahrs.theta()[2]).abs();
        assert!(err < 2.0_f64.to_radians());
        assert!(ahrs.theta()[2].abs() > 178.0_f64.to_radians());
    }

    #[test]
    fn reset_recovers_from_nan() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        ahrs.x[0] = f64::NAN;
        assert!(ahrs.reset());
        assert_approx_eq!(ahrs.quaternion().norm(), 1.0, 1e-12);
        assert!(ahrs.theta().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn bias_is_observable_through_tilt_aiding() {
        // a constant gyro bias with a static vehicle should leak into the
        // bias states once tilt corrections anchor the attitude
        let mut ahrs = Ahrs::new(AhrsConfig::default(), &static_accel(), &Vector3::zeros(), 0.0);
        let bias = Vector3::new(0.02, -0.015, 0.0);
        for _ in 0..2000 {
            ahrs.imu_propagate(&bias, 0.01);
            ahrs.accel_correct(&static_accel()).unwrap();
            ahrs.compass_correct(0.0).unwrap();
        }
        let est = ahrs.bias();
        assert!((est[0] - 0.02).abs() < 0.01);
        assert!((est[1] + 0.015).abs() < 0.01);
    }
}
