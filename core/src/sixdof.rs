//! Six-degree-of-freedom rigid-body truth model and synthetic sensors.
//!
//! [`SixDof`] integrates the standard body-frame rigid-body equations under
//! applied body forces and moments:
//!
//! ```text
//! v̇   = −ω×v + DCM·G + F/m
//! ω̇   = J⁻¹·(M − ω×(J·ω))
//! Θ̇   = E(Θ)·ω
//! ẋyz = DCMᵀ·v
//! ```
//!
//! with `J` the inertia tensor (symmetric, with the `Ixz` cross product of
//! inertia of a fuselage-symmetric airframe) and `E` the strapdown matrix.
//! The truth attitude is carried as Euler angles, wrapped into (−π, π] after
//! each step; the estimators never see these directly.
//!
//! Alongside the dynamic state, each step records the specific force a
//! strapdown IMU rigidly mounted at the center of gravity would report,
//! which feeds the synthetic sensors in [`SensorSuite`].

use std::error::Error;
use std::fmt;

use nalgebra::{Matrix3, Vector3};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::rotation::{euler_to_dcm, rate_cross, strapdown_matrix};
use crate::wrap_to_pi;

/// Errors constructing the truth model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SixDofError {
    /// The inertia tensor is not invertible, so the rotational dynamics are
    /// undefined for these parameters.
    SingularInertia,
}

impl fmt::Display for SixDofError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SixDofError::SingularInertia => write!(f, "inertia tensor is not invertible"),
        }
    }
}

impl Error for SixDofError {}

/// Mass properties of the simulated airframe.
#[derive(Debug, Clone, Copy)]
pub struct MassProperties {
    /// Vehicle mass, kg.
    pub mass: f64,
    /// Roll moment of inertia, kg·m².
    pub ixx: f64,
    /// Pitch moment of inertia, kg·m².
    pub iyy: f64,
    /// Yaw moment of inertia, kg·m².
    pub izz: f64,
    /// Roll/yaw cross product of inertia, kg·m².
    pub ixz: f64,
}

/// Rigid-body truth model.
#[derive(Debug, Clone)]
pub struct SixDof {
    mass: f64,
    inertia: Matrix3<f64>,
    inertia_inv: Matrix3<f64>,

    /// NED position, m.
    pub xyz: Vector3<f64>,
    /// Body-frame velocity, m/s.
    pub uvw: Vector3<f64>,
    /// Euler attitude (roll, pitch, yaw), rad.
    pub theta: Vector3<f64>,
    /// Body angular rates, rad/s.
    pub pqr: Vector3<f64>,

    /// Specific force felt by a strapdown IMU during the last step, m/s².
    imu_accel: Vector3<f64>,
}

impl SixDof {
    /// Build a truth model at rest at the NED origin. Fails if the inertia
    /// tensor built from the mass properties is singular.
    pub fn new(props: MassProperties) -> Result<Self, SixDofError> {
        let inertia = Matrix3::new(
            props.ixx, 0.0, -props.ixz, //
            0.0, props.iyy, 0.0, //
            -props.ixz, 0.0, props.izz,
        );
        let inertia_inv = inertia
            .try_inverse()
            .ok_or(SixDofError::SingularInertia)?;

        Ok(SixDof {
            mass: props.mass,
            inertia,
            inertia_inv,
            xyz: Vector3::zeros(),
            uvw: Vector3::zeros(),
            theta: Vector3::zeros(),
            pqr: Vector3::zeros(),
            imu_accel: Vector3::new(0.0, 0.0, -crate::GRAVITY),
        })
    }

    /// Advance the state by `dt` seconds under gravity `g` (m/s², positive
    /// down), an applied body-frame force (N), and body-frame moments (N·m).
    pub fn step(&mut self, dt: f64, g: f64, force: &Vector3<f64>, moment: &Vector3<f64>) {
        let dcm = euler_to_dcm(&self.theta);
        let om = rate_cross(&self.pqr);
        let e = strapdown_matrix(&self.theta);
        let gravity = Vector3::new(0.0, 0.0, g);

        let uvw_dot = -om * self.uvw + dcm * gravity + force / self.mass;
        let pqr_dot = self.inertia_inv * (moment - om * (self.inertia * self.pqr));
        let theta_dot = e * self.pqr;
        let xyz_dot = dcm.transpose() * self.uvw;

        self.uvw += uvw_dot * dt;
        self.xyz += xyz_dot * dt;
        self.pqr += pqr_dot * dt;
        self.theta += theta_dot * dt;

        self.theta[0] = wrap_to_pi(self.theta[0]);
        self.theta[1] = wrap_to_pi(self.theta[1]);
        self.theta[2] = wrap_to_pi(self.theta[2]);

        // The applied force is not what a strapdown accelerometer reports;
        // reconstruct the felt specific force for the synthetic sensors.
        self.imu_accel = uvw_dot + force / self.mass + self.pqr.cross(&self.uvw);
    }

    /// Specific force from the last step, body frame, m/s². At rest this is
    /// `(0, 0, −g)`.
    pub fn imu_accel(&self) -> Vector3<f64> {
        self.imu_accel
    }

    /// NED velocity, m/s.
    pub fn velocity_ned(&self) -> Vector3<f64> {
        euler_to_dcm(&self.theta).transpose() * self.uvw
    }

    /// The body force that exactly cancels gravity at the current attitude,
    /// useful for driving hover scenarios.
    pub fn hover_force(&self, g: f64) -> Vector3<f64> {
        -(euler_to_dcm(&self.theta) * Vector3::new(0.0, 0.0, g)) * self.mass
    }
}

/// Gaussian noise parameters for the synthetic sensors.
#[derive(Debug, Clone, Copy)]
pub struct NoiseParams {
    /// Accelerometer noise per axis, m/s².
    pub accel_sigma: f64,
    /// Gyro noise per axis, rad/s.
    pub gyro_sigma: f64,
    /// Constant gyro bias, rad/s.
    pub gyro_bias: Vector3<f64>,
    /// GPS position noise per axis, m.
    pub gps_position_sigma: f64,
    /// GPS velocity noise per axis, m/s.
    pub gps_velocity_sigma: f64,
    /// Compass heading noise, rad.
    pub heading_sigma: f64,
}

impl Default for NoiseParams {
    fn default() -> Self {
        NoiseParams {
            accel_sigma: 0.05,
            gyro_sigma: 0.005,
            gyro_bias: Vector3::zeros(),
            gps_position_sigma: 0.4,
            gps_velocity_sigma: 0.1,
            heading_sigma: 0.02,
        }
    }
}

/// Synthetic sensor suite sampling the truth model through Gaussian noise.
#[derive(Debug, Clone, Copy)]
pub struct SensorSuite {
    pub params: NoiseParams,
}

impl SensorSuite {
    pub fn new(params: NoiseParams) -> Self {
        SensorSuite { params }
    }

    fn gauss<R: Rng>(rng: &mut R, sigma: f64) -> f64 {
        let n: f64 = rng.sample(StandardNormal);
        n * sigma
    }

    fn gauss3<R: Rng>(rng: &mut R, sigma: f64) -> Vector3<f64> {
        Vector3::new(
            Self::gauss(rng, sigma),
            Self::gauss(rng, sigma),
            Self::gauss(rng, sigma),
        )
    }

    /// Noisy specific-force measurement, m/s².
    pub fn accel<R: Rng>(&self, rng: &mut R, truth: &SixDof) -> Vector3<f64> {
        truth.imu_accel() + Self::gauss3(rng, self.params.accel_sigma)
    }

    /// Noisy, biased angular-rate measurement, rad/s.
    pub fn gyro<R: Rng>(&self, rng: &mut R, truth: &SixDof) -> Vector3<f64> {
        truth.pqr + self.params.gyro_bias + Self::gauss3(rng, self.params.gyro_sigma)
    }

    /// Noisy GPS fix: NED position (m) and NED velocity (m/s).
    pub fn gps<R: Rng>(&self, rng: &mut R, truth: &SixDof) -> (Vector3<f64>, Vector3<f64>) {
        (
            truth.xyz + Self::gauss3(rng, self.params.gps_position_sigma),
            truth.velocity_ned() + Self::gauss3(rng, self.params.gps_velocity_sigma),
        )
    }

    /// Noisy compass heading, wrapped into (−π, π].
    pub fn compass<R: Rng>(&self, rng: &mut R, truth: &SixDof) -> f64 {
        wrap_to_pi(truth.theta[2] + Self::gauss(rng, self.params.heading_sigma))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use crate::GRAVITY;

    fn heli() -> MassProperties {
        MassProperties {
            mass: 8.0,
            ixx: 0.3,
            iyy: 0.6,
            izz: 0.7,
            ixz: 0.02,
        }
    }

    #[test]
    fn singular_inertia_is_rejected() {
        let err = SixDof::new(MassProperties {
            mass: 8.0,
            ixx: 0.0,
            iyy: 0.0,
            izz: 0.0,
            ixz: 0.0,
        })
        .unwrap_err();
        assert_eq!(err, SixDofError::SingularInertia);
    }

    #[test]
    fn free_fall_accelerates_at_g() {
        let mut body = SixDof::new(heli()).unwrap();
        for _ in 0..10 {
            body.step(0.1, GRAVITY, &Vector3::zeros(), &Vector3::zeros());
        }
        // level attitude: all of the speed is on the body z axis
        assert_approx_eq!(body.uvw[2], GRAVITY, 1e-9);
        assert_approx_eq!(body.uvw[0], 0.0, 1e-12);
    }

    #[test]
    fn hover_holds_position() {
        let mut body = SixDof::new(heli()).unwrap();
        for _ in 0..100 {
            let lift = body.hover_force(GRAVITY);
            body.step(0.01, GRAVITY, &lift, &Vector3::zeros());
        }
        assert_approx_eq!(body.xyz.norm(), 0.0, 1e-9);
        assert_approx_eq!(body.uvw.norm(), 0.0, 1e-9);
        // hovering feels exactly 1 g, upward along body z
        assert_approx_eq!(body.imu_accel()[2], -GRAVITY, 1e-9);
    }

    #[test]
    fn pure_yaw_moment_spins_about_z() {
        // no cross product of inertia, so yaw stays decoupled from roll
        let mut body = SixDof::new(MassProperties { ixz: 0.0, ..heli() }).unwrap();
        for _ in 0..100 {
            let lift = body.hover_force(GRAVITY);
            body.step(0.01, GRAVITY, &lift, &Vector3::new(0.0, 0.0, 0.05));
        }
        assert!(body.pqr[2] > 0.0);
        assert!(body.theta[2] > 0.0);
        // pitch stays untouched by a pure yaw torque at level attitude
        assert_approx_eq!(body.theta[1], 0.0, 1e-9);
    }

    #[test]
    fn euler_angles_stay_wrapped() {
        let mut body = SixDof::new(MassProperties { ixz: 0.0, ..heli() }).unwrap();
        body.pqr[2] = 1.0;
        for _ in 0..1000 {
            let lift = body.hover_force(GRAVITY);
            body.step(0.01, GRAVITY, &lift, &Vector3::zeros());
        }
        assert!(body.theta[2] > -std::f64::consts::PI);
        assert!(body.theta[2] <= std::f64::consts::PI);
    }

    #[test]
    fn sensors_are_unbiased_around_truth() {
        let body = SixDof::new(heli()).unwrap();
        let suite = SensorSuite::new(NoiseParams::default());
        let mut rng = rand::rng();

        let mut sum = Vector3::zeros();
        for _ in 0..2000 {
            sum += suite.accel(&mut rng, &body);
        }
        let mean = sum / 2000.0;
        // at rest the mean accel is gravity reaction, well inside 5 sigma
        assert_approx_eq!(mean[2], -GRAVITY, 0.05);
        assert_approx_eq!(mean[0], 0.0, 0.05);
    }

    #[test]
    fn gyro_carries_configured_bias() {
        let body = SixDof::new(heli()).unwrap();
        let mut params = NoiseParams::default();
        params.gyro_bias = Vector3::new(0.02, 0.0, 0.0);
        params.gyro_sigma = 0.0;
        let suite = SensorSuite::new(params);
        let mut rng = rand::rng();

        let gyro = suite.gyro(&mut rng, &body);
        assert_approx_eq!(gyro[0], 0.02, 1e-12);
    }
}
