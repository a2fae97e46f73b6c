//! Frame-tagged vectors and geodetic-to-tangent-plane projection.
//!
//! Filter bugs in this domain are frequently frame bugs: a body-frame
//! velocity fed where a NED velocity was expected compiles fine and flies
//! badly. [`FrameVec`] tags a `Vector3` with its reference frame at the type
//! level, and [`FrameRotation`] only maps between the frames it was built
//! for, so mixing frames is a compile error instead of a flight test
//! discovery. The tags are zero sized; a `FrameVec` has the same layout and
//! cost as the bare vector.
//!
//! The geodetic helpers project WGS84 positions into the local tangent plane
//! (NED, origin at the first GPS fix) and back, going through ECEF.

use std::fmt;
use std::marker::PhantomData;
use std::ops::{Add, Mul, Neg, Sub};

use nalgebra::{Matrix3, Vector3, Vector4};
use nav_types::{ECEF, WGS84};

use crate::rotation::{euler_to_dcm, quat_to_dcm};

/// A reference frame marker.
pub trait Frame {
    /// Short name used in debug output.
    const NAME: &'static str;
}

/// Body frame: x forward, y right, z down, origin at the center of gravity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Body;

/// Local tangent plane: x north, y east, z down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ned;

impl Frame for Body {
    const NAME: &'static str = "body";
}

impl Frame for Ned {
    const NAME: &'static str = "NED";
}

/// A 3-vector tagged with the frame it is expressed in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameVec<F: Frame> {
    inner: Vector3<f64>,
    _frame: PhantomData<F>,
}

impl<F: Frame> FrameVec<F> {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self::from_vector(Vector3::new(x, y, z))
    }

    pub fn from_vector(inner: Vector3<f64>) -> Self {
        FrameVec {
            inner,
            _frame: PhantomData,
        }
    }

    pub fn zeros() -> Self {
        Self::from_vector(Vector3::zeros())
    }

    /// The untagged vector.
    pub fn into_inner(self) -> Vector3<f64> {
        self.inner
    }

    pub fn as_vector(&self) -> &Vector3<f64> {
        &self.inner
    }

    pub fn norm(&self) -> f64 {
        self.inner.norm()
    }
}

impl<F: Frame> Add for FrameVec<F> {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::from_vector(self.inner + rhs.inner)
    }
}

impl<F: Frame> Sub for FrameVec<F> {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::from_vector(self.inner - rhs.inner)
    }
}

impl<F: Frame> Neg for FrameVec<F> {
    type Output = Self;
    fn neg(self) -> Self {
        Self::from_vector(-self.inner)
    }
}

impl<F: Frame> Mul<f64> for FrameVec<F> {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::from_vector(self.inner * rhs)
    }
}

impl<F: Frame> fmt::Display for FrameVec<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:.4}, {:.4}, {:.4}] {}",
            self.inner[0],
            self.inner[1],
            self.inner[2],
            F::NAME
        )
    }
}

/// A rotation that maps vectors from frame `A` into frame `B`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRotation<A: Frame, B: Frame> {
    matrix: Matrix3<f64>,
    _frames: PhantomData<(A, B)>,
}

impl<A: Frame, B: Frame> FrameRotation<A, B> {
    pub fn from_matrix(matrix: Matrix3<f64>) -> Self {
        FrameRotation {
            matrix,
            _frames: PhantomData,
        }
    }

    /// Rotate a vector from frame `A` into frame `B`.
    pub fn apply(&self, v: &FrameVec<A>) -> FrameVec<B> {
        FrameVec::from_vector(self.matrix * v.as_vector())
    }

    /// The reverse mapping. Rotations are orthonormal, so the inverse is the
    /// transpose.
    pub fn inverse(&self) -> FrameRotation<B, A> {
        FrameRotation::from_matrix(self.matrix.transpose())
    }

    /// Chain with a rotation out of frame `B`.
    pub fn then<C: Frame>(&self, next: &FrameRotation<B, C>) -> FrameRotation<A, C> {
        FrameRotation::from_matrix(next.matrix * self.matrix)
    }
}

/// NED-to-body rotation at the given Euler attitude.
pub fn ned_to_body(euler: &Vector3<f64>) -> FrameRotation<Ned, Body> {
    FrameRotation::from_matrix(euler_to_dcm(euler))
}

/// NED-to-body rotation at the given quaternion attitude.
pub fn ned_to_body_quat(q: &Vector4<f64>) -> FrameRotation<Ned, Body> {
    FrameRotation::from_matrix(quat_to_dcm(q))
}

/// ECEF-to-NED rotation at a tangent-plane origin.
fn ecef_to_tangent(lat_rad: f64, lon_rad: f64) -> Matrix3<f64> {
    let (slat, clat) = lat_rad.sin_cos();
    let (slon, clon) = lon_rad.sin_cos();

    Matrix3::new(
        -slat * clon,
        -slat * slon,
        clat,
        -slon,
        clon,
        0.0,
        -clat * clon,
        -clat * slon,
        -slat,
    )
}

/// Project a geodetic position into the NED tangent plane anchored at
/// `origin`.
pub fn geodetic_to_tangent(origin: &WGS84<f64>, point: &WGS84<f64>) -> FrameVec<Ned> {
    let origin_ecef = ECEF::from(*origin);
    let point_ecef = ECEF::from(*point);
    let delta = Vector3::new(
        point_ecef.x() - origin_ecef.x(),
        point_ecef.y() - origin_ecef.y(),
        point_ecef.z() - origin_ecef.z(),
    );

    let re2t = ecef_to_tangent(origin.latitude_radians(), origin.longitude_radians());
    FrameVec::from_vector(re2t * delta)
}

/// Lift a tangent-plane position back to a geodetic position.
pub fn tangent_to_geodetic(origin: &WGS84<f64>, ned: &FrameVec<Ned>) -> WGS84<f64> {
    let origin_ecef = ECEF::from(*origin);
    let rt2e = ecef_to_tangent(origin.latitude_radians(), origin.longitude_radians()).transpose();
    let delta = rt2e * ned.as_vector();

    WGS84::from(ECEF::new(
        origin_ecef.x() + delta[0],
        origin_ecef.y() + delta[1],
        origin_ecef.z() + delta[2],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn eastward_offset_projects_east() {
        let origin = WGS84::from_degrees_and_meters(0.0, 0.0, 0.0);
        let point = WGS84::from_degrees_and_meters(0.0, 0.001, 0.0);
        let ned = geodetic_to_tangent(&origin, &point);

        // 0.001 deg of longitude at the equator is about 111.32 m east
        assert_approx_eq!(ned.as_vector()[1], 111.32, 0.05);
        assert_approx_eq!(ned.as_vector()[0], 0.0, 1e-6);
    }

    #[test]
    fn altitude_projects_up() {
        let origin = WGS84::from_degrees_and_meters(39.05, -77.11, 100.0);
        let point = WGS84::from_degrees_and_meters(39.05, -77.11, 150.0);
        let ned = geodetic_to_tangent(&origin, &point);

        // 50 m higher means 50 m negative down
        assert_approx_eq!(ned.as_vector()[2], -50.0, 1e-6);
        assert_approx_eq!(ned.as_vector()[0], 0.0, 1e-6);
        assert_approx_eq!(ned.as_vector()[1], 0.0, 1e-6);
    }

    #[test]
    fn tangent_round_trip() {
        let origin = WGS84::from_degrees_and_meters(39.047466, -77.113883, 20.0);
        let ned = FrameVec::<Ned>::new(120.0, -340.0, -15.0);
        let back = geodetic_to_tangent(&origin, &tangent_to_geodetic(&origin, &ned));

        for i in 0..3 {
            assert_approx_eq!(back.as_vector()[i], ned.as_vector()[i], 1e-6);
        }
    }

    #[test]
    fn rotation_inverse_round_trips() {
        let att = Vector3::new(0.2, -0.1, 1.3);
        let rot = ned_to_body(&att);
        let v = FrameVec::<Ned>::new(1.0, -2.0, 0.5);
        let back = rot.inverse().apply(&rot.apply(&v));

        for i in 0..3 {
            assert_approx_eq!(back.as_vector()[i], v.as_vector()[i], 1e-12);
        }
    }

    #[test]
    fn yawed_body_sees_north_on_negative_y() {
        let rot = ned_to_body(&Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let north = FrameVec::<Ned>::new(1.0, 0.0, 0.0);
        let body = rot.apply(&north);

        assert_approx_eq!(body.as_vector()[0], 0.0, 1e-12);
        assert_approx_eq!(body.as_vector()[1], -1.0, 1e-12);
    }
}
