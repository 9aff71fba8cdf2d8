//! Rigid-transform math: Euler parameters, pivoted application, and the
//! re-orthonormalization that keeps slice bases valid after an update.

use nalgebra::{Matrix3, Rotation3};
use serde::{Deserialize, Serialize};

use crate::geometry::Vec3;

/// Six rigid degrees of freedom. Translations in millimeters, rotations in
/// radians with `R = Rz * Ry * Rx`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RigidParams {
    pub tx: f64,
    pub ty: f64,
    pub tz: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl RigidParams {
    pub const COUNT: usize = 6;

    pub fn identity() -> Self {
        Self::default()
    }

    pub fn translation(&self) -> Vec3 {
        Vec3::new(self.tx, self.ty, self.tz)
    }

    pub fn rotation(&self) -> Matrix3<f64> {
        euler_rotation(self.rx, self.ry, self.rz)
    }

    pub fn is_identity(&self) -> bool {
        self.to_array().iter().all(|v| *v == 0.0)
    }

    /// `[tx, ty, tz, rx, ry, rz]`
    pub fn to_array(&self) -> [f64; 6] {
        [self.tx, self.ty, self.tz, self.rx, self.ry, self.rz]
    }

    pub fn from_array(p: [f64; 6]) -> Self {
        Self {
            tx: p[0],
            ty: p[1],
            tz: p[2],
            rx: p[3],
            ry: p[4],
            rz: p[5],
        }
    }
}

/// Rotation matrix for the `Rz * Ry * Rx` convention.
pub fn euler_rotation(rx: f64, ry: f64, rz: f64) -> Matrix3<f64> {
    // nalgebra applies roll (x), then pitch (y), then yaw (z).
    Rotation3::from_euler_angles(rx, ry, rz).into_inner()
}

/// `R * p + t`
#[inline]
pub fn apply_rigid(p: &Vec3, rotation: &Matrix3<f64>, translation: &Vec3) -> Vec3 {
    rotation * p + translation
}

/// Rotates `p` about `pivot`.
#[inline]
pub fn rotate_about(p: &Vec3, pivot: &Vec3, rotation: &Matrix3<f64>) -> Vec3 {
    rotation * (p - pivot) + pivot
}

/// A [`RigidParams`] bound to its pivot.
#[derive(Clone, Copy, Debug)]
pub struct RigidTransform {
    pub rotation: Matrix3<f64>,
    pub translation: Vec3,
    pub pivot: Vec3,
}

impl RigidTransform {
    pub fn new(params: &RigidParams, pivot: Vec3) -> Self {
        Self {
            rotation: params.rotation(),
            translation: params.translation(),
            pivot,
        }
    }

    pub fn identity() -> Self {
        Self {
            rotation: Matrix3::identity(),
            translation: Vec3::zeros(),
            pivot: Vec3::zeros(),
        }
    }

    /// Rotate about the pivot, then translate.
    #[inline]
    pub fn apply_point(&self, p: &Vec3) -> Vec3 {
        rotate_about(p, &self.pivot, &self.rotation) + self.translation
    }

    #[inline]
    pub fn apply_direction(&self, d: &Vec3) -> Vec3 {
        self.rotation * d
    }
}

/// Gram-Schmidt on a (row, column) pair, returning a right-handed
/// `(row, col, normal)` basis. `None` if the inputs are degenerate.
pub fn orthonormalize(row: &Vec3, col: &Vec3) -> Option<(Vec3, Vec3, Vec3)> {
    let row = row.try_normalize(1e-9)?;
    let col = (col - row * row.dot(col)).try_normalize(1e-9)?;
    let normal = row.cross(&col);
    Some((row, col, normal))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn zero_angles_give_identity() {
        assert_eq!(euler_rotation(0.0, 0.0, 0.0), Matrix3::identity());
        assert!(RigidParams::identity().is_identity());
    }

    #[test]
    fn identity_rotation_is_exact_translation() {
        let p = Vec3::new(12.5, -3.25, 7.0);
        let t = Vec3::new(1.5, 2.0, -4.0);
        let moved = apply_rigid(&p, &euler_rotation(0.0, 0.0, 0.0), &t);
        assert_eq!(moved, Vec3::new(14.0, -1.25, 3.0));
    }

    #[test]
    fn rotation_order_is_z_after_y_after_x() {
        let r = euler_rotation(0.3, -0.2, 0.7);
        let rx = Rotation3::from_axis_angle(&Vec3::x_axis(), 0.3);
        let ry = Rotation3::from_axis_angle(&Vec3::y_axis(), -0.2);
        let rz = Rotation3::from_axis_angle(&Vec3::z_axis(), 0.7);
        let expected = (rz * ry * rx).into_inner();
        assert_relative_eq!(r, expected, epsilon = 1e-12);
    }

    #[test]
    fn yaw_quarter_turn_maps_x_to_y() {
        let r = euler_rotation(0.0, 0.0, FRAC_PI_2);
        assert_relative_eq!(r * Vec3::x(), Vec3::y(), epsilon = 1e-12);
    }

    #[test]
    fn pivot_rotation_preserves_distance() {
        let pivot = Vec3::new(40.0, -12.0, 5.0);
        let p = Vec3::new(3.0, 8.0, -20.0);
        let r = euler_rotation(0.4, -1.1, 2.3);
        let q = rotate_about(&p, &pivot, &r);
        assert_relative_eq!((q - pivot).norm(), (p - pivot).norm(), epsilon = 1e-9);
        assert!((q - p).norm() > 1.0);
    }

    #[test]
    fn transform_rotates_about_pivot_not_origin() {
        let pivot = Vec3::new(10.0, 0.0, 0.0);
        let params = RigidParams {
            rz: FRAC_PI_2,
            ..Default::default()
        };
        let t = RigidTransform::new(&params, pivot);
        assert_relative_eq!(t.apply_point(&pivot), pivot, epsilon = 1e-12);
        assert_relative_eq!(
            t.apply_point(&Vec3::new(11.0, 0.0, 0.0)),
            Vec3::new(10.0, 1.0, 0.0),
            epsilon = 1e-12
        );
    }

    #[test]
    fn orthonormalize_repairs_skewed_basis() {
        let (r, c, n) = orthonormalize(&Vec3::new(2.0, 0.0, 0.0), &Vec3::new(0.3, 1.0, 0.0)).unwrap();
        assert_relative_eq!(r, Vec3::x(), epsilon = 1e-12);
        assert_relative_eq!(c, Vec3::y(), epsilon = 1e-12);
        assert_relative_eq!(n, Vec3::z(), epsilon = 1e-12);
        assert!(orthonormalize(&Vec3::x(), &Vec3::new(3.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn params_round_trip_through_array() {
        let p = RigidParams::from_array([1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
        assert_eq!(p.to_array(), [1.0, 2.0, 3.0, 0.1, 0.2, 0.3]);
    }
}
