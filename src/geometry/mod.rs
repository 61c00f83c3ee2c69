//! Rigid transforms and the projection model shared by every solver stage.
//!
//! The projection helpers are generic over [`RealField`] so the same code
//! path serves plain `f64` evaluation and the dual numbers `tiny-solver`
//! differentiates through.

use nalgebra::{DVector, Matrix3, Point3, RealField, Rotation3, Vector3};
use serde::{Deserialize, Serialize};

pub mod homography;

pub use homography::{
    estimate_homography, intrinsics_from_homographies, nearest_rotation, pose_from_homography,
};

/// Rigid transform taking board (or left camera) coordinates into a camera frame.
///
/// The rotation is stored as an axis-angle vector whose norm is the angle in
/// radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    pub rotation: Vector3<f64>,
    pub translation: Vector3<f64>,
}

impl Pose {
    pub fn new(rotation: Vector3<f64>, translation: Vector3<f64>) -> Self {
        Pose {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Pose::new(Vector3::zeros(), Vector3::zeros())
    }

    /// Builds a pose from a rotation matrix that is assumed orthonormal.
    pub fn from_rotation_matrix(rotation: &Matrix3<f64>, translation: Vector3<f64>) -> Self {
        let rotation = Rotation3::from_matrix_unchecked(*rotation).scaled_axis();
        Pose::new(rotation, translation)
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        Rotation3::new(self.rotation).into_inner()
    }

    pub fn transform_point(&self, point: &Point3<f64>) -> Vector3<f64> {
        self.rotation_matrix() * point.coords + self.translation
    }

    /// `self ∘ other`: apply `other` first, then `self`.
    pub fn compose(&self, other: &Pose) -> Pose {
        let r = self.rotation_matrix();
        Pose::from_rotation_matrix(
            &(r * other.rotation_matrix()),
            r * other.translation + self.translation,
        )
    }

    /// Packs the pose as `[rx, ry, rz, tx, ty, tz]` for the optimizer.
    pub fn to_params(&self) -> DVector<f64> {
        DVector::from_row_slice(&[
            self.rotation.x,
            self.rotation.y,
            self.rotation.z,
            self.translation.x,
            self.translation.y,
            self.translation.z,
        ])
    }

    pub fn from_params(params: &DVector<f64>) -> Self {
        Pose::new(
            Vector3::new(params[0], params[1], params[2]),
            Vector3::new(params[3], params[4], params[5]),
        )
    }
}

/// Cross-product matrix `[v]x`, so that `skew(v) * w == v.cross(w)`.
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(
        0.0, -v.z, v.y, //
        v.z, 0.0, -v.x, //
        -v.y, v.x, 0.0,
    )
}

/// Essential matrix `[t]x R` for a transform `X_r = R X_l + t`.
pub fn essential_matrix(rotation: &Matrix3<f64>, translation: &Vector3<f64>) -> Matrix3<f64> {
    skew(translation) * rotation
}

/// Fundamental matrix `K_r^-T E K_l^-1`, scaled so `F[2,2] == 1` when that entry is non-zero.
pub fn fundamental_matrix(
    left_k: &Matrix3<f64>,
    right_k: &Matrix3<f64>,
    essential: &Matrix3<f64>,
) -> Option<Matrix3<f64>> {
    let left_inv = left_k.try_inverse()?;
    let right_inv = right_k.try_inverse()?;
    let mut fundamental = right_inv.transpose() * essential * left_inv;
    if fundamental[(2, 2)].abs() > f64::EPSILON {
        fundamental /= fundamental[(2, 2)];
    }
    Some(fundamental)
}

fn cross<T: RealField>(a: &[T; 3], b: &[T; 3]) -> [T; 3] {
    [
        a[1].clone() * b[2].clone() - a[2].clone() * b[1].clone(),
        a[2].clone() * b[0].clone() - a[0].clone() * b[2].clone(),
        a[0].clone() * b[1].clone() - a[1].clone() * b[0].clone(),
    ]
}

/// Rotates `point` by the axis-angle vector `rvec` (Rodrigues' formula).
///
/// Near the identity the first-order expansion `p + r x p` is used so the
/// derivative stays finite at `rvec == 0`.
pub fn rotate_axis_angle<T: RealField>(rvec: &[T], point: &[T; 3]) -> [T; 3] {
    let r = [rvec[0].clone(), rvec[1].clone(), rvec[2].clone()];
    let theta2 =
        r[0].clone() * r[0].clone() + r[1].clone() * r[1].clone() + r[2].clone() * r[2].clone();

    if theta2 > nalgebra::convert::<f64, T>(1e-14) {
        let theta = theta2.sqrt();
        let k = [
            r[0].clone() / theta.clone(),
            r[1].clone() / theta.clone(),
            r[2].clone() / theta.clone(),
        ];
        let (sin, cos) = (theta.clone().sin(), theta.cos());
        let k_cross_p = cross(&k, point);
        let k_dot_p = k[0].clone() * point[0].clone()
            + k[1].clone() * point[1].clone()
            + k[2].clone() * point[2].clone();
        let one_minus_cos = T::one() - cos.clone();
        std::array::from_fn(|i| {
            point[i].clone() * cos.clone()
                + k_cross_p[i].clone() * sin.clone()
                + k[i].clone() * k_dot_p.clone() * one_minus_cos.clone()
        })
    } else {
        let r_cross_p = cross(&r, point);
        std::array::from_fn(|i| point[i].clone() + r_cross_p[i].clone())
    }
}

/// Applies the pose packed as `[rx, ry, rz, tx, ty, tz]` to `point`.
pub fn transform<T: RealField>(pose: &[T], point: &[T; 3]) -> [T; 3] {
    let rotated = rotate_axis_angle(&pose[0..3], point);
    std::array::from_fn(|i| rotated[i].clone() + pose[3 + i].clone())
}

/// Projects a camera-frame point through the radial-tangential model.
///
/// `camera` is `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
pub fn project_rad_tan<T: RealField>(camera: &[T], point: &[T; 3]) -> [T; 2] {
    let fx = camera[0].clone();
    let fy = camera[1].clone();
    let cx = camera[2].clone();
    let cy = camera[3].clone();
    let k1 = camera[4].clone();
    let k2 = camera[5].clone();
    let p1 = camera[6].clone();
    let p2 = camera[7].clone();
    let k3 = camera[8].clone();

    let x = point[0].clone() / point[2].clone();
    let y = point[1].clone() / point[2].clone();

    let two = nalgebra::convert::<f64, T>(2.0);
    let r2 = x.clone() * x.clone() + y.clone() * y.clone();
    let r4 = r2.clone() * r2.clone();
    let r6 = r4.clone() * r2.clone();
    let radial = T::one() + k1 * r2.clone() + k2 * r4 + k3 * r6;

    let xy = x.clone() * y.clone();
    let x_distorted = x.clone() * radial.clone()
        + two.clone() * p1.clone() * xy.clone()
        + p2.clone() * (r2.clone() + two.clone() * x.clone() * x);
    let y_distorted = y.clone() * radial
        + p1 * (r2 + two.clone() * y.clone() * y)
        + two * p2 * xy;

    [fx * x_distorted + cx, fy * y_distorted + cy]
}

/// Lifts an `f64` board point into `T`.
pub fn lift_point<T: RealField>(point: &Point3<f64>) -> [T; 3] {
    [
        nalgebra::convert(point.x),
        nalgebra::convert(point.y),
        nalgebra::convert(point.z),
    ]
}
