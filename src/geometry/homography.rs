//! Planar homographies and Zhang's closed-form initialisation.

use super::Pose;
use crate::camera::Resolution;
use crate::error::CalibrationError;
use nalgebra::{DMatrix, Matrix3, Point2, Vector3};

fn solver_error(message: &str) -> CalibrationError {
    CalibrationError::Solver(message.to_string())
}

/// Translates points to their centroid and scales them to mean distance `sqrt(2)`.
///
/// Returns the normalised points and the similarity that produced them.
pub fn normalize_points_hartley(
    points: &[Point2<f64>],
) -> Result<(Vec<Point2<f64>>, Matrix3<f64>), CalibrationError> {
    if points.is_empty() {
        return Err(solver_error("cannot normalise an empty point set"));
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.x).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = points
        .iter()
        .map(|p| ((p.x - mean_x).powi(2) + (p.y - mean_y).powi(2)).sqrt())
        .sum::<f64>()
        / n;

    let scale = if mean_dist > 1e-18 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };

    let normalized = points
        .iter()
        .map(|p| Point2::new((p.x - mean_x) * scale, (p.y - mean_y) * scale))
        .collect();
    let t = Matrix3::new(
        scale, 0.0, -mean_x * scale, //
        0.0, scale, -mean_y * scale, //
        0.0, 0.0, 1.0,
    );
    Ok((normalized, t))
}

/// Direct linear transform estimate of `H` with `dst ~ H * src`.
pub fn estimate_homography(
    src: &[Point2<f64>],
    dst: &[Point2<f64>],
) -> Result<Matrix3<f64>, CalibrationError> {
    if src.len() != dst.len() || src.len() < 4 {
        return Err(solver_error("homography needs at least 4 paired points"));
    }

    let (src_n, t_src) = normalize_points_hartley(src)?;
    let (dst_n, t_dst) = normalize_points_hartley(dst)?;

    let mut a = DMatrix::<f64>::zeros(2 * src.len(), 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y, u, v) = (s.x, s.y, d.x, d.y);
        let r0 = 2 * i;
        a[(r0, 0)] = -x;
        a[(r0, 1)] = -y;
        a[(r0, 2)] = -1.0;
        a[(r0, 6)] = u * x;
        a[(r0, 7)] = u * y;
        a[(r0, 8)] = u;

        let r1 = r0 + 1;
        a[(r1, 3)] = -x;
        a[(r1, 4)] = -y;
        a[(r1, 5)] = -1.0;
        a[(r1, 6)] = v * x;
        a[(r1, 7)] = v * y;
        a[(r1, 8)] = v;
    }

    // A^T A keeps the SVD at 9x9 regardless of the point count.
    let ata = a.transpose() * &a;
    let svd = ata.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| solver_error("SVD failed while estimating homography"))?;
    let min_index = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| solver_error("empty singular value set"))?;
    let h = v_t.row(min_index);
    let h_normalized = Matrix3::new(
        h[0], h[1], h[2], //
        h[3], h[4], h[5], //
        h[6], h[7], h[8],
    );

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or_else(|| solver_error("singular normalisation transform"))?;
    let mut homography = t_dst_inv * h_normalized * t_src;
    if homography[(2, 2)].abs() > 1e-12 {
        homography /= homography[(2, 2)];
    }
    Ok(homography)
}

fn v_ij(h: &Matrix3<f64>, i: usize, j: usize) -> [f64; 6] {
    [
        h[(0, i)] * h[(0, j)],
        h[(0, i)] * h[(1, j)] + h[(1, i)] * h[(0, j)],
        h[(1, i)] * h[(1, j)],
        h[(2, i)] * h[(0, j)] + h[(0, i)] * h[(2, j)],
        h[(2, i)] * h[(1, j)] + h[(1, i)] * h[(2, j)],
        h[(2, i)] * h[(2, j)],
    ]
}

/// Similarity taking pixel coordinates of an image of this size to roughly `[-1, 1]`.
fn pixel_normalization(image_size: Resolution) -> Matrix3<f64> {
    if image_size.width == 0 || image_size.height == 0 {
        return Matrix3::identity();
    }
    let half_w = image_size.width as f64 / 2.0;
    let half_h = image_size.height as f64 / 2.0;
    let scale = 2.0 / (half_w + half_h);
    Matrix3::new(
        scale, 0.0, -half_w * scale, //
        0.0, scale, -half_h * scale, //
        0.0, 0.0, 1.0,
    )
}

/// Zhang's closed-form camera matrix from three or more board homographies.
///
/// The homographies are conditioned with the image size before the linear
/// solve. The returned matrix has zero skew.
pub fn intrinsics_from_homographies(
    homographies: &[Matrix3<f64>],
    image_size: Resolution,
) -> Result<Matrix3<f64>, CalibrationError> {
    if homographies.len() < 3 {
        return Err(CalibrationError::InsufficientData {
            required: 3,
            available: homographies.len(),
        });
    }

    let n = pixel_normalization(image_size);
    let n_inv = n
        .try_inverse()
        .ok_or_else(|| solver_error("singular pixel normalisation"))?;

    let mut v = DMatrix::<f64>::zeros(2 * homographies.len(), 6);
    for (i, h) in homographies.iter().enumerate() {
        let h = n * h;
        let v12 = v_ij(&h, 0, 1);
        let v11 = v_ij(&h, 0, 0);
        let v22 = v_ij(&h, 1, 1);
        for j in 0..6 {
            v[(2 * i, j)] = v12[j];
            v[(2 * i + 1, j)] = v11[j] - v22[j];
        }
    }

    let svd = v.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| solver_error("SVD failed while solving for intrinsics"))?;
    let min_index = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| solver_error("empty singular value set"))?;
    let mut b: [f64; 6] = std::array::from_fn(|j| v_t[(min_index, j)]);

    // The null vector is defined up to sign; B must be positive definite.
    if b[0] < 0.0 {
        b.iter_mut().for_each(|value| *value = -*value);
    }
    let [b11, b12, b22, b13, b23, b33] = b;

    let denom = b11 * b22 - b12 * b12;
    if denom.abs() < 1e-18 || b11.abs() < 1e-18 {
        return Err(solver_error("degenerate board poses for intrinsic estimation"));
    }
    let v0 = (b12 * b13 - b11 * b23) / denom;
    let lambda = b33 - (b13 * b13 + v0 * (b12 * b13 - b11 * b23)) / b11;
    if lambda <= 0.0 || denom <= 0.0 {
        return Err(solver_error("board poses do not constrain the intrinsics"));
    }

    let alpha = (lambda / b11).sqrt();
    let beta = (lambda * b11 / denom).sqrt();
    let gamma = -b12 * alpha * alpha * beta / lambda;
    let u0 = gamma * v0 / beta - b13 * alpha * alpha / lambda;

    let normalized_k = Matrix3::new(
        alpha, 0.0, u0, //
        0.0, beta, v0, //
        0.0, 0.0, 1.0,
    );
    Ok(n_inv * normalized_k)
}

/// Closest rotation to `m` in the Frobenius sense.
pub fn nearest_rotation(m: &Matrix3<f64>) -> Result<Matrix3<f64>, CalibrationError> {
    let svd = m.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| solver_error("SVD U missing while orthonormalising rotation"))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| solver_error("SVD V^T missing while orthonormalising rotation"))?;
    let mut r = u * v_t;
    if r.determinant() < 0.0 {
        let mut u_flipped = u;
        u_flipped.column_mut(2).neg_mut();
        r = u_flipped * v_t;
    }
    Ok(r)
}

/// Recovers the board pose from `H = K [r1 r2 t]`.
///
/// The sign is chosen so the board lies in front of the camera.
pub fn pose_from_homography(
    k_inv: &Matrix3<f64>,
    homography: &Matrix3<f64>,
) -> Result<Pose, CalibrationError> {
    let r1_raw: Vector3<f64> = k_inv * homography.column(0);
    let r2_raw: Vector3<f64> = k_inv * homography.column(1);
    let t_raw: Vector3<f64> = k_inv * homography.column(2);

    let norm = r1_raw.norm();
    if norm < 1e-18 {
        return Err(solver_error("degenerate homography"));
    }
    let mut scale = 1.0 / norm;
    if t_raw.z * scale < 0.0 {
        scale = -scale;
    }

    let r1 = r1_raw * scale;
    let r2 = r2_raw * scale;
    let r3 = r1.cross(&r2);
    let rotation = nearest_rotation(&Matrix3::from_columns(&[r1, r2, r3]))?;
    Ok(Pose::from_rotation_matrix(&rotation, t_raw * scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Point3, Rotation3};

    fn board() -> Vec<Point2<f64>> {
        (0..5)
            .flat_map(|i| (0..7).map(move |j| Point2::new(j as f64 * 0.03, i as f64 * 0.03)))
            .collect()
    }

    fn project(k: &Matrix3<f64>, pose: &Pose, p: &Point2<f64>) -> Point2<f64> {
        let pc = pose.transform_point(&Point3::new(p.x, p.y, 0.0));
        let uv = k * (pc / pc.z);
        Point2::new(uv.x, uv.y)
    }

    fn poses() -> Vec<Pose> {
        vec![
            Pose::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.1, -0.05, 0.6)),
            Pose::new(Vector3::new(-0.3, 0.1, 0.0), Vector3::new(-0.08, -0.06, 0.7)),
            Pose::new(Vector3::new(0.25, 0.3, -0.1), Vector3::new(-0.12, -0.04, 0.65)),
            Pose::new(Vector3::new(0.0, -0.35, 0.2), Vector3::new(-0.05, -0.07, 0.8)),
        ]
    }

    #[test]
    fn test_homography_maps_board_to_image() {
        let k = Matrix3::new(600.0, 0.0, 320.0, 0.0, 600.0, 240.0, 0.0, 0.0, 1.0);
        let pose = poses()[0];
        let src = board();
        let dst: Vec<_> = src.iter().map(|p| project(&k, &pose, p)).collect();

        let h = estimate_homography(&src, &dst).unwrap();
        for (s, d) in src.iter().zip(dst.iter()) {
            let mapped = h * Vector3::new(s.x, s.y, 1.0);
            assert!((mapped.x / mapped.z - d.x).abs() < 1e-6);
            assert!((mapped.y / mapped.z - d.y).abs() < 1e-6);
        }
    }

    #[test]
    fn test_zhang_recovers_camera_and_pose() {
        let k = Matrix3::new(620.0, 0.0, 330.0, 0.0, 610.0, 250.0, 0.0, 0.0, 1.0);
        let src = board();
        let homographies: Vec<_> = poses()
            .iter()
            .map(|pose| {
                let dst: Vec<_> = src.iter().map(|p| project(&k, pose, p)).collect();
                estimate_homography(&src, &dst).unwrap()
            })
            .collect();

        let image_size = Resolution {
            width: 640,
            height: 480,
        };
        let estimated = intrinsics_from_homographies(&homographies, image_size).unwrap();
        assert!((estimated[(0, 0)] - 620.0).abs() < 1e-3);
        assert!((estimated[(1, 1)] - 610.0).abs() < 1e-3);
        assert!((estimated[(0, 2)] - 330.0).abs() < 1e-3);
        assert!((estimated[(1, 2)] - 250.0).abs() < 1e-3);

        let k_inv = estimated.try_inverse().unwrap();
        let pose = pose_from_homography(&k_inv, &homographies[2]).unwrap();
        let expected = poses()[2];
        assert!((pose.translation - expected.translation).norm() < 1e-6);
        assert!((pose.rotation - expected.rotation).norm() < 1e-6);
    }

    #[test]
    fn test_two_homographies_are_insufficient() {
        let err = intrinsics_from_homographies(
            &[Matrix3::identity(), Matrix3::identity()],
            Resolution::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CalibrationError::InsufficientData {
                required: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn test_nearest_rotation_is_orthonormal() {
        let r = Rotation3::new(Vector3::new(0.3, -0.1, 0.2)).into_inner();
        let perturbed = r + Matrix3::from_element(0.01);
        let projected = nearest_rotation(&perturbed).unwrap();
        assert!((projected * projected.transpose() - Matrix3::identity()).norm() < 1e-12);
        assert!((projected.determinant() - 1.0).abs() < 1e-12);
    }
}
