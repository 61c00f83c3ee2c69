//! Single-camera calibration from planar board views.
//!
//! Initial intrinsics and per-view poses come from Zhang's homography method
//! (distortion starts at zero), then all nine camera parameters and every
//! board pose are refined jointly.

use super::{
    pose_key, run_levenberg_marquardt, squared_error, take_variable, CameraBlock, Optimizer,
    ReprojectionFactor,
};
use crate::camera::{CameraModel, Intrinsics, RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{self, Pose};
use log::info;
use nalgebra::{Point2, Point3};
use std::collections::HashMap;

const CAMERA_KEY: &str = "camera";

/// Board points further than this from `z = 0` make a target non-planar.
const PLANAR_TOLERANCE: f64 = 1e-9;

/// Projects board points through `camera` after moving them by `pose`.
pub fn project_view(
    camera: &RadTanModel,
    pose: &Pose,
    object_points: &[Point3<f64>],
) -> Result<Vec<Point2<f64>>, CalibrationError> {
    object_points
        .iter()
        .map(|p| -> Result<Point2<f64>, CalibrationError> {
            let projected = camera.project(&pose.transform_point(p))?;
            Ok(Point2::new(projected.x, projected.y))
        })
        .collect()
}

/// Checks that object and image sequences pair up view by view.
pub(crate) fn check_views(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
) -> Result<(), CalibrationError> {
    if object_points.len() != image_points.len() {
        return Err(CalibrationError::MisalignedCorrespondences(format!(
            "{} object point sets but {} image point sets",
            object_points.len(),
            image_points.len()
        )));
    }
    for (i, (objects, images)) in object_points.iter().zip(image_points.iter()).enumerate() {
        if objects.len() != images.len() {
            return Err(CalibrationError::MisalignedCorrespondences(format!(
                "view {i} has {} object points but {} image points",
                objects.len(),
                images.len()
            )));
        }
        if objects.len() < 4 {
            return Err(CalibrationError::Configuration(format!(
                "view {i} has {} points, at least 4 are required",
                objects.len()
            )));
        }
        if objects.iter().any(|p| p.z.abs() > PLANAR_TOLERANCE) {
            return Err(CalibrationError::Configuration(format!(
                "view {i} has object points off the z = 0 plane"
            )));
        }
    }
    Ok(())
}

/// Cost structure for calibrating one [`RadTanModel`] from several board views.
#[derive(Debug, Clone)]
pub struct MonoCalibrationCost {
    model: RadTanModel,
    poses: Vec<Pose>,
    object_points: Vec<Vec<Point3<f64>>>,
    image_points: Vec<Vec<Point2<f64>>>,
}

impl MonoCalibrationCost {
    /// # Errors
    ///
    /// [`CalibrationError::MisalignedCorrespondences`] when views do not pair up,
    /// [`CalibrationError::Configuration`] for non-planar or tiny views.
    pub fn new(
        resolution: Resolution,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
    ) -> Result<Self, CalibrationError> {
        check_views(object_points, image_points)?;
        let model = RadTanModel::pinhole(
            Intrinsics {
                fx: 1.0,
                fy: 1.0,
                cx: resolution.width as f64 / 2.0,
                cy: resolution.height as f64 / 2.0,
            },
            resolution,
        );
        Ok(MonoCalibrationCost {
            model,
            poses: Vec::new(),
            object_points: object_points.to_vec(),
            image_points: image_points.to_vec(),
        })
    }

    pub fn model(&self) -> &RadTanModel {
        &self.model
    }

    /// One pose per view, available after [`Optimizer::linear_estimation`].
    pub fn poses(&self) -> &[Pose] {
        &self.poses
    }

    pub fn into_parts(self) -> (RadTanModel, Vec<Pose>) {
        (self.model, self.poses)
    }
}

impl Optimizer for MonoCalibrationCost {
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        let homographies = self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .map(|(objects, images)| {
                let board: Vec<_> = objects.iter().map(|p| Point2::new(p.x, p.y)).collect();
                geometry::estimate_homography(&board, images)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let k = geometry::intrinsics_from_homographies(&homographies, self.model.resolution)?;
        let k_inv = k.try_inverse().ok_or_else(|| {
            CalibrationError::Solver("initial camera matrix is singular".to_string())
        })?;

        self.poses = homographies
            .iter()
            .map(|h| geometry::pose_from_homography(&k_inv, h))
            .collect::<Result<Vec<_>, _>>()?;
        self.model =
            RadTanModel::pinhole(Intrinsics::from_camera_matrix(&k), self.model.resolution);
        self.model.validate_params()?;
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.poses.len() != self.object_points.len() {
            return Err(CalibrationError::Solver(
                "linear estimation must run before optimization".to_string(),
            ));
        }

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        initial_values.insert(CAMERA_KEY.to_string(), self.model.params());

        for (i, (objects, images)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let key = pose_key(i);
            let factor = ReprojectionFactor::new(CameraBlock::Free, false, objects, images);
            problem.add_residual_block(
                factor.residual_count(),
                &[CAMERA_KEY, key.as_str()],
                Box::new(factor),
                None,
            );
            initial_values.insert(key, self.poses[i].to_params());
        }

        if verbose {
            info!(
                "Starting camera refinement over {} views with tiny-solver Levenberg-Marquardt...",
                self.poses.len()
            );
        }

        let result = run_levenberg_marquardt(&problem, &initial_values)?;

        self.model.set_params(&take_variable(&result, CAMERA_KEY)?)?;
        for (i, pose) in self.poses.iter_mut().enumerate() {
            *pose = Pose::from_params(&take_variable(&result, &pose_key(i))?);
        }

        if verbose {
            info!("Optimization finished: {:?}", self.model);
        }
        Ok(())
    }

    fn rms_error(&self) -> Result<f64, CalibrationError> {
        let mut total = 0.0;
        let mut count = 0;
        for ((pose, objects), images) in self
            .poses
            .iter()
            .zip(self.object_points.iter())
            .zip(self.image_points.iter())
        {
            let (sum, n) = squared_error(&project_view(&self.model, pose, objects)?, images);
            total += sum;
            count += n;
        }
        if count == 0 {
            return Err(CalibrationError::InsufficientData {
                required: 1,
                available: 0,
            });
        }
        Ok((total / count as f64).sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{DVector, Vector3};

    fn board() -> Vec<Point3<f64>> {
        (0..6)
            .flat_map(|i| (0..8).map(move |j| Point3::new(j as f64 * 0.04, i as f64 * 0.04, 0.0)))
            .collect()
    }

    fn views(camera: &RadTanModel) -> (Vec<Vec<Point3<f64>>>, Vec<Vec<Point2<f64>>>) {
        let poses = [
            Pose::new(Vector3::new(0.15, -0.25, 0.05), Vector3::new(-0.15, -0.1, 0.8)),
            Pose::new(Vector3::new(-0.3, 0.1, -0.05), Vector3::new(-0.12, -0.08, 0.9)),
            Pose::new(Vector3::new(0.3, 0.25, 0.1), Vector3::new(-0.16, -0.12, 0.85)),
            Pose::new(Vector3::new(-0.1, -0.35, 0.2), Vector3::new(-0.1, -0.1, 1.0)),
            Pose::new(Vector3::new(0.05, 0.05, -0.3), Vector3::new(-0.14, -0.1, 0.75)),
        ];
        let objects = board();
        let images = poses
            .iter()
            .map(|pose| project_view(camera, pose, &objects).unwrap())
            .collect();
        (vec![objects; poses.len()], images)
    }

    fn truth() -> RadTanModel {
        RadTanModel::new(&DVector::from_vec(vec![
            640.0, 630.0, 322.0, 238.0, -0.12, 0.03, 0.0005, -0.0003, 0.0,
        ]))
        .unwrap()
        .with_resolution(Resolution {
            width: 640,
            height: 480,
        })
    }

    #[test]
    fn test_mono_calibration_recovers_camera() {
        let truth = truth();
        let (objects, images) = views(&truth);
        let mut cost = MonoCalibrationCost::new(truth.resolution, &objects, &images).unwrap();

        cost.linear_estimation().unwrap();
        assert!((cost.model().intrinsics.fx - 640.0).abs() < 40.0);

        cost.optimize(false).unwrap();
        let model = cost.model();
        assert!((model.intrinsics.fx - 640.0).abs() < 1.0, "{model:?}");
        assert!((model.intrinsics.fy - 630.0).abs() < 1.0, "{model:?}");
        assert!((model.intrinsics.cx - 322.0).abs() < 1.0, "{model:?}");
        assert!((model.intrinsics.cy - 238.0).abs() < 1.0, "{model:?}");
        assert!(cost.rms_error().unwrap() < 0.05);
    }

    #[test]
    fn test_mismatched_views_are_rejected() {
        let truth = truth();
        let (objects, mut images) = views(&truth);
        images.pop();
        assert!(matches!(
            MonoCalibrationCost::new(truth.resolution, &objects, &images),
            Err(CalibrationError::MisalignedCorrespondences(_))
        ));
    }

    #[test]
    fn test_non_planar_board_is_rejected() {
        let truth = truth();
        let (mut objects, images) = views(&truth);
        objects[1][3].z = 0.01;
        assert!(matches!(
            MonoCalibrationCost::new(truth.resolution, &objects, &images),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_optimize_requires_initial_estimate() {
        let truth = truth();
        let (objects, images) = views(&truth);
        let mut cost = MonoCalibrationCost::new(truth.resolution, &objects, &images).unwrap();
        assert!(matches!(
            cost.optimize(false),
            Err(CalibrationError::Solver(_))
        ));
    }
}
