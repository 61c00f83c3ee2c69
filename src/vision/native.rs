//! [`CalibrationSolver`] built on this crate's own optimizers.

use super::{
    CalibrationSolver, SingleCameraSolution, StereoFlags, StereoObservations, StereoSolution,
};
use crate::camera::{RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::{self, Pose};
use crate::optimization::mono::project_view;
use crate::optimization::{MonoCalibrationCost, Optimizer, StereoCalibrationCost};
use log::debug;
use nalgebra::{Point2, Point3};

/// Zhang initialisation followed by Levenberg-Marquardt refinement.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeSolver {
    verbose: bool,
}

impl NativeSolver {
    /// Planar initialisation needs three homographies.
    pub const MIN_POSES: usize = 3;

    pub fn new() -> Self {
        NativeSolver::default()
    }

    /// Logs optimizer progress at `info` level.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn require_poses(&self, available: usize) -> Result<(), CalibrationError> {
        if available < Self::MIN_POSES {
            return Err(CalibrationError::InsufficientData {
                required: Self::MIN_POSES,
                available,
            });
        }
        Ok(())
    }
}

fn sized(camera: &RadTanModel, image_size: Resolution) -> RadTanModel {
    if camera.resolution == Resolution::default() {
        camera.clone().with_resolution(image_size)
    } else {
        camera.clone()
    }
}

impl CalibrationSolver for NativeSolver {
    fn min_poses(&self) -> usize {
        Self::MIN_POSES
    }

    fn calibrate_single_camera(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<SingleCameraSolution, CalibrationError> {
        self.require_poses(object_points.len())?;

        let mut cost = MonoCalibrationCost::new(image_size, object_points, image_points)?;
        cost.linear_estimation()?;
        debug!("Zhang initial estimate: {:?}", cost.model());
        cost.optimize(self.verbose)?;

        let (camera, poses) = cost.into_parts();
        Ok(SingleCameraSolution { camera, poses })
    }

    fn calibrate_stereo_pair(
        &self,
        observations: &StereoObservations<'_>,
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
        flags: StereoFlags,
    ) -> Result<StereoSolution, CalibrationError> {
        self.require_poses(observations.pose_count())?;

        let mut cost = StereoCalibrationCost::new(
            sized(left, image_size),
            sized(right, image_size),
            flags,
            observations,
        )?;
        cost.linear_estimation()?;
        cost.optimize(self.verbose)?;

        let rotation = cost.relative().rotation_matrix();
        let translation = cost.relative().translation;
        let essential = geometry::essential_matrix(&rotation, &translation);
        let fundamental = geometry::fundamental_matrix(
            &cost.left().camera_matrix(),
            &cost.right().camera_matrix(),
            &essential,
        )
        .ok_or_else(|| CalibrationError::Solver("camera matrix is not invertible".to_string()))?;

        Ok(StereoSolution {
            left: cost.left().clone(),
            right: cost.right().clone(),
            rotation,
            translation,
            essential,
            fundamental,
            rms_error: cost.rms_error()?,
        })
    }

    fn project_points(
        &self,
        object_points: &[Point3<f64>],
        pose: &Pose,
        camera: &RadTanModel,
    ) -> Result<Vec<Point2<f64>>, CalibrationError> {
        project_view(camera, pose, object_points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_poses_are_insufficient() {
        let board: Vec<_> = (0..4)
            .map(|i| Point3::new((i % 2) as f64, (i / 2) as f64, 0.0))
            .collect();
        let image: Vec<_> = board.iter().map(|p| Point2::new(p.x * 10.0, p.y * 10.0)).collect();

        let result = NativeSolver::new().calibrate_single_camera(
            &[board.clone(), board],
            &[image.clone(), image],
            Resolution {
                width: 640,
                height: 480,
            },
        );
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientData {
                required: 3,
                available: 2
            })
        ));
    }
}
