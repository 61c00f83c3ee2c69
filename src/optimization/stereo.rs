//! Joint refinement of a two-camera rig.
//!
//! Board poses are expressed in the left camera. The right camera sees each
//! board through the rig transform `X_r = R X_l + t`, which is shared by all
//! views.

use super::mono::{check_views, project_view};
use super::{
    pose_key, run_levenberg_marquardt, squared_error, take_variable, CameraBlock, Optimizer,
    ReprojectionFactor,
};
use crate::camera::rad_tan::RAD_TAN_PARAMS;
use crate::camera::RadTanModel;
use crate::error::CalibrationError;
use crate::geometry::{self, Pose};
use crate::vision::{StereoFlags, StereoObservations};
use log::{debug, info, warn};
use nalgebra::{DVector, Matrix3, Point2, Point3, Vector3};
use std::collections::HashMap;

const LEFT_CAMERA_KEY: &str = "left_camera";
const RIGHT_CAMERA_KEY: &str = "right_camera";
const FOCAL_KEY: &str = "focal";
const RELATIVE_KEY: &str = "relative";

/// How the two cameras' parameters enter the joint problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicsLayout {
    /// Both cameras are held constant; only poses and the rig transform move.
    Fixed,
    /// Each camera has its own nine free parameters.
    Free,
    /// `fx, fy` are one shared variable; the remaining parameters are per camera.
    SharedFocal,
}

impl From<StereoFlags> for IntrinsicsLayout {
    fn from(flags: StereoFlags) -> Self {
        if flags.fix_intrinsic {
            IntrinsicsLayout::Fixed
        } else if flags.same_focal_length {
            IntrinsicsLayout::SharedFocal
        } else {
            IntrinsicsLayout::Free
        }
    }
}

/// Board pose relative to the camera from distortion-corrected observations.
fn planar_pose(
    camera: &RadTanModel,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
) -> Result<Pose, CalibrationError> {
    let board: Vec<_> = object_points.iter().map(|p| Point2::new(p.x, p.y)).collect();
    let normalized = image_points
        .iter()
        .map(|p| camera.undistort_normalized(p))
        .collect::<Result<Vec<_>, _>>()?;
    let homography = geometry::estimate_homography(&board, &normalized)?;
    geometry::pose_from_homography(&Matrix3::identity(), &homography)
}

fn fixed_block(camera: &RadTanModel) -> CameraBlock {
    let params = camera.params();
    CameraBlock::Fixed(std::array::from_fn(|i| params[i]))
}

fn tail(camera: &RadTanModel) -> DVector<f64> {
    camera.params().rows(2, RAD_TAN_PARAMS - 2).into_owned()
}

fn with_focal(focal: &DVector<f64>, tail: &DVector<f64>) -> DVector<f64> {
    DVector::from_iterator(RAD_TAN_PARAMS, focal.iter().chain(tail.iter()).copied())
}

/// Cost structure for the joint stereo problem.
#[derive(Debug, Clone)]
pub struct StereoCalibrationCost {
    left: RadTanModel,
    right: RadTanModel,
    layout: IntrinsicsLayout,
    object_points: Vec<Vec<Point3<f64>>>,
    left_points: Vec<Vec<Point2<f64>>>,
    right_points: Vec<Vec<Point2<f64>>>,
    board_poses: Vec<Pose>,
    relative: Pose,
}

impl StereoCalibrationCost {
    pub fn new(
        left: RadTanModel,
        right: RadTanModel,
        flags: StereoFlags,
        observations: &StereoObservations<'_>,
    ) -> Result<Self, CalibrationError> {
        check_views(observations.object_points, observations.left_points)?;
        check_views(observations.object_points, observations.right_points)?;
        if flags.fix_intrinsic && flags.same_focal_length {
            warn!("same_focal_length has no effect while intrinsics are fixed");
        }

        Ok(StereoCalibrationCost {
            left,
            right,
            layout: IntrinsicsLayout::from(flags),
            object_points: observations.object_points.to_vec(),
            left_points: observations.left_points.to_vec(),
            right_points: observations.right_points.to_vec(),
            board_poses: Vec::new(),
            relative: Pose::identity(),
        })
    }

    pub fn left(&self) -> &RadTanModel {
        &self.left
    }

    pub fn right(&self) -> &RadTanModel {
        &self.right
    }

    pub fn layout(&self) -> IntrinsicsLayout {
        self.layout
    }

    /// Transform from left camera coordinates to right camera coordinates.
    pub fn relative(&self) -> &Pose {
        &self.relative
    }

    /// Board poses in the left camera frame.
    pub fn board_poses(&self) -> &[Pose] {
        &self.board_poses
    }

    fn camera_keys(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        match self.layout {
            IntrinsicsLayout::Fixed => (vec![], vec![]),
            IntrinsicsLayout::Free => (vec![LEFT_CAMERA_KEY], vec![RIGHT_CAMERA_KEY]),
            IntrinsicsLayout::SharedFocal => (
                vec![FOCAL_KEY, LEFT_CAMERA_KEY],
                vec![FOCAL_KEY, RIGHT_CAMERA_KEY],
            ),
        }
    }

    fn camera_blocks(&self) -> (CameraBlock, CameraBlock) {
        match self.layout {
            IntrinsicsLayout::Fixed => (fixed_block(&self.left), fixed_block(&self.right)),
            IntrinsicsLayout::Free => (CameraBlock::Free, CameraBlock::Free),
            IntrinsicsLayout::SharedFocal => (CameraBlock::SharedFocal, CameraBlock::SharedFocal),
        }
    }

    fn insert_camera_values(&self, values: &mut HashMap<String, DVector<f64>>) {
        match self.layout {
            IntrinsicsLayout::Fixed => {}
            IntrinsicsLayout::Free => {
                values.insert(LEFT_CAMERA_KEY.to_string(), self.left.params());
                values.insert(RIGHT_CAMERA_KEY.to_string(), self.right.params());
            }
            IntrinsicsLayout::SharedFocal => {
                let focal = self.left.params().rows(0, 2).into_owned();
                values.insert(FOCAL_KEY.to_string(), focal);
                values.insert(LEFT_CAMERA_KEY.to_string(), tail(&self.left));
                values.insert(RIGHT_CAMERA_KEY.to_string(), tail(&self.right));
            }
        }
    }

    fn read_camera_values(
        &mut self,
        result: &HashMap<String, DVector<f64>>,
    ) -> Result<(), CalibrationError> {
        match self.layout {
            IntrinsicsLayout::Fixed => {}
            IntrinsicsLayout::Free => {
                self.left.set_params(&take_variable(result, LEFT_CAMERA_KEY)?)?;
                self.right.set_params(&take_variable(result, RIGHT_CAMERA_KEY)?)?;
            }
            IntrinsicsLayout::SharedFocal => {
                let focal = take_variable(result, FOCAL_KEY)?;
                let left_tail = take_variable(result, LEFT_CAMERA_KEY)?;
                let right_tail = take_variable(result, RIGHT_CAMERA_KEY)?;
                self.left.set_params(&with_focal(&focal, &left_tail))?;
                self.right.set_params(&with_focal(&focal, &right_tail))?;
            }
        }
        Ok(())
    }
}

impl Optimizer for StereoCalibrationCost {
    /// Averages the per-view rig transforms implied by the two cameras' board poses.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError> {
        if self.layout == IntrinsicsLayout::SharedFocal {
            let fx = (self.left.intrinsics.fx + self.right.intrinsics.fx) / 2.0;
            let fy = (self.left.intrinsics.fy + self.right.intrinsics.fy) / 2.0;
            for camera in [&mut self.left, &mut self.right] {
                camera.intrinsics.fx = fx;
                camera.intrinsics.fy = fy;
            }
        }

        let mut rotation_sum = Matrix3::zeros();
        let mut translation_sum = Vector3::zeros();
        let mut board_poses = Vec::with_capacity(self.object_points.len());

        for ((objects, left_images), right_images) in self
            .object_points
            .iter()
            .zip(self.left_points.iter())
            .zip(self.right_points.iter())
        {
            let left_pose = planar_pose(&self.left, objects, left_images)?;
            let right_pose = planar_pose(&self.right, objects, right_images)?;

            let r_left = left_pose.rotation_matrix();
            let r_rel = right_pose.rotation_matrix() * r_left.transpose();
            rotation_sum += r_rel;
            translation_sum += right_pose.translation - r_rel * left_pose.translation;
            board_poses.push(left_pose);
        }

        if board_poses.is_empty() {
            return Err(CalibrationError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let rotation = geometry::nearest_rotation(&rotation_sum)?;
        let translation = translation_sum / board_poses.len() as f64;
        self.relative = Pose::from_rotation_matrix(&rotation, translation);
        self.board_poses = board_poses;
        debug!("Initial rig transform: {:?}", self.relative);
        Ok(())
    }

    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError> {
        if self.board_poses.len() != self.object_points.len() {
            return Err(CalibrationError::Solver(
                "linear estimation must run before optimization".to_string(),
            ));
        }

        let (left_keys, right_keys) = self.camera_keys();
        let (left_block, right_block) = self.camera_blocks();

        let mut problem = tiny_solver::Problem::new();
        let mut initial_values = HashMap::new();
        self.insert_camera_values(&mut initial_values);
        initial_values.insert(RELATIVE_KEY.to_string(), self.relative.to_params());

        for (i, objects) in self.object_points.iter().enumerate() {
            let key = pose_key(i);
            initial_values.insert(key.clone(), self.board_poses[i].to_params());

            let left_factor =
                ReprojectionFactor::new(left_block.clone(), false, objects, &self.left_points[i]);
            let mut keys: Vec<&str> = left_keys.clone();
            keys.push(key.as_str());
            problem.add_residual_block(
                left_factor.residual_count(),
                &keys,
                Box::new(left_factor),
                None,
            );

            let right_factor =
                ReprojectionFactor::new(right_block.clone(), true, objects, &self.right_points[i]);
            let mut keys: Vec<&str> = right_keys.clone();
            keys.push(key.as_str());
            keys.push(RELATIVE_KEY);
            problem.add_residual_block(
                right_factor.residual_count(),
                &keys,
                Box::new(right_factor),
                None,
            );
        }

        if verbose {
            info!(
                "Starting stereo refinement over {} view pairs ({:?} intrinsics)...",
                self.board_poses.len(),
                self.layout
            );
        }

        let result = run_levenberg_marquardt(&problem, &initial_values)?;

        self.read_camera_values(&result)?;
        self.relative = Pose::from_params(&take_variable(&result, RELATIVE_KEY)?);
        for (i, pose) in self.board_poses.iter_mut().enumerate() {
            *pose = Pose::from_params(&take_variable(&result, &pose_key(i))?);
        }

        if verbose {
            info!("Stereo optimization finished: {:?}", self.relative);
        }
        Ok(())
    }

    /// RMS over every observed corner of both cameras.
    fn rms_error(&self) -> Result<f64, CalibrationError> {
        let mut total = 0.0;
        let mut count = 0;
        for (i, board_pose) in self.board_poses.iter().enumerate() {
            let objects = &self.object_points[i];
            let (left_sum, left_n) = squared_error(
                &project_view(&self.left, board_pose, objects)?,
                &self.left_points[i],
            );
            let right_pose = self.relative.compose(board_pose);
            let (right_sum, right_n) = squared_error(
                &project_view(&self.right, &right_pose, objects)?,
                &self.right_points[i],
            );
            total += left_sum + right_sum;
            count += left_n + right_n;
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
    use crate::camera::Resolution;

    struct Rig {
        left: RadTanModel,
        right: RadTanModel,
        relative: Pose,
        objects: Vec<Vec<Point3<f64>>>,
        left_points: Vec<Vec<Point2<f64>>>,
        right_points: Vec<Vec<Point2<f64>>>,
    }

    fn camera(params: [f64; 9]) -> RadTanModel {
        RadTanModel::new(&DVector::from_row_slice(&params))
            .unwrap()
            .with_resolution(Resolution {
                width: 640,
                height: 480,
            })
    }

    fn rig(left: RadTanModel, right: RadTanModel) -> Rig {
        let relative = Pose::new(
            Vector3::new(0.01, -0.03, 0.005),
            Vector3::new(-0.12, 0.002, 0.001),
        );
        let board: Vec<_> = (0..6)
            .flat_map(|i| (0..8).map(move |j| Point3::new(j as f64 * 0.04, i as f64 * 0.04, 0.0)))
            .collect();
        let poses = [
            Pose::new(Vector3::new(0.15, -0.25, 0.05), Vector3::new(-0.1, -0.1, 0.8)),
            Pose::new(Vector3::new(-0.3, 0.1, -0.05), Vector3::new(-0.08, -0.08, 0.9)),
            Pose::new(Vector3::new(0.3, 0.25, 0.1), Vector3::new(-0.1, -0.12, 0.85)),
            Pose::new(Vector3::new(-0.1, -0.35, 0.2), Vector3::new(-0.06, -0.1, 1.0)),
        ];

        let left_points = poses
            .iter()
            .map(|pose| project_view(&left, pose, &board).unwrap())
            .collect();
        let right_points = poses
            .iter()
            .map(|pose| project_view(&right, &relative.compose(pose), &board).unwrap())
            .collect();

        Rig {
            left,
            right,
            relative,
            objects: vec![board; poses.len()],
            left_points,
            right_points,
        }
    }

    fn observations(rig: &Rig) -> StereoObservations<'_> {
        StereoObservations {
            object_points: &rig.objects,
            left_points: &rig.left_points,
            right_points: &rig.right_points,
        }
    }

    #[test]
    fn test_layout_from_flags() {
        let layout = |fix_intrinsic, same_focal_length| {
            IntrinsicsLayout::from(StereoFlags {
                fix_intrinsic,
                same_focal_length,
            })
        };
        assert_eq!(layout(false, false), IntrinsicsLayout::Free);
        assert_eq!(layout(false, true), IntrinsicsLayout::SharedFocal);
        assert_eq!(layout(true, true), IntrinsicsLayout::Fixed);
    }

    #[test]
    fn test_linear_estimation_recovers_rig_transform() {
        let rig = rig(
            camera([620.0, 615.0, 318.0, 242.0, -0.05, 0.01, 0.0, 0.0, 0.0]),
            camera([630.0, 628.0, 325.0, 236.0, -0.04, 0.0, 0.0, 0.0, 0.0]),
        );
        let mut cost = StereoCalibrationCost::new(
            rig.left.clone(),
            rig.right.clone(),
            StereoFlags {
                fix_intrinsic: true,
                same_focal_length: false,
            },
            &observations(&rig),
        )
        .unwrap();

        cost.linear_estimation().unwrap();
        assert!((cost.relative().translation - rig.relative.translation).norm() < 1e-6);
        assert!((cost.relative().rotation - rig.relative.rotation).norm() < 1e-6);
        assert!(cost.rms_error().unwrap() < 1e-6);
    }

    #[test]
    fn test_fixed_intrinsics_are_untouched() {
        let rig = rig(
            camera([620.0, 615.0, 318.0, 242.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            camera([630.0, 628.0, 325.0, 236.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        );
        let mut cost = StereoCalibrationCost::new(
            rig.left.clone(),
            rig.right.clone(),
            StereoFlags {
                fix_intrinsic: true,
                same_focal_length: false,
            },
            &observations(&rig),
        )
        .unwrap();
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        assert_eq!(cost.left(), &rig.left);
        assert_eq!(cost.right(), &rig.right);
        assert!((cost.relative().translation - rig.relative.translation).norm() < 1e-4);
    }

    #[test]
    fn test_shared_focal_length_is_enforced() {
        let rig = rig(
            camera([650.0, 650.0, 318.0, 242.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
            camera([650.0, 650.0, 325.0, 236.0, 0.0, 0.0, 0.0, 0.0, 0.0]),
        );
        let perturbed = camera([662.0, 641.0, 325.0, 236.0, 0.0, 0.0, 0.0, 0.0, 0.0]);
        let mut cost = StereoCalibrationCost::new(
            rig.left.clone(),
            perturbed,
            StereoFlags {
                fix_intrinsic: false,
                same_focal_length: true,
            },
            &observations(&rig),
        )
        .unwrap();
        cost.linear_estimation().unwrap();
        cost.optimize(false).unwrap();

        assert_eq!(cost.left().intrinsics.fx, cost.right().intrinsics.fx);
        assert_eq!(cost.left().intrinsics.fy, cost.right().intrinsics.fy);
        assert!((cost.left().intrinsics.fx - 650.0).abs() < 1.0);
        assert!(cost.rms_error().unwrap() < 0.05);
    }
}
