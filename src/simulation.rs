//! A simulated stereo rig with known ground truth.
//!
//! [`SyntheticRig`] places a checkerboard in front of two known cameras.
//! [`SyntheticStore`] and [`SyntheticDetector`] stand in for the image source
//! and corner detector of a real rig: the "images" are only pose tags and the
//! detector answers with the exact projections, optionally perturbed by seeded
//! Gaussian noise or made to fail on chosen poses.

use crate::calibration::{CameraParameters, ReprojectionReport};
use crate::camera::{Intrinsics, RadTanModel, Resolution};
use crate::correspondence::CameraSide;
use crate::error::CalibrationError;
use crate::geometry::Pose;
use crate::image_store::ImageStore;
use crate::optimization::mono::project_view;
use crate::target::{BoardSize, TargetModel};
use crate::util::ProjectionError;
use crate::vision::{CornerDetector, Frame, TermCriteria};
use log::debug;
use nalgebra::{Point2, Point3, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

/// Two cameras and a board seen at a sequence of poses.
#[derive(Debug, Clone)]
pub struct SyntheticRig {
    pub left: RadTanModel,
    pub right: RadTanModel,
    /// `X_right = relative(X_left)`.
    pub relative: Pose,
    target: TargetModel,
    /// Board poses in the left camera frame, pose `p` at index `p - 1`.
    board_poses: Vec<Pose>,
}

impl SyntheticRig {
    pub fn new(
        left: RadTanModel,
        right: RadTanModel,
        relative: Pose,
        target: TargetModel,
        board_poses: Vec<Pose>,
    ) -> Self {
        SyntheticRig {
            left,
            right,
            relative,
            target,
            board_poses,
        }
    }

    /// A 640x480 rig with mild distortion and equal focal lengths.
    ///
    /// The board fills about half the image width, is centred between the two
    /// cameras and tilts a little differently at every pose.
    pub fn standard(target: TargetModel, pose_count: usize) -> Self {
        let resolution = Resolution {
            width: 640,
            height: 480,
        };
        let left = RadTanModel {
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 320.0,
                cy: 240.0,
            },
            resolution,
            distortions: [-0.12, 0.03, 0.001, -0.0005, 0.0],
        };
        let right = RadTanModel {
            intrinsics: Intrinsics {
                fx: 500.0,
                fy: 500.0,
                cx: 326.0,
                cy: 236.0,
            },
            resolution,
            distortions: [-0.1, 0.02, -0.0008, 0.0004, 0.0],
        };

        let board = target.board_size();
        let square = target.square_size();
        let board_width = (board.width.max(2) - 1) as f64 * square;
        let board_height = (board.height.max(2) - 1) as f64 * square;
        let baseline = board_width / 2.0;
        let distance = 2.0 * left.intrinsics.fx * board_width / resolution.width as f64;

        let relative = Pose::new(
            Vector3::new(0.01, -0.02, 0.005),
            Vector3::new(-baseline, 0.0, 0.0),
        );
        let centre = Vector3::new(board_width / 2.0, board_height / 2.0, 0.0);
        let placement = Vector3::new(baseline / 2.0, 0.0, distance);

        let board_poses = (0..pose_count)
            .map(|k| {
                let phase = 2.0 * PI * k as f64 / pose_count as f64;
                let roll = 0.04 * (k as f64 - pose_count as f64 / 2.0);
                let rotation = Vector3::new(0.3 * phase.cos(), 0.3 * phase.sin(), roll);
                let r = Pose::new(rotation, Vector3::zeros()).rotation_matrix();
                Pose::new(rotation, placement - r * centre)
            })
            .collect();

        SyntheticRig::new(left, right, relative, target, board_poses)
    }

    pub fn target(&self) -> &TargetModel {
        &self.target
    }

    pub fn pose_count(&self) -> usize {
        self.board_poses.len()
    }

    pub fn resolution(&self) -> Resolution {
        self.left.resolution
    }

    pub fn camera(&self, side: CameraSide) -> &RadTanModel {
        match side {
            CameraSide::Left => &self.left,
            CameraSide::Right => &self.right,
        }
    }

    /// Board pose `pose` (numbered from 1) in `side`'s frame.
    pub fn board_pose(&self, pose: usize, side: CameraSide) -> Result<Pose, CalibrationError> {
        let board = pose
            .checked_sub(1)
            .and_then(|i| self.board_poses.get(i))
            .ok_or_else(|| {
                CalibrationError::Configuration(format!(
                    "pose {pose} is outside 1..={}",
                    self.pose_count()
                ))
            })?;
        Ok(match side {
            CameraSide::Left => *board,
            CameraSide::Right => self.relative.compose(board),
        })
    }

    /// Exact image positions of every board corner at `pose`.
    pub fn project(
        &self,
        pose: usize,
        side: CameraSide,
    ) -> Result<Vec<Point2<f64>>, CalibrationError> {
        project_view(
            self.camera(side),
            &self.board_pose(pose, side)?,
            self.target.canonical_points(),
        )
    }

    /// Exact observations of every pose, in pose order.
    pub fn observations(
        &self,
        side: CameraSide,
    ) -> Result<Vec<Vec<Point2<f64>>>, CalibrationError> {
        (1..=self.pose_count())
            .map(|pose| self.project(pose, side))
            .collect()
    }

    /// One copy of the canonical board points per pose.
    pub fn object_points(&self) -> Vec<Vec<Point3<f64>>> {
        vec![self.target.canonical_points().to_vec(); self.pose_count()]
    }

    pub fn frame(&self, pose: usize, side: CameraSide) -> SyntheticFrame {
        SyntheticFrame {
            pose,
            side,
            resolution: self.resolution(),
        }
    }

    /// The true parameters of one camera, with a zero error report.
    pub fn ground_truth(&self, side: CameraSide) -> Result<CameraParameters, CalibrationError> {
        let poses = (1..=self.pose_count())
            .map(|pose| self.board_pose(pose, side))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CameraParameters {
            side,
            camera: self.camera(side).clone(),
            reprojection: ReprojectionReport {
                rms: 0.0,
                per_view: vec![0.0; poses.len()],
                statistics: ProjectionError {
                    rmse: 0.0,
                    min: 0.0,
                    max: 0.0,
                    mean: 0.0,
                    stddev: 0.0,
                    median: 0.0,
                },
            },
            poses,
        })
    }
}

/// Stand-in for a decoded image: which pose and camera it shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticFrame {
    pub pose: usize,
    pub side: CameraSide,
    pub resolution: Resolution,
}

impl Frame for SyntheticFrame {
    fn resolution(&self) -> Resolution {
        self.resolution
    }
}

/// [`ImageStore`] over a [`SyntheticRig`], with optionally missing or resized frames.
#[derive(Debug, Clone)]
pub struct SyntheticStore<'a> {
    rig: &'a SyntheticRig,
    missing: HashSet<(usize, CameraSide)>,
    resized: HashMap<(usize, CameraSide), Resolution>,
}

impl<'a> SyntheticStore<'a> {
    pub fn new(rig: &'a SyntheticRig) -> Self {
        SyntheticStore {
            rig,
            missing: HashSet::new(),
            resized: HashMap::new(),
        }
    }

    /// Makes loading `pose` for `side` fail.
    pub fn with_missing(mut self, pose: usize, side: CameraSide) -> Self {
        self.missing.insert((pose, side));
        self
    }

    /// Reports a different resolution for one frame.
    pub fn with_resolution(
        mut self,
        pose: usize,
        side: CameraSide,
        resolution: Resolution,
    ) -> Self {
        self.resized.insert((pose, side), resolution);
        self
    }
}

impl ImageStore for SyntheticStore<'_> {
    type Image = SyntheticFrame;

    fn load(&self, pose: usize, side: CameraSide) -> Result<SyntheticFrame, CalibrationError> {
        if self.missing.contains(&(pose, side)) || pose == 0 || pose > self.rig.pose_count() {
            return Err(CalibrationError::Image(format!(
                "no {side} frame for pose {pose}"
            )));
        }
        let mut frame = self.rig.frame(pose, side);
        if let Some(resolution) = self.resized.get(&(pose, side)) {
            frame.resolution = *resolution;
        }
        Ok(frame)
    }
}

/// [`CornerDetector`] that reports the rig's true projections.
#[derive(Debug, Clone)]
pub struct SyntheticDetector<'a> {
    rig: &'a SyntheticRig,
    failures: HashSet<(usize, CameraSide)>,
    noise_sigma: f64,
    seed: u64,
}

impl<'a> SyntheticDetector<'a> {
    pub fn new(rig: &'a SyntheticRig) -> Self {
        SyntheticDetector {
            rig,
            failures: HashSet::new(),
            noise_sigma: 0.0,
            seed: 0,
        }
    }

    /// Makes detection fail on `pose` for `side`.
    pub fn with_failure(mut self, pose: usize, side: CameraSide) -> Self {
        self.failures.insert((pose, side));
        self
    }

    /// Adds zero-mean Gaussian noise of `sigma` pixels to both coordinates.
    ///
    /// Draws depend only on `seed`, pose and side, so a larger `sigma` with the
    /// same seed moves every corner further along the same direction.
    pub fn with_noise(mut self, sigma: f64, seed: u64) -> Self {
        self.noise_sigma = sigma;
        self.seed = seed;
        self
    }

    fn rng_for(&self, pose: usize, side: CameraSide) -> StdRng {
        let side_bit = match side {
            CameraSide::Left => 0,
            CameraSide::Right => 1,
        };
        StdRng::seed_from_u64(
            self.seed
                .wrapping_mul(1_000_003)
                .wrapping_add(2 * pose as u64 + side_bit),
        )
    }
}

impl CornerDetector for SyntheticDetector<'_> {
    type Image = SyntheticFrame;

    fn detect_grid_corners(
        &self,
        image: &SyntheticFrame,
        board: BoardSize,
    ) -> Option<Vec<Point2<f64>>> {
        if self.failures.contains(&(image.pose, image.side)) {
            debug!("Simulated detection failure: pose {} {}", image.pose, image.side);
            return None;
        }
        if board != self.rig.target().board_size() {
            return None;
        }

        let mut corners = self.rig.project(image.pose, image.side).ok()?;
        let width = image.resolution.width as f64;
        let height = image.resolution.height as f64;
        if corners
            .iter()
            .any(|p| p.x < 0.0 || p.y < 0.0 || p.x >= width || p.y >= height)
        {
            return None;
        }

        if self.noise_sigma > 0.0 {
            let normal = Normal::new(0.0, self.noise_sigma).ok()?;
            let mut rng = self.rng_for(image.pose, image.side);
            for corner in &mut corners {
                corner.x += normal.sample(&mut rng);
                corner.y += normal.sample(&mut rng);
            }
        }
        Some(corners)
    }

    fn refine_sub_pixel(
        &self,
        _image: &SyntheticFrame,
        corners: Vec<Point2<f64>>,
        _window: usize,
        _criteria: &TermCriteria,
    ) -> Vec<Point2<f64>> {
        corners
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn rig() -> SyntheticRig {
        SyntheticRig::standard(TargetModel::new(6, 9).unwrap(), 8)
    }

    #[test]
    fn test_board_is_visible_in_both_cameras() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig);
        for pose in 1..=rig.pose_count() {
            for side in CameraSide::BOTH {
                let corners = detector
                    .detect_grid_corners(&rig.frame(pose, side), rig.target().board_size())
                    .unwrap();
                assert_eq!(corners.len(), 54);
            }
        }
    }

    #[test]
    fn test_right_pose_goes_through_relative() {
        let rig = rig();
        let point = rig.target().canonical_points()[10];
        let left = rig.board_pose(2, CameraSide::Left).unwrap();
        let right = rig.board_pose(2, CameraSide::Right).unwrap();
        assert_relative_eq!(
            right.transform_point(&point),
            rig.relative.transform_point(&Point3::from(left.transform_point(&point))),
            epsilon = 1e-9
        );
        assert!(rig.board_pose(0, CameraSide::Left).is_err());
        assert!(rig.board_pose(9, CameraSide::Left).is_err());
    }

    #[test]
    fn test_failures_and_missing_frames() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig).with_failure(3, CameraSide::Right);
        let board = rig.target().board_size();
        assert!(detector
            .detect_grid_corners(&rig.frame(3, CameraSide::Right), board)
            .is_none());
        assert!(detector
            .detect_grid_corners(&rig.frame(3, CameraSide::Left), board)
            .is_some());

        let store = SyntheticStore::new(&rig).with_missing(2, CameraSide::Left);
        assert!(matches!(
            store.load(2, CameraSide::Left),
            Err(CalibrationError::Image(_))
        ));
        assert!(store.load(2, CameraSide::Right).is_ok());
    }

    #[test]
    fn test_noise_scales_with_sigma() {
        let rig = rig();
        let board = rig.target().board_size();
        let frame = rig.frame(1, CameraSide::Left);
        let exact = rig.project(1, CameraSide::Left).unwrap();
        let small = SyntheticDetector::new(&rig)
            .with_noise(0.5, 11)
            .detect_grid_corners(&frame, board)
            .unwrap();
        let large = SyntheticDetector::new(&rig)
            .with_noise(1.0, 11)
            .detect_grid_corners(&frame, board)
            .unwrap();

        for ((e, s), l) in exact.iter().zip(&small).zip(&large) {
            assert_relative_eq!(l - e, (s - e) * 2.0, epsilon = 1e-9);
        }
    }
}
