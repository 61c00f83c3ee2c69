//! Seams to the computer-vision collaborators of the pipeline.
//!
//! Checkerboard detection, sub-pixel refinement and the least-squares solvers
//! are consumed through the traits in this module. [`NativeSolver`] and
//! [`subpixel::refine_corners`] are the implementations shipped with the crate;
//! [`SubPixelDetector`] plugs the refiner into any grayscale detector.

use crate::camera::{RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::geometry::Pose;
use crate::target::BoardSize;
use image::GrayImage;
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};

pub mod native;
pub mod subpixel;

pub use native::NativeSolver;
pub use subpixel::SubPixelDetector;

/// Anything with pixel dimensions.
pub trait Frame {
    fn resolution(&self) -> Resolution;
}

impl Frame for GrayImage {
    fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }
}

/// Result of looking for the full checkerboard in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Every inner corner, in canonical row-major order.
    Found(Vec<Point2<f64>>),
    NotFound,
}

impl Detection {
    pub fn is_found(&self) -> bool {
        matches!(self, Detection::Found(_))
    }

    pub fn into_points(self) -> Option<Vec<Point2<f64>>> {
        match self {
            Detection::Found(points) => Some(points),
            Detection::NotFound => None,
        }
    }
}

/// Stopping rule for iterative refinement: stop once a step moves less than
/// `epsilon` pixels or after `max_iterations` steps, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TermCriteria {
    pub epsilon: f64,
    pub max_iterations: usize,
}

impl Default for TermCriteria {
    fn default() -> Self {
        TermCriteria {
            epsilon: 0.1,
            max_iterations: 30,
        }
    }
}

/// Which camera parameters the joint stereo estimation may change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StereoFlags {
    /// Keep both cameras' intrinsics and distortion at their input values.
    pub fix_intrinsic: bool,
    /// Force both cameras to share `fx` and `fy`.
    pub same_focal_length: bool,
}

/// Locates checkerboard corners in an image.
pub trait CornerDetector {
    type Image;

    /// Finds all inner corners of a `board`-sized grid, or `None` if the full
    /// grid is not visible.
    fn detect_grid_corners(&self, image: &Self::Image, board: BoardSize)
        -> Option<Vec<Point2<f64>>>;

    /// Refines corner locations within a `(2 * window + 1)` square search area.
    fn refine_sub_pixel(
        &self,
        image: &Self::Image,
        corners: Vec<Point2<f64>>,
        window: usize,
        criteria: &TermCriteria,
    ) -> Vec<Point2<f64>>;
}

/// Intrinsics, distortion and per-view board poses from a single-camera solve.
#[derive(Debug, Clone)]
pub struct SingleCameraSolution {
    pub camera: RadTanModel,
    pub poses: Vec<Pose>,
}

/// The aligned inputs of a stereo solve. Entry `i` of each slice is the same board pose.
#[derive(Debug, Clone, Copy)]
pub struct StereoObservations<'a> {
    pub object_points: &'a [Vec<Point3<f64>>],
    pub left_points: &'a [Vec<Point2<f64>>],
    pub right_points: &'a [Vec<Point2<f64>>],
}

impl StereoObservations<'_> {
    pub fn pose_count(&self) -> usize {
        self.object_points.len()
    }
}

/// Output of a joint stereo solve. `X_right = rotation * X_left + translation`.
#[derive(Debug, Clone)]
pub struct StereoSolution {
    pub left: RadTanModel,
    pub right: RadTanModel,
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    pub rms_error: f64,
}

/// Least-squares camera and rig estimation.
pub trait CalibrationSolver {
    /// Fewest accepted poses the solver can work with.
    fn min_poses(&self) -> usize;

    fn calibrate_single_camera(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<SingleCameraSolution, CalibrationError>;

    /// Estimates the rigid transform between two cameras, starting from the
    /// per-camera models.
    fn calibrate_stereo_pair(
        &self,
        observations: &StereoObservations<'_>,
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
        flags: StereoFlags,
    ) -> Result<StereoSolution, CalibrationError>;

    /// Projects board points seen from `pose` into `camera`'s image.
    fn project_points(
        &self,
        object_points: &[Point3<f64>],
        pose: &Pose,
        camera: &RadTanModel,
    ) -> Result<Vec<Point2<f64>>, CalibrationError>;
}
