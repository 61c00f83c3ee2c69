//! Stereo Calibration Library
//!
//! Calibrates a two-camera rig from paired images of a planar checkerboard.
//! The library provides:
//! - Checkerboard target geometry and the aligned correspondence store
//! - Per-camera calibration with the Radial-Tangential distortion model
//! - Joint stereo calibration with essential and fundamental matrices
//! - A pipeline that examines every board pose and runs all stages
//!
//! Corner detection is supplied by the caller through [`vision::CornerDetector`].
//! [`vision::NativeSolver`] estimates cameras with Zhang's method followed by
//! Levenberg-Marquardt refinement using the tiny-solver optimization framework.

pub mod calibration;
pub mod camera;
pub mod config;
pub mod correspondence;
pub mod error;
pub mod geometry;
pub mod image_store;
pub mod optimization;
pub mod simulation;
pub mod target;
pub mod util;
pub mod vision;

// Re-export commonly used types
pub use calibration::{
    CalibrationPipeline, CameraCalibrator, CameraParameters, ExaminationSummary, PipelineError,
    PipelineOutcome, PipelineStage, RigCalibration, StereoCalibrator, StereoParameters,
};
pub use camera::{CameraModel, CameraModelError, Intrinsics, RadTanModel, Resolution};
pub use config::PipelineConfig;
pub use correspondence::{CameraSide, CorrespondenceStore};
pub use error::CalibrationError;
pub use geometry::Pose;
pub use image_store::{DirectoryImageStore, ImageStore};
pub use target::{BoardSize, TargetModel};
pub use vision::{
    CalibrationSolver, CornerDetector, Detection, Frame, NativeSolver, StereoFlags,
    SubPixelDetector, TermCriteria,
};
