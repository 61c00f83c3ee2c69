//! Calibration stages and their results.
//!
//! [`camera::CameraCalibrator`] estimates one camera, [`stereo::StereoCalibrator`]
//! the rig, and [`pipeline::CalibrationPipeline`] drives both over a sequence
//! of board poses.

use crate::camera::RadTanModel;
use crate::correspondence::CameraSide;
use crate::error::CalibrationError;
use crate::geometry::Pose;
use crate::util::ProjectionError;
use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub mod camera;
pub mod pipeline;
pub mod stereo;

pub use camera::CameraCalibrator;
pub use pipeline::{
    CalibrationPipeline, Examination, ExaminationSummary, PipelineError, PipelineOutcome,
    PipelineStage,
};
pub use stereo::StereoCalibrator;

/// Reprojection error of a calibrated camera over its accepted views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReprojectionReport {
    /// `sqrt(sum of squared distances / total corners)`, in pixels.
    pub rms: f64,
    /// RMS of each view, in acceptance order.
    pub per_view: Vec<f64>,
    pub statistics: ProjectionError,
}

/// Everything estimated for one camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraParameters {
    pub side: CameraSide,
    pub camera: RadTanModel,
    /// Board pose in this camera's frame, one per accepted view.
    pub poses: Vec<Pose>,
    pub reprojection: ReprojectionReport,
}

impl CameraParameters {
    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.camera.camera_matrix()
    }

    /// `[k1, k2, p1, p2, k3]`
    pub fn distortion(&self) -> [f64; 5] {
        self.camera.distortions
    }

    /// RMS reprojection error in pixels.
    pub fn reprojection_error(&self) -> f64 {
        self.reprojection.rms
    }
}

/// Relative geometry of the rig: `X_right = rotation * X_left + translation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StereoParameters {
    pub rotation: Matrix3<f64>,
    pub translation: Vector3<f64>,
    pub essential: Matrix3<f64>,
    pub fundamental: Matrix3<f64>,
    /// RMS reprojection error over both cameras, in pixels.
    pub rms_error: f64,
    /// Camera models after the joint refinement.
    pub left: RadTanModel,
    pub right: RadTanModel,
}

impl StereoParameters {
    /// Distance between the camera centres, in board units.
    pub fn baseline(&self) -> f64 {
        self.translation.norm()
    }
}

/// Full output of a pipeline run, ready to hand to rectification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigCalibration {
    pub left: CameraParameters,
    pub right: CameraParameters,
    pub stereo: StereoParameters,
}

impl RigCalibration {
    pub fn camera(&self, side: CameraSide) -> &CameraParameters {
        match side {
            CameraSide::Left => &self.left,
            CameraSide::Right => &self.right,
        }
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    pub fn to_json(&self) -> Result<String, CalibrationError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
