//! Error type shared by every calibration stage.

use crate::camera::CameraModelError;

/// Errors raised while configuring, collecting correspondences for, or solving
/// a calibration.
///
/// A checkerboard that is simply not visible in a frame is *not* an error;
/// detection reports that through [`crate::vision::Detection::NotFound`].
#[derive(thiserror::Error, Debug)]
pub enum CalibrationError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Insufficient data: {required} valid poses required, {available} available")]
    InsufficientData { required: usize, available: usize },
    #[error("Misaligned correspondences: {0}")]
    MisalignedCorrespondences(String),
    #[error("Solver failure: {0}")]
    Solver(String),
    #[error("Image error: {0}")]
    Image(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Camera(#[from] CameraModelError),
}

impl From<image::ImageError> for CalibrationError {
    fn from(err: image::ImageError) -> Self {
        CalibrationError::Image(err.to_string())
    }
}

impl From<serde_yaml::Error> for CalibrationError {
    fn from(err: serde_yaml::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for CalibrationError {
    fn from(err: serde_json::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}

impl From<csv::Error> for CalibrationError {
    fn from(err: csv::Error) -> Self {
        CalibrationError::Serialization(err.to_string())
    }
}
