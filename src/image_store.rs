//! Loading the stereo image pairs of each board pose.

use crate::config::PipelineConfig;
use crate::correspondence::CameraSide;
use crate::error::CalibrationError;
use crate::vision::Frame;
use image::GrayImage;
use std::path::{Path, PathBuf};

/// Source of one image per camera per pose. Poses are numbered from 1.
pub trait ImageStore {
    type Image: Frame;

    fn load(&self, pose: usize, side: CameraSide) -> Result<Self::Image, CalibrationError>;
}

/// Image pairs on disk as `<root>/<left|right>frame<N>.<extension>`.
#[derive(Debug, Clone)]
pub struct DirectoryImageStore {
    root: PathBuf,
    extension: String,
}

impl DirectoryImageStore {
    pub const DEFAULT_EXTENSION: &'static str = "bmp";

    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryImageStore {
            root: root.into(),
            extension: Self::DEFAULT_EXTENSION.to_string(),
        }
    }

    /// Store under `root` using the configured image extension.
    pub fn from_config(root: impl Into<PathBuf>, config: &PipelineConfig) -> Self {
        Self::new(root).with_extension(config.image_extension.as_str())
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn image_path(&self, pose: usize, side: CameraSide) -> PathBuf {
        self.root
            .join(format!("{}frame{}.{}", side.orientation(), pose, self.extension))
    }
}

impl ImageStore for DirectoryImageStore {
    type Image = GrayImage;

    fn load(&self, pose: usize, side: CameraSide) -> Result<GrayImage, CalibrationError> {
        let path = self.image_path(pose, side);
        let image = image::open(&path)
            .map_err(|e| CalibrationError::Image(format!("{}: {e}", path.display())))?;
        Ok(image.to_luma8())
    }
}
