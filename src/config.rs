//! Pipeline configuration, loadable from YAML.

use crate::error::CalibrationError;
use crate::target::TargetModel;
use crate::vision::{StereoFlags, TermCriteria};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

fn default_square_size() -> f64 {
    1.0
}

fn default_image_extension() -> String {
    "bmp".to_string()
}

fn default_sub_pixel_window() -> usize {
    12
}

fn default_stereo_flags() -> StereoFlags {
    StereoFlags {
        fix_intrinsic: false,
        same_focal_length: true,
    }
}

/// Everything a pipeline run needs besides its collaborators.
///
/// Only the board dimensions and the pose count are required in YAML:
///
/// ```yaml
/// inner_corner_rows: 6
/// inner_corner_cols: 9
/// pose_count: 20
/// window_overrides:
///   7: 5
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub inner_corner_rows: usize,
    pub inner_corner_cols: usize,
    /// Poses are numbered `1..=pose_count`.
    pub pose_count: usize,
    #[serde(default = "default_square_size")]
    pub square_size: f64,
    #[serde(default = "default_image_extension")]
    pub image_extension: String,
    /// Half-size of the sub-pixel search window.
    #[serde(default = "default_sub_pixel_window")]
    pub sub_pixel_window: usize,
    /// Per-pose replacements for `sub_pixel_window`.
    #[serde(default)]
    pub window_overrides: BTreeMap<usize, usize>,
    #[serde(default)]
    pub criteria: TermCriteria,
    #[serde(default = "default_stereo_flags")]
    pub stereo_flags: StereoFlags,
}

impl PipelineConfig {
    pub fn new(inner_corner_rows: usize, inner_corner_cols: usize, pose_count: usize) -> Self {
        PipelineConfig {
            inner_corner_rows,
            inner_corner_cols,
            pose_count,
            square_size: default_square_size(),
            image_extension: default_image_extension(),
            sub_pixel_window: default_sub_pixel_window(),
            window_overrides: BTreeMap::new(),
            criteria: TermCriteria::default(),
            stereo_flags: default_stereo_flags(),
        }
    }

    pub fn load_from_yaml(path: impl AsRef<Path>) -> Result<Self, CalibrationError> {
        let contents = fs::read_to_string(path)?;
        let config: PipelineConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_yaml(&self, path: impl AsRef<Path>) -> Result<(), CalibrationError> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    /// Checks every field, returning the first problem found.
    pub fn validate(&self) -> Result<(), CalibrationError> {
        self.target()?;
        if self.pose_count == 0 {
            return Err(CalibrationError::Configuration(
                "pose_count must be at least 1".to_string(),
            ));
        }
        if self.sub_pixel_window == 0 {
            return Err(CalibrationError::Configuration(
                "sub_pixel_window must be positive".to_string(),
            ));
        }
        if let Some((pose, _)) = self.window_overrides.iter().find(|(_, w)| **w == 0) {
            return Err(CalibrationError::Configuration(format!(
                "window override for pose {pose} must be positive"
            )));
        }
        if !(self.criteria.epsilon.is_finite() && self.criteria.epsilon >= 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "termination epsilon must be finite and non-negative, got {}",
                self.criteria.epsilon
            )));
        }
        if self.criteria.max_iterations == 0 {
            return Err(CalibrationError::Configuration(
                "termination max_iterations must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// The checkerboard described by this configuration.
    pub fn target(&self) -> Result<TargetModel, CalibrationError> {
        TargetModel::new(self.inner_corner_rows, self.inner_corner_cols)?
            .with_square_size(self.square_size)
    }

    /// Sub-pixel window half-size for `pose`.
    pub fn window_for(&self, pose: usize) -> usize {
        self.window_overrides
            .get(&pose)
            .copied()
            .unwrap_or(self.sub_pixel_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_minimal_yaml() {
        let config: PipelineConfig =
            serde_yaml::from_str("inner_corner_rows: 6\ninner_corner_cols: 9\npose_count: 20\n")
                .unwrap();

        assert_eq!(config, PipelineConfig::new(6, 9, 20));
        assert_eq!(config.square_size, 1.0);
        assert_eq!(config.image_extension, "bmp");
        assert_eq!(config.sub_pixel_window, 12);
        assert_eq!(config.criteria, TermCriteria::default());
        assert!(config.stereo_flags.same_focal_length);
        assert!(!config.stereo_flags.fix_intrinsic);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_overrides() {
        let yaml = "inner_corner_rows: 6\ninner_corner_cols: 9\npose_count: 20\n\
                    window_overrides:\n  7: 5\n";
        let config: PipelineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.window_for(7), 5);
        assert_eq!(config.window_for(8), 12);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PipelineConfig::new(0, 9, 20);
        assert!(matches!(
            config.validate(),
            Err(CalibrationError::Configuration(_))
        ));

        config = PipelineConfig::new(6, 9, 0);
        assert!(config.validate().is_err());

        config = PipelineConfig::new(6, 9, 20);
        config.square_size = 0.0;
        assert!(config.validate().is_err());

        config = PipelineConfig::new(6, 9, 20);
        config.window_overrides.insert(3, 0);
        assert!(config.validate().is_err());

        config = PipelineConfig::new(6, 9, 20);
        config.criteria.max_iterations = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");

        let mut config = PipelineConfig::new(7, 10, 15);
        config.square_size = 0.03;
        config.image_extension = "png".to_string();
        config.window_overrides.insert(2, 6);
        config.stereo_flags.fix_intrinsic = true;
        config.save_to_yaml(&path).unwrap();

        assert_eq!(PipelineConfig::load_from_yaml(&path).unwrap(), config);
    }

    #[test]
    fn test_load_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, "inner_corner_rows: 6\ninner_corner_cols: 9\npose_count: 0\n").unwrap();
        assert!(matches!(
            PipelineConfig::load_from_yaml(&path),
            Err(CalibrationError::Configuration(_))
        ));
    }
}
