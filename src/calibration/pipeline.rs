//! The end-to-end stereo calibration run.
//!
//! Every pose is examined in order. A pose is accepted only when the full
//! board is found in both cameras, so the two image sequences in the
//! [`CorrespondenceStore`] always pair up with the shared object sequence.
//! The left camera, the right camera and then the rig are calibrated from
//! the accepted poses.

use super::{CameraCalibrator, CameraParameters, RigCalibration, StereoCalibrator};
use crate::camera::Resolution;
use crate::config::PipelineConfig;
use crate::correspondence::{CameraSide, CorrespondenceStore};
use crate::error::CalibrationError;
use crate::image_store::ImageStore;
use crate::target::TargetModel;
use crate::vision::{CalibrationSolver, CornerDetector, Detection, Frame, StereoObservations};
use log::{info, warn};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Calibration step a [`PipelineError`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStage {
    LeftCamera,
    RightCamera,
    Stereo,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineStage::LeftCamera => "left camera",
            PipelineStage::RightCamera => "right camera",
            PipelineStage::Stereo => "stereo",
        })
    }
}

/// Which poses made it into the correspondence store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExaminationSummary {
    pub total: usize,
    /// Accepted pose indices, in order.
    pub accepted: Vec<usize>,
    /// Discarded pose indices, in order.
    pub skipped: Vec<usize>,
}

impl ExaminationSummary {
    pub fn valid_count(&self) -> usize {
        self.accepted.len()
    }
}

/// What happened to a single pose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Examination {
    Accepted,
    /// The board was missing from at least one camera.
    NotFound { left_found: bool, right_found: bool },
    /// Both boards were found but a frame's size differs from earlier frames.
    SizeMismatch {
        side: CameraSide,
        expected: Resolution,
        actual: Resolution,
    },
}

/// Terminal state of a run that did not fail.
#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Complete(Box<RigCalibration>, ExaminationSummary),
    /// No pose was accepted, so nothing was calibrated.
    Aborted(ExaminationSummary),
}

impl PipelineOutcome {
    pub fn summary(&self) -> &ExaminationSummary {
        match self {
            PipelineOutcome::Complete(_, summary) | PipelineOutcome::Aborted(summary) => summary,
        }
    }
}

/// A calibration stage failed after the poses were examined.
#[derive(Debug, thiserror::Error)]
#[error(
    "{stage} calibration failed with {} of {} poses accepted: {source}",
    .summary.accepted.len(),
    .summary.total
)]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub source: CalibrationError,
    pub summary: ExaminationSummary,
    /// Per-camera results that completed before the failure.
    pub cameras: Vec<CameraParameters>,
}

/// Drives detection over all poses and the three calibration stages.
pub struct CalibrationPipeline<S, D, V> {
    config: PipelineConfig,
    target: TargetModel,
    store: CorrespondenceStore,
    image_sizes: [Option<Resolution>; 2],
    images: S,
    detector: D,
    solver: V,
}

impl<S, D, V> CalibrationPipeline<S, D, V>
where
    S: ImageStore,
    D: CornerDetector<Image = S::Image>,
    V: CalibrationSolver,
{
    /// # Errors
    ///
    /// [`CalibrationError::Configuration`] if `config` does not validate.
    pub fn new(
        config: PipelineConfig,
        images: S,
        detector: D,
        solver: V,
    ) -> Result<Self, CalibrationError> {
        config.validate()?;
        let target = config.target()?;
        let store = CorrespondenceStore::new(&target);
        Ok(CalibrationPipeline {
            config,
            target,
            store,
            image_sizes: [None, None],
            images,
            detector,
            solver,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn target(&self) -> &TargetModel {
        &self.target
    }

    pub fn store(&self) -> &CorrespondenceStore {
        &self.store
    }

    pub fn solver(&self) -> &V {
        &self.solver
    }

    /// Image size fixed by the first accepted frame of `side`.
    pub fn image_size(&self, side: CameraSide) -> Option<Resolution> {
        self.image_sizes[side_index(side)]
    }

    fn camera_calibrator(&self, side: CameraSide) -> CameraCalibrator<'_, D, V> {
        CameraCalibrator::new(side, &self.detector, &self.solver)
            .with_criteria(self.config.criteria)
    }

    /// Loads one frame and looks for the board. A frame that fails to load
    /// counts as not found.
    fn detect(&self, pose: usize, side: CameraSide) -> (Detection, Option<Resolution>) {
        let image = match self.images.load(pose, side) {
            Ok(image) => image,
            Err(e) => {
                warn!("Could not load {side} image for pose {pose}: {e}");
                return (Detection::NotFound, None);
            }
        };
        let detection = self.camera_calibrator(side).extract_corners(
            &image,
            self.target.board_size(),
            self.config.window_for(pose),
        );
        (detection, Some(image.resolution()))
    }

    /// Examines one pose and records it if the board was found in both cameras.
    pub fn examine_pose(&mut self, pose: usize) -> Examination {
        info!("Checking chessboard pose {pose} ...");
        let (left, left_size) = self.detect(pose, CameraSide::Left);
        let (right, right_size) = self.detect(pose, CameraSide::Right);

        let (left_points, right_points, left_size, right_size) =
            match (left, right, left_size, right_size) {
                (Detection::Found(l), Detection::Found(r), Some(ls), Some(rs)) => (l, r, ls, rs),
                (left, right, _, _) => {
                    info!(
                        "Pose {pose} skipped: left {}, right {}",
                        found_label(&left),
                        found_label(&right)
                    );
                    return Examination::NotFound {
                        left_found: left.is_found(),
                        right_found: right.is_found(),
                    };
                }
            };

        for (side, actual) in [(CameraSide::Left, left_size), (CameraSide::Right, right_size)] {
            if let Some(expected) = self.image_size(side) {
                if expected != actual {
                    warn!(
                        "Pose {pose} skipped: {side} image is {}x{}, earlier frames were {}x{}",
                        actual.width, actual.height, expected.width, expected.height
                    );
                    return Examination::SizeMismatch {
                        side,
                        expected,
                        actual,
                    };
                }
            }
        }

        self.accept(left_points, right_points);
        self.image_sizes = [Some(left_size), Some(right_size)];
        Examination::Accepted
    }

    fn accept(&mut self, left: Vec<Point2<f64>>, right: Vec<Point2<f64>>) {
        self.store.record_pose(CameraSide::Left, left);
        self.store.record_pose(CameraSide::Right, right);
        self.store.commit_canonical_points();
    }

    /// Examines poses `1..=pose_count` in order.
    ///
    /// Poses recorded by earlier calls are discarded first, so the store only
    /// ever holds one entry per accepted pose.
    pub fn examine_poses(&mut self) -> ExaminationSummary {
        if !self.store.is_empty() {
            info!("Discarding {} previously accepted poses", self.store.pose_count());
        }
        self.store.clear();
        self.image_sizes = [None, None];

        let mut summary = ExaminationSummary {
            total: self.config.pose_count,
            ..Default::default()
        };
        for pose in 1..=self.config.pose_count {
            match self.examine_pose(pose) {
                Examination::Accepted => summary.accepted.push(pose),
                _ => summary.skipped.push(pose),
            }
        }
        info!("{} of {} poses accepted", summary.valid_count(), summary.total);
        summary
    }

    /// Calibrates both cameras and the rig from the poses accepted so far.
    pub fn calibrate(&self, summary: ExaminationSummary) -> Result<PipelineOutcome, PipelineError> {
        if self.store.is_empty() {
            warn!("No valid chessboard poses, calibration aborted");
            return Ok(PipelineOutcome::Aborted(summary));
        }

        let failed = |stage: PipelineStage, cameras: &[&CameraParameters]| {
            let summary = summary.clone();
            let cameras = cameras.iter().map(|c| (*c).clone()).collect();
            move |source| PipelineError {
                stage,
                source,
                summary,
                cameras,
            }
        };

        let left = self
            .calibrate_camera(CameraSide::Left)
            .map_err(failed(PipelineStage::LeftCamera, &[]))?;
        let right = self
            .calibrate_camera(CameraSide::Right)
            .map_err(failed(PipelineStage::RightCamera, &[&left]))?;

        let observations = StereoObservations {
            object_points: self.store.object_points(),
            left_points: self.store.image_points(CameraSide::Left),
            right_points: self.store.image_points(CameraSide::Right),
        };
        let stereo = StereoCalibrator::new(&self.solver)
            .calibrate(
                &observations,
                &left.camera,
                &right.camera,
                self.image_size(CameraSide::Left).unwrap_or_default(),
                self.config.stereo_flags,
            )
            .map_err(failed(PipelineStage::Stereo, &[&left, &right]))?;

        Ok(PipelineOutcome::Complete(
            Box::new(RigCalibration {
                left,
                right,
                stereo,
            }),
            summary,
        ))
    }

    fn calibrate_camera(&self, side: CameraSide) -> Result<CameraParameters, CalibrationError> {
        self.camera_calibrator(side).calibrate(
            self.store.object_points(),
            self.store.image_points(side),
            self.image_size(side).unwrap_or_default(),
        )
    }

    /// Examines every pose, then calibrates.
    pub fn run(mut self) -> Result<PipelineOutcome, PipelineError> {
        let summary = self.examine_poses();
        self.calibrate(summary)
    }
}

fn side_index(side: CameraSide) -> usize {
    match side {
        CameraSide::Left => 0,
        CameraSide::Right => 1,
    }
}

fn found_label(detection: &Detection) -> &'static str {
    if detection.is_found() {
        "found"
    } else {
        "not found"
    }
}
