//! Per-camera corner extraction, calibration and error measurement.

use super::{CameraParameters, ReprojectionReport};
use crate::camera::{RadTanModel, Resolution};
use crate::correspondence::CameraSide;
use crate::error::CalibrationError;
use crate::geometry::Pose;
use crate::target::BoardSize;
use crate::util::projection_statistics;
use crate::vision::{CalibrationSolver, CornerDetector, Detection, TermCriteria};
use log::{debug, info, warn};
use nalgebra::{Point2, Point3};

/// Calibrates one camera of the rig through the detector and solver it borrows.
pub struct CameraCalibrator<'a, D, V: ?Sized> {
    side: CameraSide,
    detector: &'a D,
    solver: &'a V,
    criteria: TermCriteria,
}

impl<'a, D, V> CameraCalibrator<'a, D, V>
where
    D: CornerDetector,
    V: CalibrationSolver + ?Sized,
{
    pub fn new(side: CameraSide, detector: &'a D, solver: &'a V) -> Self {
        CameraCalibrator {
            side,
            detector,
            solver,
            criteria: TermCriteria::default(),
        }
    }

    pub fn with_criteria(mut self, criteria: TermCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn side(&self) -> CameraSide {
        self.side
    }

    /// Finds and refines the board's corners in one image.
    ///
    /// A detector result with the wrong number of corners is treated as not found.
    pub fn extract_corners(&self, image: &D::Image, board: BoardSize, window: usize) -> Detection {
        let Some(corners) = self.detector.detect_grid_corners(image, board) else {
            return Detection::NotFound;
        };
        if corners.len() != board.corner_count() {
            warn!(
                "{} detector returned {} corners for a {}x{} board",
                self.side,
                corners.len(),
                board.width,
                board.height
            );
            return Detection::NotFound;
        }

        let refined = self
            .detector
            .refine_sub_pixel(image, corners, window, &self.criteria);
        if refined.len() != board.corner_count() {
            warn!("{} sub-pixel refinement changed the corner count", self.side);
            return Detection::NotFound;
        }
        Detection::Found(refined)
    }

    /// Estimates intrinsics, distortion and per-view poses, then measures the
    /// reprojection error of the result.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::MisalignedCorrespondences`] if the object and image
    ///   sequences, or any view within them, differ in length.
    /// * [`CalibrationError::InsufficientData`] below the solver's minimum pose count.
    /// * Any solver failure, unchanged.
    pub fn calibrate(
        &self,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
        image_size: Resolution,
    ) -> Result<CameraParameters, CalibrationError> {
        check_lengths(object_points, image_points)?;
        let required = self.solver.min_poses();
        if object_points.len() < required {
            return Err(CalibrationError::InsufficientData {
                required,
                available: object_points.len(),
            });
        }

        info!(
            "Calibrating {} camera from {} poses",
            self.side,
            object_points.len()
        );
        let solution = self
            .solver
            .calibrate_single_camera(object_points, image_points, image_size)?;
        if solution.poses.len() != object_points.len() {
            return Err(CalibrationError::Solver(format!(
                "solver returned {} poses for {} views",
                solution.poses.len(),
                object_points.len()
            )));
        }

        let reprojection = self.reprojection_report(
            &solution.camera,
            &solution.poses,
            object_points,
            image_points,
        )?;
        let parameters = CameraParameters {
            side: self.side,
            camera: solution.camera,
            poses: solution.poses,
            reprojection,
        };
        info!(
            "{} camera: {:?}, RMS reprojection error {:.4} px",
            self.side, parameters.camera, parameters.reprojection.rms
        );
        Ok(parameters)
    }

    /// Projects every board point with `parameters` and compares against the
    /// observed corners.
    pub fn compute_reprojection_error(
        &self,
        parameters: &CameraParameters,
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
    ) -> Result<ReprojectionReport, CalibrationError> {
        self.reprojection_report(
            &parameters.camera,
            &parameters.poses,
            object_points,
            image_points,
        )
    }

    fn reprojection_report(
        &self,
        camera: &RadTanModel,
        poses: &[Pose],
        object_points: &[Vec<Point3<f64>>],
        image_points: &[Vec<Point2<f64>>],
    ) -> Result<ReprojectionReport, CalibrationError> {
        check_lengths(object_points, image_points)?;
        if poses.len() != object_points.len() {
            return Err(CalibrationError::MisalignedCorrespondences(format!(
                "{} poses for {} views",
                poses.len(),
                object_points.len()
            )));
        }

        let mut total_squared = 0.0;
        let mut total_points = 0usize;
        let mut per_view = Vec::with_capacity(object_points.len());
        let mut distances = Vec::new();

        for ((pose, objects), observed) in poses
            .iter()
            .zip(object_points.iter())
            .zip(image_points.iter())
        {
            let projected = self.solver.project_points(objects, pose, camera)?;
            if projected.len() != observed.len() {
                return Err(CalibrationError::MisalignedCorrespondences(format!(
                    "projected {} points but observed {}",
                    projected.len(),
                    observed.len()
                )));
            }

            let view_squared: f64 = projected
                .iter()
                .zip(observed.iter())
                .map(|(p, o)| {
                    let distance = (p - o).norm();
                    distances.push(distance);
                    distance * distance
                })
                .sum();

            per_view.push(if observed.is_empty() {
                0.0
            } else {
                (view_squared / observed.len() as f64).sqrt()
            });
            total_squared += view_squared;
            total_points += observed.len();
        }

        if total_points == 0 {
            return Err(CalibrationError::InsufficientData {
                required: 1,
                available: 0,
            });
        }

        let rms = (total_squared / total_points as f64).sqrt();
        debug!("{} per-view RMS: {:?}", self.side, per_view);
        Ok(ReprojectionReport {
            rms,
            per_view,
            statistics: projection_statistics(&distances)?,
        })
    }
}

fn check_lengths(
    object_points: &[Vec<Point3<f64>>],
    image_points: &[Vec<Point2<f64>>],
) -> Result<(), CalibrationError> {
    if object_points.len() != image_points.len() {
        return Err(CalibrationError::MisalignedCorrespondences(format!(
            "{} object point sets but {} image point sets",
            object_points.len(),
            image_points.len()
        )));
    }
    for (index, (objects, observed)) in object_points.iter().zip(image_points).enumerate() {
        if objects.len() != observed.len() {
            return Err(CalibrationError::MisalignedCorrespondences(format!(
                "view {index}: {} object points but {} image points",
                objects.len(),
                observed.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SyntheticDetector, SyntheticRig};
    use crate::target::TargetModel;
    use crate::vision::NativeSolver;

    fn rig() -> SyntheticRig {
        SyntheticRig::standard(TargetModel::new(6, 9).unwrap(), 6)
    }

    fn observations(
        rig: &SyntheticRig,
        detector: &SyntheticDetector<'_>,
        side: CameraSide,
    ) -> Vec<Vec<Point2<f64>>> {
        (1..=rig.pose_count())
            .map(|pose| {
                detector
                    .detect_grid_corners(&rig.frame(pose, side), rig.target().board_size())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn test_zero_noise_reprojection_error_is_negligible() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig);
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);

        for side in CameraSide::BOTH {
            let truth = rig.ground_truth(side).unwrap();
            let report = calibrator
                .compute_reprojection_error(
                    &truth,
                    &rig.object_points(),
                    &observations(&rig, &detector, side),
                )
                .unwrap();
            assert!(report.rms < 1e-6, "{side}: {}", report.rms);
            assert_eq!(report.per_view.len(), rig.pose_count());
        }
    }

    #[test]
    fn test_reprojection_error_grows_with_noise() {
        let rig = rig();
        let solver = NativeSolver::new();
        let truth = rig.ground_truth(CameraSide::Right).unwrap();

        let mut previous = -1.0;
        for sigma in [0.0, 0.1, 0.5, 1.0, 2.0] {
            let detector = SyntheticDetector::new(&rig).with_noise(sigma, 7);
            let calibrator = CameraCalibrator::new(CameraSide::Right, &detector, &solver);
            let observed = observations(&rig, &detector, CameraSide::Right);
            let rms = calibrator
                .compute_reprojection_error(&truth, &rig.object_points(), &observed)
                .unwrap()
                .rms;
            assert!(rms >= previous, "sigma {sigma}: {rms} < {previous}");
            previous = rms;
        }
        assert!(previous > 1.0);
    }

    #[test]
    fn test_two_poses_are_insufficient() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig);
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);
        let observed = observations(&rig, &detector, CameraSide::Left);

        let result = calibrator.calibrate(
            &rig.object_points()[..2],
            &observed[..2],
            rig.resolution(),
        );
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientData {
                required: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn test_mismatched_sequences_are_rejected() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig);
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);
        let observed = observations(&rig, &detector, CameraSide::Left);

        let result = calibrator.calibrate(&rig.object_points(), &observed[..4], rig.resolution());
        assert!(matches!(
            result,
            Err(CalibrationError::MisalignedCorrespondences(_))
        ));

        let mut truncated = observed.clone();
        truncated[2].pop();
        let result = calibrator.calibrate(&rig.object_points(), &truncated, rig.resolution());
        assert!(matches!(
            result,
            Err(CalibrationError::MisalignedCorrespondences(_))
        ));

        let result = calibrator.calibrate(&[], &[], rig.resolution());
        assert!(matches!(
            result,
            Err(CalibrationError::InsufficientData {
                required: 3,
                available: 0
            })
        ));
    }

    #[test]
    fn test_calibrate_caches_reprojection_error() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig).with_noise(0.2, 3);
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);
        let observed = observations(&rig, &detector, CameraSide::Left);

        let parameters = calibrator
            .calibrate(&rig.object_points(), &observed, rig.resolution())
            .unwrap();
        let recomputed = calibrator
            .compute_reprojection_error(&parameters, &rig.object_points(), &observed)
            .unwrap();
        assert_eq!(parameters.reprojection_error(), recomputed.rms);
        assert!(parameters.reprojection_error() < 0.5);
    }

    #[test]
    fn test_extract_corners_rejects_board_mismatch() {
        let rig = rig();
        let detector = SyntheticDetector::new(&rig);
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);
        let frame = rig.frame(1, CameraSide::Left);

        let found = calibrator.extract_corners(&frame, rig.target().board_size(), 12);
        assert!(found.is_found());

        let wrong = BoardSize {
            width: 8,
            height: 6,
        };
        assert_eq!(calibrator.extract_corners(&frame, wrong, 12), Detection::NotFound);
    }
}
