//! Joint estimation of the rig transform from per-camera results.

use super::StereoParameters;
use crate::camera::{RadTanModel, Resolution};
use crate::error::CalibrationError;
use crate::vision::{CalibrationSolver, StereoFlags, StereoObservations};
use log::info;

/// Estimates the rotation and translation from the left to the right camera.
pub struct StereoCalibrator<'a, V: ?Sized> {
    solver: &'a V,
}

impl<'a, V: CalibrationSolver + ?Sized> StereoCalibrator<'a, V> {
    pub fn new(solver: &'a V) -> Self {
        StereoCalibrator { solver }
    }

    /// Runs the solver's joint estimation over the accepted pose pairs.
    ///
    /// `left` and `right` are the per-camera results used as the starting
    /// point. `flags` are handed to the solver unchanged.
    ///
    /// # Errors
    ///
    /// * [`CalibrationError::MisalignedCorrespondences`] unless the three
    ///   sequences, and every view within them, have matching lengths.
    /// * [`CalibrationError::InsufficientData`] below the solver's minimum pose count.
    pub fn calibrate(
        &self,
        observations: &StereoObservations<'_>,
        left: &RadTanModel,
        right: &RadTanModel,
        image_size: Resolution,
        flags: StereoFlags,
    ) -> Result<StereoParameters, CalibrationError> {
        check_observations(observations)?;
        let required = self.solver.min_poses();
        if observations.pose_count() < required {
            return Err(CalibrationError::InsufficientData {
                required,
                available: observations.pose_count(),
            });
        }

        info!(
            "Stereo calibration from {} pose pairs with {:?}",
            observations.pose_count(),
            flags
        );
        let solution = self
            .solver
            .calibrate_stereo_pair(observations, left, right, image_size, flags)?;
        info!(
            "Stereo RMS error {:.4} px, baseline {:.4}",
            solution.rms_error,
            solution.translation.norm()
        );

        Ok(StereoParameters {
            rotation: solution.rotation,
            translation: solution.translation,
            essential: solution.essential,
            fundamental: solution.fundamental,
            rms_error: solution.rms_error,
            left: solution.left,
            right: solution.right,
        })
    }
}

fn check_observations(observations: &StereoObservations<'_>) -> Result<(), CalibrationError> {
    let n = observations.object_points.len();
    if observations.left_points.len() != n || observations.right_points.len() != n {
        return Err(CalibrationError::MisalignedCorrespondences(format!(
            "{} object point sets, {} left sets, {} right sets",
            n,
            observations.left_points.len(),
            observations.right_points.len()
        )));
    }
    if n == 0 {
        return Err(CalibrationError::MisalignedCorrespondences(
            "no pose pairs to calibrate".to_string(),
        ));
    }

    for (index, ((objects, left), right)) in observations
        .object_points
        .iter()
        .zip(observations.left_points)
        .zip(observations.right_points)
        .enumerate()
    {
        if left.len() != objects.len() || right.len() != objects.len() {
            return Err(CalibrationError::MisalignedCorrespondences(format!(
                "view {index}: {} object points, {} left, {} right",
                objects.len(),
                left.len(),
                right.len()
            )));
        }
    }
    Ok(())
}
