//! Non-linear refinement of calibration problems.
//!
//! Each problem type implements [`Optimizer`]: a closed-form
//! [`linear_estimation`](Optimizer::linear_estimation) to get a starting point,
//! followed by Levenberg-Marquardt in [`optimize`](Optimizer::optimize) using
//! the `tiny_solver` crate with automatic differentiation.
//!
//! Both problems minimise pixel reprojection error. Residual blocks are built
//! from [`ReprojectionFactor`], one block per camera per board pose.

use crate::camera::rad_tan::RAD_TAN_PARAMS;
use crate::error::CalibrationError;
use crate::geometry::{lift_point, project_rad_tan, transform};
use nalgebra::{DVector, Point2, Point3, RealField};
use std::collections::HashMap;
use tiny_solver::factors::Factor;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer};

pub mod mono;
pub mod stereo;

pub use mono::MonoCalibrationCost;
pub use stereo::StereoCalibrationCost;

/// A calibration problem that can be initialised linearly and refined non-linearly.
pub trait Optimizer {
    /// Refines all free parameters by minimising reprojection error.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, logs progress at `info` level.
    fn optimize(&mut self, verbose: bool) -> Result<(), CalibrationError>;

    /// Computes a closed-form initial estimate of every parameter.
    fn linear_estimation(&mut self) -> Result<(), CalibrationError>
    where
        Self: Sized;

    /// Root-mean-square pixel reprojection error at the current parameters.
    fn rms_error(&self) -> Result<f64, CalibrationError>;
}

/// Where a residual block gets its camera parameters from.
#[derive(Debug, Clone)]
pub(crate) enum CameraBlock {
    /// Held constant at these `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    Fixed([f64; RAD_TAN_PARAMS]),
    /// One nine-element variable.
    Free,
    /// A two-element `[fx, fy]` variable followed by a seven-element
    /// `[cx, cy, k1, k2, p1, p2, k3]` variable.
    SharedFocal,
}

impl CameraBlock {
    fn variable_count(&self) -> usize {
        match self {
            CameraBlock::Fixed(_) => 0,
            CameraBlock::Free => 1,
            CameraBlock::SharedFocal => 2,
        }
    }

    fn assemble<T: RealField>(&self, params: &[DVector<T>]) -> Vec<T> {
        match self {
            CameraBlock::Fixed(values) => values.iter().map(|v| nalgebra::convert(*v)).collect(),
            CameraBlock::Free => params[0].iter().cloned().collect(),
            CameraBlock::SharedFocal => params[0].iter().chain(params[1].iter()).cloned().collect(),
        }
    }
}

/// Reprojection residuals of one board pose in one camera.
///
/// Variables, in order: the camera variables of [`CameraBlock`], the board
/// pose, and when `through_relative` is set the left-to-right rig transform.
#[derive(Debug, Clone)]
pub(crate) struct ReprojectionFactor {
    camera: CameraBlock,
    through_relative: bool,
    object_points: Vec<Point3<f64>>,
    image_points: Vec<Point2<f64>>,
}

impl ReprojectionFactor {
    pub(crate) fn new(
        camera: CameraBlock,
        through_relative: bool,
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
    ) -> Self {
        ReprojectionFactor {
            camera,
            through_relative,
            object_points: object_points.to_vec(),
            image_points: image_points.to_vec(),
        }
    }

    pub(crate) fn residual_count(&self) -> usize {
        self.image_points.len() * 2
    }
}

impl<T: RealField> Factor<T> for ReprojectionFactor {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let offset = self.camera.variable_count();
        let camera = self.camera.assemble(params);
        let pose = params[offset].as_slice();
        let relative = self.through_relative.then(|| params[offset + 1].as_slice());

        let mut residuals = DVector::zeros(self.residual_count());
        for (i, (object, observed)) in self
            .object_points
            .iter()
            .zip(self.image_points.iter())
            .enumerate()
        {
            let mut point = transform(pose, &lift_point(object));
            if let Some(relative) = relative {
                point = transform(relative, &point);
            }
            let [u, v] = project_rad_tan(&camera, &point);
            residuals[i * 2] = u - nalgebra::convert::<f64, T>(observed.x);
            residuals[i * 2 + 1] = v - nalgebra::convert::<f64, T>(observed.y);
        }
        residuals
    }
}

pub(crate) fn pose_key(index: usize) -> String {
    format!("pose_{index}")
}

/// Runs Levenberg-Marquardt and hands back the optimised variables.
pub(crate) fn run_levenberg_marquardt(
    problem: &tiny_solver::Problem,
    initial_values: &HashMap<String, DVector<f64>>,
) -> Result<HashMap<String, DVector<f64>>, CalibrationError> {
    let optimizer = LevenbergMarquardtOptimizer::default();
    optimizer
        .optimize(problem, initial_values, None)
        .ok_or_else(|| CalibrationError::Solver("Levenberg-Marquardt did not converge".to_string()))
}

pub(crate) fn take_variable(
    result: &HashMap<String, DVector<f64>>,
    key: &str,
) -> Result<DVector<f64>, CalibrationError> {
    result
        .get(key)
        .cloned()
        .ok_or_else(|| CalibrationError::Solver(format!("optimizer dropped variable {key}")))
}

/// Squared pixel error summed over `observed`, and the point count.
pub(crate) fn squared_error(projected: &[Point2<f64>], observed: &[Point2<f64>]) -> (f64, usize) {
    let sum = projected
        .iter()
        .zip(observed.iter())
        .map(|(p, o)| (p - o).norm_squared())
        .sum();
    (sum, observed.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Pose;
    use nalgebra::Vector3;

    #[test]
    fn test_reprojection_factor_zero_at_truth() {
        let camera = [600.0, 610.0, 320.0, 240.0, -0.1, 0.01, 0.001, -0.001, 0.0];
        let pose = Pose::new(Vector3::new(0.1, -0.2, 0.05), Vector3::new(-0.1, -0.05, 0.6));
        let objects: Vec<_> = (0..4)
            .map(|i| Point3::new(i as f64 * 0.05, (i % 2) as f64 * 0.05, 0.0))
            .collect();
        let observed: Vec<_> = objects
            .iter()
            .map(|p| {
                let pc = pose.transform_point(p);
                let [u, v] = project_rad_tan(&camera, &[pc.x, pc.y, pc.z]);
                Point2::new(u, v)
            })
            .collect();

        let factor = ReprojectionFactor::new(CameraBlock::Free, false, &objects, &observed);
        let params = [DVector::from_row_slice(&camera), pose.to_params()];
        let residuals: DVector<f64> = factor.residual_func(&params);
        assert_eq!(residuals.len(), 8);
        assert!(residuals.amax() < 1e-9);
    }

    #[test]
    fn test_shared_focal_assembles_nine_parameters() {
        let params = [
            DVector::from_row_slice(&[700.0, 705.0]),
            DVector::from_row_slice(&[320.0, 240.0, 0.1, 0.2, 0.3, 0.4, 0.5]),
        ];
        let camera = CameraBlock::SharedFocal.assemble(&params);
        assert_eq!(camera, vec![700.0, 705.0, 320.0, 240.0, 0.1, 0.2, 0.3, 0.4, 0.5]);
    }
}
