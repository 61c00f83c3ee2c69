//! Implements the Radial-Tangential (RadTan) camera model.
//!
//! This is the Brown-Conrady lens model estimated for each camera of the rig:
//! a pinhole camera matrix followed by three radial (`k1`, `k2`, `k3`) and two
//! tangential (`p1`, `p2`) distortion coefficients. It adheres to the
//! [`CameraModel`] trait defined in the parent `camera` module.

use crate::camera::{validation, CameraModel, CameraModelError, Intrinsics, Resolution};
use crate::geometry;
use nalgebra::{DVector, Matrix2, Matrix3, Point2, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use std::{fmt, fs, io::Write};
use yaml_rust::YamlLoader;

/// Number of scalars in the packed `[fx, fy, cx, cy, k1, k2, p1, p2, k3]` form.
pub const RAD_TAN_PARAMS: usize = 9;

/// Represents a Radial-Tangential (RadTan) camera model.
///
/// # Examples
///
/// ```rust
/// use nalgebra::DVector;
/// use stereo_calib::camera::rad_tan::RadTanModel;
/// use stereo_calib::camera::Resolution;
///
/// // Parameters: fx, fy, cx, cy, k1, k2, p1, p2, k3
/// let params = DVector::from_vec(vec![
///     500.0, 500.0, 320.0, 240.0,
///     0.1, -0.05, 0.001, 0.001, 0.02,
/// ]);
/// let model = RadTanModel::new(&params)
///     .unwrap()
///     .with_resolution(Resolution { width: 640, height: 480 });
///
/// assert_eq!(model.intrinsics.fx, 500.0);
/// assert_eq!(model.distortions[0], 0.1); // k1
/// assert_eq!(model.camera_matrix()[(0, 2)], 320.0);
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RadTanModel {
    /// The intrinsic parameters of the camera, [`Intrinsics`] (fx, fy, cx, cy).
    pub intrinsics: Intrinsics,
    /// The resolution of the camera image, [`Resolution`] (width, height).
    pub resolution: Resolution,
    /// The 5 distortion coefficients: `[k1, k2, p1, p2, k3]`.
    pub distortions: [f64; 5],
}

impl RadTanModel {
    /// Creates a new [`RadTanModel`] from packed parameters
    /// `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    ///
    /// The resolution is initialized to 0x0.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::InvalidParams`] if fewer than nine values are given.
    /// * [`CameraModelError::FocalLengthMustBePositive`] or
    ///   [`CameraModelError::PrincipalPointMustBeFinite`] from `validate_params`.
    pub fn new(parameters: &DVector<f64>) -> Result<Self, CameraModelError> {
        if parameters.len() < RAD_TAN_PARAMS {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected {} parameters, got {}",
                RAD_TAN_PARAMS,
                parameters.len()
            )));
        }

        let model = RadTanModel {
            intrinsics: Intrinsics {
                fx: parameters[0],
                fy: parameters[1],
                cx: parameters[2],
                cy: parameters[3],
            },
            resolution: Resolution::default(),
            distortions: [
                parameters[4],
                parameters[5],
                parameters[6],
                parameters[7],
                parameters[8],
            ],
        };

        model.validate_params()?;
        Ok(model)
    }

    /// A distortion-free camera with the given intrinsics.
    pub fn pinhole(intrinsics: Intrinsics, resolution: Resolution) -> Self {
        RadTanModel {
            intrinsics,
            resolution,
            distortions: [0.0; 5],
        }
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn camera_matrix(&self) -> Matrix3<f64> {
        self.intrinsics.camera_matrix()
    }

    /// Packs the model as `[fx, fy, cx, cy, k1, k2, p1, p2, k3]`.
    pub fn params(&self) -> DVector<f64> {
        DVector::from_row_slice(&[
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions[0],
            self.distortions[1],
            self.distortions[2],
            self.distortions[3],
            self.distortions[4],
        ])
    }

    /// Overwrites intrinsics and distortion from the packed form, keeping the resolution.
    pub fn set_params(&mut self, params: &DVector<f64>) -> Result<(), CameraModelError> {
        let resolution = self.resolution;
        *self = RadTanModel::new(params)?.with_resolution(resolution);
        Ok(())
    }

    /// Distorts a point on the normalized image plane (`z = 1`).
    fn distort(&self, x: f64, y: f64) -> Vector2<f64> {
        let [k1, k2, p1, p2, k3] = self.distortions;
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r6;
        Vector2::new(
            x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x),
            y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y,
        )
    }

    /// Removes lens distortion from a pixel, returning normalized image coordinates.
    ///
    /// Newton iteration on the distortion function, seeded with the distorted
    /// normalized point.
    pub fn undistort_normalized(
        &self,
        pixel: &Point2<f64>,
    ) -> Result<Point2<f64>, CameraModelError> {
        const EPS: f64 = 1e-12;
        const MAX_ITERATIONS: u32 = 100;

        let [k1, k2, p1, p2, k3] = self.distortions;
        let target = Vector2::new(
            (pixel.x - self.intrinsics.cx) / self.intrinsics.fx,
            (pixel.y - self.intrinsics.cy) / self.intrinsics.fy,
        );
        let mut point = target;

        for _ in 0..MAX_ITERATIONS {
            let (x, y) = (point.x, point.y);
            let error = self.distort(x, y) - target;
            if error.norm() < EPS {
                return Ok(Point2::from(point));
            }

            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let radial = 1.0 + k1 * r2 + k2 * r4 + k3 * r4 * r2;
            let d_radial = k1 + 2.0 * k2 * r2 + 3.0 * k3 * r4;
            let d_radial_dx = d_radial * 2.0 * x;
            let d_radial_dy = d_radial * 2.0 * y;

            let jacobian = Matrix2::new(
                radial + x * d_radial_dx + 2.0 * p1 * y + 6.0 * p2 * x,
                x * d_radial_dy + 2.0 * p1 * x + 2.0 * p2 * y,
                y * d_radial_dx + 2.0 * p1 * x + 2.0 * p2 * y,
                radial + y * d_radial_dy + 6.0 * p1 * y + 2.0 * p2 * x,
            );

            let delta = jacobian.try_inverse().ok_or_else(|| {
                CameraModelError::NumericalError("Jacobian is singular".to_string())
            })? * error;
            point -= delta;

            if delta.norm() < EPS {
                return Ok(Point2::from(point));
            }
        }

        Err(CameraModelError::NumericalError(format!(
            "Undistortion did not converge after {} iterations.",
            MAX_ITERATIONS
        )))
    }
}

impl fmt::Debug for RadTanModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RadTanModel [fx: {} fy: {} cx: {} cy: {} distortions: {:?} resolution: {}x{}]",
            self.intrinsics.fx,
            self.intrinsics.fy,
            self.intrinsics.cx,
            self.intrinsics.cy,
            self.distortions,
            self.resolution.width,
            self.resolution.height,
        )
    }
}

impl CameraModel for RadTanModel {
    /// Projects a 3D point from camera coordinates to pixel coordinates,
    /// applying distortion.
    ///
    /// Points off the sensor are still projected; reprojection needs their
    /// coordinates even when they land outside the frame.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::PointAtCameraCenter`] if `z` is not in front of the camera.
    fn project(&self, point_3d: &Vector3<f64>) -> Result<Vector2<f64>, CameraModelError> {
        if point_3d.z < f64::EPSILON.sqrt() {
            return Err(CameraModelError::PointAtCameraCenter);
        }

        let params = self.params();
        let point = [point_3d.x, point_3d.y, point_3d.z];
        let [u, v] = geometry::project_rad_tan(params.as_slice(), &point);
        Ok(Vector2::new(u, v))
    }

    /// Unprojects a distorted pixel to a unit ray in camera coordinates.
    ///
    /// # Errors
    ///
    /// * [`CameraModelError::ProjectionOutSideImage`] if the pixel is outside
    ///   a known (non-zero) resolution.
    /// * [`CameraModelError::NumericalError`] if undistortion does not converge.
    fn unproject(&self, point_2d: &Vector2<f64>) -> Result<Vector3<f64>, CameraModelError> {
        let bounded = self.resolution.width > 0 && self.resolution.height > 0;
        if bounded
            && (point_2d.x < 0.0
                || point_2d.x >= self.resolution.width as f64
                || point_2d.y < 0.0
                || point_2d.y >= self.resolution.height as f64)
        {
            return Err(CameraModelError::ProjectionOutSideImage);
        }

        let normalized = self.undistort_normalized(&Point2::from(*point_2d))?;
        Ok(Vector3::new(normalized.x, normalized.y, 1.0).normalize())
    }

    /// Loads a Kalibr-style `cam0` block (`intrinsics`, `distortion`, `resolution`).
    fn load_from_yaml(path: &str) -> Result<Self, CameraModelError> {
        let contents = fs::read_to_string(path)?;
        let docs = YamlLoader::load_from_str(&contents)?;
        let doc = docs
            .first()
            .ok_or_else(|| CameraModelError::InvalidParams("Empty YAML document".to_string()))?;

        let read_floats = |key: &str, expected: usize| -> Result<Vec<f64>, CameraModelError> {
            let node = doc["cam0"][key]
                .as_vec()
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Missing {key}")))?;
            if node.len() != expected {
                return Err(CameraModelError::InvalidParams(format!(
                    "Expected {expected} values for {key}, found {}",
                    node.len()
                )));
            }
            node.iter()
                .enumerate()
                .map(|(i, value)| {
                    value
                        .as_f64()
                        .or_else(|| value.as_i64().map(|v| v as f64))
                        .ok_or_else(|| {
                            CameraModelError::InvalidParams(format!(
                                "Invalid {key} value at index {i}"
                            ))
                        })
                })
                .collect()
        };

        let intrinsics = read_floats("intrinsics", 4)?;
        let distortion = read_floats("distortion", 5)?;

        let resolution_yaml = doc["cam0"]["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let dimension = |index: usize, name: &str| -> Result<u32, CameraModelError> {
            resolution_yaml
                .get(index)
                .and_then(|value| value.as_i64())
                .and_then(|value| u32::try_from(value).ok())
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };
        let resolution = Resolution {
            width: dimension(0, "width")?,
            height: dimension(1, "height")?,
        };

        let mut params = intrinsics;
        params.extend(distortion);
        Ok(RadTanModel::new(&DVector::from_vec(params))?.with_resolution(resolution))
    }

    /// Saves the model as a Kalibr-style `cam0` block.
    fn save_to_yaml(&self, path: &str) -> Result<(), CameraModelError> {
        let yaml_error = |e: serde_yaml::Error| CameraModelError::YamlError(e.to_string());

        let mut cam0 = serde_yaml::Mapping::new();
        cam0.insert("camera_model".into(), "pinhole".into());
        cam0.insert("distortion_model".into(), "radtan".into());
        cam0.insert(
            "intrinsics".into(),
            serde_yaml::to_value(vec![
                self.intrinsics.fx,
                self.intrinsics.fy,
                self.intrinsics.cx,
                self.intrinsics.cy,
            ])
            .map_err(yaml_error)?,
        );
        cam0.insert(
            "distortion".into(),
            serde_yaml::to_value(self.distortions.to_vec()).map_err(yaml_error)?,
        );
        cam0.insert(
            "resolution".into(),
            serde_yaml::to_value(vec![self.resolution.width, self.resolution.height])
                .map_err(yaml_error)?,
        );

        let mut root = serde_yaml::Mapping::new();
        root.insert("cam0".into(), serde_yaml::Value::Mapping(cam0));
        let yaml_string = serde_yaml::to_string(&root).map_err(yaml_error)?;

        let mut file = fs::File::create(path)?;
        file.write_all(yaml_string.as_bytes())?;
        Ok(())
    }

    fn validate_params(&self) -> Result<(), CameraModelError> {
        validation::validate_intrinsics(&self.intrinsics)?;
        if self.distortions.iter().any(|d| !d.is_finite()) {
            return Err(CameraModelError::InvalidParams(
                "Distortion coefficients must be finite".to_string(),
            ));
        }
        Ok(())
    }
}
