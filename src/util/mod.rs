use crate::correspondence::{CameraSide, CorrespondenceStore};
use crate::error::CalibrationError;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Distribution of per-corner reprojection distances, in pixels.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionError {
    pub rmse: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub stddev: f64,
    pub median: f64,
}

impl fmt::Debug for ProjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Projection Error [ rmse: {}, min: {}, max: {}, mean: {}, stddev: {}, median: {} ]",
            self.rmse, self.min, self.max, self.mean, self.stddev, self.median
        )
    }
}

/// Summary statistics of a set of reprojection distances.
///
/// # Errors
///
/// [`CalibrationError::InsufficientData`] when `errors` is empty.
pub fn projection_statistics(errors: &[f64]) -> Result<ProjectionError, CalibrationError> {
    if errors.is_empty() {
        return Err(CalibrationError::InsufficientData {
            required: 1,
            available: 0,
        });
    }

    let n = errors.len() as f64;
    let mean = errors.iter().sum::<f64>() / n;
    let variance = errors.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
    let rmse = (errors.iter().map(|x| x.powi(2)).sum::<f64>() / n).sqrt();
    let min = errors.iter().copied().fold(f64::INFINITY, f64::min);
    let max = errors.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    let mut sorted = errors.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Ok(ProjectionError {
        rmse,
        min,
        max,
        mean,
        stddev: variance.sqrt(),
        median,
    })
}

#[derive(Serialize)]
struct CorrespondenceRow {
    pose: usize,
    corner: usize,
    x3d: f64,
    y3d: f64,
    z3d: f64,
    x2d: f64,
    y2d: f64,
}

/// Writes one camera's accepted correspondences to CSV, one row per corner.
///
/// `pose` counts accepted poses from zero, in acceptance order.
pub fn export_correspondences(
    store: &CorrespondenceStore,
    side: CameraSide,
    path: impl AsRef<Path>,
) -> Result<(), CalibrationError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let mut writer = csv::Writer::from_path(path)?;
    let mut rows = 0;
    for (pose, (objects, images)) in store
        .object_points()
        .iter()
        .zip(store.image_points(side).iter())
        .enumerate()
    {
        for (corner, (object, image)) in objects.iter().zip(images.iter()).enumerate() {
            writer.serialize(CorrespondenceRow {
                pose,
                corner,
                x3d: object.x,
                y3d: object.y,
                z3d: object.z,
                x2d: image.x,
                y2d: image.y,
            })?;
            rows += 1;
        }
    }
    writer.flush()?;

    info!("Exported {rows} {side} correspondences to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::TargetModel;
    use nalgebra::Point2;

    #[test]
    fn test_projection_statistics() {
        let stats = projection_statistics(&[3.0, 1.0, 4.0, 2.0]).unwrap();
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.median, 2.5);
        assert!((stats.rmse - 7.5f64.sqrt()).abs() < 1e-12);
        assert!((stats.stddev - 1.25f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_projection_statistics_empty() {
        assert!(matches!(
            projection_statistics(&[]),
            Err(CalibrationError::InsufficientData { .. })
        ));
    }

    #[test]
    fn test_export_correspondences_writes_every_corner() {
        let target = TargetModel::new(2, 3).unwrap();
        let mut store = CorrespondenceStore::new(&target);
        for pose in 0..2 {
            let points: Vec<_> = (0..6)
                .map(|i| Point2::new(i as f64 * 10.0, pose as f64))
                .collect();
            store.record_pose(CameraSide::Left, points.clone());
            store.record_pose(CameraSide::Right, points);
            store.commit_canonical_points();
        }

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("left.csv");
        export_correspondences(&store, CameraSide::Left, &path).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "pose");
        assert_eq!(&headers[6], "y2d");
        let rows: Vec<_> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 12);
        assert_eq!(&rows[7][0], "1");
        assert_eq!(&rows[7][5], "10.0");
    }
}
