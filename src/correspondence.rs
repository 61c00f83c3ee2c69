//! Accumulated board-to-image correspondences for both rig cameras.

use crate::target::TargetModel;
use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which camera of the rig an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraSide {
    Left,
    Right,
}

impl CameraSide {
    pub const BOTH: [CameraSide; 2] = [CameraSide::Left, CameraSide::Right];

    /// Lowercase name, also used as the image file prefix.
    pub fn orientation(&self) -> &'static str {
        match self {
            CameraSide::Left => "left",
            CameraSide::Right => "right",
        }
    }
}

impl fmt::Display for CameraSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.orientation())
    }
}

/// Append-only store of accepted poses.
///
/// Entry `i` of [`object_points`](Self::object_points) and entry `i` of each
/// camera's [`image_points`](Self::image_points) describe the same physical
/// board pose, and every inner sequence has one point per board corner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrespondenceStore {
    canonical_points: Vec<Point3<f64>>,
    object_points: Vec<Vec<Point3<f64>>>,
    left_points: Vec<Vec<Point2<f64>>>,
    right_points: Vec<Vec<Point2<f64>>>,
}

impl CorrespondenceStore {
    pub fn new(target: &TargetModel) -> Self {
        CorrespondenceStore {
            canonical_points: target.canonical_points().to_vec(),
            object_points: Vec::new(),
            left_points: Vec::new(),
            right_points: Vec::new(),
        }
    }

    fn side_points_mut(&mut self, side: CameraSide) -> &mut Vec<Vec<Point2<f64>>> {
        match side {
            CameraSide::Left => &mut self.left_points,
            CameraSide::Right => &mut self.right_points,
        }
    }

    /// Appends one camera's detected corners for the pose being accepted.
    ///
    /// # Panics
    ///
    /// If `image_points` does not hold exactly one point per board corner.
    /// Callers only record corners that detection reported as complete.
    pub fn record_pose(&mut self, side: CameraSide, image_points: Vec<Point2<f64>>) {
        assert_eq!(
            image_points.len(),
            self.canonical_points.len(),
            "{side} corner count must match the checkerboard"
        );
        self.side_points_mut(side).push(image_points);
    }

    /// Appends the canonical board points for the pose being accepted.
    pub fn commit_canonical_points(&mut self) {
        self.object_points.push(self.canonical_points.clone());
    }

    /// Drops every recorded pose, keeping the board.
    pub fn clear(&mut self) {
        self.object_points.clear();
        self.left_points.clear();
        self.right_points.clear();
    }

    pub fn object_points(&self) -> &[Vec<Point3<f64>>] {
        &self.object_points
    }

    pub fn image_points(&self, side: CameraSide) -> &[Vec<Point2<f64>>] {
        match side {
            CameraSide::Left => &self.left_points,
            CameraSide::Right => &self.right_points,
        }
    }

    pub fn canonical_points(&self) -> &[Point3<f64>] {
        &self.canonical_points
    }

    /// Number of fully accepted poses.
    pub fn pose_count(&self) -> usize {
        self.object_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.object_points.is_empty()
    }

    /// True when the three sequences have equal length and every inner
    /// sequence has one entry per board corner.
    pub fn is_aligned(&self) -> bool {
        let n = self.canonical_points.len();
        self.object_points.len() == self.left_points.len()
            && self.object_points.len() == self.right_points.len()
            && self.object_points.iter().all(|set| set.len() == n)
            && self.left_points.iter().all(|set| set.len() == n)
            && self.right_points.iter().all(|set| set.len() == n)
    }
}
