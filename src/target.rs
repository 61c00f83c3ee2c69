//! The planar checkerboard target.

use crate::error::CalibrationError;
use nalgebra::Point3;
use serde::{Deserialize, Serialize};

/// Grid dimensions in inner corners, width first, as detectors expect them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardSize {
    pub width: usize,
    pub height: usize,
}

impl BoardSize {
    pub fn corner_count(&self) -> usize {
        self.width * self.height
    }
}

/// Geometry of a checkerboard and the board-frame coordinates of its inner corners.
///
/// Corners are laid out row-major on the `z = 0` plane: point `i * cols + j`
/// is `(j * square_size, i * square_size, 0)`. Detected corners must be
/// reported in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetModel {
    inner_corner_rows: usize,
    inner_corner_cols: usize,
    square_size: f64,
    canonical_points: Vec<Point3<f64>>,
}

impl TargetModel {
    /// Builds the target from its inner corner counts, with unit squares.
    ///
    /// # Errors
    ///
    /// [`CalibrationError::Configuration`] if either count is zero.
    pub fn new(
        inner_corner_rows: usize,
        inner_corner_cols: usize,
    ) -> Result<Self, CalibrationError> {
        if inner_corner_rows == 0 || inner_corner_cols == 0 {
            return Err(CalibrationError::Configuration(format!(
                "checkerboard needs at least one inner corner per axis, got {}x{}",
                inner_corner_rows,
                inner_corner_cols
            )));
        }

        let mut target = TargetModel {
            inner_corner_rows,
            inner_corner_cols,
            square_size: 1.0,
            canonical_points: Vec::new(),
        };
        target.canonical_points = target.generate_points();
        Ok(target)
    }

    /// Builds the target from the number of squares along each axis.
    ///
    /// A board with `n` squares along an axis has `n - 1` inner corners there.
    pub fn from_squares(square_rows: usize, square_cols: usize) -> Result<Self, CalibrationError> {
        if square_rows < 2 || square_cols < 2 {
            return Err(CalibrationError::Configuration(format!(
                "checkerboard needs at least 2 squares per axis, got {square_rows}x{square_cols}"
            )));
        }
        TargetModel::new(square_rows - 1, square_cols - 1)
    }

    /// Scales the board to physical units. Translations estimated later are in these units.
    pub fn with_square_size(mut self, square_size: f64) -> Result<Self, CalibrationError> {
        if !(square_size.is_finite() && square_size > 0.0) {
            return Err(CalibrationError::Configuration(format!(
                "square size must be positive and finite, got {square_size}"
            )));
        }
        self.square_size = square_size;
        self.canonical_points = self.generate_points();
        Ok(self)
    }

    fn generate_points(&self) -> Vec<Point3<f64>> {
        (0..self.inner_corner_rows)
            .flat_map(|i| {
                (0..self.inner_corner_cols).map(move |j| {
                    Point3::new(j as f64 * self.square_size, i as f64 * self.square_size, 0.0)
                })
            })
            .collect()
    }

    pub fn board_size(&self) -> BoardSize {
        BoardSize {
            width: self.inner_corner_cols,
            height: self.inner_corner_rows,
        }
    }

    pub fn canonical_points(&self) -> &[Point3<f64>] {
        &self.canonical_points
    }

    pub fn point_count(&self) -> usize {
        self.canonical_points.len()
    }

    pub fn inner_corner_rows(&self) -> usize {
        self.inner_corner_rows
    }

    pub fn inner_corner_cols(&self) -> usize {
        self.inner_corner_cols
    }

    pub fn square_size(&self) -> f64 {
        self.square_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_points_row_major() {
        let target = TargetModel::new(6, 9).unwrap();
        let points = target.canonical_points();

        assert_eq!(points.len(), 54);
        assert_eq!(points[0], Point3::new(0.0, 0.0, 0.0));
        assert_eq!(points[1], Point3::new(1.0, 0.0, 0.0));
        assert_eq!(points[9], Point3::new(0.0, 1.0, 0.0));
        assert_eq!(points[53], Point3::new(8.0, 5.0, 0.0));
        assert!(points.iter().all(|p| p.z == 0.0));
    }

    #[test]
    fn test_board_size_is_width_first() {
        let target = TargetModel::new(6, 9).unwrap();
        assert_eq!(
            target.board_size(),
            BoardSize {
                width: 9,
                height: 6
            }
        );
        assert_eq!(target.board_size().corner_count(), target.point_count());
    }

    #[test]
    fn test_zero_dimension_is_rejected() {
        assert!(matches!(
            TargetModel::new(0, 9),
            Err(CalibrationError::Configuration(_))
        ));
        assert!(matches!(
            TargetModel::new(6, 0),
            Err(CalibrationError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_squares_subtracts_one() {
        let target = TargetModel::from_squares(7, 10).unwrap();
        assert_eq!(target.inner_corner_rows(), 6);
        assert_eq!(target.inner_corner_cols(), 9);
        assert!(TargetModel::from_squares(1, 10).is_err());
    }

    #[test]
    fn test_square_size_scales_points() {
        let target = TargetModel::new(6, 9).unwrap().with_square_size(0.025).unwrap();
        let last = target.canonical_points()[53];
        assert!((last.x - 0.2).abs() < 1e-12);
        assert!((last.y - 0.125).abs() < 1e-12);
        assert!(TargetModel::new(6, 9).unwrap().with_square_size(-1.0).is_err());
    }
}
