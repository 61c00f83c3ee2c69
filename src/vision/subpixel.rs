//! Sub-pixel refinement of checkerboard corners.
//!
//! At a saddle point every image gradient in the neighbourhood is orthogonal
//! to the vector from the corner to the gradient's location. Each iteration
//! solves the weighted least-squares system of those constraints for a new
//! corner estimate. Pixel centres sit at integer coordinates.

use super::{CornerDetector, TermCriteria};
use crate::target::BoardSize;
use image::GrayImage;
use log::trace;
use nalgebra::{Point2, Vector2};

/// Bilinear intensity lookup with edge pixels replicated outside the image.
fn sample_bilinear(image: &GrayImage, x: f64, y: f64) -> f64 {
    let max_x = image.width() as i64 - 1;
    let max_y = image.height() as i64 - 1;
    let pixel = |px: i64, py: i64| -> f64 {
        let px = px.clamp(0, max_x) as u32;
        let py = py.clamp(0, max_y) as u32;
        image.get_pixel(px, py).0[0] as f64
    };

    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = pixel(x0, y0);
    let p10 = pixel(x0 + 1, y0);
    let p01 = pixel(x0, y0 + 1);
    let p11 = pixel(x0 + 1, y0 + 1);

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

fn gaussian_weights(window: usize) -> Vec<f64> {
    let half = window as f64;
    (0..=2 * window)
        .map(|i| {
            let x = (i as f64 - half) / half;
            (-x * x).exp()
        })
        .collect()
}

fn refine_corner(
    image: &GrayImage,
    initial: Point2<f64>,
    window: usize,
    weights: &[f64],
    criteria: &TermCriteria,
) -> Point2<f64> {
    let half = window as i64;
    let mut corner = initial.coords;

    for iteration in 0..criteria.max_iterations {
        let mut a = 0.0;
        let mut b = 0.0;
        let mut c = 0.0;
        let mut bb1 = 0.0;
        let mut bb2 = 0.0;

        for dy in -half..=half {
            for dx in -half..=half {
                let px = corner.x + dx as f64;
                let py = corner.y + dy as f64;
                let gx = (sample_bilinear(image, px + 1.0, py)
                    - sample_bilinear(image, px - 1.0, py))
                    * 0.5;
                let gy = (sample_bilinear(image, px, py + 1.0)
                    - sample_bilinear(image, px, py - 1.0))
                    * 0.5;
                let m = weights[(dy + half) as usize] * weights[(dx + half) as usize];

                let gxx = gx * gx * m;
                let gxy = gx * gy * m;
                let gyy = gy * gy * m;
                a += gxx;
                b += gxy;
                c += gyy;
                bb1 += gxx * px + gxy * py;
                bb2 += gxy * px + gyy * py;
            }
        }

        let det = a * c - b * b;
        if det.abs() <= f64::EPSILON * (a * c).abs().max(1.0) {
            trace!("flat neighbourhood at {corner:?}, keeping estimate");
            break;
        }

        let next = Vector2::new((c * bb1 - b * bb2) / det, (a * bb2 - b * bb1) / det);
        let step = (next - corner).norm();
        corner = next;
        if step <= criteria.epsilon {
            trace!("corner converged after {} iterations", iteration + 1);
            break;
        }
    }

    let drift = corner - initial.coords;
    let outside = drift.x.abs() > window as f64 || drift.y.abs() > window as f64;
    if outside || !corner.iter().all(|v| v.is_finite()) {
        return initial;
    }
    Point2::from(corner)
}

/// Refines each corner within a `(2 * window + 1)` pixel square centred on it.
///
/// A corner whose estimate leaves the search window is returned unchanged.
pub fn refine_corners(
    image: &GrayImage,
    corners: &[Point2<f64>],
    window: usize,
    criteria: &TermCriteria,
) -> Vec<Point2<f64>> {
    if window == 0 || image.width() == 0 || image.height() == 0 {
        return corners.to_vec();
    }
    let weights = gaussian_weights(window);
    corners
        .iter()
        .map(|corner| refine_corner(image, *corner, window, &weights, criteria))
        .collect()
}

/// Grayscale corner detector whose corners are refined with [`refine_corners`].
///
/// The wrapped detector's own `refine_sub_pixel` is never called.
#[derive(Debug, Clone)]
pub struct SubPixelDetector<D> {
    inner: D,
}

impl<D> SubPixelDetector<D> {
    pub fn new(inner: D) -> Self {
        SubPixelDetector { inner }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: CornerDetector<Image = GrayImage>> CornerDetector for SubPixelDetector<D> {
    type Image = GrayImage;

    fn detect_grid_corners(&self, image: &GrayImage, board: BoardSize) -> Option<Vec<Point2<f64>>> {
        self.inner.detect_grid_corners(image, board)
    }

    fn refine_sub_pixel(
        &self,
        image: &GrayImage,
        corners: Vec<Point2<f64>>,
        window: usize,
        criteria: &TermCriteria,
    ) -> Vec<Point2<f64>> {
        refine_corners(image, &corners, window, criteria)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CameraCalibrator;
    use crate::correspondence::CameraSide;
    use crate::vision::{Detection, NativeSolver};
    use image::Luma;

    /// Supersampled X-junction with its saddle point at `corner`.
    fn render_corner(size: u32, corner: Point2<f64>) -> GrayImage {
        const SAMPLES: u32 = 8;
        GrayImage::from_fn(size, size, |x, y| {
            let mut sum = 0.0;
            for sy in 0..SAMPLES {
                for sx in 0..SAMPLES {
                    let fx = x as f64 - 0.5 + (sx as f64 + 0.5) / SAMPLES as f64;
                    let fy = y as f64 - 0.5 + (sy as f64 + 0.5) / SAMPLES as f64;
                    let dark = (fx - corner.x) * (fy - corner.y) > 0.0;
                    sum += if dark { 40.0 } else { 220.0 };
                }
            }
            Luma([(sum / (SAMPLES * SAMPLES) as f64).round() as u8])
        })
    }

    #[test]
    fn test_refines_rendered_corner() {
        let truth = Point2::new(31.4, 32.7);
        let image = render_corner(64, truth);
        let criteria = TermCriteria {
            epsilon: 0.001,
            max_iterations: 50,
        };

        let refined = refine_corners(&image, &[Point2::new(33.0, 31.5)], 5, &criteria);
        assert!((refined[0] - truth).norm() < 0.15, "refined to {:?}", refined[0]);
    }

    #[test]
    fn test_default_window_and_criteria() {
        let truth = Point2::new(40.25, 38.6);
        let image = render_corner(80, truth);

        let refined =
            refine_corners(&image, &[Point2::new(41.0, 38.0)], 12, &TermCriteria::default());
        assert!((refined[0] - truth).norm() < 0.25, "refined to {:?}", refined[0]);
    }

    #[test]
    fn test_flat_image_keeps_corner() {
        let image = GrayImage::from_pixel(32, 32, Luma([128]));
        let corner = Point2::new(15.5, 16.25);
        let refined = refine_corners(&image, &[corner], 4, &TermCriteria::default());
        assert_eq!(refined, vec![corner]);
    }

    #[test]
    fn test_zero_window_is_identity() {
        let image = render_corner(32, Point2::new(16.0, 16.0));
        let corners = vec![Point2::new(10.0, 12.0), Point2::new(17.0, 15.0)];
        assert_eq!(refine_corners(&image, &corners, 0, &TermCriteria::default()), corners);
    }

    /// Reports a fixed, slightly-off guess for a single-corner board.
    struct FixedGuess(Point2<f64>);

    impl CornerDetector for FixedGuess {
        type Image = GrayImage;

        fn detect_grid_corners(&self, _: &GrayImage, _: BoardSize) -> Option<Vec<Point2<f64>>> {
            Some(vec![self.0])
        }

        fn refine_sub_pixel(
            &self,
            _: &GrayImage,
            corners: Vec<Point2<f64>>,
            _: usize,
            _: &TermCriteria,
        ) -> Vec<Point2<f64>> {
            corners
        }
    }

    #[test]
    fn test_extract_corners_through_refining_detector() {
        let truth = Point2::new(24.3, 22.8);
        let image = render_corner(48, truth);
        let detector = SubPixelDetector::new(FixedGuess(Point2::new(25.0, 22.0)));
        let solver = NativeSolver::new();
        let calibrator = CameraCalibrator::new(CameraSide::Left, &detector, &solver);
        let board = BoardSize {
            width: 1,
            height: 1,
        };

        let Detection::Found(corners) = calibrator.extract_corners(&image, board, 5) else {
            panic!("board not found");
        };
        assert!((corners[0] - truth).norm() < 0.25, "refined to {:?}", corners[0]);
    }
}
