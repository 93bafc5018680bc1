//! Pixel comparison.
//!
//! The diff store treats the comparison as a pure function supplied at
//! construction; [`pixel_diff`] is the stock implementation.

use diffcache_metrics::{COMBINED_METRIC, DiffMetrics};
use image::{Rgba, RgbaImage};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Compare two images, producing their metrics and a visual diff.
pub type DiffFn = Arc<dyn Fn(&RgbaImage, &RgbaImage) -> (DiffMetrics, RgbaImage) + Send + Sync>;

/// Marks differing pixels in the diff image.
const DIFF_PIXEL: Rgba<u8> = Rgba([255, 0, 0, 255]);
/// Pixels present in only one image (dimensions differ).
const MISSING_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 255]);
/// Identical pixels are kept as a faded copy for context.
const FADE_ALPHA: u8 = 48;

/// The stock [`DiffFn`].
pub fn default_diff_fn() -> DiffFn {
    Arc::new(pixel_diff)
}

/// Exact per-pixel comparison.
///
/// The diff image covers the union of both images. Differing pixels are
/// red, pixels covered by only one image are black, and identical pixels are
/// a faded copy of the original. The `combined` score is 0.0 for identical
/// images and 1.0 when the dimensions differ; otherwise it grows with both
/// the share of differing pixels and the size of the per-channel differences.
pub fn pixel_diff(left: &RgbaImage, right: &RgbaImage) -> (DiffMetrics, RgbaImage) {
    let (width, height) = (left.width().max(right.width()), left.height().max(right.height()));
    let dim_differ = left.dimensions() != right.dimensions();
    let mut diff_image = RgbaImage::new(width, height);
    let mut num_diff_pixels = 0u64;
    let mut max_rgba_diffs = [0u8; 4];

    for (x, y, out) in diff_image.enumerate_pixels_mut() {
        let (a, b) = match (left.get_pixel_checked(x, y), right.get_pixel_checked(x, y)) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                num_diff_pixels += 1;
                *out = MISSING_PIXEL;
                continue;
            },
        };
        if a == b {
            *out = Rgba([a[0], a[1], a[2], a[3].min(FADE_ALPHA)]);
            continue;
        }
        num_diff_pixels += 1;
        for (channel, max) in max_rgba_diffs.iter_mut().enumerate() {
            *max = (*max).max(a[channel].abs_diff(b[channel]));
        }
        *out = DIFF_PIXEL;
    }

    let total = u64::from(width) * u64::from(height);
    let pixel_diff_percent = match total {
        0 => 0.0,
        total => (num_diff_pixels as f64 * 100.0 / total as f64) as f32,
    };
    let combined = if dim_differ { 1.0 } else { combined_score(pixel_diff_percent, &max_rgba_diffs) };
    let metrics = DiffMetrics {
        num_diff_pixels,
        pixel_diff_percent,
        max_rgba_diffs,
        dim_differ,
        diffs: BTreeMap::from([(COMBINED_METRIC.to_string(), combined)]),
    };
    (metrics, diff_image)
}

/// Geometric mean of the share of differing pixels and the RMS of the
/// maximum channel differences, both normalized to `0.0..=1.0`.
fn combined_score(pixel_diff_percent: f32, max_rgba_diffs: &[u8; 4]) -> f32 {
    let mean_square = max_rgba_diffs.iter().map(|&d| (f32::from(d) / 255.0).powi(2)).sum::<f32>() / 4.0;
    ((pixel_diff_percent / 100.0) * mean_square.sqrt()).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_images() {
        let image = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let (metrics, diff) = pixel_diff(&image, &image);
        assert_eq!(metrics.num_diff_pixels, 0);
        assert_eq!(metrics.pixel_diff_percent, 0.0);
        assert_eq!(metrics.max_rgba_diffs, [0; 4]);
        assert!(!metrics.dim_differ);
        assert_eq!(metrics.combined(), Some(0.0));
        assert_eq!(diff.dimensions(), (4, 4));
        assert_eq!(*diff.get_pixel(0, 0), Rgba([10, 20, 30, FADE_ALPHA]));
    }

    #[test]
    fn test_one_pixel_differs() {
        let left = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        let mut right = left.clone();
        right.put_pixel(1, 1, Rgba([255, 0, 100, 255]));
        let (metrics, diff) = pixel_diff(&left, &right);
        assert_eq!(metrics.num_diff_pixels, 1);
        assert_eq!(metrics.pixel_diff_percent, 25.0);
        assert_eq!(metrics.max_rgba_diffs, [255, 0, 100, 0]);
        let combined = metrics.combined().unwrap();
        assert!(combined > 0.0 && combined < 1.0);
        assert_eq!(*diff.get_pixel(1, 1), DIFF_PIXEL);
    }

    #[test]
    fn test_symmetric() {
        let left = RgbaImage::from_pixel(3, 1, Rgba([0, 50, 0, 255]));
        let right = RgbaImage::from_pixel(3, 1, Rgba([0, 0, 70, 255]));
        assert_eq!(pixel_diff(&left, &right).0, pixel_diff(&right, &left).0);
    }

    #[test]
    fn test_dimensions_differ() {
        let left = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 255]));
        let right = RgbaImage::from_pixel(3, 2, Rgba([0, 0, 0, 255]));
        let (metrics, diff) = pixel_diff(&left, &right);
        assert!(metrics.dim_differ);
        assert_eq!(metrics.num_diff_pixels, 2);
        assert_eq!(metrics.combined(), Some(1.0));
        assert_eq!(diff.dimensions(), (3, 2));
        assert_eq!(*diff.get_pixel(2, 0), MISSING_PIXEL);
    }
}
