//! Image thresholding strategies.
//!
//! A [`ThresholdFunction`] turns one panel plane and its validity mask into
//! a mask of candidate strong pixels. Strategies are injected into the
//! extractor by composition.
#![allow(clippy::cast_precision_loss)]

use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Trait for image thresholding strategies.
pub trait ThresholdFunction: Send + Sync {
    /// Returns true for every pixel considered strong.
    ///
    /// `image` and `mask` have the same shape; the returned mask must too.
    fn compute_threshold(&self, image: ArrayView2<f64>, mask: ArrayView2<bool>) -> Array2<bool>;

    /// Returns the name of the strategy.
    fn name(&self) -> &'static str;
}

/// Flags valid pixels strictly above a fixed value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FixedThreshold {
    /// Pixels with a value above this are strong.
    pub value: f64,
}

impl FixedThreshold {
    /// Creates a fixed threshold.
    #[must_use]
    pub fn new(value: f64) -> Self {
        Self { value }
    }
}

impl ThresholdFunction for FixedThreshold {
    fn compute_threshold(&self, image: ArrayView2<f64>, mask: ArrayView2<bool>) -> Array2<bool> {
        let mut result = Array2::from_elem(image.dim(), false);
        ndarray::Zip::from(&mut result)
            .and(&image)
            .and(&mask)
            .for_each(|out, &value, &valid| *out = valid && value > self.value);
        result
    }

    fn name(&self) -> &'static str {
        "Fixed"
    }
}

/// Local index-of-dispersion threshold.
///
/// For each pixel, the mean and variance of the valid pixels in a
/// `(2k+1) x (2k+1)` window are computed from summed-area tables. A pixel is
/// strong when the window is not Poisson-like (dispersion above
/// `gain * (1 + sigma_background * sqrt(2 / (n - 1)))`), the pixel itself
/// lies `sigma_strong` standard deviations above the local mean, and its
/// value exceeds `global_threshold`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispersionThreshold {
    /// Half-size of the kernel window in pixels.
    pub kernel_half_size: usize,
    /// Detector gain.
    pub gain: f64,
    /// Sigma for the background dispersion test.
    pub sigma_background: f64,
    /// Sigma for the strong pixel test.
    pub sigma_strong: f64,
    /// Minimum number of valid pixels in the window.
    pub min_count: usize,
    /// Absolute lower bound on strong pixel values.
    pub global_threshold: f64,
}

impl Default for DispersionThreshold {
    fn default() -> Self {
        Self {
            kernel_half_size: 3,
            gain: 1.0,
            sigma_background: 6.0,
            sigma_strong: 3.0,
            min_count: 2,
            global_threshold: 0.0,
        }
    }
}

impl DispersionThreshold {
    /// Sets the kernel half size.
    #[must_use]
    pub fn with_kernel_half_size(mut self, half_size: usize) -> Self {
        self.kernel_half_size = half_size;
        self
    }

    /// Sets the detector gain.
    #[must_use]
    pub fn with_gain(mut self, gain: f64) -> Self {
        self.gain = gain;
        self
    }

    /// Sets the background and strong pixel sigmas.
    #[must_use]
    pub fn with_sigmas(mut self, sigma_background: f64, sigma_strong: f64) -> Self {
        self.sigma_background = sigma_background;
        self.sigma_strong = sigma_strong;
        self
    }

    /// Sets the absolute threshold.
    #[must_use]
    pub fn with_global_threshold(mut self, threshold: f64) -> Self {
        self.global_threshold = threshold;
        self
    }
}

/// Summed-area tables of count, sum and sum of squares over valid pixels.
struct SummedArea {
    count: Array2<f64>,
    sum: Array2<f64>,
    sum_sq: Array2<f64>,
}

impl SummedArea {
    fn new(image: ArrayView2<f64>, mask: ArrayView2<bool>) -> Self {
        let (height, width) = image.dim();
        let mut count = Array2::zeros((height + 1, width + 1));
        let mut sum = Array2::zeros((height + 1, width + 1));
        let mut sum_sq = Array2::zeros((height + 1, width + 1));
        for y in 0..height {
            let mut row_count = 0.0;
            let mut row_sum = 0.0;
            let mut row_sum_sq = 0.0;
            for x in 0..width {
                if mask[[y, x]] {
                    let value = image[[y, x]];
                    row_count += 1.0;
                    row_sum += value;
                    row_sum_sq += value * value;
                }
                count[[y + 1, x + 1]] = count[[y, x + 1]] + row_count;
                sum[[y + 1, x + 1]] = sum[[y, x + 1]] + row_sum;
                sum_sq[[y + 1, x + 1]] = sum_sq[[y, x + 1]] + row_sum_sq;
            }
        }
        Self { count, sum, sum_sq }
    }

    /// Window totals over rows `y0..y1` and columns `x0..x1` (exclusive ends).
    fn window(&self, y0: usize, y1: usize, x0: usize, x1: usize) -> (f64, f64, f64) {
        let area = |table: &Array2<f64>| {
            table[[y1, x1]] - table[[y0, x1]] - table[[y1, x0]] + table[[y0, x0]]
        };
        (area(&self.count), area(&self.sum), area(&self.sum_sq))
    }
}

impl ThresholdFunction for DispersionThreshold {
    fn compute_threshold(&self, image: ArrayView2<f64>, mask: ArrayView2<bool>) -> Array2<bool> {
        let (height, width) = image.dim();
        let mut result = Array2::from_elem((height, width), false);
        if height == 0 || width == 0 {
            return result;
        }
        let table = SummedArea::new(image, mask);
        let k = self.kernel_half_size;
        let min_count = self.min_count.max(2) as f64;

        for y in 0..height {
            let y0 = y.saturating_sub(k);
            let y1 = (y + k + 1).min(height);
            for x in 0..width {
                if !mask[[y, x]] {
                    continue;
                }
                let value = image[[y, x]];
                if value <= self.global_threshold {
                    continue;
                }
                let x0 = x.saturating_sub(k);
                let x1 = (x + k + 1).min(width);
                let (n, sum, sum_sq) = table.window(y0, y1, x0, x1);
                if n < min_count {
                    continue;
                }
                let mean = sum / n;
                if mean <= 0.0 {
                    continue;
                }
                let variance = (n * sum_sq - sum * sum) / (n * (n - 1.0));
                let dispersion_limit =
                    self.gain * (1.0 + self.sigma_background * (2.0 / (n - 1.0)).sqrt());
                let strong_limit = mean + self.sigma_strong * (self.gain * mean).sqrt();
                result[[y, x]] = variance / mean > dispersion_limit && value > strong_limit;
            }
        }
        result
    }

    fn name(&self) -> &'static str {
        "Dispersion"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_fixed_threshold_respects_mask() {
        let image = array![[1.0, 5.0], [6.0, 2.0]];
        let mask = array![[true, true], [false, true]];
        let result = FixedThreshold::new(4.0).compute_threshold(image.view(), mask.view());
        assert_eq!(result, array![[false, true], [false, false]]);
    }

    #[test]
    fn test_fixed_threshold_is_strict() {
        let image = array![[4.0]];
        let mask = array![[true]];
        let result = FixedThreshold::new(4.0).compute_threshold(image.view(), mask.view());
        assert!(!result[[0, 0]]);
    }

    #[test]
    fn test_dispersion_finds_isolated_peak() {
        let mut image = Array2::from_elem((15, 15), 10.0);
        // Mild Poisson-like texture
        for ((y, x), value) in image.indexed_iter_mut() {
            if (x + y) % 2 == 0 {
                *value = 12.0;
            } else {
                *value = 8.0;
            }
        }
        image[[7, 7]] = 500.0;
        let mask = Array2::from_elem((15, 15), true);

        let result = DispersionThreshold::default().compute_threshold(image.view(), mask.view());
        assert!(result[[7, 7]]);
        assert_eq!(result.iter().filter(|&&strong| strong).count(), 1);
    }

    #[test]
    fn test_dispersion_flat_background_has_no_strong_pixels() {
        let image = Array2::from_elem((9, 9), 10.0);
        let mask = Array2::from_elem((9, 9), true);
        let result = DispersionThreshold::default().compute_threshold(image.view(), mask.view());
        assert!(result.iter().all(|&strong| !strong));
    }

    #[test]
    fn test_dispersion_ignores_masked_peak() {
        let mut image = Array2::from_elem((9, 9), 10.0);
        image[[4, 4]] = 500.0;
        let mut mask = Array2::from_elem((9, 9), true);
        mask[[4, 4]] = false;
        let result = DispersionThreshold::default().compute_threshold(image.view(), mask.view());
        assert!(!result[[4, 4]]);
    }
}
