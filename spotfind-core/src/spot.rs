//! Observed spot positions and intensities.
#![allow(clippy::cast_precision_loss)]

use crate::shoebox::{BoundingBox, Shoebox};
use serde::{Deserialize, Serialize};

/// Centroid and summed intensity of one shoebox.
///
/// Pixel positions are taken at pixel centres (`index + 0.5`) and weighted
/// by their background-subtracted value. When no pixel carries positive
/// weight the unweighted mean is used instead.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Spot {
    /// Panel the spot was found on.
    pub panel: usize,
    /// Bounding box of the spot.
    pub bbox: BoundingBox,
    /// Centroid `(x, y, z)`.
    pub centroid: [f64; 3],
    /// Variance of the centroid position along each axis.
    pub variance: [f64; 3],
    /// Background-subtracted summed intensity.
    pub intensity: f64,
    /// Number of pixels in the spot.
    pub num_pixels: usize,
}

impl Spot {
    /// Computes the observation for a shoebox.
    #[must_use]
    pub fn from_shoebox(shoebox: &Shoebox) -> Self {
        let mut sum_w = 0.0;
        let mut sum = [0.0; 3];
        let mut sum_sq = [0.0; 3];
        let mut count = 0usize;
        let mut plain = [0.0; 3];
        let mut plain_sq = [0.0; 3];

        for ((z, y, x), &valid) in shoebox.mask.indexed_iter() {
            if !valid {
                continue;
            }
            let position = [
                (x + shoebox.bbox.x0) as f64 + 0.5,
                (y + shoebox.bbox.y0) as f64 + 0.5,
                (z + shoebox.bbox.z0) as f64 + 0.5,
            ];
            let weight = shoebox.data[[z, y, x]] - shoebox.background[[z, y, x]];
            count += 1;
            for axis in 0..3 {
                plain[axis] += position[axis];
                plain_sq[axis] += position[axis] * position[axis];
                if weight > 0.0 {
                    sum[axis] += weight * position[axis];
                    sum_sq[axis] += weight * position[axis] * position[axis];
                }
            }
            if weight > 0.0 {
                sum_w += weight;
            }
        }

        let (centroid, variance) = if sum_w > 0.0 {
            moments(sum, sum_sq, sum_w)
        } else if count > 0 {
            moments(plain, plain_sq, count as f64)
        } else {
            ([0.0; 3], [0.0; 3])
        };

        Self {
            panel: shoebox.panel,
            bbox: shoebox.bbox,
            centroid,
            variance,
            intensity: shoebox.summed_intensity(),
            num_pixels: count,
        }
    }
}

fn moments(sum: [f64; 3], sum_sq: [f64; 3], total: f64) -> ([f64; 3], [f64; 3]) {
    let mut mean = [0.0; 3];
    let mut variance = [0.0; 3];
    for axis in 0..3 {
        mean[axis] = sum[axis] / total;
        variance[axis] = (sum_sq[axis] / total - mean[axis] * mean[axis]).max(0.0);
    }
    (mean, variance)
}
