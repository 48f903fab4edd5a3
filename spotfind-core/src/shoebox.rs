//! Bounding boxes and shoeboxes.
//!
//! A shoebox is the dense 3D block of pixel data around one closed
//! component. Arrays are indexed `[[z, y, x]]` relative to the box origin.

use ndarray::Array3;
use serde::{Deserialize, Serialize};

/// Axis-aligned 3D box with inclusive bounds on every axis.
///
/// A single pixel on frame 4 at (2, 3) has the box `(2, 2, 3, 3, 4, 4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// First column.
    pub x0: usize,
    /// Last column.
    pub x1: usize,
    /// First row.
    pub y0: usize,
    /// Last row.
    pub y1: usize,
    /// First frame.
    pub z0: usize,
    /// Last frame.
    pub z1: usize,
}

impl BoundingBox {
    /// Creates a box from inclusive bounds.
    #[must_use]
    pub fn new(x0: usize, x1: usize, y0: usize, y1: usize, z0: usize, z1: usize) -> Self {
        Self {
            x0,
            x1,
            y0,
            y1,
            z0,
            z1,
        }
    }

    /// Creates a box covering exactly one pixel.
    #[must_use]
    pub fn from_point(x: usize, y: usize, z: usize) -> Self {
        Self::new(x, x, y, y, z, z)
    }

    /// Grows the box to include a pixel.
    pub fn include(&mut self, x: usize, y: usize, z: usize) {
        self.x0 = self.x0.min(x);
        self.x1 = self.x1.max(x);
        self.y0 = self.y0.min(y);
        self.y1 = self.y1.max(y);
        self.z0 = self.z0.min(z);
        self.z1 = self.z1.max(z);
    }

    /// Number of columns covered.
    #[must_use]
    pub fn width(&self) -> usize {
        self.x1 - self.x0 + 1
    }

    /// Number of rows covered.
    #[must_use]
    pub fn height(&self) -> usize {
        self.y1 - self.y0 + 1
    }

    /// Number of frames covered.
    #[must_use]
    pub fn z_extent(&self) -> usize {
        self.z1 - self.z0 + 1
    }

    /// Array shape `(frames, rows, columns)`.
    #[must_use]
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.z_extent(), self.height(), self.width())
    }

    /// Number of voxels in the box.
    #[must_use]
    pub fn volume(&self) -> usize {
        self.width() * self.height() * self.z_extent()
    }

    /// Returns true if the pixel lies inside the box.
    #[must_use]
    pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
        (self.x0..=self.x1).contains(&x)
            && (self.y0..=self.y1).contains(&y)
            && (self.z0..=self.z1).contains(&z)
    }
}

/// Dense pixel data for one spot.
#[derive(Debug, Clone, PartialEq)]
pub struct Shoebox {
    /// Panel the spot was found on.
    pub panel: usize,
    /// Bounding box in panel/frame coordinates.
    pub bbox: BoundingBox,
    /// Pixel values, zero outside the spot.
    pub data: Array3<f64>,
    /// Background estimate; zero until a background stage fills it.
    pub background: Array3<f64>,
    /// True for pixels belonging to the spot.
    pub mask: Array3<bool>,
}

impl Shoebox {
    /// Allocates zeroed arrays sized to `bbox`.
    #[must_use]
    pub fn allocate(panel: usize, bbox: BoundingBox) -> Self {
        let shape = bbox.shape();
        Self {
            panel,
            bbox,
            data: Array3::zeros(shape),
            background: Array3::zeros(shape),
            mask: Array3::from_elem(shape, false),
        }
    }

    /// Sets the value of a pixel given in absolute coordinates and marks it valid.
    ///
    /// Returns false if the pixel lies outside the box.
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f64) -> bool {
        if !self.bbox.contains(x, y, z) {
            return false;
        }
        let index = [z - self.bbox.z0, y - self.bbox.y0, x - self.bbox.x0];
        self.data[index] = value;
        self.mask[index] = true;
        true
    }

    /// Number of valid pixels.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.mask.iter().filter(|&&valid| valid).count()
    }

    /// Returns true if the array shapes agree with the bounding box.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let shape = self.bbox.shape();
        self.data.dim() == shape && self.background.dim() == shape && self.mask.dim() == shape
    }

    /// Iterates over valid pixels as `(x, y, z, value)` in absolute coordinates.
    pub fn pixels(&self) -> impl Iterator<Item = (usize, usize, usize, f64)> + '_ {
        self.mask
            .indexed_iter()
            .filter(|(_, &valid)| valid)
            .map(move |((z, y, x), _)| {
                (
                    x + self.bbox.x0,
                    y + self.bbox.y0,
                    z + self.bbox.z0,
                    self.data[[z, y, x]],
                )
            })
    }

    /// Distinct `(x, y)` positions that are valid on at least one frame.
    #[must_use]
    pub fn footprint(&self) -> Vec<(usize, usize)> {
        let (_, height, width) = self.mask.dim();
        let mut positions = Vec::new();
        for y in 0..height {
            for x in 0..width {
                if self.mask.slice(ndarray::s![.., y, x]).iter().any(|&v| v) {
                    positions.push((x + self.bbox.x0, y + self.bbox.y0));
                }
            }
        }
        positions
    }

    /// Sum of background-subtracted values over valid pixels.
    #[must_use]
    pub fn summed_intensity(&self) -> f64 {
        self.mask
            .iter()
            .zip(self.data.iter().zip(self.background.iter()))
            .filter(|(&valid, _)| valid)
            .map(|(_, (&value, &background))| value - background)
            .sum()
    }
}
