//! Hot pixel detection.
//!
//! A spot that is present on every image of a scan is almost certainly a
//! detector defect. Every pixel position it covers is marked bad.

use ndarray::{Array2, Zip};
use spotfind_core::{Detector, Error, Result, Shoebox};

/// Per-panel mask of good pixels (true = good, false = hot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotMask {
    panels: Vec<Array2<bool>>,
    num_hot_spots: usize,
}

impl HotMask {
    /// Creates a mask with every pixel good.
    #[must_use]
    pub fn all_good(detector: &Detector) -> Self {
        Self {
            panels: detector
                .panels()
                .iter()
                .map(|size| Array2::from_elem(size.shape(), true))
                .collect(),
            num_hot_spots: 0,
        }
    }

    /// Per-panel masks.
    #[must_use]
    pub fn panels(&self) -> &[Array2<bool>] {
        &self.panels
    }

    /// Number of spots flagged as hot.
    #[must_use]
    pub fn num_hot_spots(&self) -> usize {
        self.num_hot_spots
    }

    /// Number of pixels marked bad.
    #[must_use]
    pub fn num_hot_pixels(&self) -> usize {
        self.panels
            .iter()
            .map(|panel| panel.iter().filter(|&&good| !good).count())
            .sum()
    }

    /// Combines with an external mask; a pixel is good only if good in both.
    ///
    /// # Errors
    /// Returns a configuration error if the panel count or shapes differ.
    pub fn and(mut self, external: &[Array2<bool>]) -> Result<Self> {
        if external.len() != self.panels.len() {
            return Err(Error::Config(format!(
                "external mask has {} panels but the hot mask has {}",
                external.len(),
                self.panels.len()
            )));
        }
        for (index, (panel, other)) in self.panels.iter_mut().zip(external).enumerate() {
            if panel.dim() != other.dim() {
                return Err(Error::Config(format!(
                    "external mask for panel {index} has shape {:?}, expected {:?}",
                    other.dim(),
                    panel.dim()
                )));
            }
            Zip::from(panel)
                .and(other)
                .for_each(|good, &external| *good = *good && external);
        }
        Ok(self)
    }
}

/// Flags spots that span the whole scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HotPixelDetector {
    scan_length: usize,
}

impl HotPixelDetector {
    /// Creates a detector for a scan of `scan_length` images.
    #[must_use]
    pub fn new(scan_length: usize) -> Self {
        Self { scan_length }
    }

    /// Returns true if the shoebox covers exactly as many frames as the scan.
    #[must_use]
    pub fn is_hot(&self, shoebox: &Shoebox) -> bool {
        shoebox.bbox.z_extent() == self.scan_length
    }

    /// Derives the hot mask from accepted shoeboxes.
    ///
    /// # Errors
    /// Returns [`Error::Inconsistent`] if a shoebox refers to a missing panel
    /// or extends past its panel.
    pub fn detect(&self, detector: &Detector, shoeboxes: &[Shoebox]) -> Result<HotMask> {
        let mut mask = HotMask::all_good(detector);
        for shoebox in shoeboxes.iter().filter(|shoebox| self.is_hot(shoebox)) {
            let panel = mask.panels.get_mut(shoebox.panel).ok_or_else(|| {
                Error::Inconsistent(format!(
                    "shoebox on panel {} but the detector has {} panels",
                    shoebox.panel,
                    detector.len()
                ))
            })?;
            for (x, y) in shoebox.footprint() {
                let good = panel.get_mut([y, x]).ok_or_else(|| {
                    Error::Inconsistent(format!(
                        "shoebox pixel ({x}, {y}) lies outside panel {}",
                        shoebox.panel
                    ))
                })?;
                *good = false;
            }
            mask.num_hot_spots += 1;
        }
        Ok(mask)
    }
}
