//! Strong pixel lists stored in Structure of Arrays (`SoA`) layout.
//!
//! A [`PixelList`] holds the strong pixels of one panel of one frame. Lists
//! are produced by frame extraction, consumed once by the labeller and then
//! dropped.
#![allow(clippy::cast_possible_truncation)]

use crate::image::PanelSize;
use crate::{Error, Result};
use ndarray::ArrayView2;

/// Strong pixels of one panel on one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PixelList {
    /// Frame number the pixels were recorded on.
    pub frame: usize,
    /// Size of the panel the coordinates refer to.
    pub size: PanelSize,
    /// Columnar storage for X (column) coordinates.
    pub x: Vec<u32>,
    /// Columnar storage for Y (row) coordinates.
    pub y: Vec<u32>,
    /// Columnar storage for pixel values.
    pub value: Vec<f64>,
}

impl PixelList {
    /// Creates an empty list for a panel and frame.
    #[must_use]
    pub fn new(frame: usize, size: PanelSize) -> Self {
        Self {
            frame,
            size,
            ..Self::default()
        }
    }

    /// Creates an empty list with pre-allocated capacity.
    #[must_use]
    pub fn with_capacity(frame: usize, size: PanelSize, capacity: usize) -> Self {
        Self {
            frame,
            size,
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            value: Vec::with_capacity(capacity),
        }
    }

    /// Builds the list from an image and a mask of selected pixels.
    ///
    /// Pixels are collected in row-major order.
    ///
    /// # Errors
    /// Returns an error if the image and mask shapes differ.
    pub fn from_mask(
        frame: usize,
        image: ArrayView2<f64>,
        selected: ArrayView2<bool>,
    ) -> Result<Self> {
        if image.dim() != selected.dim() {
            return Err(Error::Inconsistent(format!(
                "image shape {:?} does not match threshold mask shape {:?}",
                image.dim(),
                selected.dim()
            )));
        }
        let (height, width) = image.dim();
        let count = selected.iter().filter(|&&flag| flag).count();
        let mut list = Self::with_capacity(frame, PanelSize::new(width, height), count);
        for ((y, x), &flag) in selected.indexed_iter() {
            if flag {
                list.push(x as u32, y as u32, image[[y, x]]);
            }
        }
        Ok(list)
    }

    /// Appends a pixel.
    pub fn push(&mut self, x: u32, y: u32, value: f64) {
        self.x.push(x);
        self.y.push(y);
        self.value.push(value);
    }

    /// Returns the number of pixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Returns true if the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Iterates over `(x, y, value)` tuples.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, f64)> + '_ {
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.value)
            .map(|((&x, &y), &value)| (x, y, value))
    }

    /// Checks that every coordinate lies on the panel.
    ///
    /// # Errors
    /// Returns an error naming the first pixel outside the panel.
    pub fn check_bounds(&self) -> Result<()> {
        if self.y.len() != self.x.len() || self.value.len() != self.x.len() {
            return Err(Error::Inconsistent(format!(
                "pixel list columns have different lengths ({}, {}, {})",
                self.x.len(),
                self.y.len(),
                self.value.len()
            )));
        }
        if let Some((x, y, _)) = self
            .iter()
            .find(|&(x, y, _)| x as usize >= self.size.width || y as usize >= self.size.height)
        {
            return Err(Error::Inconsistent(format!(
                "pixel ({x}, {y}) on frame {} lies outside the {}x{} panel",
                self.frame, self.size.width, self.size.height
            )));
        }
        Ok(())
    }
}

/// The per-panel strong pixel lists of one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FramePixels {
    /// Frame number.
    pub frame: usize,
    /// One list per detector panel.
    pub panels: Vec<PixelList>,
}

impl FramePixels {
    /// Total number of strong pixels over all panels.
    #[must_use]
    pub fn num_strong(&self) -> usize {
        self.panels.iter().map(PixelList::len).sum()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]
    use super::*;
    use ndarray::array;

    #[test]
    fn test_pixel_list_operations() {
        let mut list = PixelList::with_capacity(3, PanelSize::new(10, 10), 4);
        assert!(list.is_empty());

        list.push(1, 2, 10.0);
        list.push(3, 4, 20.0);
        assert_eq!(list.len(), 2);
        assert_eq!(list.iter().nth(1), Some((3, 4, 20.0)));
        assert!(list.check_bounds().is_ok());
    }

    #[test]
    fn test_from_mask_row_major() {
        let image = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let selected = array![[false, true, false], [true, false, true]];

        let list = PixelList::from_mask(7, image.view(), selected.view()).unwrap();
        assert_eq!(list.frame, 7);
        assert_eq!(list.size, PanelSize::new(3, 2));
        assert_eq!(list.x, vec![1, 0, 2]);
        assert_eq!(list.y, vec![0, 1, 1]);
        assert_eq!(list.value, vec![2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_from_mask_shape_mismatch() {
        let image = array![[1.0, 2.0]];
        let selected = array![[true], [false]];
        assert!(PixelList::from_mask(0, image.view(), selected.view()).is_err());
    }

    #[test]
    fn test_check_bounds_rejects_outside_pixel() {
        let mut list = PixelList::new(0, PanelSize::new(4, 4));
        list.push(4, 0, 1.0);
        assert!(matches!(list.check_bounds(), Err(Error::Inconsistent(_))));
    }

    #[test]
    fn test_frame_pixels_counts_all_panels() {
        let mut a = PixelList::new(0, PanelSize::new(4, 4));
        a.push(0, 0, 1.0);
        let mut b = PixelList::new(0, PanelSize::new(4, 4));
        b.push(1, 1, 1.0);
        b.push(2, 2, 1.0);
        let frame = FramePixels {
            frame: 0,
            panels: vec![a, b],
        };
        assert_eq!(frame.num_strong(), 3);
    }
}
