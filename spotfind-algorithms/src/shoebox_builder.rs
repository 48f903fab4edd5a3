//! Conversion of closed components into shoeboxes.

use crate::labeller::Component;
use spotfind_core::{Error, Result, Shoebox};

/// Builds shoeboxes from closed components, filtering them by pixel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShoeboxBuilder {
    min_spot_size: usize,
    max_spot_size: usize,
}

/// Shoeboxes accepted by a [`ShoeboxBuilder`] and the rejection counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShoeboxBatch {
    /// Accepted shoeboxes in the order their components closed.
    pub shoeboxes: Vec<Shoebox>,
    /// Components with fewer than `min_spot_size` pixels.
    pub rejected_small: usize,
    /// Components with more than `max_spot_size` pixels.
    pub rejected_large: usize,
}

impl ShoeboxBatch {
    /// Number of components seen, accepted or not.
    #[must_use]
    pub fn total(&self) -> usize {
        self.shoeboxes.len() + self.rejected_small + self.rejected_large
    }

    /// Moves the contents of `other` into this batch.
    pub fn append(&mut self, other: &mut ShoeboxBatch) {
        self.shoeboxes.append(&mut other.shoeboxes);
        self.rejected_small += std::mem::take(&mut other.rejected_small);
        self.rejected_large += std::mem::take(&mut other.rejected_large);
    }
}

impl ShoeboxBuilder {
    /// Creates a builder accepting components of `min..=max` pixels.
    ///
    /// # Errors
    /// Returns a configuration error if either bound is zero or `min > max`.
    pub fn new(min_spot_size: usize, max_spot_size: usize) -> Result<Self> {
        if min_spot_size == 0 || max_spot_size == 0 {
            return Err(Error::Config("spot size bounds must be positive".to_string()));
        }
        if min_spot_size > max_spot_size {
            return Err(Error::Config(format!(
                "min_spot_size ({min_spot_size}) is greater than max_spot_size ({max_spot_size})"
            )));
        }
        Ok(Self {
            min_spot_size,
            max_spot_size,
        })
    }

    /// Smallest accepted size.
    #[must_use]
    pub fn min_spot_size(&self) -> usize {
        self.min_spot_size
    }

    /// Largest accepted size.
    #[must_use]
    pub fn max_spot_size(&self) -> usize {
        self.max_spot_size
    }

    /// Builds shoeboxes for the components of one panel.
    ///
    /// Rejected components are counted and dropped without allocating arrays.
    pub fn build<I>(&self, panel: usize, components: I) -> ShoeboxBatch
    where
        I: IntoIterator<Item = Component>,
    {
        let mut batch = ShoeboxBatch::default();
        for component in components {
            let size = component.num_pixels();
            if size < self.min_spot_size {
                batch.rejected_small += 1;
            } else if size > self.max_spot_size {
                batch.rejected_large += 1;
            } else {
                batch.shoeboxes.push(Self::materialize(panel, &component));
            }
        }
        batch
    }

    fn materialize(panel: usize, component: &Component) -> Shoebox {
        let mut shoebox = Shoebox::allocate(panel, component.bbox);
        for (x, y, z, value) in component.iter() {
            shoebox.set(x as usize, y as usize, z, value);
        }
        shoebox
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labeller::PixelListLabeller;
    use approx::assert_relative_eq;
    use spotfind_core::{BoundingBox, PanelSize, PixelList};

    fn components(frames: &[Vec<(u32, u32, f64)>]) -> Vec<Component> {
        let size = PanelSize::new(20, 20);
        let mut labeller = PixelListLabeller::new(size);
        for (frame, pixels) in frames.iter().enumerate() {
            let mut list = PixelList::new(frame, size);
            for &(x, y, value) in pixels {
                list.push(x, y, value);
            }
            labeller.add(frame, &list).unwrap();
        }
        labeller.flush();
        labeller.drain_closed()
    }

    #[test]
    fn test_size_filter_is_inclusive() {
        // 1 pixel, 11 pixels and 2 pixels
        let mut frame = vec![(0, 0, 1.0)];
        frame.extend((0..11).map(|x| (x, 5, 1.0)));
        frame.extend([(0, 10, 1.0), (1, 10, 1.0)]);
        let builder = ShoeboxBuilder::new(2, 10).unwrap();

        let batch = builder.build(0, components(&[frame]));
        assert_eq!(batch.rejected_small, 1);
        assert_eq!(batch.rejected_large, 1);
        assert_eq!(batch.shoeboxes.len(), 1);
        assert_eq!(batch.shoeboxes[0].num_pixels(), 2);
        assert_eq!(batch.total(), 3);
    }

    #[test]
    fn test_boundary_sizes_accepted() {
        let two = vec![(0, 0, 1.0), (1, 0, 1.0)];
        let builder = ShoeboxBuilder::new(2, 2).unwrap();
        let batch = builder.build(0, components(&[two]));
        assert_eq!(batch.shoeboxes.len(), 1);
    }

    #[test]
    fn test_shoebox_contents() {
        let frames = vec![vec![(2, 2, 5.0), (2, 3, 6.0)], vec![(2, 2, 7.0)]];
        let builder = ShoeboxBuilder::new(1, 20).unwrap();
        let batch = builder.build(3, components(&frames));
        let shoebox = &batch.shoeboxes[0];

        assert_eq!(shoebox.panel, 3);
        assert_eq!(shoebox.bbox, BoundingBox::new(2, 2, 2, 3, 0, 1));
        assert!(shoebox.is_consistent());
        assert_eq!(shoebox.num_pixels(), 3);
        // Frame 1 row 3 is not part of the spot
        assert!(!shoebox.mask[[1, 1, 0]]);
        assert_relative_eq!(shoebox.data[[1, 1, 0]], 0.0);
        assert_relative_eq!(shoebox.data[[1, 0, 0]], 7.0);
        assert_relative_eq!(shoebox.summed_intensity(), 18.0);
    }

    #[test]
    fn test_invalid_bounds() {
        assert!(ShoeboxBuilder::new(0, 5).is_err());
        assert!(ShoeboxBuilder::new(6, 5).is_err());
    }

    #[test]
    fn test_batches_append() {
        let mut a = ShoeboxBatch {
            rejected_small: 1,
            ..ShoeboxBatch::default()
        };
        let mut b = ShoeboxBatch {
            rejected_large: 2,
            ..ShoeboxBatch::default()
        };
        a.append(&mut b);
        assert_eq!(a.total(), 3);
        assert_eq!(b.total(), 0);
    }
}
