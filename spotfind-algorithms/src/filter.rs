//! Post-extraction spot filters.

use spotfind_core::{Detector, Spot};

/// Decides which observed spots to keep.
pub trait SpotFilter: Send + Sync {
    /// Returns one flag per spot, true to keep it.
    fn filter(&self, detector: &Detector, spots: &[Spot]) -> Vec<bool>;

    /// Returns the name of the filter.
    fn name(&self) -> &'static str;
}

/// Keeps every spot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptAll;

impl SpotFilter for AcceptAll {
    fn filter(&self, _detector: &Detector, spots: &[Spot]) -> Vec<bool> {
        vec![true; spots.len()]
    }

    fn name(&self) -> &'static str {
        "AcceptAll"
    }
}

/// Rejects spots whose centroid lies within `border` pixels of a panel edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BorderFilter {
    /// Width of the rejected border in pixels.
    pub border: f64,
}

impl BorderFilter {
    /// Creates a border filter.
    #[must_use]
    pub fn new(border: f64) -> Self {
        Self { border }
    }
}

impl SpotFilter for BorderFilter {
    #[allow(clippy::cast_precision_loss)]
    fn filter(&self, detector: &Detector, spots: &[Spot]) -> Vec<bool> {
        spots
            .iter()
            .map(|spot| {
                detector.panel(spot.panel).is_some_and(|size| {
                    let [x, y, _] = spot.centroid;
                    x >= self.border
                        && y >= self.border
                        && x <= size.width as f64 - self.border
                        && y <= size.height as f64 - self.border
                })
            })
            .collect()
    }

    fn name(&self) -> &'static str {
        "Border"
    }
}
