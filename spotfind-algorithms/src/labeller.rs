//! Incremental 3D connected component labelling for one panel.
//!
//! Pixel lists are added one frame at a time in strictly increasing frame
//! order. Pixels within a frame are connected through shared edges
//! (4-connectivity); between consecutive frames a pixel connects only to the
//! pixel at the same `(x, y)` on the previous frame.
//!
//! Only components that touched the previous frame can grow, so every open
//! component that the current frame does not extend is closed right away.
//! Open state is therefore bounded by the pixels of the last frame plus the
//! components they belong to.

use crate::union_find::UnionFind;
use spotfind_core::{BoundingBox, Error, PanelSize, PixelList, Result};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

/// Identifier of a component within one labeller.
type ComponentId = u64;

/// A connected set of strong pixels on one panel.
#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    /// Column of each pixel.
    pub x: Vec<u32>,
    /// Row of each pixel.
    pub y: Vec<u32>,
    /// Frame of each pixel.
    pub z: Vec<usize>,
    /// Value of each pixel.
    pub value: Vec<f64>,
    /// Tight inclusive bounding box.
    pub bbox: BoundingBox,
}

impl Component {
    fn start(x: u32, y: u32, z: usize, value: f64) -> Self {
        Self {
            x: vec![x],
            y: vec![y],
            z: vec![z],
            value: vec![value],
            bbox: BoundingBox::from_point(x as usize, y as usize, z),
        }
    }

    fn push(&mut self, x: u32, y: u32, z: usize, value: f64) {
        self.x.push(x);
        self.y.push(y);
        self.z.push(z);
        self.value.push(value);
        self.bbox.include(x as usize, y as usize, z);
    }

    fn absorb(&mut self, other: Component) {
        self.bbox.include(other.bbox.x0, other.bbox.y0, other.bbox.z0);
        self.bbox.include(other.bbox.x1, other.bbox.y1, other.bbox.z1);
        self.x.extend(other.x);
        self.y.extend(other.y);
        self.z.extend(other.z);
        self.value.extend(other.value);
    }

    /// Number of pixels in the component.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.x.len()
    }

    /// Iterates over `(x, y, z, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, usize, f64)> + '_ {
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.z)
            .zip(&self.value)
            .map(|(((&x, &y), &z), &value)| (x, y, z, value))
    }
}

/// Connected component labeller for a single panel.
#[derive(Debug, Clone)]
pub struct PixelListLabeller {
    size: PanelSize,
    link_frames: bool,
    open: BTreeMap<ComponentId, Component>,
    /// Pixels of the last added frame and the open component owning each.
    previous: HashMap<(u32, u32), ComponentId>,
    closed: Vec<Component>,
    last_frame: Option<usize>,
    next_id: ComponentId,
    num_pixels: usize,
}

impl PixelListLabeller {
    /// Creates a labeller that links components across consecutive frames.
    #[must_use]
    pub fn new(size: PanelSize) -> Self {
        Self {
            size,
            link_frames: true,
            open: BTreeMap::new(),
            previous: HashMap::new(),
            closed: Vec::new(),
            last_frame: None,
            next_id: 0,
            num_pixels: 0,
        }
    }

    /// Creates a labeller that treats every frame independently (stills).
    #[must_use]
    pub fn two_dimensional(size: PanelSize) -> Self {
        Self {
            link_frames: false,
            ..Self::new(size)
        }
    }

    /// Total number of pixels added so far.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.num_pixels
    }

    /// Number of components that may still grow.
    #[must_use]
    pub fn num_open(&self) -> usize {
        self.open.len()
    }

    /// Number of closed components not yet drained.
    #[must_use]
    pub fn num_closed(&self) -> usize {
        self.closed.len()
    }

    /// Adds the strong pixels of the next frame.
    ///
    /// # Errors
    /// Returns [`Error::Inconsistent`] if the frame is not after the previous
    /// one, the list was recorded on a panel of another size or on another
    /// frame, a pixel lies outside the panel, or a pixel appears twice.
    pub fn add(&mut self, frame: usize, pixels: &PixelList) -> Result<()> {
        if let Some(last) = self.last_frame {
            if frame <= last {
                return Err(Error::Inconsistent(format!(
                    "frame {frame} added after frame {last}; frames must be strictly increasing"
                )));
            }
        }
        if pixels.frame != frame {
            return Err(Error::Inconsistent(format!(
                "pixel list for frame {} added as frame {frame}",
                pixels.frame
            )));
        }
        if pixels.size != self.size {
            return Err(Error::Inconsistent(format!(
                "pixel list for a {}x{} panel added to a {}x{} labeller",
                pixels.size.width, pixels.size.height, self.size.width, self.size.height
            )));
        }
        pixels.check_bounds()?;

        // Index the frame's pixels by position
        let n = pixels.len();
        let mut position = HashMap::with_capacity(n);
        for (index, (x, y, _)) in pixels.iter().enumerate() {
            match position.entry((x, y)) {
                Entry::Occupied(_) => {
                    return Err(Error::Inconsistent(format!(
                        "pixel ({x}, {y}) appears twice on frame {frame}"
                    )));
                }
                Entry::Vacant(slot) => {
                    slot.insert(index);
                }
            }
        }

        let contiguous = self.link_frames && self.last_frame.is_some_and(|last| last + 1 == frame);
        if !contiguous {
            self.close_all();
        }
        self.last_frame = Some(frame);
        self.num_pixels += pixels.len();

        // Nodes 0..n are this frame's pixels, n.. are the open components
        let open_ids: Vec<ComponentId> = self.open.keys().copied().collect();
        let node_of: HashMap<ComponentId, usize> = open_ids
            .iter()
            .enumerate()
            .map(|(offset, &id)| (id, n + offset))
            .collect();
        let mut uf = UnionFind::new(n + open_ids.len());

        for (index, (x, y, _)) in pixels.iter().enumerate() {
            if x > 0 {
                if let Some(&left) = position.get(&(x - 1, y)) {
                    uf.union(index, left);
                }
            }
            if y > 0 {
                if let Some(&up) = position.get(&(x, y - 1)) {
                    uf.union(index, up);
                }
            }
            if let Some(node) = self.previous.get(&(x, y)).and_then(|id| node_of.get(id)) {
                uf.union(index, *node);
            }
        }

        // Group pixels and open components by root, keeping first-seen order
        let mut groups: Vec<(Vec<usize>, Vec<ComponentId>)> = Vec::new();
        let mut group_of_root: HashMap<usize, usize> = HashMap::new();
        for index in 0..n {
            let root = uf.find(index);
            let group = *group_of_root.entry(root).or_insert_with(|| {
                groups.push((Vec::new(), Vec::new()));
                groups.len() - 1
            });
            groups[group].0.push(index);
        }
        for (offset, &id) in open_ids.iter().enumerate() {
            let root = uf.find(n + offset);
            if let Some(&group) = group_of_root.get(&root) {
                groups[group].1.push(id);
            }
        }

        let mut previous = HashMap::with_capacity(n);
        let mut extended = BTreeMap::new();
        for (members, merged) in groups {
            let mut merged = merged.into_iter();
            // The oldest matching component keeps its id; a new one starts from the first pixel
            let (id, mut component, pending) = match merged.next() {
                Some(id) => {
                    let component = self.open.remove(&id).ok_or_else(|| {
                        Error::Inconsistent(format!(
                            "open component {id} vanished while labelling frame {frame}"
                        ))
                    })?;
                    (id, component, &members[..])
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    let first = members[0];
                    let component = Component::start(
                        pixels.x[first],
                        pixels.y[first],
                        frame,
                        pixels.value[first],
                    );
                    previous.insert((pixels.x[first], pixels.y[first]), id);
                    (id, component, &members[1..])
                }
            };
            for other in merged {
                if let Some(other) = self.open.remove(&other) {
                    component.absorb(other);
                }
            }
            for &index in pending {
                let (x, y) = (pixels.x[index], pixels.y[index]);
                component.push(x, y, frame, pixels.value[index]);
                previous.insert((x, y), id);
            }
            extended.insert(id, component);
        }

        // Open components not touched by this frame can no longer grow
        let stale = std::mem::replace(&mut self.open, extended);
        self.closed.extend(stale.into_values());
        self.previous = previous;
        if !self.link_frames {
            self.close_all();
        }
        Ok(())
    }

    /// Closes every open component. Call once after the last frame.
    pub fn flush(&mut self) {
        self.close_all();
    }

    /// Takes the components closed so far.
    pub fn drain_closed(&mut self) -> Vec<Component> {
        std::mem::take(&mut self.closed)
    }

    fn close_all(&mut self) {
        let open = std::mem::take(&mut self.open);
        self.closed.extend(open.into_values());
        self.previous.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn list(frame: usize, pixels: &[(u32, u32)]) -> PixelList {
        let mut list = PixelList::new(frame, PanelSize::new(5, 5));
        for &(x, y) in pixels {
            list.push(x, y, 1.0);
        }
        list
    }

    fn label(frames: &[&[(u32, u32)]]) -> Vec<Component> {
        let mut labeller = PixelListLabeller::new(PanelSize::new(5, 5));
        let mut components = Vec::new();
        for (frame, pixels) in frames.iter().enumerate() {
            labeller.add(frame, &list(frame, pixels)).unwrap();
            components.extend(labeller.drain_closed());
        }
        labeller.flush();
        components.extend(labeller.drain_closed());
        components
    }

    #[test]
    fn test_two_frame_component() {
        let components = label(&[&[(2, 2), (2, 3)], &[(2, 2)]]);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].num_pixels(), 3);
        assert_eq!(components[0].bbox, BoundingBox::new(2, 2, 2, 3, 0, 1));
    }

    #[test]
    fn test_diagonal_pixels_are_separate() {
        let components = label(&[&[(0, 0), (1, 1)]]);
        assert_eq!(components.len(), 2);
    }

    #[test]
    fn test_diagonal_across_frames_is_separate() {
        let components = label(&[&[(1, 1)], &[(2, 1)]]);
        assert_eq!(components.len(), 2);
    }

    #[test]
    fn test_group_merges_two_open_components() {
        // Two blobs on frame 0 joined by a bar on frame 1
        let components = label(&[&[(0, 0), (4, 0)], &[(0, 0), (1, 0), (2, 0), (3, 0), (4, 0)]]);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].num_pixels(), 7);
        assert_eq!(components[0].bbox, BoundingBox::new(0, 4, 0, 0, 0, 1));
    }

    #[test]
    fn test_component_splits_are_kept_together() {
        // One blob on frame 0 continued by two separate pixels on frame 1
        let components = label(&[&[(1, 1), (2, 1), (3, 1)], &[(1, 1), (3, 1)]]);
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].num_pixels(), 5);
    }

    #[test]
    fn test_gap_frame_closes_component() {
        let mut labeller = PixelListLabeller::new(PanelSize::new(5, 5));
        labeller.add(0, &list(0, &[(2, 2)])).unwrap();
        assert_eq!(labeller.num_open(), 1);
        labeller.add(1, &list(1, &[])).unwrap();
        assert_eq!(labeller.num_open(), 0);
        assert_eq!(labeller.num_closed(), 1);
        labeller.add(2, &list(2, &[(2, 2)])).unwrap();
        labeller.flush();
        assert_eq!(labeller.drain_closed().len(), 2);
        assert_eq!(labeller.num_pixels(), 2);
    }

    #[test]
    fn test_two_dimensional_mode_never_links() {
        let mut labeller = PixelListLabeller::two_dimensional(PanelSize::new(5, 5));
        labeller.add(0, &list(0, &[(2, 2)])).unwrap();
        labeller.add(1, &list(1, &[(2, 2)])).unwrap();
        assert_eq!(labeller.num_open(), 0);
        let components = labeller.drain_closed();
        assert_eq!(components.len(), 2);
        assert!(components.iter().all(|c| c.bbox.z_extent() == 1));
    }

    #[test]
    fn test_out_of_order_frame_rejected() {
        let mut labeller = PixelListLabeller::new(PanelSize::new(5, 5));
        labeller.add(3, &list(3, &[(0, 0)])).unwrap();
        assert!(matches!(
            labeller.add(3, &list(3, &[(1, 1)])),
            Err(Error::Inconsistent(_))
        ));
        assert!(labeller.add(2, &list(2, &[])).is_err());
    }

    #[test]
    fn test_duplicate_and_outside_pixels_rejected() {
        let mut labeller = PixelListLabeller::new(PanelSize::new(5, 5));
        assert!(labeller.add(0, &list(0, &[(1, 1), (1, 1)])).is_err());
        assert!(labeller.add(1, &list(1, &[(5, 0)])).is_err());
    }

    #[test]
    fn test_rejected_frame_leaves_state_unchanged() {
        let mut labeller = PixelListLabeller::new(PanelSize::new(5, 5));
        labeller.add(0, &list(0, &[(2, 2)])).unwrap();
        assert!(labeller.add(1, &list(1, &[(2, 2), (3, 3), (2, 2)])).is_err());
        assert_eq!(labeller.num_pixels(), 1);
        assert_eq!(labeller.num_open(), 1);
        assert_eq!(labeller.num_closed(), 0);

        // A corrected frame 1 still links to frame 0
        labeller.add(1, &list(1, &[(2, 2)])).unwrap();
        labeller.flush();
        let components = labeller.drain_closed();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].num_pixels(), 2);
        assert_eq!(labeller.num_pixels(), 2);
    }

    #[test]
    fn test_pixels_partitioned_without_loss() {
        // Pseudo-random frames from a fixed linear congruential sequence
        let mut state = 12_345_u64;
        let mut frames: Vec<Vec<(u32, u32)>> = Vec::new();
        for _ in 0..12 {
            let mut set = BTreeSet::new();
            for _ in 0..9 {
                state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
                let x = ((state >> 33) % 5) as u32;
                let y = ((state >> 45) % 5) as u32;
                set.insert((x, y));
            }
            frames.push(set.into_iter().collect());
        }
        let refs: Vec<&[(u32, u32)]> = frames.iter().map(Vec::as_slice).collect();
        let components = label(&refs);

        let expected: BTreeSet<(u32, u32, usize)> = frames
            .iter()
            .enumerate()
            .flat_map(|(z, pixels)| pixels.iter().map(move |&(x, y)| (x, y, z)))
            .collect();
        let mut seen = BTreeSet::new();
        for component in &components {
            for (x, y, z, _) in component.iter() {
                assert!(seen.insert((x, y, z)), "pixel ({x}, {y}, {z}) in two components");
                assert!(component.bbox.contains(x as usize, y as usize, z));
            }
        }
        assert_eq!(seen, expected);
    }
}
