//! Detector images, validity masks and the image source contract.
//!
//! Panel planes are stored row-major as `Array2` with shape `(height, width)`
//! and indexed `[[y, x]]`.

use crate::{Error, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// Size of a single detector panel in pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PanelSize {
    /// Number of columns (fast axis).
    pub width: usize,
    /// Number of rows (slow axis).
    pub height: usize,
}

impl PanelSize {
    /// Creates a new panel size.
    #[inline]
    #[must_use]
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// Number of pixels on the panel.
    #[inline]
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.width * self.height
    }

    /// Array shape `(height, width)` for this panel.
    #[inline]
    #[must_use]
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// The panel layout of a detector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detector {
    panels: Vec<PanelSize>,
}

impl Detector {
    /// Creates a detector from its panel sizes.
    #[must_use]
    pub fn new(panels: Vec<PanelSize>) -> Self {
        Self { panels }
    }

    /// Creates a single-panel detector.
    #[must_use]
    pub fn single_panel(width: usize, height: usize) -> Self {
        Self::new(vec![PanelSize::new(width, height)])
    }

    /// Returns the number of panels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    /// Returns true if the detector has no panels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    /// Returns the size of a panel.
    #[must_use]
    pub fn panel(&self, index: usize) -> Option<&PanelSize> {
        self.panels.get(index)
    }

    /// Returns all panel sizes.
    #[must_use]
    pub fn panels(&self) -> &[PanelSize] {
        &self.panels
    }

    /// Total number of pixels over all panels.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.panels.iter().map(PanelSize::num_pixels).sum()
    }

    /// Checks that a set of per-panel masks matches this detector.
    ///
    /// # Errors
    /// Returns a configuration error on a panel count or shape mismatch.
    pub fn check_masks(&self, masks: &[Array2<bool>]) -> Result<()> {
        if masks.len() != self.len() {
            return Err(Error::Config(format!(
                "mask has {} panels but the detector has {}",
                masks.len(),
                self.len()
            )));
        }
        for (index, (mask, panel)) in masks.iter().zip(&self.panels).enumerate() {
            if mask.dim() != panel.shape() {
                return Err(Error::Config(format!(
                    "mask for panel {index} has shape {:?}, expected {:?}",
                    mask.dim(),
                    panel.shape()
                )));
            }
        }
        Ok(())
    }
}

/// Signal values and validity mask for one panel of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePanel {
    /// Corrected pixel values.
    pub data: Array2<f64>,
    /// Validity mask (true = pixel may be used).
    pub mask: Array2<bool>,
}

impl ImagePanel {
    /// Creates a panel from data and mask of equal shape.
    ///
    /// # Errors
    /// Returns an error if the shapes differ.
    pub fn new(data: Array2<f64>, mask: Array2<bool>) -> Result<Self> {
        if data.dim() != mask.dim() {
            return Err(Error::Inconsistent(format!(
                "image shape {:?} does not match mask shape {:?}",
                data.dim(),
                mask.dim()
            )));
        }
        Ok(Self { data, mask })
    }

    /// Creates a panel where every pixel is valid.
    #[must_use]
    pub fn from_data(data: Array2<f64>) -> Self {
        let mask = Array2::from_elem(data.dim(), true);
        Self { data, mask }
    }

    /// Returns the panel size.
    #[must_use]
    pub fn size(&self) -> PanelSize {
        let (height, width) = self.data.dim();
        PanelSize::new(width, height)
    }

    /// Number of pixels on the panel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the panel has no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// One image of a scan: an ordered list of panel planes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Image {
    /// Panel planes in detector order.
    pub panels: Vec<ImagePanel>,
}

impl Image {
    /// Creates an image from its panels.
    #[must_use]
    pub fn new(panels: Vec<ImagePanel>) -> Self {
        Self { panels }
    }

    /// Number of panels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.panels.len()
    }

    /// Returns true if the image has no panels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    /// Total number of pixels over all panels.
    #[must_use]
    pub fn num_pixels(&self) -> usize {
        self.panels.iter().map(ImagePanel::len).sum()
    }
}

/// Per-worker handle used to read images.
///
/// Readers are created on the thread that uses them and are never shared.
pub trait FrameReader {
    /// Reads the image at `index` (0-based within the source).
    ///
    /// # Errors
    /// Returns an error if the image cannot be read.
    fn read(&mut self, index: usize) -> Result<Image>;
}

/// A sequence of images with a fixed detector layout.
pub trait ImageSource: Sync {
    /// Reader type handed to each worker.
    type Reader: FrameReader;

    /// Detector panel layout shared by all images.
    fn detector(&self) -> &Detector;

    /// Number of images.
    fn len(&self) -> usize;

    /// Returns true if the source holds no images.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Frame number of the image at index 0.
    fn array_start(&self) -> usize {
        0
    }

    /// True for rotation sweeps, where spots extend across consecutive images.
    fn is_sweep(&self) -> bool {
        true
    }

    /// Optional static mask applied to every image (true = good).
    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        None
    }

    /// Acquires the resources needed to read images on the calling thread.
    ///
    /// # Errors
    /// Returns an error if the underlying data cannot be opened.
    fn open_reader(&self) -> Result<Self::Reader>;
}

/// A contiguous sub-range of another image source.
pub struct ImageRange<'a, S: ImageSource> {
    source: &'a S,
    range: Range<usize>,
}

impl<'a, S: ImageSource> ImageRange<'a, S> {
    /// Creates a view over `range` (0-based indices into `source`).
    ///
    /// # Errors
    /// Returns a configuration error if the range is empty or out of bounds.
    pub fn new(source: &'a S, range: Range<usize>) -> Result<Self> {
        if range.start >= range.end || range.end > source.len() {
            return Err(Error::Config(format!(
                "image range {}..{} is invalid for a source of {} images",
                range.start,
                range.end,
                source.len()
            )));
        }
        Ok(Self { source, range })
    }
}

/// Reader for an [`ImageRange`].
pub struct RangeReader<R> {
    inner: R,
    offset: usize,
}

impl<R: FrameReader> FrameReader for RangeReader<R> {
    fn read(&mut self, index: usize) -> Result<Image> {
        self.inner.read(self.offset + index)
    }
}

impl<S: ImageSource> ImageSource for ImageRange<'_, S> {
    type Reader = RangeReader<S::Reader>;

    fn detector(&self) -> &Detector {
        self.source.detector()
    }

    fn len(&self) -> usize {
        self.range.len()
    }

    fn array_start(&self) -> usize {
        self.source.array_start() + self.range.start
    }

    fn is_sweep(&self) -> bool {
        self.source.is_sweep()
    }

    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        self.source.static_mask()
    }

    fn open_reader(&self) -> Result<Self::Reader> {
        Ok(RangeReader {
            inner: self.source.open_reader()?,
            offset: self.range.start,
        })
    }
}

/// Image source backed by images held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryImageSet {
    detector: Detector,
    images: Arc<Vec<Image>>,
    array_start: usize,
    sweep: bool,
    static_mask: Option<Vec<Array2<bool>>>,
}

impl InMemoryImageSet {
    /// Creates a sweep from images that all match `detector`.
    ///
    /// # Errors
    /// Returns an error if any image does not match the detector layout.
    pub fn new(detector: Detector, images: Vec<Image>) -> Result<Self> {
        for (index, image) in images.iter().enumerate() {
            if image.len() != detector.len() {
                return Err(Error::Inconsistent(format!(
                    "image {index} has {} panels but the detector has {}",
                    image.len(),
                    detector.len()
                )));
            }
            for (panel_index, (panel, size)) in
                image.panels.iter().zip(detector.panels()).enumerate()
            {
                if panel.size() != *size {
                    return Err(Error::Inconsistent(format!(
                        "image {index} panel {panel_index} is {}x{}, expected {}x{}",
                        panel.size().width,
                        panel.size().height,
                        size.width,
                        size.height
                    )));
                }
            }
        }
        Ok(Self {
            detector,
            images: Arc::new(images),
            array_start: 0,
            sweep: true,
            static_mask: None,
        })
    }

    /// Sets the frame number of the first image.
    #[must_use]
    pub fn with_array_start(mut self, array_start: usize) -> Self {
        self.array_start = array_start;
        self
    }

    /// Marks the set as a sweep (linked frames) or a set of stills.
    #[must_use]
    pub fn with_sweep(mut self, sweep: bool) -> Self {
        self.sweep = sweep;
        self
    }

    /// Attaches a static mask applied to every image.
    ///
    /// # Errors
    /// Returns an error if the mask does not match the detector.
    pub fn with_static_mask(mut self, mask: Vec<Array2<bool>>) -> Result<Self> {
        self.detector.check_masks(&mask)?;
        self.static_mask = Some(mask);
        Ok(self)
    }
}

/// Reader for an [`InMemoryImageSet`].
pub struct InMemoryReader {
    images: Arc<Vec<Image>>,
}

impl FrameReader for InMemoryReader {
    fn read(&mut self, index: usize) -> Result<Image> {
        self.images.get(index).cloned().ok_or_else(|| {
            Error::ImageSource(format!(
                "image index {index} out of range (0..{})",
                self.images.len()
            ))
        })
    }
}

impl ImageSource for InMemoryImageSet {
    type Reader = InMemoryReader;

    fn detector(&self) -> &Detector {
        &self.detector
    }

    fn len(&self) -> usize {
        self.images.len()
    }

    fn array_start(&self) -> usize {
        self.array_start
    }

    fn is_sweep(&self) -> bool {
        self.sweep
    }

    fn static_mask(&self) -> Option<&[Array2<bool>]> {
        self.static_mask.as_deref()
    }

    fn open_reader(&self) -> Result<Self::Reader> {
        Ok(InMemoryReader {
            images: Arc::clone(&self.images),
        })
    }
}
