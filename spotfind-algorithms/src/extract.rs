//! Per-frame strong pixel extraction.
//!
//! [`FrameExtractor`] reads one image, combines its validity mask with the
//! static mask of the source, thresholds every panel (optionally inside a
//! region of interest only) and collects the strong pixels into one
//! [`PixelList`] per panel.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

use crate::scheduler::{Task, TaskLog};
use ndarray::{s, Array2, Zip};
use spotfind_core::{
    Error, FramePixels, FrameReader, ImagePanel, ImageSource, PixelList, RegionOfInterest,
    Result, SpotFinderConfig, ThresholdFunction,
};

/// Extracts strong pixels from the images of a source.
pub struct FrameExtractor<'a, S: ImageSource> {
    source: &'a S,
    threshold: &'a dyn ThresholdFunction,
    region_of_interest: Option<RegionOfInterest>,
    max_strong_pixel_fraction: f64,
}

impl<'a, S: ImageSource> FrameExtractor<'a, S> {
    /// Creates an extractor, validating the configuration against the source.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is invalid, the
    /// region of interest does not fit a panel, or the static mask does not
    /// match the detector.
    pub fn new(
        source: &'a S,
        threshold: &'a dyn ThresholdFunction,
        config: &SpotFinderConfig,
    ) -> Result<Self> {
        config.validate()?;
        let detector = source.detector();
        if let Some(roi) = &config.region_of_interest {
            for panel in detector.panels() {
                roi.validate(panel.width, panel.height)?;
            }
        }
        if let Some(mask) = source.static_mask() {
            detector.check_masks(mask)?;
        }
        Ok(Self {
            source,
            threshold,
            region_of_interest: config.region_of_interest,
            max_strong_pixel_fraction: config.max_strong_pixel_fraction,
        })
    }

    /// Number of images available.
    #[must_use]
    pub fn len(&self) -> usize {
        self.source.len()
    }

    /// Returns true if the source has no images.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Maximum number of strong pixels allowed on an image of `num_pixels`
    /// pixels, or `None` when the fraction does not restrict anything.
    #[must_use]
    pub fn max_strong(&self, num_pixels: usize) -> Option<usize> {
        (self.max_strong_pixel_fraction < 1.0)
            .then(|| (self.max_strong_pixel_fraction * num_pixels as f64).ceil() as usize)
    }

    /// Extracts the strong pixels of the image at `index`.
    ///
    /// # Errors
    /// Returns [`Error::TooManyStrongPixels`] if the guard trips,
    /// [`Error::Inconsistent`] if the image does not match the detector, or
    /// any error raised by the reader.
    pub fn extract(
        &self,
        reader: &mut S::Reader,
        index: usize,
        log: &mut TaskLog,
    ) -> Result<FramePixels> {
        let frame = self.source.array_start() + index;
        let image = reader.read(index)?;
        let detector = self.source.detector();
        if image.len() != detector.len() {
            return Err(Error::Inconsistent(format!(
                "image {index} has {} panels but the detector has {}",
                image.len(),
                detector.len()
            )));
        }
        let static_mask = self.source.static_mask();

        let mut panels = Vec::with_capacity(image.len());
        for (panel_index, (panel, size)) in image.panels.iter().zip(detector.panels()).enumerate()
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
            let mut valid = panel.mask.clone();
            if let Some(mask) = static_mask.and_then(|masks| masks.get(panel_index)) {
                if mask.dim() != valid.dim() {
                    return Err(Error::Inconsistent(format!(
                        "static mask for panel {panel_index} has shape {:?}, expected {:?}",
                        mask.dim(),
                        valid.dim()
                    )));
                }
                Zip::from(&mut valid)
                    .and(mask)
                    .for_each(|good, &external| *good = *good && external);
            }
            let strong = self.threshold_panel(panel, &valid)?;
            panels.push(PixelList::from_mask(frame, panel.data.view(), strong.view())?);
        }

        let pixels = FramePixels { frame, panels };
        let num_strong = pixels.num_strong();
        if let Some(max) = self.max_strong(image.num_pixels()) {
            if num_strong > max {
                return Err(Error::TooManyStrongPixels {
                    frame,
                    found: num_strong,
                    max,
                });
            }
        }
        log.info(format!(
            "Found {num_strong} strong pixels on image {}",
            index + 1
        ));
        Ok(pixels)
    }

    /// Strong = flagged by the threshold and valid.
    fn threshold_panel(&self, panel: &ImagePanel, valid: &Array2<bool>) -> Result<Array2<bool>> {
        let mut strong = match &self.region_of_interest {
            Some(roi) => {
                let (x0, x1, y0, y1) = (roi.x0, roi.x1, roi.y0, roi.y1);
                let inside = self.threshold.compute_threshold(
                    panel.data.slice(s![y0..y1, x0..x1]),
                    valid.slice(s![y0..y1, x0..x1]),
                );
                if inside.dim() != (y1 - y0, x1 - x0) {
                    return Err(Error::Inconsistent(format!(
                        "{} threshold returned shape {:?} for a {:?} region",
                        self.threshold.name(),
                        inside.dim(),
                        (y1 - y0, x1 - x0)
                    )));
                }
                let mut full = Array2::from_elem(valid.dim(), false);
                full.slice_mut(s![y0..y1, x0..x1]).assign(&inside);
                full
            }
            None => self
                .threshold
                .compute_threshold(panel.data.view(), valid.view()),
        };
        if strong.dim() != valid.dim() {
            return Err(Error::Inconsistent(format!(
                "{} threshold returned shape {:?} for a {:?} panel",
                self.threshold.name(),
                strong.dim(),
                valid.dim()
            )));
        }
        Zip::from(&mut strong)
            .and(valid)
            .for_each(|flag, &good| *flag = *flag && good);
        Ok(strong)
    }
}

impl<S: ImageSource> Task for FrameExtractor<'_, S> {
    type Worker = S::Reader;
    type Output = FramePixels;

    fn start_worker(&self) -> Result<S::Reader> {
        self.source.open_reader()
    }

    fn run(&self, worker: &mut S::Reader, index: usize, log: &mut TaskLog) -> Result<FramePixels> {
        self.extract(worker, index, log)
    }
}
