//! The spot finding pipeline.
//!
//! [`ExtractSpots`] runs frame extraction over one image source, feeds the
//! ordered results into one labeller per panel and turns closed components
//! into shoeboxes as soon as they close. [`SpotFinder`] drives extraction
//! over the configured scan ranges, computes spot observations, derives the
//! hot pixel mask and applies the spot filter.

use crate::extract::FrameExtractor;
use crate::filter::{AcceptAll, SpotFilter};
use crate::hot_pixel::{HotMask, HotPixelDetector};
use crate::labeller::PixelListLabeller;
use crate::scheduler::ParallelScheduler;
use crate::shoebox_builder::{ShoeboxBatch, ShoeboxBuilder};
use rayon::prelude::*;
use spotfind_core::{
    Error, FramePixels, ImageRange, ImageSource, Result, Shoebox, Spot, SpotFinderConfig,
    ThresholdFunction,
};

/// Shoeboxes and per-frame statistics of one extraction run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    /// Accepted shoeboxes and rejection counts.
    pub batch: ShoeboxBatch,
    /// `(frame, strong pixel count)` for every image, in frame order.
    pub strong_pixels: Vec<(usize, usize)>,
}

/// Extracts shoeboxes from every image of a source.
pub struct ExtractSpots<'a> {
    threshold: &'a dyn ThresholdFunction,
    config: &'a SpotFinderConfig,
    builder: ShoeboxBuilder,
}

impl<'a> ExtractSpots<'a> {
    /// Creates the extraction stage.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is invalid.
    pub fn new(threshold: &'a dyn ThresholdFunction, config: &'a SpotFinderConfig) -> Result<Self> {
        config.validate()?;
        let builder = ShoeboxBuilder::new(config.min_spot_size, config.max_spot_size)?;
        Ok(Self {
            threshold,
            config,
            builder,
        })
    }

    /// Runs extraction, labelling and shoebox creation over `source`.
    ///
    /// # Errors
    /// Returns the first configuration, guard, worker or consistency error.
    pub fn run<S: ImageSource>(&self, source: &S) -> Result<Extraction> {
        let extractor = FrameExtractor::new(source, self.threshold, self.config)?;
        let detector = source.detector();
        let mut labellers: Vec<PixelListLabeller> = detector
            .panels()
            .iter()
            .map(|&size| {
                if source.is_sweep() {
                    PixelListLabeller::new(size)
                } else {
                    PixelListLabeller::two_dimensional(size)
                }
            })
            .collect();
        let mut batches = vec![ShoeboxBatch::default(); labellers.len()];
        let mut strong_pixels = Vec::with_capacity(source.len());

        let builder = self.builder;
        log::info!("Extracting strong pixels from images");
        let scheduler = ParallelScheduler::new(self.config.scheduler);
        scheduler.run(&extractor, source.len(), |_, pixels: FramePixels| {
            if pixels.panels.len() != labellers.len() {
                return Err(Error::Inconsistent(format!(
                    "Inconsistent size: {} pixel lists for {} panels",
                    pixels.panels.len(),
                    labellers.len()
                )));
            }
            strong_pixels.push((pixels.frame, pixels.num_strong()));
            let frame = pixels.frame;
            labellers
                .par_iter_mut()
                .zip(batches.par_iter_mut())
                .zip(pixels.panels.into_par_iter())
                .enumerate()
                .try_for_each(|(panel, ((labeller, batch), list))| {
                    labeller.add(frame, &list)?;
                    let mut built = builder.build(panel, labeller.drain_closed());
                    batch.append(&mut built);
                    Ok::<(), Error>(())
                })
        })?;

        labellers
            .par_iter_mut()
            .zip(batches.par_iter_mut())
            .enumerate()
            .filter(|(_, (labeller, _))| labeller.num_pixels() > 0)
            .for_each(|(panel, (labeller, batch))| {
                labeller.flush();
                let mut built = builder.build(panel, labeller.drain_closed());
                batch.append(&mut built);
            });

        let mut batch = ShoeboxBatch::default();
        for panel_batch in &mut batches {
            batch.append(panel_batch);
        }
        log::info!("Extracted {} spots", batch.total());
        log::info!(
            "Removed {} spots with size < {} pixels",
            batch.rejected_small,
            builder.min_spot_size()
        );
        log::info!(
            "Removed {} spots with size > {} pixels",
            batch.rejected_large,
            builder.max_spot_size()
        );
        Ok(Extraction {
            batch,
            strong_pixels,
        })
    }
}

/// Counts gathered over a spot finding run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotFinderReport {
    /// `(frame, strong pixel count)` for every processed image.
    pub strong_pixels: Vec<(usize, usize)>,
    /// Components extracted, before size filtering.
    pub spots_extracted: usize,
    /// Components with too few pixels.
    pub rejected_small: usize,
    /// Components with too many pixels.
    pub rejected_large: usize,
    /// Accepted spots spanning the whole scan.
    pub possible_hot_spots: usize,
    /// Pixels marked bad by the hot pixel detector.
    pub hot_pixels: usize,
    /// Spots removed by the spot filter.
    pub filtered: usize,
}

/// Result of [`SpotFinder::find`].
#[derive(Debug, Clone)]
pub struct SpotFinderOutput {
    /// Shoeboxes of the spots that passed the filter.
    pub shoeboxes: Vec<Shoebox>,
    /// Observations, parallel to `shoeboxes`.
    pub spots: Vec<Spot>,
    /// Hot pixel mask combined with the source's static mask, if requested.
    pub hot_mask: Option<HotMask>,
    /// Run statistics.
    pub report: SpotFinderReport,
}

/// Spot finding over an image source.
pub struct SpotFinder {
    config: SpotFinderConfig,
    threshold: Box<dyn ThresholdFunction>,
    filter: Box<dyn SpotFilter>,
}

impl SpotFinder {
    /// Creates a spot finder that keeps every spot.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration is invalid.
    pub fn new<T>(config: SpotFinderConfig, threshold: T) -> Result<Self>
    where
        T: ThresholdFunction + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            threshold: Box::new(threshold),
            filter: Box::new(AcceptAll),
        })
    }

    /// Sets the filter applied to the observed spots.
    #[must_use]
    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: SpotFilter + 'static,
    {
        self.filter = Box::new(filter);
        self
    }

    /// Finds spots in `source`.
    ///
    /// # Errors
    /// Returns a configuration error if the configuration does not fit the
    /// source, or any error raised during extraction.
    pub fn find<S: ImageSource>(&self, source: &S) -> Result<SpotFinderOutput> {
        let detector = source.detector();
        self.config.validate_for(detector, source.len())?;
        let extract = ExtractSpots::new(self.threshold.as_ref(), &self.config)?;

        let scan_ranges = if self.config.scan_ranges.is_empty() && !source.is_empty() {
            vec![(1, source.len())]
        } else {
            self.config.scan_ranges.clone()
        };

        let mut batch = ShoeboxBatch::default();
        let mut report = SpotFinderReport::default();
        for (first, last) in scan_ranges {
            log::info!("Finding spots in image {first} to {last}...");
            let range = ImageRange::new(source, (first - 1)..last)?;
            let mut extraction = extract.run(&range)?;
            batch.append(&mut extraction.batch);
            report.strong_pixels.append(&mut extraction.strong_pixels);
        }
        report.spots_extracted = batch.total();
        report.rejected_small = batch.rejected_small;
        report.rejected_large = batch.rejected_large;
        let mut shoeboxes = batch.shoeboxes;

        let mut spots: Vec<Spot> = shoeboxes.par_iter().map(Spot::from_shoebox).collect();
        log::info!("Calculated {} spot centroids", spots.len());
        log::info!("Calculated {} spot intensities", spots.len());

        let hot_mask = if self.config.write_hot_mask {
            let mask = HotPixelDetector::new(source.len()).detect(detector, &shoeboxes)?;
            report.possible_hot_spots = mask.num_hot_spots();
            report.hot_pixels = mask.num_hot_pixels();
            log::info!("Found {} possible hot spots", report.possible_hot_spots);
            log::info!("Found {} possible hot pixel(s)", report.hot_pixels);
            Some(match source.static_mask() {
                Some(external) => mask.and(external)?,
                None => mask,
            })
        } else {
            None
        };

        let flags = self.filter.filter(detector, &spots);
        if flags.len() != spots.len() {
            return Err(Error::Inconsistent(format!(
                "{} filter returned {} flags for {} spots",
                self.filter.name(),
                flags.len(),
                spots.len()
            )));
        }
        let total = spots.len();
        let mut keep = flags.iter().copied();
        shoeboxes.retain(|_| keep.next().unwrap_or(false));
        let mut keep = flags.iter().copied();
        spots.retain(|_| keep.next().unwrap_or(false));
        report.filtered = total - spots.len();
        log::info!(
            "Filtered {} of {total} spots by {}",
            report.filtered,
            self.filter.name()
        );

        Ok(SpotFinderOutput {
            shoeboxes,
            spots,
            hot_mask,
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::BorderFilter;
    use ndarray::Array2;
    use spotfind_core::{
        BoundingBox, ChunkSize, Detector, FixedThreshold, Image, ImagePanel, InMemoryImageSet,
        SchedulerConfig,
    };

    fn sweep(width: usize, height: usize, frames: &[Vec<(usize, usize)>]) -> InMemoryImageSet {
        let images = frames
            .iter()
            .map(|pixels| {
                let mut data = Array2::zeros((height, width));
                for &(x, y) in pixels {
                    data[[y, x]] = 100.0;
                }
                Image::new(vec![ImagePanel::from_data(data)])
            })
            .collect();
        InMemoryImageSet::new(Detector::single_panel(width, height), images).unwrap()
    }

    fn config() -> SpotFinderConfig {
        SpotFinderConfig::default().with_max_strong_pixel_fraction(1.0)
    }

    #[test]
    fn test_two_frame_scenario() {
        let set = sweep(5, 5, &[vec![(2, 2), (2, 3)], vec![(2, 2)]]);
        let threshold = FixedThreshold::new(10.0);
        let config = config();
        let extraction = ExtractSpots::new(&threshold, &config).unwrap().run(&set).unwrap();

        assert_eq!(extraction.batch.shoeboxes.len(), 1);
        let shoebox = &extraction.batch.shoeboxes[0];
        assert_eq!(shoebox.bbox, BoundingBox::new(2, 2, 2, 3, 0, 1));
        assert_eq!(shoebox.num_pixels(), 3);
        assert_eq!(extraction.strong_pixels, vec![(0, 2), (1, 1)]);
    }

    #[test]
    fn test_stills_are_labelled_per_image() {
        let set = sweep(5, 5, &[vec![(2, 2)], vec![(2, 2)]]).with_sweep(false);
        let threshold = FixedThreshold::new(10.0);
        let config = config();
        let extraction = ExtractSpots::new(&threshold, &config).unwrap().run(&set).unwrap();
        assert_eq!(extraction.batch.shoeboxes.len(), 2);
    }

    #[test]
    fn test_finder_reports_hot_pixel() {
        // (0, 0) is lit on every image, (3, 3) only on the first two
        let frames: Vec<_> = (0..4)
            .map(|z| if z < 2 { vec![(0, 0), (3, 3)] } else { vec![(0, 0)] })
            .collect();
        let set = sweep(5, 5, &frames);
        let finder = SpotFinder::new(config(), FixedThreshold::new(10.0)).unwrap();
        let output = finder.find(&set).unwrap();

        assert_eq!(output.report.spots_extracted, 2);
        assert_eq!(output.report.possible_hot_spots, 1);
        assert_eq!(output.report.hot_pixels, 1);
        let mask = output.hot_mask.unwrap();
        assert!(!mask.panels()[0][[0, 0]]);
        assert!(mask.panels()[0][[3, 3]]);
    }

    #[test]
    fn test_finder_without_hot_mask() {
        let set = sweep(5, 5, &[vec![(1, 1)]]);
        let finder =
            SpotFinder::new(config().with_write_hot_mask(false), FixedThreshold::new(10.0))
                .unwrap();
        assert!(finder.find(&set).unwrap().hot_mask.is_none());
    }

    #[test]
    fn test_scan_ranges_are_one_based() {
        let frames: Vec<_> = (0..6).map(|_| vec![(2, 2)]).collect();
        let set = sweep(5, 5, &frames);
        let finder = SpotFinder::new(
            config().with_scan_range(1, 2).with_scan_range(5, 6),
            FixedThreshold::new(10.0),
        )
        .unwrap();
        let output = finder.find(&set).unwrap();

        assert_eq!(output.shoeboxes.len(), 2);
        assert_eq!(output.shoeboxes[0].bbox.z0, 0);
        assert_eq!(output.shoeboxes[0].bbox.z1, 1);
        assert_eq!(output.shoeboxes[1].bbox.z0, 4);
        assert_eq!(output.shoeboxes[1].bbox.z1, 5);
        assert_eq!(output.report.strong_pixels.len(), 4);
        // Neither spans the six images of the set
        assert_eq!(output.report.possible_hot_spots, 0);
    }

    #[test]
    fn test_filter_removes_spots() {
        let set = sweep(10, 10, &[vec![(0, 0), (5, 5)]]);
        let finder = SpotFinder::new(config(), FixedThreshold::new(10.0))
            .unwrap()
            .with_filter(BorderFilter::new(1.0));
        let output = finder.find(&set).unwrap();
        assert_eq!(output.spots.len(), 1);
        assert_eq!(output.shoeboxes.len(), 1);
        assert_eq!(output.report.filtered, 1);
        assert_eq!(output.shoeboxes[0].bbox.x0, 5);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let frames: Vec<_> = (0..9)
            .map(|z| vec![(z % 5, 1), ((z + 1) % 5, 1), (4, 4)])
            .collect();
        let set = sweep(5, 5, &frames);
        let sequential = SpotFinder::new(config(), FixedThreshold::new(10.0))
            .unwrap()
            .find(&set)
            .unwrap();
        let parallel = SpotFinder::new(
            config().with_scheduler(SchedulerConfig::new(3, 1, ChunkSize::Fixed(2))),
            FixedThreshold::new(10.0),
        )
        .unwrap()
        .find(&set)
        .unwrap();
        assert_eq!(parallel.shoeboxes, sequential.shoeboxes);
        assert_eq!(parallel.report, sequential.report);
    }

    #[test]
    fn test_invalid_scan_range() {
        let set = sweep(5, 5, &[vec![(1, 1)]]);
        let finder =
            SpotFinder::new(config().with_scan_range(1, 2), FixedThreshold::new(10.0)).unwrap();
        assert!(matches!(finder.find(&set), Err(Error::Config(_))));
    }
}
