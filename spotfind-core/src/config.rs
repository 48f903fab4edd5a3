//! Spot finding configuration.
//!
//! Configurations can be built in code with the `with_*` setters or loaded
//! from JSON, where every field is optional:
//!
//! ```json
//! {
//!   "max_strong_pixel_fraction": 0.1,
//!   "min_spot_size": 2,
//!   "max_spot_size": 100,
//!   "region_of_interest": { "x0": 0, "x1": 512, "y0": 0, "y1": 512 },
//!   "scheduler": { "worker_count": 4, "job_count": 1, "chunk_size": "auto" },
//!   "scan_ranges": [[1, 90]],
//!   "write_hot_mask": true
//! }
//! ```

use crate::image::Detector;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Rectangular region of interest with half-open bounds `[x0, x1) x [y0, y1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOfInterest {
    /// First column.
    pub x0: usize,
    /// One past the last column.
    pub x1: usize,
    /// First row.
    pub y0: usize,
    /// One past the last row.
    pub y1: usize,
}

impl RegionOfInterest {
    /// Creates a region of interest.
    #[must_use]
    pub fn new(x0: usize, x1: usize, y0: usize, y1: usize) -> Self {
        Self { x0, x1, y0, y1 }
    }

    /// Checks the region against a panel of the given size.
    ///
    /// # Errors
    /// Returns a configuration error unless `x0 < x1 <= width` and `y0 < y1 <= height`.
    pub fn validate(&self, width: usize, height: usize) -> Result<()> {
        if self.x0 >= self.x1 {
            return Err(Error::Config(format!(
                "region of interest requires x0 < x1 (got {} and {})",
                self.x0, self.x1
            )));
        }
        if self.y0 >= self.y1 {
            return Err(Error::Config(format!(
                "region of interest requires y0 < y1 (got {} and {})",
                self.y0, self.y1
            )));
        }
        if self.x1 > width {
            return Err(Error::Config(format!(
                "region of interest requires x1 <= width (got {} > {width})",
                self.x1
            )));
        }
        if self.y1 > height {
            return Err(Error::Config(format!(
                "region of interest requires y1 <= height (got {} > {height})",
                self.y1
            )));
        }
        Ok(())
    }
}

/// Number of tasks handed to a worker at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkSize {
    /// Split the tasks evenly across all workers.
    Auto,
    /// Fixed number of tasks per chunk.
    #[serde(untagged)]
    Fixed(usize),
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Fixed(1)
    }
}

/// Work distribution settings for frame extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker threads per job.
    pub worker_count: usize,
    /// Number of jobs; the thread count is `worker_count * job_count`.
    pub job_count: usize,
    /// Tasks per chunk.
    pub chunk_size: ChunkSize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            job_count: 1,
            chunk_size: ChunkSize::default(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a scheduler configuration.
    #[must_use]
    pub fn new(worker_count: usize, job_count: usize, chunk_size: ChunkSize) -> Self {
        Self {
            worker_count,
            job_count,
            chunk_size,
        }
    }

    /// Checks the counts.
    ///
    /// # Errors
    /// Returns a configuration error if any count is zero.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::Config("worker_count must be at least 1".to_string()));
        }
        if self.job_count == 0 {
            return Err(Error::Config("job_count must be at least 1".to_string()));
        }
        if self.chunk_size == ChunkSize::Fixed(0) {
            return Err(Error::Config("chunk_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Configuration for spot finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpotFinderConfig {
    /// Maximum fraction of an image's pixels that may be strong, in (0, 1].
    pub max_strong_pixel_fraction: f64,
    /// Smallest accepted spot, in pixels (inclusive).
    pub min_spot_size: usize,
    /// Largest accepted spot, in pixels (inclusive).
    pub max_spot_size: usize,
    /// Only threshold pixels inside this region.
    pub region_of_interest: Option<RegionOfInterest>,
    /// Work distribution settings.
    pub scheduler: SchedulerConfig,
    /// 1-based inclusive image ranges to search; empty means all images.
    pub scan_ranges: Vec<(usize, usize)>,
    /// Derive a hot pixel mask from spots spanning the whole scan.
    pub write_hot_mask: bool,
}

impl Default for SpotFinderConfig {
    fn default() -> Self {
        Self {
            max_strong_pixel_fraction: 0.1,
            min_spot_size: 1,
            max_spot_size: 20,
            region_of_interest: None,
            scheduler: SchedulerConfig::default(),
            scan_ranges: Vec::new(),
            write_hot_mask: true,
        }
    }
}

impl SpotFinderConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum strong pixel fraction.
    #[must_use]
    pub fn with_max_strong_pixel_fraction(mut self, fraction: f64) -> Self {
        self.max_strong_pixel_fraction = fraction;
        self
    }

    /// Sets the inclusive spot size bounds.
    #[must_use]
    pub fn with_spot_size(mut self, min: usize, max: usize) -> Self {
        self.min_spot_size = min;
        self.max_spot_size = max;
        self
    }

    /// Sets the region of interest.
    #[must_use]
    pub fn with_region_of_interest(mut self, roi: RegionOfInterest) -> Self {
        self.region_of_interest = Some(roi);
        self
    }

    /// Sets the scheduler configuration.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Adds a 1-based inclusive image range.
    #[must_use]
    pub fn with_scan_range(mut self, first: usize, last: usize) -> Self {
        self.scan_ranges.push((first, last));
        self
    }

    /// Enables or disables hot mask derivation.
    #[must_use]
    pub fn with_write_hot_mask(mut self, enabled: bool) -> Self {
        self.write_hot_mask = enabled;
        self
    }

    /// Checks values that do not depend on the detector.
    ///
    /// # Errors
    /// Returns a configuration error for an out-of-range fraction, spot size
    /// bounds that are zero or inverted, or invalid scheduler counts.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_strong_pixel_fraction > 0.0 && self.max_strong_pixel_fraction <= 1.0) {
            return Err(Error::Config(format!(
                "max_strong_pixel_fraction must be in (0, 1], got {}",
                self.max_strong_pixel_fraction
            )));
        }
        if self.min_spot_size == 0 {
            return Err(Error::Config("min_spot_size must be positive".to_string()));
        }
        if self.max_spot_size == 0 {
            return Err(Error::Config("max_spot_size must be positive".to_string()));
        }
        if self.min_spot_size > self.max_spot_size {
            return Err(Error::Config(format!(
                "min_spot_size ({}) is greater than max_spot_size ({})",
                self.min_spot_size, self.max_spot_size
            )));
        }
        self.scheduler.validate()
    }

    /// Checks values against a detector and the number of images.
    ///
    /// # Errors
    /// Returns a configuration error if [`Self::validate`] fails, the region
    /// of interest does not fit every panel, or a scan range is out of bounds.
    pub fn validate_for(&self, detector: &Detector, num_images: usize) -> Result<()> {
        self.validate()?;
        if let Some(roi) = &self.region_of_interest {
            for panel in detector.panels() {
                roi.validate(panel.width, panel.height)?;
            }
        }
        for &(first, last) in &self.scan_ranges {
            if first == 0 || first > last || last > num_images {
                return Err(Error::Config(format!(
                    "scan range ({first}, {last}) is outside images 1..={num_images}"
                )));
            }
        }
        Ok(())
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    /// Returns an error if the string cannot be parsed or validated.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::PanelSize;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = SpotFinderConfig::default();
        assert!((config.max_strong_pixel_fraction - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.min_spot_size, 1);
        assert_eq!(config.max_spot_size, 20);
        assert_eq!(config.scheduler, SchedulerConfig::new(1, 1, ChunkSize::Fixed(1)));
        assert!(config.write_hot_mask);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_spot_size_bounds() {
        assert!(SpotFinderConfig::new().with_spot_size(0, 5).validate().is_err());
        assert!(SpotFinderConfig::new().with_spot_size(6, 5).validate().is_err());
        assert!(SpotFinderConfig::new().with_spot_size(5, 5).validate().is_ok());
    }

    #[test]
    fn test_fraction_bounds() {
        let config = SpotFinderConfig::new();
        assert!(config.clone().with_max_strong_pixel_fraction(0.0).validate().is_err());
        assert!(config.clone().with_max_strong_pixel_fraction(1.5).validate().is_err());
        assert!(config.with_max_strong_pixel_fraction(1.0).validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config =
            SpotFinderConfig::new().with_scheduler(SchedulerConfig::new(0, 1, ChunkSize::Auto));
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_roi_validation() {
        assert!(RegionOfInterest::new(0, 5, 0, 5).validate(5, 5).is_ok());
        assert!(RegionOfInterest::new(2, 2, 0, 5).validate(5, 5).is_err());
        assert!(RegionOfInterest::new(0, 5, 3, 1).validate(5, 5).is_err());
        assert!(RegionOfInterest::new(0, 6, 0, 5).validate(5, 5).is_err());
        assert!(RegionOfInterest::new(0, 5, 0, 6).validate(5, 5).is_err());
    }

    #[test]
    fn test_validate_for_detector() {
        let detector = Detector::new(vec![PanelSize::new(10, 10), PanelSize::new(8, 10)]);
        let config = SpotFinderConfig::new().with_region_of_interest(RegionOfInterest::new(0, 9, 0, 9));
        // Second panel is only 8 pixels wide
        assert!(config.validate_for(&detector, 5).is_err());

        let config = SpotFinderConfig::new().with_scan_range(2, 6);
        assert!(config.validate_for(&detector, 5).is_err());
        let config = SpotFinderConfig::new().with_scan_range(2, 5);
        assert!(config.validate_for(&detector, 5).is_ok());
    }

    #[test]
    fn test_json_partial_config() {
        let json = r#"{
            "min_spot_size": 2,
            "max_spot_size": 10,
            "scheduler": { "worker_count": 4, "chunk_size": "auto" }
        }"#;
        let config = SpotFinderConfig::from_json(json).expect("Should parse partial config");
        assert_eq!(config.min_spot_size, 2);
        assert_eq!(config.max_spot_size, 10);
        assert_eq!(config.scheduler.worker_count, 4);
        assert_eq!(config.scheduler.job_count, 1);
        assert_eq!(config.scheduler.chunk_size, ChunkSize::Auto);
        assert!((config.max_strong_pixel_fraction - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn test_json_fixed_chunk_size_and_roi() {
        let json = r#"{
            "scheduler": { "chunk_size": 8 },
            "region_of_interest": { "x0": 1, "x1": 4, "y0": 0, "y1": 2 }
        }"#;
        let config = SpotFinderConfig::from_json(json).unwrap();
        assert_eq!(config.scheduler.chunk_size, ChunkSize::Fixed(8));
        assert_eq!(config.region_of_interest, Some(RegionOfInterest::new(1, 4, 0, 2)));
    }

    #[test]
    fn test_json_invalid_values_rejected() {
        let json = r#"{ "min_spot_size": 30, "max_spot_size": 10 }"#;
        assert!(matches!(SpotFinderConfig::from_json(json), Err(Error::Config(_))));
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let config = SpotFinderConfig::new()
            .with_spot_size(3, 50)
            .with_scan_range(1, 10)
            .with_write_hot_mask(false);
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(config.to_json().unwrap().as_bytes()).unwrap();
        file.flush().unwrap();

        let loaded = SpotFinderConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
