//! spotfind-core: Core types and traits for diffraction spot finding.
//!
//! This crate provides the image source contract, strong pixel lists,
//! shoeboxes, thresholding strategies and configuration shared by the
//! spot finding algorithms.
//!

pub mod config;
pub mod error;
pub mod image;
pub mod pixel_list;
pub mod shoebox;
pub mod spot;
pub mod threshold;

pub use config::{ChunkSize, RegionOfInterest, SchedulerConfig, SpotFinderConfig};
pub use error::{Error, Result};
pub use image::{
    Detector, FrameReader, Image, ImagePanel, ImageRange, ImageSource, InMemoryImageSet,
    InMemoryReader, PanelSize, RangeReader,
};
pub use pixel_list::{FramePixels, PixelList};
pub use shoebox::{BoundingBox, Shoebox};
pub use spot::Spot;
pub use threshold::{DispersionThreshold, FixedThreshold, ThresholdFunction};
