//! spotfind-algorithms: The spot finding pipeline.
//!
//! This crate provides the stages that turn a sequence of images into
//! shoeboxes:
//! - **Extraction** - per-frame thresholding into strong pixel lists
//! - **Scheduling** - parallel extraction with in-order delivery
//! - **Labelling** - incremental 3D connected components per panel
//! - **Shoeboxes** - size filtering and dense materialization
//! - **Hot pixels** - mask of pixels lit on every image of a scan
//!
#![warn(missing_docs)]

mod extract;
mod filter;
mod finder;
mod hot_pixel;
mod labeller;
pub mod scheduler;
mod shoebox_builder;
mod union_find;

pub use extract::FrameExtractor;
pub use filter::{AcceptAll, BorderFilter, SpotFilter};
pub use finder::{ExtractSpots, Extraction, SpotFinder, SpotFinderOutput, SpotFinderReport};
pub use hot_pixel::{HotMask, HotPixelDetector};
pub use labeller::{Component, PixelListLabeller};
pub use scheduler::{LogRecord, ParallelScheduler, SchedulerPlan, Task, TaskLog};
pub use shoebox_builder::{ShoeboxBatch, ShoeboxBuilder};

// Re-export core configuration types
pub use spotfind_core::{ChunkSize, SchedulerConfig, SpotFinderConfig};
