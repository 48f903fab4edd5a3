//! spotfind CLI
//!
//! Runs spot finding on synthetic diffraction scans, benchmarks scheduler
//! settings and prints the effective configuration.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand, ValueEnum};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spotfind_algorithms::{BorderFilter, HotMask, SpotFinder, SpotFinderOutput};
use spotfind_core::{
    ChunkSize, Detector, DispersionThreshold, FixedThreshold, Image, ImagePanel,
    InMemoryImageSet, SchedulerConfig, SpotFinderConfig,
};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Core error: {0}")]
    Core(#[from] spotfind_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    Argument(String),
}

/// Thresholding strategy selection.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Threshold {
    /// Local index-of-dispersion test
    Dispersion,
    /// Fixed value threshold
    Fixed,
}

/// Diffraction spot finder.
#[derive(Parser)]
#[command(name = "spotfind")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Shape and content of a synthetic scan.
#[derive(clap::Args, Debug, Clone)]
struct ScanArgs {
    /// Number of images in the scan
    #[arg(long, default_value = "90")]
    frames: usize,

    /// Panel width in pixels
    #[arg(long, default_value = "256")]
    width: usize,

    /// Panel height in pixels
    #[arg(long, default_value = "256")]
    height: usize,

    /// Number of detector panels
    #[arg(long, default_value = "1")]
    panels: usize,

    /// Number of spots per panel
    #[arg(long, default_value = "50")]
    spots: usize,

    /// Number of hot pixels per panel
    #[arg(long, default_value = "2")]
    hot_pixels: usize,

    /// Mean background level (counts)
    #[arg(long, default_value = "5.0")]
    background: f64,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

/// Thresholding settings shared by the subcommands.
#[derive(clap::Args, Debug, Clone)]
struct ThresholdArgs {
    /// Thresholding strategy
    #[arg(short, long, value_enum, default_value = "dispersion")]
    threshold: Threshold,

    /// Threshold value for the fixed strategy
    #[arg(long, default_value = "50.0")]
    threshold_value: f64,

    /// Detector gain for the dispersion strategy
    #[arg(long, default_value = "1.0")]
    gain: f64,

    /// Background dispersion sigma
    #[arg(long, default_value = "6.0")]
    sigma_background: f64,

    /// Strong pixel sigma
    #[arg(long, default_value = "3.0")]
    sigma_strong: f64,

    /// Half-size of the dispersion kernel window
    #[arg(long, default_value = "3")]
    kernel_half_size: usize,

    /// Absolute lower bound on strong pixel values
    #[arg(long, default_value = "0.0")]
    global_threshold: f64,
}

impl ThresholdArgs {
    fn dispersion(&self) -> DispersionThreshold {
        DispersionThreshold::default()
            .with_kernel_half_size(self.kernel_half_size)
            .with_gain(self.gain)
            .with_sigmas(self.sigma_background, self.sigma_strong)
            .with_global_threshold(self.global_threshold)
    }

    fn finder(&self, config: SpotFinderConfig) -> Result<SpotFinder> {
        Ok(match self.threshold {
            Threshold::Dispersion => SpotFinder::new(config, self.dispersion())?,
            Threshold::Fixed => SpotFinder::new(config, FixedThreshold::new(self.threshold_value))?,
        })
    }
}

/// Scheduler settings shared by the subcommands.
#[derive(clap::Args, Debug, Clone)]
struct SchedulerArgs {
    /// Worker threads per job
    #[arg(long)]
    workers: Option<usize>,

    /// Number of jobs
    #[arg(long)]
    jobs: Option<usize>,

    /// Images per chunk, or "auto"
    #[arg(long, value_parser = parse_chunk_size)]
    chunk_size: Option<ChunkSize>,
}

#[derive(Subcommand)]
enum Commands {
    /// Find spots in a synthetic scan
    Simulate {
        #[command(flatten)]
        scan: ScanArgs,

        #[command(flatten)]
        scheduler: SchedulerArgs,

        #[command(flatten)]
        threshold: ThresholdArgs,

        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Write the hot pixel mask to this JSON file
        #[arg(long)]
        hot_mask: Option<PathBuf>,

        /// Reject spots within this many pixels of a panel edge
        #[arg(long)]
        border: Option<f64>,

        /// Print every spot
        #[arg(short, long)]
        verbose: bool,
    },

    /// Compare run times of worker counts on a synthetic scan
    Benchmark {
        #[command(flatten)]
        scan: ScanArgs,

        #[command(flatten)]
        threshold: ThresholdArgs,

        /// Worker counts to compare
        #[arg(long, value_delimiter = ',', default_value = "1,2,4,8")]
        workers: Vec<usize>,

        /// Number of iterations per setting
        #[arg(short, long, default_value = "3")]
        iterations: usize,
    },

    /// Print the effective configuration as JSON
    Config {
        /// JSON configuration file to load
        input: Option<PathBuf>,
    },
}

fn parse_chunk_size(value: &str) -> std::result::Result<ChunkSize, String> {
    if value.eq_ignore_ascii_case("auto") {
        return Ok(ChunkSize::Auto);
    }
    match value.parse::<usize>() {
        Ok(0) => Err("chunk size must be at least 1".to_string()),
        Ok(size) => Ok(ChunkSize::Fixed(size)),
        Err(err) => Err(format!("expected a number or \"auto\": {err}")),
    }
}

/// Poisson-like count with the given mean (normal approximation).
fn counts(rng: &mut StdRng, mean: f64) -> f64 {
    let u1 = rng.random::<f64>().max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    let normal = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    (mean + normal * mean.sqrt()).round().max(0.0)
}

/// Builds a scan with Gaussian spots spread over a few images and hot pixels
/// lit on every image.
fn synthetic_scan(args: &ScanArgs) -> Result<InMemoryImageSet> {
    if args.frames == 0 || args.width < 8 || args.height < 8 || args.panels == 0 {
        return Err(CliError::Argument(
            "scan needs at least one frame and panel of 8x8 pixels".to_string(),
        ));
    }
    let mut rng = StdRng::seed_from_u64(args.seed);
    let detector = Detector::new(vec![
        spotfind_core::PanelSize::new(args.width, args.height);
        args.panels
    ]);

    // (panel, x, y, z, peak)
    let mut spots = Vec::with_capacity(args.spots * args.panels);
    for panel in 0..args.panels {
        for _ in 0..args.spots {
            spots.push((
                panel,
                rng.random_range(2..args.width - 2),
                rng.random_range(2..args.height - 2),
                rng.random_range(0..args.frames),
                rng.random_range(200.0..1000.0),
            ));
        }
    }
    let mut hot = Vec::with_capacity(args.hot_pixels * args.panels);
    for panel in 0..args.panels {
        for _ in 0..args.hot_pixels {
            hot.push((
                panel,
                rng.random_range(0..args.width),
                rng.random_range(0..args.height),
            ));
        }
    }

    let mut images = Vec::with_capacity(args.frames);
    for z in 0..args.frames {
        let mut panels: Vec<Array2<f64>> = (0..args.panels)
            .map(|_| {
                Array2::from_shape_fn((args.height, args.width), |_| {
                    counts(&mut rng, args.background)
                })
            })
            .collect();
        for &(panel, cx, cy, cz, peak) in &spots {
            let dz = z as f64 - cz as f64;
            if dz.abs() > 1.0 {
                continue;
            }
            for y in cy - 2..=cy + 2 {
                for x in cx - 2..=cx + 2 {
                    let dx = x as f64 - cx as f64;
                    let dy = y as f64 - cy as f64;
                    let weight = (-(dx * dx + dy * dy) / 1.5 - dz * dz).exp();
                    panels[panel][[y, x]] += (peak * weight).round();
                }
            }
        }
        for &(panel, x, y) in &hot {
            panels[panel][[y, x]] += 5000.0;
        }
        images.push(Image::new(
            panels.into_iter().map(ImagePanel::from_data).collect(),
        ));
    }
    Ok(InMemoryImageSet::new(detector, images)?)
}

fn load_config(path: Option<&PathBuf>) -> Result<SpotFinderConfig> {
    Ok(match path {
        Some(path) => SpotFinderConfig::from_file(path)?,
        None => SpotFinderConfig::default(),
    })
}

fn apply_scheduler(config: SpotFinderConfig, args: &SchedulerArgs) -> SpotFinderConfig {
    let scheduler = SchedulerConfig::new(
        args.workers.unwrap_or(config.scheduler.worker_count),
        args.jobs.unwrap_or(config.scheduler.job_count),
        args.chunk_size.unwrap_or(config.scheduler.chunk_size),
    );
    config.with_scheduler(scheduler)
}

fn run_finder(
    config: SpotFinderConfig,
    threshold: &ThresholdArgs,
    border: Option<f64>,
    set: &InMemoryImageSet,
) -> Result<SpotFinderOutput> {
    let finder = threshold.finder(config)?;
    let finder = match border {
        Some(border) => finder.with_filter(BorderFilter::new(border)),
        None => finder,
    };
    Ok(finder.find(set)?)
}

/// Writes the per-panel hot pixel mask as nested `[panel][y][x]` arrays, true for good pixels.
fn write_hot_mask(path: &Path, mask: &HotMask) -> Result<()> {
    let panels: Vec<Vec<Vec<bool>>> = mask
        .panels()
        .iter()
        .map(|panel| panel.rows().into_iter().map(|row| row.to_vec()).collect())
        .collect();
    let json = serde_json::json!({
        "num_hot_spots": mask.num_hot_spots(),
        "num_hot_pixels": mask.num_hot_pixels(),
        "panels": panels,
    });
    std::fs::write(path, serde_json::to_string(&json)?)?;
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            scan,
            scheduler,
            threshold,
            config,
            hot_mask,
            border,
            verbose,
        } => {
            let config = apply_scheduler(load_config(config.as_ref())?, &scheduler);
            if verbose {
                eprintln!("Generating {} images of {} panel(s)...", scan.frames, scan.panels);
            }
            let set = synthetic_scan(&scan)?;

            let start = Instant::now();
            let output = run_finder(config, &threshold, border, &set)?;
            let elapsed = start.elapsed();

            if verbose {
                println!(
                    "{:<6} | {:>9} | {:>9} | {:>9} | {:>12} | {:>6}",
                    "Panel", "X", "Y", "Z", "Intensity", "Pixels"
                );
                println!("{:-<66}", "");
                for spot in &output.spots {
                    println!(
                        "{:<6} | {:>9.2} | {:>9.2} | {:>9.2} | {:>12.1} | {:>6}",
                        spot.panel,
                        spot.centroid[0],
                        spot.centroid[1],
                        spot.centroid[2],
                        spot.intensity,
                        spot.num_pixels
                    );
                }
            }

            let report = &output.report;
            let strong: usize = report.strong_pixels.iter().map(|&(_, count)| count).sum();
            println!(
                "Processed {} images in {:.2}s",
                report.strong_pixels.len(),
                elapsed.as_secs_f64()
            );
            println!("Strong pixels: {}", strong);
            println!("Spots extracted: {}", report.spots_extracted);
            println!("Rejected (too small): {}", report.rejected_small);
            println!("Rejected (too large): {}", report.rejected_large);
            println!("Removed by filter: {}", report.filtered);
            println!("Spots found: {}", output.spots.len());
            println!("Possible hot spots: {}", report.possible_hot_spots);
            println!("Hot pixels: {}", report.hot_pixels);

            match (&output.hot_mask, hot_mask) {
                (Some(mask), Some(path)) => {
                    write_hot_mask(&path, mask)?;
                    println!(
                        "Hot mask written to {} ({} bad pixels)",
                        path.display(),
                        mask.num_hot_pixels()
                    );
                }
                (None, Some(_)) => {
                    log::warn!("Hot mask output requested but write_hot_mask is disabled");
                }
                _ => {}
            }
        }

        Commands::Benchmark {
            scan,
            threshold,
            workers,
            iterations,
        } => {
            if iterations == 0 {
                return Err(CliError::Argument("iterations must be at least 1".to_string()));
            }
            let set = synthetic_scan(&scan)?;
            println!(
                "Benchmarking {} images of {}x{} pixels, {} iterations",
                scan.frames, scan.width, scan.height, iterations
            );
            println!(
                "{:<8} | {:<15} | {:<15} | {:<15} | {:<6}",
                "Workers", "Mean Time (ms)", "Min Time (ms)", "Max Time (ms)", "Spots"
            );
            println!("{:-<70}", "");

            for worker_count in workers {
                let config = SpotFinderConfig::default()
                    .with_scheduler(SchedulerConfig::new(worker_count, 1, ChunkSize::Auto));
                let finder = threshold.finder(config)?;

                // Warmup
                let mut spots = finder.find(&set)?.spots.len();
                let mut times = Vec::with_capacity(iterations);
                for _ in 0..iterations {
                    let start = Instant::now();
                    spots = finder.find(&set)?.spots.len();
                    times.push(start.elapsed().as_secs_f64() * 1000.0);
                }

                let min_time = times.iter().fold(f64::INFINITY, |a, &b| a.min(b));
                let max_time = times.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
                let mean_time = times.iter().sum::<f64>() / times.len() as f64;
                println!(
                    "{:<8} | {:<15.2} | {:<15.2} | {:<15.2} | {:<6}",
                    worker_count, mean_time, min_time, max_time, spots
                );
            }
        }

        Commands::Config { input } => {
            let config = load_config(input.as_ref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_scan() -> ScanArgs {
        ScanArgs {
            frames: 12,
            width: 48,
            height: 40,
            panels: 2,
            spots: 4,
            hot_pixels: 1,
            background: 2.0,
            seed: 7,
        }
    }

    fn default_threshold() -> ThresholdArgs {
        ThresholdArgs {
            threshold: Threshold::Dispersion,
            threshold_value: 50.0,
            gain: 1.0,
            sigma_background: 6.0,
            sigma_strong: 3.0,
            kernel_half_size: 3,
            global_threshold: 0.0,
        }
    }

    #[test]
    fn test_parse_chunk_size() {
        assert_eq!(parse_chunk_size("auto"), Ok(ChunkSize::Auto));
        assert_eq!(parse_chunk_size("4"), Ok(ChunkSize::Fixed(4)));
        assert!(parse_chunk_size("0").is_err());
        assert!(parse_chunk_size("x").is_err());
    }

    #[test]
    fn test_synthetic_scan_shape() {
        let set = synthetic_scan(&small_scan()).unwrap();
        assert_eq!(spotfind_core::ImageSource::len(&set), 12);
        assert_eq!(spotfind_core::ImageSource::detector(&set).len(), 2);
    }

    #[test]
    fn test_hot_pixels_are_found() {
        let set = synthetic_scan(&small_scan()).unwrap();
        let config = SpotFinderConfig::default().with_spot_size(1, 100);
        let threshold = ThresholdArgs {
            threshold: Threshold::Fixed,
            threshold_value: 1000.0,
            ..default_threshold()
        };
        let output = run_finder(config, &threshold, None, &set).unwrap();
        // Only the hot pixels exceed 1000 counts on every image
        assert_eq!(output.report.possible_hot_spots, 2);
    }

    #[test]
    fn test_scheduler_overrides() {
        let args = SchedulerArgs {
            workers: Some(4),
            jobs: None,
            chunk_size: Some(ChunkSize::Auto),
        };
        let config = apply_scheduler(SpotFinderConfig::default(), &args);
        assert_eq!(config.scheduler, SchedulerConfig::new(4, 1, ChunkSize::Auto));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from([
            "spotfind",
            "simulate",
            "--frames",
            "10",
            "--workers",
            "2",
            "--chunk-size",
            "auto",
            "--threshold",
            "fixed",
        ]);
        assert!(cli.is_ok());
    }

    #[test]
    fn test_dispersion_flags_reach_threshold() {
        let cli = Cli::try_parse_from([
            "spotfind",
            "simulate",
            "--gain",
            "1.5",
            "--sigma-background",
            "4",
            "--sigma-strong",
            "2.5",
            "--kernel-half-size",
            "2",
            "--global-threshold",
            "10",
        ])
        .unwrap();
        let Commands::Simulate { threshold, .. } = cli.command else {
            panic!("expected the simulate command");
        };
        let dispersion = threshold.dispersion();
        assert_eq!(dispersion.kernel_half_size, 2);
        assert!((dispersion.gain - 1.5).abs() < f64::EPSILON);
        assert!((dispersion.sigma_background - 4.0).abs() < f64::EPSILON);
        assert!((dispersion.sigma_strong - 2.5).abs() < f64::EPSILON);
        assert!((dispersion.global_threshold - 10.0).abs() < f64::EPSILON);
        assert_eq!(default_threshold().dispersion(), DispersionThreshold::default());
    }

    #[test]
    fn test_hot_mask_written_as_json() {
        let set = synthetic_scan(&small_scan()).unwrap();
        let config = SpotFinderConfig::default().with_spot_size(1, 100);
        let threshold = ThresholdArgs {
            threshold: Threshold::Fixed,
            threshold_value: 1000.0,
            ..default_threshold()
        };
        let output = run_finder(config, &threshold, None, &set).unwrap();
        let mask = output.hot_mask.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hot_mask.json");
        write_hot_mask(&path, &mask).unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["num_hot_spots"], 2);
        let panels = json["panels"].as_array().unwrap();
        assert_eq!(panels.len(), 2);
        assert_eq!(panels[0].as_array().unwrap().len(), 40);
        assert_eq!(panels[0][0].as_array().unwrap().len(), 48);
        let bad = panels
            .iter()
            .flat_map(|panel| panel.as_array().unwrap())
            .flat_map(|row| row.as_array().unwrap())
            .filter(|good| good.as_bool() == Some(false))
            .count();
        assert_eq!(bad, mask.num_hot_pixels());
    }
}
