//! PipeCapture - Core Library
//!
//! Fills a pipe inspection workbook from a work folder of inspection videos
//! and defect photos. This file wires the modules together: it loads the
//! workbook, runs the ingestion batch, and always saves the result and
//! removes the transient captures, however the batch ended.

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub mod error;
pub mod frames;
pub mod ingest;
pub mod parser;
pub mod placement;
pub mod report;
pub mod workbook;
pub mod xlsx;

pub use error::IngestError;
pub use frames::{CaptureDir, FfmpegFrameExtractor, FrameExtractor};
pub use ingest::{Ingestor, Progress, RunHooks, RunSummary};
pub use parser::{ParsedRecord, PipeKind};
pub use workbook::Workbook;

/// Name of the capture directory created inside the work folder by default.
pub const DEFAULT_CAPTURE_DIR: &str = "captured_images";

/// Application configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    /// Report workbook holding the `입상sample` and `횡주sample` templates.
    pub workbook: PathBuf,
    /// Folder containing the `입상관` and `횡주관` source folders.
    pub work_dir: PathBuf,
    /// Where to write the filled workbook; defaults to
    /// `<workbook stem>_processed.xlsx` beside the input.
    pub output: Option<PathBuf>,
    /// Where to put transient frame captures.
    pub capture_dir: Option<PathBuf>,
    /// Optional JSON file receiving the run summary.
    pub report: Option<PathBuf>,
}

impl Config {
    pub fn output_path(&self) -> PathBuf {
        self.output
            .clone()
            .unwrap_or_else(|| xlsx::default_output_path(&self.workbook))
    }

    pub fn capture_path(&self) -> PathBuf {
        self.capture_dir
            .clone()
            .unwrap_or_else(|| self.work_dir.join(DEFAULT_CAPTURE_DIR))
    }
}

/// Runs a batch with FFmpeg frame capture and a terminal progress bar.
/// Setting `cancel` stops the batch before the next file.
pub fn run(config: Config, cancel: Arc<AtomicBool>) -> Result<RunSummary> {
    info!("Initializing processing with config: {:?}", config);
    warn_if_no_sources(&config.work_dir);

    let extractor = FfmpegFrameExtractor::new()?;

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} Processing files [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
            .context("Invalid progress bar template")?
            .progress_chars("##-"),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let bar = pb.clone();
    let hooks = RunHooks::default()
        .with_cancel(cancel)
        .with_progress(move |p| {
            bar.set_length(p.total as u64);
            bar.set_position(p.processed as u64);
            bar.set_message(p.file.to_string());
        });

    let result = execute(&config, extractor, hooks);
    pb.finish_and_clear();
    result
}

/// Loads the workbook, ingests the work folder with `extractor`, then saves
/// the workbook and removes the capture directory on every exit path.
pub fn execute<E: FrameExtractor>(
    config: &Config,
    extractor: E,
    hooks: RunHooks,
) -> Result<RunSummary> {
    let mut workbook = xlsx::load(&config.workbook).context("Failed to load workbook")?;
    let output = config.output_path();
    let mut captures = CaptureDir::new(config.capture_path());

    let (outcome, summary) = {
        let mut ingestor = Ingestor::new(&mut workbook, extractor, hooks, &mut captures);
        let outcome = ingestor.run(&config.work_dir);
        (outcome, ingestor.summary().clone())
    };
    captures.cleanup();

    let saved = xlsx::save(&workbook, &output);
    if let Some(report) = &config.report {
        if let Err(e) = write_report(&summary, report) {
            warn!("Could not write run report: {:#}", e);
        }
    }

    let summary = match outcome {
        Ok(summary) => summary,
        Err(e) => {
            if let Err(save_err) = saved {
                error!("Saving the partial workbook also failed: {}", save_err);
            }
            return Err(e).context("Processing aborted");
        }
    };
    saved.with_context(|| format!("Failed to save workbook to {:?}", output))?;

    info!(
        "Placed {} videos and {} photo groups ({} parse failures, {} capture failures, {} skipped)",
        summary.videos_placed,
        summary.image_groups_placed,
        summary.parse_failures,
        summary.capture_failures,
        summary.skipped
    );
    Ok(summary)
}

/// Writes the run summary as pretty JSON.
pub fn write_report(summary: &RunSummary, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("Failed to create report directory")?;
    }
    fs::write(path, serde_json::to_string_pretty(summary)?)
        .with_context(|| format!("Failed to write report to {:?}", path))?;
    info!("Wrote run report to {:?}", path);
    Ok(())
}

fn warn_if_no_sources(work_dir: &Path) {
    let any = PipeKind::ALL
        .iter()
        .any(|kind| work_dir.join(kind.folder_name()).is_dir());
    if !any {
        warn!(
            "{:?} contains neither '{}' nor '{}'; nothing will be placed",
            work_dir,
            PipeKind::Vertical.folder_name(),
            PipeKind::Horizontal.folder_name()
        );
    }
}
