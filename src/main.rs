//! PipeCapture - Main Application Entrypoint
//!
//! This file is responsible for parsing command-line arguments, initializing
//! the application environment (logging, Ctrl-C handling), and dispatching
//! the core processing logic.

use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

/// A command-line tool that fills pipe inspection workbooks with stills
/// captured from inspection videos and with defect photos.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the report workbook (e.g., sample.xlsx)
    #[arg(short, long)]
    workbook: PathBuf,

    /// Work folder containing the '입상관' and '횡주관' folders
    #[arg(short = 'd', long, default_value = ".")]
    work_dir: PathBuf,

    /// Output workbook (default: <workbook>_processed.xlsx)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory for transient frame captures (default: <work-dir>/captured_images)
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Write a JSON summary of the run to this file
    #[arg(long)]
    report: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,
}

#[derive(clap::ValueEnum, Clone, Debug)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

fn main() {
    let code = {
        #[cfg(feature = "dhat-heap")]
        let _profiler = dhat::Profiler::new_heap();
        run_cli()
    };
    std::process::exit(code);
}

fn run_cli() -> i32 {
    let args = Args::parse();

    // 1. Initialize Logger
    let log_level = match args.log_level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("Starting PipeCapture...");

    // 2. Validate input paths
    if !args.workbook.is_file() {
        error!("Workbook does not exist: {:?}", args.workbook);
        return 1;
    }
    if !args.work_dir.is_dir() {
        error!("Work folder does not exist: {:?}", args.work_dir);
        return 1;
    }

    // 3. Cooperative cancellation on Ctrl-C
    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    // 4. Create a configuration object from arguments
    let config = pipecapture::Config {
        workbook: args.workbook,
        work_dir: args.work_dir,
        output: args.output,
        capture_dir: args.capture_dir,
        report: args.report,
    };
    let output = config.output_path();

    // 5. Run the main application logic
    match pipecapture::run(config, cancel) {
        Ok(summary) if summary.cancelled => {
            warn!(
                "Processing cancelled after {} of {} files; partial workbook saved to {:?}",
                summary.processed_files, summary.total_files, output
            );
            0
        }
        Ok(_) => {
            info!("Processing completed successfully. Output: {:?}", output);
            0
        }
        Err(e) => {
            error!("Application failed: {:#}", e);
            2
        }
    }
}
