//! Generals Tracker command line entry point.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use generals_tracker::automation::progress::{CancelToken, CollectionProgress};
use generals_tracker::automation::{
    build_session, load_config, prepare_session_dir, spawn_collection, AppConfig, CollectionStatus,
    CsvExporter, ExportSummary,
};
use generals_tracker::regions::RegionRegistry;
use generals_tracker::{init_logging, paths};

#[derive(Parser, Debug)]
#[command(name = "generals-tracker", version, about = "Collects generals data from an emulator over ADB")]
struct Cli {
    /// Config file (default: config.json next to the executable)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Region preset file, overrides `regions_file`
    #[arg(long)]
    regions: Option<PathBuf>,
    /// Output root for session folders
    #[arg(long)]
    output: Option<PathBuf>,
    /// Save every cropped region to the debug image folder
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = paths::ensure_directories() {
        eprintln!("Failed to create output directories: {}", e);
    }

    let config_path = cli.config.clone().unwrap_or_else(paths::get_default_config_path);
    let (config, fallback) = load_config(&config_path);
    let log_path = paths::get_logs_dir().join("generals_tracker.log");
    if let Err(e) = init_logging(&config.log_level, Some(&log_path)) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }
    match fallback {
        Some(reason) => warn!("{}", reason),
        None => info!("Config loaded from {}", config_path.display()),
    }

    match run(&cli, config) {
        Ok(CollectionStatus::Completed) => ExitCode::SUCCESS,
        Ok(CollectionStatus::Cancelled) => {
            warn!("Collection was cancelled, partial results were saved");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, mut config: AppConfig) -> Result<CollectionStatus> {
    if cli.debug {
        config.debug_mode = true;
    }

    let regions_path = cli
        .regions
        .clone()
        .unwrap_or_else(|| paths::resolve_relative(&config.regions_file));
    let registry = Arc::new(RegionRegistry::load(&regions_path)?);
    let resources_dir = paths::resolve_relative(&config.resources_dir);

    let output_root = cli.output.clone().unwrap_or_else(paths::get_output_dir);
    let session_dir = prepare_session_dir(&output_root)?;
    let exporter = CsvExporter::create(&session_dir)?;

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("Cancellation requested, finishing current general");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;

    let session = match build_session(
        &config,
        registry,
        &resources_dir,
        Some(paths::get_debug_images_dir()),
        cancel,
    ) {
        Ok(session) => session,
        Err(e) => {
            exporter.write_summary(&ExportSummary::failed(&e, 0))?;
            return Err(e.into());
        }
    };

    info!("Starting collection (Ctrl+C to stop)");
    let handle = spawn_collection(session, log_progress, exporter);
    let (result, exporter) = handle.join().map_err(|_| anyhow!("Collection thread panicked"))?;

    match result {
        Ok(outcome) => {
            exporter.write_summary(&ExportSummary::from_outcome(&outcome))?;
            info!(
                "{} generals collected ({} uncertain), count '{}', results in {}",
                outcome.records.len(),
                outcome.uncertain_count(),
                outcome.count_text,
                exporter.csv_path().display()
            );
            Ok(outcome.status)
        }
        Err(e) => {
            exporter.write_summary(&ExportSummary::failed(&e, exporter.rows_written()))?;
            Err(e.into())
        }
    }
}

fn log_progress(progress: &CollectionProgress) {
    let eta = progress
        .estimated_remaining
        .map(|d| format!(", ~{}s left", d.as_secs()))
        .unwrap_or_default();
    info!(
        "[{:5.1}%] {} (avg confidence {:.2}{})",
        progress.percentage, progress.status, progress.average_confidence, eta
    );
}
