//! Collection runner - main entry point for a collection run.
//!
//! Connects the device, normalizes the list, walks every entity and always
//! restores the list filters and disconnects, whatever happened in between.

use chrono::Local;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::automation::collector::{CollectorSettings, EntityCollector};
use crate::automation::config::AppConfig;
use crate::automation::detection::ReferenceImages;
use crate::automation::navigator::{FilterStateFlags, NavError, NavState, Navigator, NavigatorTiming};
use crate::automation::progress::{CancelToken, ProgressSink, ProgressTracker, RecordSink, SETUP_PERCENT};
use crate::automation::record::EntityRecord;
use crate::device::{AdbDevice, Device};
use crate::ocr::{create_backend, ExtractionPipeline, PipelineSettings};
use crate::regions::RegionRegistry;

/// Terminal failures. Everything else is recorded per field and the run goes on.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("device unavailable: {0:#}")]
    DeviceUnavailable(anyhow::Error),
    #[error("navigation failed: {0}")]
    NavigationFailed(#[from] NavError),
    #[error("no entities found (count text: '{count_text}')")]
    NoEntities { count_text: String },
    #[error("OCR initialization failed: {0:#}")]
    OcrInit(anyhow::Error),
    #[error("output error: {0:#}")]
    Io(anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    Completed,
    Cancelled,
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionStatus::Completed => write!(f, "completed"),
            CollectionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionOutcome {
    pub status: CollectionStatus,
    pub records: Vec<Arc<EntityRecord>>,
    /// Raw text of the list counter, e.g. "42/120"
    pub count_text: String,
    pub elapsed: Duration,
}

impl CollectionOutcome {
    pub fn uncertain_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_uncertain).count()
    }
}

/// Everything one run needs. Owned by the worker thread for the run's duration.
pub struct CollectionSession<D: Device> {
    navigator: Navigator<D>,
    pipeline: ExtractionPipeline,
    collector: EntityCollector,
    cancel: CancelToken,
    retry_count: u32,
}

impl<D: Device> CollectionSession<D> {
    pub fn new(
        navigator: Navigator<D>,
        pipeline: ExtractionPipeline,
        collector: EntityCollector,
        cancel: CancelToken,
    ) -> Self {
        Self { navigator, pipeline, collector, cancel, retry_count: 0 }
    }

    /// Sets the configured retry count. It is reported, not used.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn navigator(&self) -> &Navigator<D> {
        &self.navigator
    }

    /// Runs the whole collection.
    ///
    /// Returns `Cancelled` with the records gathered so far when the token fires.
    /// Filter restoration and disconnect run on every path.
    pub fn run(
        &mut self,
        progress: &mut dyn ProgressSink,
        sink: &mut dyn RecordSink,
    ) -> Result<CollectionOutcome, CollectError> {
        let mut tracker = ProgressTracker::start();
        let mut applied = FilterStateFlags::default();
        let mut records = Vec::new();
        let mut count_text = String::new();

        let result = self.collect_all(&mut tracker, progress, sink, &mut applied, &mut records, &mut count_text);
        self.cleanup(&applied);

        match result {
            Ok(status) => {
                let label = match status {
                    CollectionStatus::Completed => "Collection complete",
                    CollectionStatus::Cancelled => "Collection cancelled",
                };
                progress.on_progress(&tracker.phase(label, 100.0, &records));
                info!(
                    "Collection {}: {} record(s) in {:.1}s",
                    status,
                    records.len(),
                    tracker.elapsed().as_secs_f64()
                );
                Ok(CollectionOutcome { status, records, count_text, elapsed: tracker.elapsed() })
            }
            Err(e) => {
                error!("Collection failed: {}", e);
                Err(e)
            }
        }
    }

    fn collect_all(
        &mut self,
        tracker: &mut ProgressTracker,
        progress: &mut dyn ProgressSink,
        sink: &mut dyn RecordSink,
        applied: &mut FilterStateFlags,
        records: &mut Vec<Arc<EntityRecord>>,
        count_text: &mut String,
    ) -> Result<CollectionStatus, CollectError> {
        progress.on_progress(&tracker.phase("Connecting to device", 5.0, records));
        self.navigator.connect().map_err(CollectError::DeviceUnavailable)?;
        self.navigator.refresh_screen_size();
        info!("Navigation retry count is {} (not used)", self.retry_count);

        progress.on_progress(&tracker.phase("Navigating to generals list", 10.0, records));
        self.navigator.navigate_to_list()?;
        *applied = match self.navigator.set_list_state() {
            Ok(flags) => flags,
            Err(e) => {
                *applied = e.applied;
                return Err(CollectError::NavigationFailed(e.source));
            }
        };

        progress.on_progress(&tracker.phase("Counting generals", SETUP_PERCENT, records));
        let (count, text) = self.navigator.read_entity_count(&self.pipeline);
        *count_text = text;
        if count <= 0 {
            return Err(CollectError::NoEntities { count_text: count_text.clone() });
        }
        let total = count as usize;
        tracker.set_total(total);
        info!("Found {} generals ({})", total, count_text);

        for index in 1..=total {
            if self.cancel.is_cancelled() {
                info!("Cancellation requested after {} of {} entities", records.len(), total);
                return Ok(CollectionStatus::Cancelled);
            }

            let record = self.collector.collect(&mut self.navigator, &self.pipeline, index);
            if let Err(e) = sink.on_record(&record) {
                warn!("Failed to export entity {}: {:#}", index, e);
            }
            let status = format!("Processed {} ({}/{})", record.name, index, total);
            records.push(Arc::new(record));
            progress.on_progress(&tracker.entity(&status, records));
        }

        progress.on_progress(&tracker.phase("Restoring list state", 98.0, records));
        Ok(CollectionStatus::Completed)
    }

    fn cleanup(&mut self, applied: &FilterStateFlags) {
        // The filter toggles are only reachable from the list
        if matches!(
            self.navigator.state(),
            NavState::EntityDetail | NavState::CultivationSub | NavState::SpecialtySub | NavState::CovenantSub
        ) {
            if let Err(e) = self.navigator.close_details() {
                warn!("Failed to leave entity details: {}", e);
            }
        }
        self.navigator.reset_list_state(applied);
        self.navigator.disconnect();
    }
}

/// Builds the extraction pipeline, mapping backend failures to `OcrInit`.
pub fn build_pipeline(
    config: &AppConfig,
    registry: Arc<RegionRegistry>,
    debug_dir: Option<PathBuf>,
) -> Result<ExtractionPipeline, CollectError> {
    let backend = create_backend(config).map_err(CollectError::OcrInit)?;
    Ok(ExtractionPipeline::new(registry, backend, PipelineSettings::from_config(config, debug_dir)))
}

/// Wires an ADB-backed session from the configuration.
pub fn build_session(
    config: &AppConfig,
    registry: Arc<RegionRegistry>,
    resources_dir: &Path,
    debug_dir: Option<PathBuf>,
    cancel: CancelToken,
) -> Result<CollectionSession<AdbDevice>, CollectError> {
    let pipeline = build_pipeline(config, registry.clone(), debug_dir)?;
    let navigator = Navigator::new(
        AdbDevice::new(config),
        registry,
        ReferenceImages::new(resources_dir),
        NavigatorTiming::from_config(config),
    );
    let collector = EntityCollector::new(CollectorSettings::from_config(config, resources_dir));
    Ok(CollectionSession::new(navigator, pipeline, collector, cancel)
        .with_retry_count(config.navigation_retry_count))
}

/// Creates a timestamped session folder: `<root>/YYYYMMDD_HHMMSS/`.
pub fn prepare_session_dir(root: &Path) -> Result<PathBuf, CollectError> {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
    let session_dir = root.join(timestamp);
    fs::create_dir_all(&session_dir).map_err(|e| {
        CollectError::Io(anyhow::anyhow!(
            "Failed to create session directory {}: {}",
            session_dir.display(),
            e
        ))
    })?;
    info!("Session folder: {}", session_dir.display());
    Ok(session_dir)
}

/// Runs `session` on a background thread. Progress snapshots go to `progress`.
pub fn spawn_collection<D, P, S>(
    mut session: CollectionSession<D>,
    mut progress: P,
    mut sink: S,
) -> JoinHandle<(Result<CollectionOutcome, CollectError>, S)>
where
    D: Device + Send + 'static,
    P: ProgressSink + Send + 'static,
    S: RecordSink + Send + 'static,
{
    thread::spawn(move || {
        let result = session.run(&mut progress, &mut sink);
        info!("Collection thread finished");
        (result, sink)
    })
}
