//! Collection automation for the generals list.
//!
//! This module provides:
//! - Navigation through the list and its sub-screens with filter restoration
//! - Reference-image checks for toggles and inactive buttons
//! - Per-entity collection with confidence scoring
//! - A runner with progress reporting and cooperative cancellation
//! - CSV result output

pub mod collector;
pub mod config;
pub mod csv_writer;
pub mod detection;
pub mod navigator;
pub mod progress;
pub mod record;
pub mod runner;

#[cfg(test)]
pub(crate) mod test_support;

pub use collector::{CollectorSettings, EntityCollector};
pub use config::{load_config, AppConfig};
pub use csv_writer::{CsvExporter, ExportSummary};
pub use navigator::{FilterStateFlags, NavState, Navigator, NavigatorTiming};
pub use progress::{CancelToken, CollectionProgress, ProgressSink, RecordSink};
pub use record::{EntityRecord, NamedImage};
pub use runner::{
    build_session, prepare_session_dir, spawn_collection, CollectError, CollectionOutcome,
    CollectionSession, CollectionStatus,
};
