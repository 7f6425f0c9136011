//! CSV export for collected entities.
//!
//! Writes one row per entity in append-only mode for crash safety: every record
//! is on disk as soon as it is collected. Slot images are written as PNG files
//! next to the CSV and referenced by relative path.

use anyhow::{Context, Result};
use chrono::Local;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::automation::progress::{running_average, RecordSink};
use crate::automation::record::EntityRecord;
use crate::automation::runner::{CollectError, CollectionOutcome};

/// CSV header row.
const CSV_HEADER: &str = "index,name,level,type,power,exp_ratio,leadership,attack,defense,politics,\
specialties,covenants,average_confidence,uncertain,failures,timestamp,\
specialty_image,covenant_image,type_image,stars_image";

const IMAGES_DIR: &str = "images";

/// Initializes CSV file with header if it doesn't exist or is empty.
///
/// If the file exists and has content, this does nothing (preserves existing data).
pub fn init_csv(path: &Path) -> Result<()> {
    if path.exists() {
        let file = File::open(path).context("Failed to open existing CSV")?;
        let reader = BufReader::new(file);
        if reader.lines().next().is_some() {
            return Ok(());
        }
    }

    let mut file = File::create(path).context("Failed to create CSV file")?;
    writeln!(file, "{}", CSV_HEADER).context("Failed to write CSV header")?;
    Ok(())
}

/// Quotes a field when it holds a comma, quote or line break. Quotes are doubled.
pub fn escape_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Relative paths of the image files written for one record.
#[derive(Debug, Default, Clone)]
pub struct ImagePaths {
    pub specialty: Option<String>,
    pub covenant: Option<String>,
    pub kind: Option<String>,
    pub stars: Option<String>,
}

/// Value of `stat` from the "Stat: value" cultivation entries.
fn cultivation_value<'a>(record: &'a EntityRecord, stat: &str) -> &'a str {
    record
        .cultivation
        .iter()
        .find_map(|entry| entry.strip_prefix(stat).and_then(|rest| rest.strip_prefix(": ")))
        .unwrap_or("")
}

fn format_row(record: &EntityRecord, images: &ImagePaths) -> String {
    let optional = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
    let names = |slots: &[crate::automation::record::NamedImage]| {
        slots.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join("; ")
    };
    let failures = record
        .failures
        .iter()
        .map(|(field, reason)| format!("{}={}", field, reason))
        .collect::<Vec<_>>()
        .join("; ");

    let fields = [
        record.index.to_string(),
        record.name.clone(),
        optional(record.level),
        record.kind.clone(),
        optional(record.power),
        record.exp_ratio.clone(),
        cultivation_value(record, "Leadership").to_string(),
        cultivation_value(record, "Attack").to_string(),
        cultivation_value(record, "Defense").to_string(),
        cultivation_value(record, "Politics").to_string(),
        names(&record.specialties),
        names(&record.covenants),
        format!("{:.3}", record.average_confidence()),
        record.is_uncertain.to_string(),
        failures,
        record.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string(),
        images.specialty.clone().unwrap_or_default(),
        images.covenant.clone().unwrap_or_default(),
        images.kind.clone().unwrap_or_default(),
        images.stars.clone().unwrap_or_default(),
    ];
    fields.iter().map(|f| escape_field(f)).collect::<Vec<_>>().join(",")
}

/// Appends one result row to the CSV file.
///
/// Opens the file in append mode for each write, ensuring crash safety.
pub fn append_to_csv(path: &Path, record: &EntityRecord, images: &ImagePaths) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .context("Failed to open CSV for append")?;

    writeln!(file, "{}", format_row(record, images)).context("Failed to write CSV row")?;
    Ok(())
}

/// Run totals written to `summary.json` at the end of a session.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub status: String,
    pub count_text: String,
    pub records: usize,
    pub uncertain: usize,
    pub average_confidence: f32,
    pub elapsed_secs: f64,
    pub error: Option<String>,
    pub finished_at: String,
}

impl ExportSummary {
    pub fn from_outcome(outcome: &CollectionOutcome) -> Self {
        Self {
            status: outcome.status.to_string(),
            count_text: outcome.count_text.clone(),
            records: outcome.records.len(),
            uncertain: outcome.uncertain_count(),
            average_confidence: running_average(&outcome.records),
            elapsed_secs: outcome.elapsed.as_secs_f64(),
            error: None,
            finished_at: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }

    /// Summary for a run that ended in a terminal error after `exported` rows.
    pub fn failed(error: &CollectError, exported: usize) -> Self {
        let count_text = match error {
            CollectError::NoEntities { count_text } => count_text.clone(),
            _ => String::new(),
        };
        Self {
            status: "failed".to_string(),
            count_text,
            records: exported,
            uncertain: 0,
            average_confidence: 0.0,
            elapsed_secs: 0.0,
            error: Some(error.to_string()),
            finished_at: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

/// Per-session exporter: `results.csv`, `images/` and `summary.json`.
pub struct CsvExporter {
    session_dir: PathBuf,
    csv_path: PathBuf,
    rows_written: usize,
}

impl CsvExporter {
    pub fn create(session_dir: &Path) -> Result<Self> {
        fs::create_dir_all(session_dir.join(IMAGES_DIR)).context("Failed to create images directory")?;
        let csv_path = session_dir.join("results.csv");
        init_csv(&csv_path)?;
        info!("Results CSV: {}", csv_path.display());
        Ok(Self { session_dir: session_dir.to_path_buf(), csv_path, rows_written: 0 })
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    fn save_image(&self, index: usize, label: &str, png: Option<&Vec<u8>>) -> Result<Option<String>> {
        let Some(png) = png else {
            return Ok(None);
        };
        let relative = format!("{}/entity_{:03}_{}.png", IMAGES_DIR, index, label);
        let path = self.session_dir.join(&relative);
        fs::write(&path, png).with_context(|| format!("Failed to write {}", path.display()))?;
        debug!("Saved {}", path.display());
        Ok(Some(relative))
    }

    fn save_images(&self, record: &EntityRecord) -> Result<ImagePaths> {
        Ok(ImagePaths {
            specialty: self.save_image(record.index, "specialties", record.specialty_image.as_ref())?,
            covenant: self.save_image(record.index, "covenants", record.covenant_image.as_ref())?,
            kind: self.save_image(record.index, "type", record.type_image.as_ref())?,
            stars: self.save_image(record.index, "stars", record.stars_image.as_ref())?,
        })
    }

    pub fn write_summary(&self, summary: &ExportSummary) -> Result<PathBuf> {
        let path = self.session_dir.join("summary.json");
        let json = serde_json::to_string_pretty(summary).context("Failed to serialize summary")?;
        fs::write(&path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Summary written to {}", path.display());
        Ok(path)
    }
}

impl RecordSink for CsvExporter {
    fn on_record(&mut self, record: &EntityRecord) -> Result<()> {
        let images = self.save_images(record)?;
        append_to_csv(&self.csv_path, record, &images)?;
        self.rows_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::record::NamedImage;
    use crate::automation::runner::CollectionStatus;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn sample_record(index: usize) -> EntityRecord {
        let mut record = EntityRecord::new(index);
        record.name = "Caesar".to_string();
        record.level = Some(45);
        record.power = Some(143657);
        record.exp_ratio = "1,234/5,000".to_string();
        record.cultivation = vec![
            "Leadership: 85+15".to_string(),
            "Attack: 92+1".to_string(),
            "Defense: Unknown".to_string(),
            "Politics: 81-3".to_string(),
        ];
        record.specialties = vec![
            NamedImage { name: "Conqueror".to_string(), image: None },
            NamedImage { name: "Blitz".to_string(), image: None },
        ];
        record.set_confidence("name", 0.9);
        record.specialty_image = Some(vec![1, 2, 3]);
        record
    }

    #[test]
    fn test_init_csv_creates_header() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("test.csv");

        init_csv(&csv_path).unwrap();

        let content = std::fs::read_to_string(&csv_path).unwrap();
        assert!(content.starts_with(CSV_HEADER));
    }

    #[test]
    fn test_init_csv_preserves_existing() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("test.csv");

        std::fs::write(&csv_path, "existing,data\n1,2,3\n").unwrap();

        init_csv(&csv_path).unwrap();

        let content = std::fs::read_to_string(&csv_path).unwrap();
        assert!(content.starts_with("existing,data"));
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("Caesar"), "Caesar");
        assert_eq!(escape_field("1,234/5,000"), "\"1,234/5,000\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn test_row_layout() {
        let row = format_row(&sample_record(7), &ImagePaths::default());
        assert!(row.starts_with("7,Caesar,45,Unknown,143657,\"1,234/5,000\",85+15,92+1,Unknown,81-3,Conqueror; Blitz,,"));
        assert_eq!(row.matches(',').count(), CSV_HEADER.matches(',').count() + 2);
    }

    #[test]
    fn test_covenant_column_holds_pairs_or_placeholder() {
        let named = |name: &str| NamedImage { name: name.to_string(), image: None };

        let mut inactive = sample_record(1);
        inactive.covenants = vec![named("No Covenant")];
        let row = format_row(&inactive, &ImagePaths::default());
        assert!(row.contains(",Conqueror; Blitz,No Covenant,"), "{}", row);

        let mut full = sample_record(2);
        full.covenants = ["Scipio", "Hannibal", "Unknown Covenant", "Cyrus"].map(named).to_vec();
        let row = format_row(&full, &ImagePaths::default());
        assert!(row.contains(",Scipio; Hannibal; Unknown Covenant; Cyrus,"), "{}", row);
        assert_eq!(row.matches(',').count(), CSV_HEADER.matches(',').count() + 2);
    }

    #[test]
    fn test_exporter_appends_rows_and_images() {
        let dir = tempdir().unwrap();
        let mut exporter = CsvExporter::create(dir.path()).unwrap();

        exporter.on_record(&sample_record(1)).unwrap();
        exporter.on_record(&EntityRecord::new(2)).unwrap();

        let content = std::fs::read_to_string(exporter.csv_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 data rows
        assert!(lines[1].contains("images/entity_001_specialties.png"));
        assert!(lines[2].starts_with("2,Unknown,,Unknown,,Unknown"));
        assert!(dir.path().join("images/entity_001_specialties.png").exists());
        assert_eq!(exporter.rows_written(), 2);
    }

    #[test]
    fn test_summary_json() {
        let dir = tempdir().unwrap();
        let exporter = CsvExporter::create(dir.path()).unwrap();
        let outcome = CollectionOutcome {
            status: CollectionStatus::Cancelled,
            records: vec![Arc::new(sample_record(1)), Arc::new(EntityRecord::new(2))],
            count_text: "2/40".to_string(),
            elapsed: Duration::from_secs(3),
        };

        let path = exporter.write_summary(&ExportSummary::from_outcome(&outcome)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["status"], "cancelled");
        assert_eq!(value["count_text"], "2/40");
        assert_eq!(value["records"], 2);
        assert_eq!(value["error"], serde_json::Value::Null);
    }

    #[test]
    fn test_failed_summary_keeps_count_text() {
        let err = CollectError::NoEntities { count_text: "abc".to_string() };
        let summary = ExportSummary::failed(&err, 0);
        assert_eq!(summary.status, "failed");
        assert_eq!(summary.count_text, "abc");
        assert!(summary.error.unwrap().contains("no entities"));
    }
}
