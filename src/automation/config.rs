//! Configuration types for collection runs.
//!
//! Loads settings from config.json at startup. Provides thresholds, timing
//! parameters, device settings and OCR engine selection. Every key is optional;
//! missing keys take their defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// OCR engine selected by the `ocr_engine` key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OcrEngineKind {
    /// EasyOCR-compatible HTTP recognition server
    EasyOcr,
    /// Local tesseract executable
    Tesseract,
}

impl OcrEngineKind {
    /// Parses the config value. Unknown names fall back to EasyOCR.
    pub fn from_config(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "tesseract" => OcrEngineKind::Tesseract,
            "easyocr" => OcrEngineKind::EasyOcr,
            other => {
                warn!("Unknown OCR engine '{}', falling back to easyocr", other);
                OcrEngineKind::EasyOcr
            }
        }
    }
}

/// Pixel check on the cultivation screen that tells the two entity variants apart.
///
/// When the color is absent at `region`, the entity is the reduced variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VariantMarker {
    pub region: String,
    pub rgb: [u8; 3],
    pub tolerance: f32,
}

impl Default for VariantMarker {
    fn default() -> Self {
        Self {
            region: "GeneralsListCultivateVariant".to_string(),
            rgb: [255, 206, 66],
            tolerance: 10.0,
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path to the adb executable. Empty means auto-discover.
    pub adb_path: String,
    /// ADB serial of the emulator
    pub device_id: String,
    /// Per-command adb timeout (seconds)
    pub adb_timeout_secs: u64,
    /// Timeout for `adb connect` and `adb devices` (seconds)
    pub adb_connect_timeout_secs: u64,

    /// "easyocr" or "tesseract"
    pub ocr_engine: String,
    /// Language codes handed to the OCR engine
    pub ocr_languages: Vec<String>,
    /// Base URL of the EasyOCR-compatible server
    pub ocr_server_url: String,
    /// Baseline acceptance bar for unprocessed OCR fragments; also the uncertainty threshold
    pub confidence_threshold: f32,
    /// Acceptance bar for fragments read from preprocessed crops
    pub postprocessed_confidence_threshold: f32,
    /// Apply region-class enhancement before OCR
    pub preprocessing_enabled: bool,
    /// Resolution the OCR region table is resolved against
    pub ocr_reference_resolution: [u32; 2],

    /// Extra wait after every navigation tap (seconds)
    pub screen_transition_delay: f32,
    /// Read and logged, not consulted by any retry loop
    pub navigation_retry_count: u32,

    /// Region preset file (relative paths resolve against the executable dir)
    pub regions_file: String,
    /// Directory with reference and template images
    pub resources_dir: String,
    /// Template (inside resources_dir) identifying the first power label layout
    pub power_label_template: String,
    pub reduced_variant_marker: VariantMarker,

    /// Persist every cropped and processed region image
    pub debug_mode: bool,
    /// Default tracing filter when RUST_LOG is unset
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adb_path: String::new(),
            device_id: "127.0.0.1:5555".to_string(),
            adb_timeout_secs: 30,
            adb_connect_timeout_secs: 15,
            ocr_engine: "easyocr".to_string(),
            ocr_languages: vec!["en".to_string()],
            ocr_server_url: "http://127.0.0.1:39835".to_string(),
            confidence_threshold: 0.8,
            postprocessed_confidence_threshold: 0.4,
            preprocessing_enabled: true,
            ocr_reference_resolution: [540, 960],
            screen_transition_delay: 0.5,
            navigation_retry_count: 3,
            regions_file: "regions.json".to_string(),
            resources_dir: "resources".to_string(),
            power_label_template: "PowerLabel.png".to_string(),
            reduced_variant_marker: VariantMarker::default(),
            debug_mode: false,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    pub fn ocr_engine_kind(&self) -> OcrEngineKind {
        OcrEngineKind::from_config(&self.ocr_engine)
    }

    /// Transition delay as a duration. Negative or non-finite values count as zero.
    pub fn transition_delay(&self) -> Duration {
        if self.screen_transition_delay.is_finite() && self.screen_transition_delay > 0.0 {
            Duration::from_secs_f32(self.screen_transition_delay)
        } else {
            Duration::ZERO
        }
    }

    pub fn reference_resolution(&self) -> (u32, u32) {
        (self.ocr_reference_resolution[0], self.ocr_reference_resolution[1])
    }
}

/// Loads configuration from `path` or returns defaults.
///
/// A missing or unparsable file is replaced by the defaults and the reason is
/// returned alongside, since logging is configured from the result.
pub fn load_config(path: &Path) -> (AppConfig, Option<String>) {
    if !path.exists() {
        return (AppConfig::default(), Some(format!("{} not found, using defaults", path.display())));
    }

    let reason = match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(config) => return (config, None),
            Err(e) => format!("Failed to parse {}: {}. Using defaults", path.display(), e),
        },
        Err(e) => format!("Failed to read {}: {}. Using defaults", path.display(), e),
    };
    (AppConfig::default(), Some(reason))
}
