pub mod engine;
pub mod extract;
pub mod http;
pub mod preprocess;
pub mod setup;

pub use engine::{OcrBackend, OcrFragment, TesseractBackend};
pub use extract::{
    ExtractionFailure, ExtractionPipeline, ExtractionResult, FailureReason, PipelineSettings,
    ResultKind,
};
pub use http::HttpOcrBackend;

use anyhow::Result;
use tracing::info;

use crate::automation::config::{AppConfig, OcrEngineKind};

/// Builds the OCR backend selected in the configuration.
pub fn create_backend(config: &AppConfig) -> Result<Box<dyn OcrBackend>> {
    let backend: Box<dyn OcrBackend> = match config.ocr_engine_kind() {
        OcrEngineKind::EasyOcr => {
            Box::new(HttpOcrBackend::connect(&config.ocr_server_url, &config.ocr_languages)?)
        }
        OcrEngineKind::Tesseract => Box::new(TesseractBackend::new(&config.ocr_languages)?),
    };
    info!("{} OCR engine initialized", backend.name());
    Ok(backend)
}
