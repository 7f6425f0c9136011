//! Client for an EasyOCR-compatible HTTP recognition server.
//!
//! The server takes a base64 PNG and returns text boxes with a score each:
//! `POST /ocr {"image_base64": "...", "languages": ["en"]}` →
//! `{"boxes": [{"box": [[x, y], ...], "text": "...", "score": 0.93}]}`.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use image::{GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

use super::engine::{OcrBackend, OcrFragment};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Serialize)]
struct ImageRequest<'a> {
    image_base64: String,
    languages: &'a [String],
}

#[derive(Deserialize, Clone, Debug)]
struct TextBox {
    #[serde(rename = "box", default)]
    bbox: Vec<Vec<f64>>,
    text: String,
    score: f64,
}

#[derive(Deserialize)]
struct OcrResponse {
    boxes: Vec<TextBox>,
}

impl TextBox {
    fn left_x(&self) -> f64 {
        self.bbox.iter().filter_map(|p| p.first().copied()).fold(f64::INFINITY, f64::min)
    }
}

pub struct HttpOcrBackend {
    client: reqwest::blocking::Client,
    base_url: String,
    languages: Vec<String>,
}

impl HttpOcrBackend {
    /// Creates the client and checks that the server answers `/health`.
    pub fn connect(base_url: &str, languages: &[String]) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        let backend = Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            languages: languages.to_vec(),
        };
        backend.health_check()?;
        info!("OCR server reachable at {}", backend.base_url);
        Ok(backend)
    }

    pub fn health_check(&self) -> Result<()> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("OCR server health check failed: {}", url))?;
        if !response.status().is_success() {
            return Err(anyhow!("OCR server unhealthy: HTTP {}", response.status()));
        }
        Ok(())
    }

    fn encode_image(img: &GrayImage) -> Result<String> {
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .context("Failed to encode image")?;
        Ok(general_purpose::STANDARD.encode(&buffer))
    }
}

impl OcrBackend for HttpOcrBackend {
    fn name(&self) -> &str {
        "easyocr"
    }

    fn recognize(&self, img: &GrayImage) -> Result<Vec<OcrFragment>> {
        let image_base64 = Self::encode_image(img)?;
        let url = format!("{}/ocr", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&ImageRequest { image_base64, languages: &self.languages })
            .send()
            .context("OCR request failed")?;

        if !response.status().is_success() {
            let error_text = response.text().unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!("OCR server error: {}", error_text));
        }

        let data: OcrResponse = response.json().context("Failed to parse OCR response")?;
        let fragments = boxes_to_fragments(data.boxes);
        debug!("OCR server returned {} box(es)", fragments.len());
        Ok(fragments)
    }
}

/// Orders boxes left to right and converts them to fragments.
fn boxes_to_fragments(mut boxes: Vec<TextBox>) -> Vec<OcrFragment> {
    boxes.sort_by(|a, b| a.left_x().partial_cmp(&b.left_x()).unwrap_or(std::cmp::Ordering::Equal));
    boxes
        .into_iter()
        .filter(|b| !b.text.trim().is_empty())
        .map(|b| OcrFragment {
            text: b.text.trim().to_string(),
            confidence: (b.score as f32).clamp(0.0, 1.0),
        })
        .collect()
}
