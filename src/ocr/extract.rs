//! Region-based extraction: crop, enhance, recognize, filter by confidence.
//!
//! Every operation returns either a typed result or an [`ExtractionFailure`]
//! carrying the region and a reason code. Nothing here panics on bad input and
//! nothing is retried.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::engine::OcrBackend;
use super::preprocess::{crop_rect, enhance_for_class};
use crate::automation::config::AppConfig;
use crate::device::Frame;
use crate::regions::{RegionClass, RegionPreset, RegionRegistry, Resolved};

/// Comma-grouped or plain digit runs.
const NUMBER_PATTERN: &str = r"\d+(?:,\d{3})*";

/// Number confidence is the text confidence scaled by this.
const NUMBER_CONFIDENCE_FACTOR: f32 = 0.95;

/// Acceptance bar ceiling for character-heavy regions after enhancement.
const CHARACTER_HEAVY_THRESHOLD_CAP: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Region name not in the registry
    UnknownRegion,
    /// Region resolves to nothing inside the frame
    EmptyRegion,
    /// Screenshot bytes could not be decoded
    DecodeFailed,
    /// OCR backend returned an error
    OcrFailed,
    /// OCR produced nothing above the acceptance threshold
    Illegible,
    /// Text was read but held no number
    NoNumber,
    /// Device did not return a screenshot
    NoScreenshot,
    /// Sub-screen inactive for this entity
    NotAvailable,
    /// Device rejected a tap
    TapFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownRegion => "unknown_region",
            FailureReason::EmptyRegion => "empty_region",
            FailureReason::DecodeFailed => "decode_failed",
            FailureReason::OcrFailed => "ocr_failed",
            FailureReason::Illegible => "illegible",
            FailureReason::NoNumber => "no_number",
            FailureReason::NoScreenshot => "no_screenshot",
            FailureReason::NotAvailable => "not_available",
            FailureReason::TapFailed => "tap_failed",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{region}: {reason}")]
pub struct ExtractionFailure {
    pub region: String,
    pub reason: FailureReason,
}

impl ExtractionFailure {
    pub fn new(region: &str, reason: FailureReason) -> Self {
        Self { region: region.to_string(), reason }
    }
}

pub type Extraction<T> = Result<T, ExtractionFailure>;

#[derive(Debug, Clone, PartialEq)]
pub struct TextResult {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NumberResult {
    pub value: Option<i64>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageResult {
    /// PNG bytes
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// What to pull out of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Text,
    Number,
    Image,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionResult {
    Text(TextResult),
    Number(NumberResult),
    Image(ImageResult),
}

impl ExtractionResult {
    /// Image crops carry no recognition uncertainty and report 1.0.
    pub fn confidence(&self) -> f32 {
        match self {
            ExtractionResult::Text(t) => t.confidence,
            ExtractionResult::Number(n) => n.confidence,
            ExtractionResult::Image(_) => 1.0,
        }
    }
}

/// Thresholds and switches the pipeline reads from the configuration.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub confidence_threshold: f32,
    pub postprocessed_confidence_threshold: f32,
    pub preprocessing_enabled: bool,
    /// Resolution the OCR regions are resolved against
    pub reference_size: (u32, u32),
    /// Where crops are written when debugging, `None` to disable
    pub debug_dir: Option<PathBuf>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig, debug_dir: Option<PathBuf>) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            postprocessed_confidence_threshold: config.postprocessed_confidence_threshold,
            preprocessing_enabled: config.preprocessing_enabled,
            reference_size: config.reference_resolution(),
            debug_dir: if config.debug_mode { debug_dir } else { None },
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default(), None)
    }
}

pub struct ExtractionPipeline {
    registry: Arc<RegionRegistry>,
    backend: Box<dyn OcrBackend>,
    settings: PipelineSettings,
}

impl ExtractionPipeline {
    pub fn new(
        registry: Arc<RegionRegistry>,
        backend: Box<dyn OcrBackend>,
        settings: PipelineSettings,
    ) -> Self {
        if let Some(dir) = &settings.debug_dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create debug image dir {}: {}", dir.display(), e);
            }
        }
        Self { registry, backend, settings }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Minimum fragment confidence for a region of `class`.
    pub fn acceptance_threshold(&self, class: RegionClass, preprocessed: bool) -> f32 {
        if !preprocessed {
            return self.settings.confidence_threshold;
        }
        match class {
            RegionClass::CharacterHeavy => self
                .settings
                .postprocessed_confidence_threshold
                .min(CHARACTER_HEAVY_THRESHOLD_CAP),
            RegionClass::Standard => self.settings.postprocessed_confidence_threshold,
        }
    }

    /// Dispatches to the extraction matching `kind`.
    pub fn extract(&self, frame: &Frame, region: &str, kind: ResultKind) -> Extraction<ExtractionResult> {
        match kind {
            ResultKind::Text => self.extract_text(frame, region).map(ExtractionResult::Text),
            ResultKind::Number => self.extract_number(frame, region).map(ExtractionResult::Number),
            ResultKind::Image => self.extract_image(frame, region).map(ExtractionResult::Image),
        }
    }

    pub fn extract_text(&self, frame: &Frame, region: &str) -> Extraction<TextResult> {
        let preset = self.preset(region)?;
        let crop = self.crop(frame, preset)?;
        self.save_debug(&DynamicImage::ImageRgb8(crop.clone()), region);

        let preprocessed = self.settings.preprocessing_enabled;
        let ocr_input = if preprocessed {
            let enhanced = enhance_for_class(&crop, preset.class);
            self.save_debug(
                &DynamicImage::ImageLuma8(enhanced.clone()),
                &format!("{}_postprocessed", region),
            );
            enhanced
        } else {
            image::imageops::grayscale(&crop)
        };

        let fragments = self.backend.recognize(&ocr_input).map_err(|e| {
            warn!("OCR failed for {}: {:#}", region, e);
            ExtractionFailure::new(region, FailureReason::OcrFailed)
        })?;

        let threshold = self.acceptance_threshold(preset.class, preprocessed);
        let accepted: Vec<_> = fragments.iter().filter(|f| f.confidence >= threshold).collect();
        if accepted.is_empty() {
            debug!(
                "{}: {} fragment(s), none at or above {:.2}",
                region,
                fragments.len(),
                threshold
            );
            return Err(ExtractionFailure::new(region, FailureReason::Illegible));
        }

        let text = accepted.iter().map(|f| f.text.as_str()).collect::<Vec<_>>().join(" ");
        let confidence =
            accepted.iter().map(|f| f.confidence).sum::<f32>() / accepted.len() as f32;
        debug!("{}: '{}' ({:.2})", region, text, confidence);
        Ok(TextResult { text, confidence })
    }

    /// Reads text and keeps the largest number in it.
    pub fn extract_number(&self, frame: &Frame, region: &str) -> Extraction<NumberResult> {
        let text = self.extract_text(frame, region)?;
        match parse_largest_number(&text.text) {
            Some(value) => Ok(NumberResult {
                value: Some(value),
                confidence: text.confidence * NUMBER_CONFIDENCE_FACTOR,
            }),
            None => Err(ExtractionFailure::new(region, FailureReason::NoNumber)),
        }
    }

    /// Crops the region and returns it PNG-encoded.
    pub fn extract_image(&self, frame: &Frame, region: &str) -> Extraction<ImageResult> {
        let preset = self.preset(region)?;
        let crop = self.crop(frame, preset)?;
        let image = DynamicImage::ImageRgb8(crop);
        self.save_debug(&image, region);
        let png = encode_png(&image).ok_or_else(|| ExtractionFailure::new(region, FailureReason::DecodeFailed))?;
        Ok(ImageResult { png, width: image.width(), height: image.height() })
    }

    /// True when the pixel at the region's anchor is within `tolerance`
    /// (Euclidean RGB distance) of `rgb`. Out-of-frame anchors never match.
    pub fn check_pixel_color(&self, frame: &Frame, region: &str, rgb: [u8; 3], tolerance: f32) -> Extraction<bool> {
        let preset = self.preset(region)?;
        let (x, y) = match preset.resolve(self.settings.reference_size) {
            Resolved::Rect(rect) if rect.x0 == rect.x1 && rect.y0 == rect.y1 => (rect.x0, rect.y0),
            resolved => resolved.anchor(),
        };
        let (width, height) = frame.size();
        if x >= width || y >= height {
            warn!(
                "Pixel ({}, {}) for {} out of bounds for {}x{}",
                x, y, region, width, height
            );
            return Ok(false);
        }

        let p = frame.image.get_pixel(x, y);
        let distance = color_distance([p[0], p[1], p[2]], rgb);
        let matches = distance <= tolerance;
        debug!(
            "Pixel check {} at ({}, {}): expected {:?}, got {:?}, distance {:.2}, matches: {}",
            region, x, y, rgb, p.0, distance, matches
        );
        Ok(matches)
    }

    /// Correlates the region against the template image at `template_path`.
    ///
    /// A missing or unreadable template counts as no match.
    pub fn check_template_match(
        &self,
        frame: &Frame,
        region: &str,
        template_path: &Path,
        threshold: f32,
    ) -> Extraction<bool> {
        let template = match image::open(template_path) {
            Ok(img) => img.to_luma8(),
            Err(e) => {
                warn!("Could not load template {}: {}", template_path.display(), e);
                return Ok(false);
            }
        };
        let correlation = self.template_correlation(frame, region, &template)?;
        let matched = correlation >= threshold;
        debug!(
            "Template match for {} vs {}: correlation={:.3}, threshold={}, match={}",
            region,
            template_path.display(),
            correlation,
            threshold,
            matched
        );
        Ok(matched)
    }

    /// Pearson correlation between the grayscale region and `template` resized to it.
    pub fn template_correlation(&self, frame: &Frame, region: &str, template: &GrayImage) -> Extraction<f32> {
        let preset = self.preset(region)?;
        let crop = image::imageops::grayscale(&self.crop(frame, preset)?);
        let template = if template.dimensions() == crop.dimensions() {
            template.clone()
        } else {
            image::imageops::resize(template, crop.width(), crop.height(), FilterType::Lanczos3)
        };
        Ok(correlation(&crop, &template))
    }

    fn preset(&self, region: &str) -> Extraction<&RegionPreset> {
        self.registry.get(region).map_err(|_| {
            warn!("Unknown region: {}", region);
            ExtractionFailure::new(region, FailureReason::UnknownRegion)
        })
    }

    fn crop(&self, frame: &Frame, preset: &RegionPreset) -> Extraction<RgbImage> {
        match preset.resolve(self.settings.reference_size) {
            Resolved::Rect(rect) => crop_rect(&frame.image, &rect)
                .ok_or_else(|| ExtractionFailure::new(&preset.name, FailureReason::EmptyRegion)),
            Resolved::Point { .. } => Err(ExtractionFailure::new(&preset.name, FailureReason::EmptyRegion)),
        }
    }

    fn save_debug(&self, image: &DynamicImage, name: &str) {
        let Some(dir) = &self.settings.debug_dir else {
            return;
        };
        let path = dir.join(format!("ocr_{}.png", name));
        match image.save(&path) {
            Ok(()) => debug!("Saved debug image: {}", path.display()),
            Err(e) => warn!("Failed to save debug image {}: {}", path.display(), e),
        }
    }
}

/// Finds every digit run (commas allowed as thousands separators) and returns the largest.
pub fn parse_largest_number(text: &str) -> Option<i64> {
    let re = Regex::new(NUMBER_PATTERN).ok()?;
    re.find_iter(text)
        .filter_map(|m| m.as_str().replace(',', "").parse::<i64>().ok())
        .max()
}

pub fn encode_png(image: &DynamicImage) -> Option<Vec<u8>> {
    let mut buffer = Vec::new();
    image.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png).ok()?;
    Some(buffer)
}

fn color_distance(a: [u8; 3], b: [u8; 3]) -> f32 {
    let sum: f32 = (0..3).map(|c| (a[c] as f32 - b[c] as f32).powi(2)).sum();
    sum.sqrt()
}

/// Pearson correlation of two equally sized grayscale images. Undefined
/// correlation (a constant image) is reported as a perfect match.
pub fn correlation(a: &GrayImage, b: &GrayImage) -> f32 {
    let n = a.as_raw().len().min(b.as_raw().len());
    if n == 0 {
        return 1.0;
    }
    let xs = &a.as_raw()[..n];
    let ys = &b.as_raw()[..n];
    let mean_x = xs.iter().map(|&v| v as f64).sum::<f64>() / n as f64;
    let mean_y = ys.iter().map(|&v| v as f64).sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (&x, &y) in xs.iter().zip(ys) {
        let dx = x as f64 - mean_x;
        let dy = y as f64 - mean_y;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }

    let r = cov / (var_x * var_y).sqrt();
    if r.is_nan() { 1.0 } else { r as f32 }
}
