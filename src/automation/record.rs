//! Per-entity record assembled by the collector.

use chrono::{DateTime, Local};
use std::collections::BTreeMap;

use crate::ocr::extract::FailureReason;

/// A name read off a slot together with the slot's cropped image.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedImage {
    pub name: String,
    /// PNG bytes, `None` when the crop failed
    pub image: Option<Vec<u8>>,
}

/// One collected entity.
///
/// Field values that could not be read hold an "Unknown ..." placeholder (or `None`
/// for numbers) and the matching confidence entry is zero.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    /// 1-based position in the list
    pub index: usize,
    pub name: String,
    pub level: Option<i64>,
    /// Type classification ("Ground", "Mounted", ... or "Unknown")
    pub kind: String,
    pub power: Option<i64>,
    /// Experience ratio as displayed, e.g. "1,234/5,000"
    pub exp_ratio: String,
    /// "Stat: value" entries in display order
    pub cultivation: Vec<String>,
    pub specialties: Vec<NamedImage>,
    /// Either one entry per covenant slot (4) or a single placeholder
    /// ("No Covenant", "No Covenant Data") when the covenant view was not read.
    /// The exporter joins the names into one column either way.
    pub covenants: Vec<NamedImage>,
    /// Specialty slot images composited side by side
    pub specialty_image: Option<Vec<u8>>,
    /// Covenant slot images composited side by side
    pub covenant_image: Option<Vec<u8>>,
    pub type_image: Option<Vec<u8>>,
    pub stars_image: Option<Vec<u8>>,
    /// Field or group name → confidence in [0, 1]
    pub confidence: BTreeMap<String, f32>,
    /// Field name → why it could not be read
    pub failures: BTreeMap<String, FailureReason>,
    pub is_uncertain: bool,
    pub timestamp: DateTime<Local>,
}

impl EntityRecord {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            name: "Unknown".to_string(),
            level: None,
            kind: "Unknown".to_string(),
            power: None,
            exp_ratio: "Unknown".to_string(),
            cultivation: Vec::new(),
            specialties: Vec::new(),
            covenants: Vec::new(),
            specialty_image: None,
            covenant_image: None,
            type_image: None,
            stars_image: None,
            confidence: BTreeMap::new(),
            failures: BTreeMap::new(),
            is_uncertain: true,
            timestamp: Local::now(),
        }
    }

    /// Records a confidence score, clamped to [0, 1]. NaN counts as zero.
    pub fn set_confidence(&mut self, field: &str, value: f32) {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        self.confidence.insert(field.to_string(), value);
    }

    /// Marks a field as unreadable: zero confidence plus the reason.
    pub fn set_failure(&mut self, field: &str, reason: FailureReason) {
        self.confidence.insert(field.to_string(), 0.0);
        self.failures.insert(field.to_string(), reason);
    }

    /// Records why a sub-field was missed without adding a confidence entry.
    /// The owning group's confidence already accounts for it.
    pub fn note_failure(&mut self, field: &str, reason: FailureReason) {
        self.failures.insert(field.to_string(), reason);
    }

    /// Mean of all recorded confidences, 0 when nothing was recorded.
    pub fn average_confidence(&self) -> f32 {
        if self.confidence.is_empty() {
            return 0.0;
        }
        let sum: f32 = self.confidence.values().sum();
        sum / self.confidence.len() as f32
    }

    /// Derives `is_uncertain` from the current confidence map.
    pub fn finalize(&mut self, threshold: f32) {
        self.is_uncertain = self.average_confidence() < threshold;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_record_is_uncertain() {
        let mut record = EntityRecord::new(1);
        record.finalize(0.8);
        assert_eq!(record.average_confidence(), 0.0);
        assert!(record.is_uncertain);
    }

    #[test]
    fn test_uncertainty_follows_average() {
        let mut record = EntityRecord::new(1);
        record.set_confidence("name", 0.9);
        record.set_confidence("power", 0.8);
        record.finalize(0.8);
        assert!((record.average_confidence() - 0.85).abs() < 1e-6);
        assert!(!record.is_uncertain);

        record.set_failure("level", FailureReason::Illegible);
        record.finalize(0.8);
        assert!(record.is_uncertain);
        assert_eq!(record.failures.get("level"), Some(&FailureReason::Illegible));
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut record = EntityRecord::new(1);
        record.set_confidence("a", 1.7);
        record.set_confidence("b", -0.2);
        record.set_confidence("c", f32::NAN);
        let avg = record.average_confidence();
        assert!((0.0..=1.0).contains(&avg));
        assert_eq!(record.confidence["a"], 1.0);
        assert_eq!(record.confidence["c"], 0.0);
    }
}
