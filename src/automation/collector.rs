//! Per-entity collection: base fields, then the cultivation, specialty and
//! covenant sub-screens.
//!
//! Nothing in here aborts an entity. A field that cannot be read gets a
//! placeholder value and a zero confidence, a sub-screen that cannot be entered
//! marks its whole group, and the entity is always returned.

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbaImage};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::automation::config::{AppConfig, VariantMarker};
use crate::automation::navigator::{NavError, NavState, Navigator, Transition};
use crate::automation::record::{EntityRecord, NamedImage};
use crate::device::{Device, Frame};
use crate::ocr::extract::{encode_png, ExtractionPipeline, ExtractionResult, FailureReason, ResultKind};

/// Cultivation stats in display order. Each has a `GeneralsListCultivate<Stat>` region.
pub const CULTIVATION_STATS: [&str; 4] = ["Leadership", "Attack", "Defense", "Politics"];

/// Main entity plus its three covenant partners.
pub const COVENANT_SLOTS: usize = 4;

const NAME_PREFIX_PATTERN: &str = r"(?i)^(lv|level)\s*\d+\s+";

const UNKNOWN_SPECIALTY: &str = "Unknown Specialty";
const UNKNOWN_COVENANT: &str = "Unknown Covenant";

/// Layout variant of an entity, read off the cultivation screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Full,
    Reduced,
}

impl Variant {
    pub fn specialty_slots(&self) -> usize {
        match self {
            Variant::Full => 5,
            Variant::Reduced => 3,
        }
    }

    /// Region tapped to select specialty `slot` (1-based).
    pub fn specialty_tap_region(&self, slot: usize) -> String {
        match self {
            Variant::Full => format!("GeneralsListSpecialty{}", slot),
            Variant::Reduced => format!("GeneralsListSpecialtyReduced{}", slot),
        }
    }

    /// Region holding the icon of specialty `slot` (1-based).
    pub fn specialty_image_region(&self, slot: usize) -> String {
        match self {
            Variant::Full => format!("GeneralsListSpecialtyImage{}", slot),
            Variant::Reduced => format!("GeneralsListSpecialtyImageReduced{}", slot),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Average confidence below this marks an entity uncertain
    pub confidence_threshold: f32,
    pub variant_marker: VariantMarker,
    /// Template telling the two power/experience layouts apart
    pub power_label_template: Option<PathBuf>,
    /// (type name, grayscale template) pairs for type classification
    pub type_templates: Vec<(String, GrayImage)>,
    pub type_match_threshold: f32,
    pub power_label_threshold: f32,
}

impl CollectorSettings {
    pub fn from_config(config: &AppConfig, resources_dir: &Path) -> Self {
        let power_label_template = if config.power_label_template.is_empty() {
            None
        } else {
            Some(resources_dir.join(&config.power_label_template))
        };
        Self {
            confidence_threshold: config.confidence_threshold,
            variant_marker: config.reduced_variant_marker.clone(),
            power_label_template,
            type_templates: load_type_templates(&resources_dir.join("types")),
            ..Self::default()
        }
    }
}

impl Default for CollectorSettings {
    fn default() -> Self {
        let config = AppConfig::default();
        Self {
            confidence_threshold: config.confidence_threshold,
            variant_marker: config.reduced_variant_marker,
            power_label_template: None,
            type_templates: Vec::new(),
            type_match_threshold: 0.8,
            power_label_threshold: 0.8,
        }
    }
}

/// Loads every `*.png` in `dir` as a type template named after the file stem.
pub fn load_type_templates(dir: &Path) -> Vec<(String, GrayImage)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("No type templates in {} ({}), types will be Unknown", dir.display(), e);
            return Vec::new();
        }
    };

    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("png")))
        .collect();
    paths.sort();

    let mut templates = Vec::new();
    for path in paths {
        let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        match image::open(&path) {
            Ok(img) => templates.push((name, img.to_luma8())),
            Err(e) => warn!("Failed to load type template {}: {}", path.display(), e),
        }
    }
    info!("Loaded {} type template(s)", templates.len());
    templates
}

/// Strips a leading "Lv 25 " / "Level 25 " from an OCR'd name.
pub fn clean_name(raw: &str) -> String {
    let trimmed = raw.trim();
    match Regex::new(NAME_PREFIX_PATTERN) {
        Ok(re) => re.replace(trimmed, "").into_owned(),
        Err(_) => trimmed.to_string(),
    }
}

/// Scales every image to the tallest height (keeping aspect ratio) and lays them
/// out left to right. Undecodable inputs are skipped; a single input is returned as is.
pub fn compose_side_by_side(images: &[Vec<u8>]) -> Option<Vec<u8>> {
    if images.len() == 1 {
        return Some(images[0].clone());
    }

    let decoded: Vec<RgbaImage> = images
        .iter()
        .filter_map(|bytes| match image::load_from_memory(bytes) {
            Ok(img) => Some(img.to_rgba8()),
            Err(e) => {
                warn!("Skipping undecodable slot image: {}", e);
                None
            }
        })
        .filter(|img| img.width() > 0 && img.height() > 0)
        .collect();
    let max_height = decoded.iter().map(|img| img.height()).max()?;

    let resized: Vec<RgbaImage> = decoded
        .into_iter()
        .map(|img| {
            if img.height() == max_height {
                img
            } else {
                let width = (max_height as f64 * img.width() as f64 / img.height() as f64) as u32;
                image::imageops::resize(&img, width.max(1), max_height, FilterType::Lanczos3)
            }
        })
        .collect();

    let total_width: u32 = resized.iter().map(|img| img.width()).sum();
    let mut canvas = RgbaImage::new(total_width, max_height);
    let mut x = 0i64;
    for img in &resized {
        image::imageops::overlay(&mut canvas, img, x, 0);
        x += img.width() as i64;
    }
    encode_png(&DynamicImage::ImageRgba8(canvas))
}

/// Walks one entity through its screens and assembles the record.
pub struct EntityCollector {
    settings: CollectorSettings,
}

impl EntityCollector {
    pub fn new(settings: CollectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CollectorSettings {
        &self.settings
    }

    /// Collects entity `index` (1-based). Always returns a record; an entity whose
    /// details did not open comes back empty and uncertain.
    pub fn collect<D: Device>(
        &self,
        nav: &mut Navigator<D>,
        pipeline: &ExtractionPipeline,
        index: usize,
    ) -> EntityRecord {
        let mut record = EntityRecord::new(index);

        if let Err(e) = nav.open_entity(index) {
            warn!("Failed to open details for entity {}: {}", index, e);
            record.note_failure("details", e.reason());
            record.finalize(self.settings.confidence_threshold);
            return record;
        }

        let frame = match nav.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to capture details of entity {}: {}", index, e);
                record.note_failure("details", e.reason());
                record.finalize(self.settings.confidence_threshold);
                return record;
            }
        };

        self.extract_base_fields(&frame, pipeline, &mut record);
        let variant = self.visit_cultivation(nav, pipeline, &mut record);
        self.visit_specialty(nav, pipeline, &mut record, variant);
        self.visit_covenant(nav, pipeline, &mut record);

        record.finalize(self.settings.confidence_threshold);
        info!(
            "Collected entity {}: {} (confidence {:.2}{})",
            index,
            record.name,
            record.average_confidence(),
            if record.is_uncertain { ", uncertain" } else { "" }
        );
        record
    }

    fn extract_base_fields(&self, frame: &Frame, pipeline: &ExtractionPipeline, record: &mut EntityRecord) {
        let (power_region, exp_region) = self.power_layout(frame, pipeline);
        let fields = [
            ("name", "GeneralsListName", ResultKind::Text),
            ("level", "GeneralsListLevel", ResultKind::Number),
            ("power", power_region, ResultKind::Number),
            ("exp_ratio", exp_region, ResultKind::Text),
        ];

        for (field, region, kind) in fields {
            match pipeline.extract(frame, region, kind) {
                Ok(result) => {
                    record.set_confidence(field, result.confidence());
                    apply_base_field(record, field, result);
                }
                Err(failure) => {
                    warn!("Entity {}: {} unreadable ({})", record.index, field, failure);
                    record.set_failure(field, failure.reason);
                }
            }
        }

        record.type_image = self.crop_image(frame, pipeline, "GeneralsListType", record);
        record.stars_image = self.crop_image(frame, pipeline, "GeneralsListStars", record);
        record.kind = self.classify_type(frame, pipeline);
    }

    fn crop_image(
        &self,
        frame: &Frame,
        pipeline: &ExtractionPipeline,
        region: &str,
        record: &mut EntityRecord,
    ) -> Option<Vec<u8>> {
        match pipeline.extract_image(frame, region) {
            Ok(img) => Some(img.png),
            Err(failure) => {
                debug!("Entity {}: no {} image ({})", record.index, region, failure);
                record.note_failure(region, failure.reason);
                None
            }
        }
    }

    /// Picks the power and experience regions for this screen.
    ///
    /// When the label template matches, the first layout applies, otherwise the
    /// second. Missing presets or template fall back to the plain regions.
    fn power_layout(&self, frame: &Frame, pipeline: &ExtractionPipeline) -> (&'static str, &'static str) {
        const FALLBACK: (&str, &str) = ("GeneralsListPower", "GeneralsListExp");
        let registry = pipeline.registry();
        let Some(template) = &self.settings.power_label_template else {
            return FALLBACK;
        };
        if !registry.contains("GeneralsListPowerLabel") {
            return FALLBACK;
        }

        let layout = match pipeline.check_template_match(
            frame,
            "GeneralsListPowerLabel",
            template,
            self.settings.power_label_threshold,
        ) {
            Ok(true) => ("GeneralsListPower1", "GeneralsListExp1"),
            Ok(false) => ("GeneralsListPower2", "GeneralsListExp2"),
            Err(failure) => {
                warn!("Power label check failed: {}", failure);
                return FALLBACK;
            }
        };
        if registry.contains(layout.0) && registry.contains(layout.1) {
            debug!("Using power layout {} / {}", layout.0, layout.1);
            layout
        } else {
            FALLBACK
        }
    }

    /// Best-correlating type template, or "Unknown" when none clears the threshold.
    fn classify_type(&self, frame: &Frame, pipeline: &ExtractionPipeline) -> String {
        let mut best: Option<(&str, f32)> = None;
        for (name, template) in &self.settings.type_templates {
            let score = match pipeline.template_correlation(frame, "GeneralsListType", template) {
                Ok(score) => score,
                Err(failure) => {
                    debug!("Type classification skipped: {}", failure);
                    return "Unknown".to_string();
                }
            };
            if best.is_none_or(|(_, s)| score > s) {
                best = Some((name, score));
            }
        }

        match best {
            Some((name, score)) if score >= self.settings.type_match_threshold => {
                debug!("Type {} (correlation {:.3})", name, score);
                name.to_string()
            }
            _ => "Unknown".to_string(),
        }
    }

    /// Reads the four cultivation stats and detects the layout variant.
    /// An unreadable marker counts as the full variant.
    fn visit_cultivation<D: Device>(
        &self,
        nav: &mut Navigator<D>,
        pipeline: &ExtractionPipeline,
        record: &mut EntityRecord,
    ) -> Variant {
        let frame = match enter_and_capture(nav, |n| n.enter_cultivation()) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                record.cultivation = unknown_cultivation();
                record.note_failure("cultivation", FailureReason::NotAvailable);
                return Variant::Full;
            }
            Err(e) => {
                warn!("Entity {}: cultivation screen unavailable: {}", record.index, e);
                record.cultivation = unknown_cultivation();
                record.set_failure("cultivation", e.reason());
                close_sub_screen(nav);
                return Variant::Full;
            }
        };

        let variant = self.detect_variant(&frame, pipeline);
        let mut total = 0.0;
        record.cultivation.clear();
        for stat in CULTIVATION_STATS {
            let region = format!("GeneralsListCultivate{}", stat);
            match pipeline.extract_text(&frame, &region) {
                Ok(result) => {
                    record.cultivation.push(format!("{}: {}", stat, result.text));
                    total += result.confidence;
                }
                Err(failure) => {
                    debug!("Entity {}: {}", record.index, failure);
                    record.cultivation.push(format!("{}: Unknown", stat));
                    record.note_failure(&format!("cultivation_{}", stat.to_lowercase()), failure.reason);
                }
            }
        }
        record.set_confidence("cultivation", total / CULTIVATION_STATS.len() as f32);

        close_sub_screen(nav);
        variant
    }

    fn detect_variant(&self, frame: &Frame, pipeline: &ExtractionPipeline) -> Variant {
        let marker = &self.settings.variant_marker;
        match pipeline.check_pixel_color(frame, &marker.region, marker.rgb, marker.tolerance) {
            Ok(true) => Variant::Full,
            Ok(false) => {
                info!("Reduced variant detected");
                Variant::Reduced
            }
            Err(failure) => {
                debug!("Variant marker unavailable ({}), assuming full variant", failure);
                Variant::Full
            }
        }
    }

    fn visit_specialty<D: Device>(
        &self,
        nav: &mut Navigator<D>,
        pipeline: &ExtractionPipeline,
        record: &mut EntityRecord,
        variant: Variant,
    ) {
        let slots = variant.specialty_slots();
        match nav.enter_specialty() {
            Ok(Transition::Entered) => {}
            Ok(Transition::NotAvailable) => {
                record.specialties = placeholders(UNKNOWN_SPECIALTY, slots);
                record.note_failure("specialty", FailureReason::NotAvailable);
                return;
            }
            Err(e) => {
                warn!("Entity {}: specialty screen unavailable: {}", record.index, e);
                record.specialties = placeholders(UNKNOWN_SPECIALTY, slots);
                record.set_failure("specialty", e.reason());
                close_sub_screen(nav);
                return;
            }
        }

        let mut total = 0.0;
        record.specialties.clear();
        for slot in 1..=slots {
            let tap_region = variant.specialty_tap_region(slot);
            if let Err(e) = nav.tap_preset(&tap_region) {
                warn!("Entity {}: specialty slot {} not selectable: {}", record.index, slot, e);
                record.note_failure(&format!("specialty_{}", slot), e.reason());
                record.specialties.push(placeholder(UNKNOWN_SPECIALTY));
                continue;
            }
            nav.wait(nav.timing().slot_settle);

            let (slot_result, confidence) = read_slot(
                nav,
                pipeline,
                &variant.specialty_image_region(slot),
                "GeneralsListSpecialtyName",
                UNKNOWN_SPECIALTY,
            );
            if let Err(reason) = &slot_result {
                record.note_failure(&format!("specialty_{}", slot), *reason);
            }
            record.specialties.push(slot_result.unwrap_or_else(|_| placeholder(UNKNOWN_SPECIALTY)));
            total += confidence;
        }

        record.set_confidence("specialty", total / slots as f32);
        record.specialty_image = combined_image(&record.specialties);
        close_sub_screen(nav);
    }

    fn visit_covenant<D: Device>(&self, nav: &mut Navigator<D>, pipeline: &ExtractionPipeline, record: &mut EntityRecord) {
        match nav.enter_covenant() {
            Ok(Transition::Entered) => {}
            Ok(Transition::NotAvailable) => {
                // Inactive covenant is a property of the entity, not a read error
                record.covenants = vec![placeholder("No Covenant")];
                record.note_failure("covenant", FailureReason::NotAvailable);
                return;
            }
            Err(e) => {
                warn!("Entity {}: covenant screen unavailable: {}", record.index, e);
                record.covenants = placeholders(UNKNOWN_COVENANT, COVENANT_SLOTS);
                record.set_failure("covenant", e.reason());
                return;
            }
        }

        if let Err(e) = nav.open_covenant_general() {
            warn!("Entity {}: covenant general not selectable: {}", record.index, e);
            record.covenants = vec![placeholder("No Covenant Data")];
            record.set_failure("covenant", e.reason());
            close_sub_screen(nav);
            return;
        }

        let mut total = 0.0;
        record.covenants.clear();
        for slot in 0..COVENANT_SLOTS {
            if slot > 0 {
                if let Err(e) = nav.next_covenant_general() {
                    warn!("Entity {}: covenant slot {} not reachable: {}", record.index, slot + 1, e);
                    record.note_failure(&format!("covenant_{}", slot + 1), e.reason());
                    record.covenants.push(placeholder(UNKNOWN_COVENANT));
                    continue;
                }
            }

            let (slot_result, confidence) = read_slot(
                nav,
                pipeline,
                "GeneralsListCovenantCoGenImage",
                "GeneralsListCovenantCoGenName",
                UNKNOWN_COVENANT,
            );
            if let Err(reason) = &slot_result {
                record.note_failure(&format!("covenant_{}", slot + 1), *reason);
            }
            record.covenants.push(slot_result.unwrap_or_else(|_| placeholder(UNKNOWN_COVENANT)));
            total += confidence;
        }

        if let Err(e) = nav.close_covenant() {
            warn!("Failed to close covenant general view: {}", e);
        }
        record.set_confidence("covenant", total / COVENANT_SLOTS as f32);
        record.covenant_image = combined_image(&record.covenants);
        close_sub_screen(nav);
    }
}

fn apply_base_field(record: &mut EntityRecord, field: &str, result: ExtractionResult) {
    match (field, result) {
        ("name", ExtractionResult::Text(t)) => record.name = clean_name(&t.text),
        ("level", ExtractionResult::Number(n)) => record.level = n.value,
        ("power", ExtractionResult::Number(n)) => record.power = n.value,
        ("exp_ratio", ExtractionResult::Text(t)) => record.exp_ratio = t.text,
        (field, _) => debug!("Unexpected result kind for {}", field),
    }
}

/// Runs a sub-screen transition and captures it. `Ok(None)` when the screen is
/// inactive for this entity.
fn enter_and_capture<D: Device>(
    nav: &mut Navigator<D>,
    enter: impl FnOnce(&mut Navigator<D>) -> Result<Transition, NavError>,
) -> Result<Option<Frame>, NavError> {
    match enter(nav)? {
        Transition::NotAvailable => Ok(None),
        Transition::Entered => nav.capture_frame().map(Some),
    }
}

/// Captures the current slot and reads its image and name.
///
/// The name falls back to `unknown` with zero confidence; the image is optional.
fn read_slot<D: Device>(
    nav: &mut Navigator<D>,
    pipeline: &ExtractionPipeline,
    image_region: &str,
    name_region: &str,
    unknown: &str,
) -> (Result<NamedImage, FailureReason>, f32) {
    let frame = match nav.capture_frame() {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Slot screenshot failed: {}", e);
            return (Err(e.reason()), 0.0);
        }
    };

    let image = match pipeline.extract_image(&frame, image_region) {
        Ok(img) => Some(img.png),
        Err(failure) => {
            debug!("{}", failure);
            None
        }
    };
    match pipeline.extract_text(&frame, name_region) {
        Ok(result) => (Ok(NamedImage { name: result.text, image }), result.confidence),
        Err(failure) => {
            debug!("{}", failure);
            (Ok(NamedImage { name: unknown.to_string(), image }), 0.0)
        }
    }
}

/// Returns to the entity details when a sub-screen is showing.
fn close_sub_screen<D: Device>(nav: &mut Navigator<D>) {
    if !matches!(
        nav.state(),
        NavState::CultivationSub | NavState::SpecialtySub | NavState::CovenantSub
    ) {
        return;
    }
    if let Err(e) = nav.close_details() {
        warn!("Failed to return to entity details: {}", e);
    }
}

fn combined_image(slots: &[NamedImage]) -> Option<Vec<u8>> {
    let images: Vec<Vec<u8>> = slots.iter().filter_map(|s| s.image.clone()).collect();
    if images.is_empty() {
        return None;
    }
    compose_side_by_side(&images)
}

fn placeholder(name: &str) -> NamedImage {
    NamedImage { name: name.to_string(), image: None }
}

fn placeholders(name: &str, count: usize) -> Vec<NamedImage> {
    (0..count).map(|_| placeholder(name)).collect()
}

fn unknown_cultivation() -> Vec<String> {
    CULTIVATION_STATS.iter().map(|stat| format!("{}: Unknown", stat)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::detection::ReferenceImages;
    use crate::automation::navigator::NavigatorTiming;
    use crate::automation::test_support::{tap_of, test_registry, test_registry_without, variant_marker_pixel, width_of};
    use crate::device::mock::MockDevice;
    use crate::ocr::extract::tests::ScriptedOcr;
    use crate::ocr::extract::PipelineSettings;
    use crate::regions::RegionRegistry;
    use image::{Rgb, RgbImage};
    use std::sync::Arc;

    const SIZE: (u32, u32) = (540, 960);

    fn screen(full_variant: bool) -> RgbImage {
        let mut img = RgbImage::from_pixel(SIZE.0, SIZE.1, Rgb([40, 40, 40]));
        if full_variant {
            let (x, y) = variant_marker_pixel();
            img.put_pixel(x, y, Rgb([255, 206, 66]));
        }
        img
    }

    fn navigator(device: MockDevice, registry: Arc<RegionRegistry>) -> Navigator<MockDevice> {
        let dir = std::env::temp_dir().join("generals-tracker-no-references");
        Navigator::new(device, registry, ReferenceImages::new(&dir), NavigatorTiming::zero())
    }

    fn readable_ocr() -> ScriptedOcr {
        ScriptedOcr::new()
            .with(width_of("GeneralsListName"), &[("Lv 45 Caesar", 0.9)])
            .with(width_of("GeneralsListLevel"), &[("45", 0.95)])
            .with(width_of("GeneralsListPower"), &[("143,657", 0.9)])
            .with(width_of("GeneralsListExp"), &[("1,234/5,000", 0.85)])
            .with(width_of("GeneralsListCultivateLeadership"), &[("85+15", 0.9)])
            .with(width_of("GeneralsListCultivateAttack"), &[("92+1", 0.9)])
            .with(width_of("GeneralsListCultivateDefense"), &[("78+7", 0.9)])
            .with(width_of("GeneralsListCultivatePolitics"), &[("81-3", 0.9)])
            .with(width_of("GeneralsListSpecialtyName"), &[("Conqueror", 0.9)])
            .with(width_of("GeneralsListCovenantCoGenName"), &[("Scipio", 0.9)])
    }

    fn pipeline(ocr: ScriptedOcr, registry: Arc<RegionRegistry>) -> ExtractionPipeline {
        ExtractionPipeline::new(registry, Box::new(ocr), PipelineSettings::default())
    }

    #[test]
    fn test_clean_name() {
        assert_eq!(clean_name("Lv 45 Caesar"), "Caesar");
        assert_eq!(clean_name("level45  Hannibal Barca"), "Hannibal Barca");
        assert_eq!(clean_name("  Leonidas "), "Leonidas");
        assert_eq!(clean_name("Lvov"), "Lvov");
    }

    #[test]
    fn test_compose_side_by_side() {
        let a = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(10, 20))).unwrap();
        let b = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(30, 10))).unwrap();
        let combined = compose_side_by_side(&[a, b]).unwrap();

        let img = image::load_from_memory(&combined).unwrap();
        // 30x10 scaled to height 20 becomes 60 wide
        assert_eq!((img.width(), img.height()), (70, 20));
    }

    #[test]
    fn test_compose_skips_garbage() {
        let a = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(8, 8))).unwrap();
        let combined = compose_side_by_side(&[a, b"not a png".to_vec()]).unwrap();
        let img = image::load_from_memory(&combined).unwrap();
        assert_eq!(img.width(), 8);
        assert!(compose_side_by_side(&[]).is_none());
    }

    #[test]
    fn test_variant_slot_counts() {
        assert_eq!(Variant::Full.specialty_slots(), 5);
        assert_eq!(Variant::Reduced.specialty_slots(), 3);
        assert_eq!(Variant::Reduced.specialty_tap_region(2), "GeneralsListSpecialtyReduced2");
        assert_eq!(Variant::Full.specialty_image_region(5), "GeneralsListSpecialtyImage5");
    }

    #[test]
    fn test_collect_full_entity() {
        let registry = test_registry();
        let mut nav = navigator(MockDevice::with_image(screen(true)), registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.name, "Caesar");
        assert_eq!(record.level, Some(45));
        assert_eq!(record.power, Some(143657));
        assert_eq!(record.exp_ratio, "1,234/5,000");
        assert_eq!(
            record.cultivation,
            vec!["Leadership: 85+15", "Attack: 92+1", "Defense: 78+7", "Politics: 81-3"]
        );
        assert_eq!(record.specialties.len(), 5);
        assert!(record.specialties.iter().all(|s| s.name == "Conqueror" && s.image.is_some()));
        assert_eq!(record.covenants.len(), COVENANT_SLOTS);
        assert!(record.specialty_image.is_some());
        assert!(record.covenant_image.is_some());
        assert!(record.type_image.is_some());
        assert_eq!(record.kind, "Unknown");
        assert!(!record.is_uncertain, "average {}", record.average_confidence());

        let taps = &nav.device().taps;
        let count = |name: &str| taps.iter().filter(|t| **t == tap_of(name, SIZE)).count();
        assert_eq!(count("GeneralsFirstGeneral"), 1);
        assert_eq!(count("GeneralsListSpecialty5"), 1);
        assert_eq!(count("GeneralsListCovenantRight"), 3);
        assert_eq!(count("GeneralsListCovenantXOut"), 1);
        // One return per sub-screen
        assert_eq!(count("Back"), 3);
    }

    #[test]
    fn test_reduced_variant_uses_three_slots() {
        let registry = test_registry();
        let mut nav = navigator(MockDevice::with_image(screen(false)), registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.specialties.len(), 3);
        let taps = &nav.device().taps;
        assert!(taps.contains(&tap_of("GeneralsListSpecialtyReduced3", SIZE)));
        assert!(!taps.contains(&tap_of("GeneralsListSpecialty1", SIZE)));
    }

    #[test]
    fn test_variant_detected_once_per_entity() {
        // Details and cultivation screens show the reduced layout; every later
        // capture would read as full if the variant were checked again.
        let mut device = MockDevice::with_image(screen(true));
        device.queue_screen(&screen(false));
        device.queue_screen(&screen(false));
        let registry = test_registry();
        let mut nav = navigator(device, registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.specialties.len(), 3);
        let taps = &nav.device().taps;
        assert!(!taps.contains(&tap_of("GeneralsListSpecialty4", SIZE)));
        // details, cultivation, 3 slots, covenant button, 4 covenant slots
        assert_eq!(nav.device().captures, 10);
        assert!(nav.device().queued.is_empty());
    }

    #[test]
    fn test_missing_region_does_not_abort_entity() {
        let registry = test_registry_without(&["GeneralsListLevel", "GeneralsListCultivateVariant"]);
        let mut nav = navigator(MockDevice::with_image(screen(false)), registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.level, None);
        assert_eq!(record.confidence["level"], 0.0);
        assert_eq!(record.failures["level"], FailureReason::UnknownRegion);
        assert_eq!(record.name, "Caesar");
        // No marker region means the full variant
        assert_eq!(record.specialties.len(), 5);
    }

    #[test]
    fn test_unreadable_fields_get_placeholders() {
        let registry = test_registry();
        let mut nav = navigator(MockDevice::with_image(screen(true)), registry.clone());
        let p = pipeline(ScriptedOcr::new(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.name, "Unknown");
        assert_eq!(record.cultivation[0], "Leadership: Unknown");
        assert_eq!(record.confidence["cultivation"], 0.0);
        assert!(record.specialties.iter().all(|s| s.name == UNKNOWN_SPECIALTY));
        assert!(record.is_uncertain);
    }

    #[test]
    fn test_failed_slot_tap_scores_zero() {
        let registry = test_registry();
        let mut device = MockDevice::with_image(screen(true));
        device.fail_tap(tap_of("GeneralsListSpecialty2", SIZE), 1);
        let mut nav = navigator(device, registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert_eq!(record.specialties[1].name, UNKNOWN_SPECIALTY);
        assert_eq!(record.specialties[2].name, "Conqueror");
        assert!((record.confidence["specialty"] - 0.9 * 4.0 / 5.0).abs() < 1e-5);
        assert_eq!(record.failures["specialty_2"], FailureReason::TapFailed);
    }

    #[test]
    fn test_inactive_covenant_is_skipped() {
        let registry = test_registry();
        let mut nav = navigator(MockDevice::with_image(screen(true)), registry.clone());
        nav.set_reference("GeneralsListCovenant", RgbImage::from_pixel(5, 5, Rgb([40, 40, 40])));
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 1);

        assert!(!record.confidence.contains_key("covenant"));
        assert_eq!(record.failures["covenant"], FailureReason::NotAvailable);
        assert_eq!(record.covenants[0].name, "No Covenant");
        assert!(!nav.device().taps.contains(&tap_of("GeneralsListCovenantGeneral", SIZE)));
    }

    #[test]
    fn test_details_not_opened_yields_empty_record() {
        let registry = test_registry();
        let mut device = MockDevice::with_image(screen(true));
        device.fail_tap(tap_of("GeneralsListMoveRight", SIZE), 1);
        let mut nav = navigator(device, registry.clone());
        let p = pipeline(readable_ocr(), registry);
        let collector = EntityCollector::new(CollectorSettings::default());

        let record = collector.collect(&mut nav, &p, 2);

        assert!(record.is_uncertain);
        assert!(record.confidence.is_empty());
        assert_eq!(record.name, "Unknown");
        assert_eq!(record.failures["details"], FailureReason::TapFailed);
    }

    #[test]
    fn test_type_classified_by_template() {
        let registry = test_registry();
        let mut img = screen(true);
        // Horizontal ramp inside the type region
        for y in 0..img.height() {
            for x in 0..img.width() {
                img.put_pixel(x, y, Rgb([(x % 256) as u8, 0, 0]));
            }
        }
        let mut nav = navigator(MockDevice::with_image(img), registry.clone());
        let p = pipeline(ScriptedOcr::new(), registry);

        let width = width_of("GeneralsListType");
        let ramp = GrayImage::from_fn(width, 10, |x, _| image::Luma([(x * 4) as u8]));
        let inverse = GrayImage::from_fn(width, 10, |x, _| image::Luma([255 - (x * 4) as u8]));
        let settings = CollectorSettings {
            type_templates: vec![("Mounted".to_string(), inverse), ("Siege".to_string(), ramp)],
            ..CollectorSettings::default()
        };
        let collector = EntityCollector::new(settings);

        let record = collector.collect(&mut nav, &p, 1);
        assert_eq!(record.kind, "Siege");
    }

    #[test]
    fn test_type_templates_loaded_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        GrayImage::new(4, 4).save(dir.path().join("Ground.png")).unwrap();
        GrayImage::new(4, 4).save(dir.path().join("Ranged.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x").unwrap();

        let templates = load_type_templates(dir.path());
        let names: Vec<&str> = templates.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["Ground", "Ranged"]);
        assert!(load_type_templates(&dir.path().join("missing")).is_empty());
    }
}
