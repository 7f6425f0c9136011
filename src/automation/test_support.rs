//! Region table shared by navigator, collector and runner tests.
//!
//! Every preset gets its own horizontal band and a distinct width, so taps can be
//! told apart by position and the scripted OCR can answer by crop width.

use std::sync::Arc;

use crate::regions::{RegionPreset, RegionRegistry};

const PRESETS: &[&str] = &[
    "ThreeDots",
    "Generals",
    "All",
    "GeneralsListMode",
    "GeneralsListFavorites",
    "GeneralsListIdle",
    "GeneralsListCount",
    "GeneralsFirstGeneral",
    "GeneralsListMoveRight",
    "Back",
    "GeneralsListName",
    "GeneralsListLevel",
    "GeneralsListPower",
    "GeneralsListExp",
    "GeneralsListType",
    "GeneralsListStars",
    "GeneralsListCultivate",
    "GeneralsListCultivateVariant",
    "GeneralsListCultivateLeadership",
    "GeneralsListCultivateAttack",
    "GeneralsListCultivateDefense",
    "GeneralsListCultivatePolitics",
    "GeneralsListSpecialty",
    "GeneralsListSpecialty1",
    "GeneralsListSpecialty2",
    "GeneralsListSpecialty3",
    "GeneralsListSpecialty4",
    "GeneralsListSpecialty5",
    "GeneralsListSpecialtyReduced1",
    "GeneralsListSpecialtyReduced2",
    "GeneralsListSpecialtyReduced3",
    "GeneralsListSpecialtyImage1",
    "GeneralsListSpecialtyImage2",
    "GeneralsListSpecialtyImage3",
    "GeneralsListSpecialtyImage4",
    "GeneralsListSpecialtyImage5",
    "GeneralsListSpecialtyImageReduced1",
    "GeneralsListSpecialtyImageReduced2",
    "GeneralsListSpecialtyImageReduced3",
    "GeneralsListSpecialtyName",
    "GeneralsListCovenant",
    "GeneralsListCovenantGeneral",
    "GeneralsListCovenantRight",
    "GeneralsListCovenantXOut",
    "GeneralsListCovenantCoGenImage",
    "GeneralsListCovenantCoGenName",
];

fn band(index: usize) -> (f64, f64) {
    let y0 = index as f64 * 0.02;
    (y0, y0 + 0.015)
}

/// Crop width of `name` at 540 px, unique per preset.
pub fn width_of(name: &str) -> u32 {
    let index = PRESETS
        .iter()
        .position(|p| *p == name)
        .unwrap_or_else(|| panic!("{} is not in the test registry", name));
    20 + 2 * index as u32
}

fn preset(index: usize, name: &str) -> RegionPreset {
    let (y0, y1) = band(index);
    let width = width_of(name) as f64;
    RegionPreset::rect(name, 0.0, y0, width / 540.0 + 1e-6, y1)
}

pub fn test_registry() -> Arc<RegionRegistry> {
    Arc::new(RegionRegistry::from_presets(
        PRESETS.iter().enumerate().map(|(i, name)| preset(i, name)),
    ))
}

/// Same table without `missing`, for layouts lacking a feature.
pub fn test_registry_without(missing: &[&str]) -> Arc<RegionRegistry> {
    Arc::new(RegionRegistry::from_presets(
        PRESETS
            .iter()
            .enumerate()
            .filter(|(_, name)| !missing.contains(*name))
            .map(|(i, name)| preset(i, name)),
    ))
}

pub fn tap_of(name: &str, size: (u32, u32)) -> (u32, u32) {
    let index = PRESETS
        .iter()
        .position(|p| *p == name)
        .unwrap_or_else(|| panic!("{} is not in the test registry", name));
    preset(index, name).tap_point(size)
}

/// Pixel the variant marker check reads at 540x960.
pub fn variant_marker_pixel() -> (u32, u32) {
    let index = PRESETS.iter().position(|p| *p == "GeneralsListCultivateVariant").unwrap_or(0);
    preset(index, "GeneralsListCultivateVariant").resolve((540, 960)).anchor()
}
