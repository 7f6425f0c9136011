//! Named screen regions in normalized coordinates.
//!
//! Presets are loaded once from a JSON file and never change afterwards. The same
//! preset set serves every screen resolution: callers resolve a preset against the
//! pixel size they are working with.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

/// Regions whose text sits on highly variable backgrounds and gets the
/// color-isolating binarization instead of the general enhancement.
pub const CHARACTER_HEAVY_REGIONS: &[&str] = &[
    "GeneralsListName",
    "GeneralsListLevel",
    "GeneralsListPower",
    "GeneralsListPower1",
    "GeneralsListPower2",
    "GeneralsListExp",
    "GeneralsListExp1",
    "GeneralsListExp2",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegionError {
    #[error("unknown region: {0}")]
    UnknownRegion(String),
}

/// Enhancement strategy attached to a preset at load time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionClass {
    CharacterHeavy,
    Standard,
}

impl RegionClass {
    /// Class for a preset that does not declare one.
    pub fn infer(name: &str) -> Self {
        if CHARACTER_HEAVY_REGIONS.contains(&name) {
            RegionClass::CharacterHeavy
        } else {
            RegionClass::Standard
        }
    }
}

/// A rectangle in relative coordinates (0.0 to 1.0).
///
/// Stored as both corners rather than origin + size so that resolving the far edge
/// does not accumulate rounding error.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelativeRect {
    /// Left edge (0.0 = left edge of the screen, 1.0 = right edge)
    pub x0: f64,
    /// Top edge (0.0 = top edge of the screen, 1.0 = bottom edge)
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RegionShape {
    Rect(RelativeRect),
    Point { x: f64, y: f64 },
}

/// A rectangle in absolute pixels. `x1`/`y1` are exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl PixelRect {
    pub fn width(&self) -> u32 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u32 {
        self.y1.saturating_sub(self.y0)
    }

    pub fn center(&self) -> (u32, u32) {
        ((self.x0 + self.x1) / 2, (self.y0 + self.y1) / 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    Rect(PixelRect),
    Point { x: u32, y: u32 },
}

impl Resolved {
    /// The pixel a color check or tap should use: the point itself or the rectangle center.
    pub fn anchor(&self) -> (u32, u32) {
        match self {
            Resolved::Rect(rect) => rect.center(),
            Resolved::Point { x, y } => (*x, *y),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RegionPreset {
    pub name: String,
    pub shape: RegionShape,
    pub drag: bool,
    pub class: RegionClass,
}

impl RegionPreset {
    pub fn rect(name: &str, x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self {
            name: name.to_string(),
            shape: RegionShape::Rect(RelativeRect { x0, y0, x1, y1 }),
            drag: false,
            class: RegionClass::infer(name),
        }
    }

    pub fn point(name: &str, x: f64, y: f64) -> Self {
        Self {
            name: name.to_string(),
            shape: RegionShape::Point { x, y },
            drag: false,
            class: RegionClass::infer(name),
        }
    }

    /// Multiplies the normalized coordinates by `size`, truncating toward zero.
    pub fn resolve(&self, (width, height): (u32, u32)) -> Resolved {
        let w = width as f64;
        let h = height as f64;
        match self.shape {
            RegionShape::Rect(r) => Resolved::Rect(PixelRect {
                x0: (r.x0 * w) as u32,
                y0: (r.y0 * h) as u32,
                x1: (r.x1 * w) as u32,
                y1: (r.y1 * h) as u32,
            }),
            RegionShape::Point { x, y } => Resolved::Point { x: (x * w) as u32, y: (y * h) as u32 },
        }
    }

    /// Tap target: the normalized center scaled to `size`.
    pub fn tap_point(&self, (width, height): (u32, u32)) -> (u32, u32) {
        let (cx, cy) = match self.shape {
            RegionShape::Rect(r) => ((r.x0 + r.x1) / 2.0, (r.y0 + r.y1) / 2.0),
            RegionShape::Point { x, y } => (x, y),
        };
        ((cx * width as f64) as u32, (cy * height as f64) as u32)
    }
}

#[derive(Deserialize)]
struct PresetFile {
    presets: Vec<RawPreset>,
}

#[derive(Deserialize)]
struct RawPreset {
    name: String,
    #[serde(alias = "xLoc")]
    x: f64,
    #[serde(alias = "yLoc")]
    y: f64,
    #[serde(alias = "xDest", default)]
    x_dest: Option<f64>,
    #[serde(alias = "yDest", default)]
    y_dest: Option<f64>,
    #[serde(alias = "ClickAndDrag", default)]
    drag: bool,
    #[serde(default)]
    class: Option<RegionClass>,
}

impl RawPreset {
    fn into_preset(self) -> std::result::Result<RegionPreset, String> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.x) || !in_unit(self.y) {
            return Err(format!("origin ({}, {}) outside [0, 1]", self.x, self.y));
        }
        let shape = match (self.x_dest, self.y_dest) {
            (Some(xd), Some(yd)) => {
                if !in_unit(xd) || !in_unit(yd) || xd < self.x || yd < self.y {
                    return Err(format!("invalid rectangle end ({}, {})", xd, yd));
                }
                RegionShape::Rect(RelativeRect { x0: self.x, y0: self.y, x1: xd, y1: yd })
            }
            (None, None) => RegionShape::Point { x: self.x, y: self.y },
            _ => return Err("only one of x_dest/y_dest given".to_string()),
        };
        let class = self.class.unwrap_or_else(|| RegionClass::infer(&self.name));
        Ok(RegionPreset { name: self.name, shape, drag: self.drag, class })
    }
}

/// Read-only lookup of region presets by name.
#[derive(Clone, Debug, Default)]
pub struct RegionRegistry {
    presets: HashMap<String, RegionPreset>,
}

impl RegionRegistry {
    /// Builds a registry. Duplicate names keep the first preset.
    pub fn from_presets(presets: impl IntoIterator<Item = RegionPreset>) -> Self {
        let mut map = HashMap::new();
        for preset in presets {
            if map.contains_key(&preset.name) {
                warn!("Duplicate region preset '{}' ignored", preset.name);
                continue;
            }
            map.insert(preset.name.clone(), preset);
        }
        Self { presets: map }
    }

    /// Parses a preset document. Individually invalid presets are skipped.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: PresetFile = serde_json::from_str(json).context("Failed to parse region presets")?;
        let mut presets = Vec::with_capacity(file.presets.len());
        for raw in file.presets {
            let name = raw.name.clone();
            match raw.into_preset() {
                Ok(preset) => presets.push(preset),
                Err(e) => warn!("Failed to parse preset {}: {}", name, e),
            }
        }
        Ok(Self::from_presets(presets))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read region presets from {}", path.display()))?;
        let registry = Self::from_json_str(&json)?;
        info!("Loaded {} region presets from {}", registry.len(), path.display());
        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Result<&RegionPreset, RegionError> {
        self.presets.get(name).ok_or_else(|| RegionError::UnknownRegion(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    pub fn resolve(&self, name: &str, screen_size: (u32, u32)) -> Result<Resolved, RegionError> {
        Ok(self.get(name)?.resolve(screen_size))
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_rect_against_screen_size() {
        let registry =
            RegionRegistry::from_presets([RegionPreset::rect("Box", 0.1, 0.25, 0.6, 0.35)]);

        let resolved = registry.resolve("Box", (100, 200)).unwrap();
        let Resolved::Rect(rect) = resolved else { panic!("expected rect") };
        assert_eq!((rect.x0, rect.y0), (10, 50));
        assert_eq!((rect.width(), rect.height()), (50, 20));

        // Same preset, different resolution
        let Resolved::Rect(big) = registry.resolve("Box", (1000, 2000)).unwrap() else {
            panic!("expected rect")
        };
        assert_eq!((big.x0, big.y0), (100, 500));
    }

    #[test]
    fn test_resolve_point() {
        let registry = RegionRegistry::from_presets([RegionPreset::point("Back", 0.5, 0.25)]);
        assert_eq!(registry.resolve("Back", (540, 960)).unwrap(), Resolved::Point { x: 270, y: 240 });
    }

    #[test]
    fn test_unknown_region() {
        let registry = RegionRegistry::default();
        assert_eq!(
            registry.resolve("Nope", (540, 960)),
            Err(RegionError::UnknownRegion("Nope".to_string()))
        );
    }

    #[test]
    fn test_tap_point_is_center() {
        let preset = RegionPreset::rect("Button", 0.2, 0.4, 0.4, 0.6);
        assert_eq!(preset.tap_point((500, 1000)), (150, 500));
    }

    #[test]
    fn test_class_inferred_at_load() {
        let json = r#"{"presets": [
            {"name": "GeneralsListName", "x": 0.1, "y": 0.1, "x_dest": 0.5, "y_dest": 0.15},
            {"name": "GeneralsListCount", "xLoc": 0.4, "yLoc": 0.9, "xDest": 0.6, "yDest": 0.95},
            {"name": "Custom", "x": 0.1, "y": 0.1, "x_dest": 0.2, "y_dest": 0.2, "class": "character_heavy"},
            {"name": "ThreeDots", "x": 0.95, "y": 0.05, "ClickAndDrag": true}
        ]}"#;
        let registry = RegionRegistry::from_json_str(json).unwrap();

        assert_eq!(registry.len(), 4);
        assert_eq!(registry.get("GeneralsListName").unwrap().class, RegionClass::CharacterHeavy);
        assert_eq!(registry.get("GeneralsListCount").unwrap().class, RegionClass::Standard);
        assert_eq!(registry.get("Custom").unwrap().class, RegionClass::CharacterHeavy);
        assert!(registry.get("ThreeDots").unwrap().drag);
    }

    #[test]
    fn test_invalid_presets_skipped() {
        let json = r#"{"presets": [
            {"name": "OutOfRange", "x": 1.5, "y": 0.1},
            {"name": "HalfRect", "x": 0.1, "y": 0.1, "x_dest": 0.2},
            {"name": "Inverted", "x": 0.5, "y": 0.5, "x_dest": 0.2, "y_dest": 0.6},
            {"name": "Good", "x": 0.1, "y": 0.1}
        ]}"#;
        let registry = RegionRegistry::from_json_str(json).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("Good"));
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let registry = RegionRegistry::from_presets([
            RegionPreset::point("Back", 0.1, 0.1),
            RegionPreset::point("Back", 0.9, 0.9),
        ]);
        assert_eq!(registry.resolve("Back", (100, 100)).unwrap(), Resolved::Point { x: 10, y: 10 });
    }

    #[test]
    fn test_demo_table_is_complete() {
        let registry = RegionRegistry::from_json_str(include_str!("../demos/regions.json")).unwrap();
        for name in [
            "ThreeDots",
            "Generals",
            "All",
            "GeneralsListMode",
            "GeneralsListCount",
            "GeneralsFirstGeneral",
            "GeneralsListMoveRight",
            "Back",
            "GeneralsListCultivateVariant",
            "GeneralsListSpecialtyReduced3",
            "GeneralsListSpecialtyImage5",
            "GeneralsListCovenantXOut",
        ] {
            assert!(registry.contains(name), "{} missing", name);
        }
        assert!(matches!(registry.resolve("GeneralsListMode", (540, 960)), Ok(Resolved::Rect(_))));
    }
}
