//! Navigation state machine for the generals list.
//!
//! The navigator sequences: Unknown → ListScreen → ListScreenFiltered →
//! EntityDetail → {Cultivation, Specialty, Covenant} → EntityDetail, and restores
//! the list filters afterwards. Every tap is followed by a fixed settle delay and
//! the configured transition delay.

use image::RgbImage;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::automation::config::AppConfig;
use crate::automation::detection::{compare_with_reference, ReferenceImages};
use crate::device::{Device, Frame, FALLBACK_SCREEN_SIZE};
use crate::ocr::extract::{ExtractionPipeline, FailureReason};
use crate::ocr::preprocess::crop_rect;
use crate::regions::{RegionError, RegionRegistry, Resolved};

/// Navigator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
    Unknown,
    ListScreen,
    ListScreenFiltered,
    EntityDetail,
    CultivationSub,
    SpecialtySub,
    CovenantSub,
}

impl fmt::Display for NavState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavState::Unknown => write!(f, "Unknown"),
            NavState::ListScreen => write!(f, "List screen"),
            NavState::ListScreenFiltered => write!(f, "List screen (filtered)"),
            NavState::EntityDetail => write!(f, "Entity detail"),
            NavState::CultivationSub => write!(f, "Cultivation"),
            NavState::SpecialtySub => write!(f, "Specialty"),
            NavState::CovenantSub => write!(f, "Covenant"),
        }
    }
}

#[derive(Debug, Error)]
pub enum NavError {
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error("tap on {preset} failed: {error:#}")]
    Tap {
        preset: String,
        error: anyhow::Error,
    },
    #[error("screenshot failed: {0:#}")]
    Capture(anyhow::Error),
    #[error("screenshot could not be decoded: {0}")]
    Decode(#[from] image::ImageError),
}

impl NavError {
    pub fn reason(&self) -> FailureReason {
        match self {
            NavError::Region(_) => FailureReason::UnknownRegion,
            NavError::Tap { .. } => FailureReason::TapFailed,
            NavError::Capture(_) => FailureReason::NoScreenshot,
            NavError::Decode(_) => FailureReason::DecodeFailed,
        }
    }
}

/// Outcome of a speculative sub-screen transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Entered,
    /// The feature is inactive for this entity; nothing was tapped.
    NotAvailable,
}

/// The three list toggles the collection run normalizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Mode,
    Favorites,
    Idle,
}

impl Filter {
    pub const ALL: [Filter; 3] = [Filter::Mode, Filter::Favorites, Filter::Idle];

    pub fn preset(&self) -> &'static str {
        match self {
            Filter::Mode => "GeneralsListMode",
            Filter::Favorites => "GeneralsListFavorites",
            Filter::Idle => "GeneralsListIdle",
        }
    }

    /// References show each toggle's inactive look. Mode must end up active, so a
    /// match means tap; favorites and idle must end up inactive, so a mismatch means tap.
    fn needs_tap(&self, matches_reference: bool) -> bool {
        match self {
            Filter::Mode => matches_reference,
            Filter::Favorites | Filter::Idle => !matches_reference,
        }
    }
}

/// Which filters this run toggled. Produced by `set_list_state`, consumed by
/// `reset_list_state`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStateFlags {
    mode: bool,
    favorites: bool,
    idle: bool,
}

impl FilterStateFlags {
    /// Records one tap on `filter`. Two taps cancel out.
    pub fn record_toggle(&mut self, filter: Filter) {
        let flag = self.flag_mut(filter);
        *flag = !*flag;
    }

    pub fn is_changed(&self, filter: Filter) -> bool {
        match filter {
            Filter::Mode => self.mode,
            Filter::Favorites => self.favorites,
            Filter::Idle => self.idle,
        }
    }

    pub fn changed(&self) -> Vec<Filter> {
        Filter::ALL.into_iter().filter(|f| self.is_changed(*f)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changed().is_empty()
    }

    fn flag_mut(&mut self, filter: Filter) -> &mut bool {
        match filter {
            Filter::Mode => &mut self.mode,
            Filter::Favorites => &mut self.favorites,
            Filter::Idle => &mut self.idle,
        }
    }
}

/// `set_list_state` stopped partway; `applied` holds the taps already made.
#[derive(Debug, Error)]
#[error("setting list filters failed: {source}")]
pub struct FilterSetupError {
    pub applied: FilterStateFlags,
    #[source]
    pub source: NavError,
}

/// Wait durations between UI actions.
#[derive(Debug, Clone, Copy)]
pub struct NavigatorTiming {
    /// Fixed wait after every tap
    pub settle: Duration,
    /// Configured extra wait after every tap
    pub transition: Duration,
    /// Wait after selecting a specialty slot
    pub slot_settle: Duration,
    /// Wait for the covenant general view to open
    pub covenant_open: Duration,
}

impl NavigatorTiming {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            settle: Duration::from_millis(500),
            transition: config.transition_delay(),
            slot_settle: Duration::from_millis(500),
            covenant_open: Duration::from_secs(1),
        }
    }

    pub fn zero() -> Self {
        Self {
            settle: Duration::ZERO,
            transition: Duration::ZERO,
            slot_settle: Duration::ZERO,
            covenant_open: Duration::ZERO,
        }
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

pub struct Navigator<D: Device> {
    device: D,
    registry: Arc<RegionRegistry>,
    references: ReferenceImages,
    timing: NavigatorTiming,
    screen_size: (u32, u32),
    state: NavState,
}

impl<D: Device> Navigator<D> {
    pub fn new(
        device: D,
        registry: Arc<RegionRegistry>,
        references: ReferenceImages,
        timing: NavigatorTiming,
    ) -> Self {
        Self {
            device,
            registry,
            references,
            timing,
            screen_size: FALLBACK_SCREEN_SIZE,
            state: NavState::Unknown,
        }
    }

    pub fn state(&self) -> NavState {
        self.state
    }

    pub fn screen_size(&self) -> (u32, u32) {
        self.screen_size
    }

    pub fn timing(&self) -> &NavigatorTiming {
        &self.timing
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn connect(&mut self) -> anyhow::Result<()> {
        self.device.connect()
    }

    pub fn disconnect(&mut self) {
        self.device.disconnect();
    }

    /// Asks the device for its size; keeps the fallback when it cannot tell.
    pub fn refresh_screen_size(&mut self) {
        match self.device.screen_size() {
            Ok(size) => {
                info!("Detected screen size: {}x{}", size.0, size.1);
                self.screen_size = size;
            }
            Err(e) => {
                warn!(
                    "Failed to detect screen size ({:#}), using {}x{}",
                    e, FALLBACK_SCREEN_SIZE.0, FALLBACK_SCREEN_SIZE.1
                );
                self.screen_size = FALLBACK_SCREEN_SIZE;
            }
        }
    }

    /// Taps the center of `preset`, then waits settle + transition.
    pub fn tap_preset(&mut self, preset: &str) -> Result<(), NavError> {
        let (x, y) = self.registry.get(preset)?.tap_point(self.screen_size);
        debug!("Tapping {} at ({}, {})", preset, x, y);
        self.device
            .send_tap(x, y)
            .map_err(|error| NavError::Tap { preset: preset.to_string(), error })?;
        pause(self.timing.settle);
        pause(self.timing.transition);
        Ok(())
    }

    /// Waits without touching the device. Used between slot selection and capture.
    pub fn wait(&self, duration: Duration) {
        pause(duration);
    }

    pub fn capture_frame(&mut self) -> Result<Frame, NavError> {
        let bytes = self.device.capture_screenshot().map_err(NavError::Capture)?;
        Ok(Frame::decode(&bytes)?)
    }

    pub fn navigate_to_list(&mut self) -> Result<(), NavError> {
        info!("Navigating to generals list");
        self.tap_preset("ThreeDots")?;
        self.tap_preset("Generals")?;
        pause(self.timing.transition);
        self.state = NavState::ListScreen;
        Ok(())
    }

    /// Normalizes the list filters: "All", mode on, favorites off, idle off.
    ///
    /// Every tap is recorded in the returned flags so `reset_list_state` can undo it.
    pub fn set_list_state(&mut self) -> Result<FilterStateFlags, FilterSetupError> {
        info!("Setting generals list state");
        let mut flags = FilterStateFlags::default();
        let fail = |applied, source| FilterSetupError { applied, source };

        self.tap_preset("All").map_err(|e| fail(flags, e))?;
        let frame = self.capture_frame().map_err(|e| fail(flags, e))?;

        for filter in Filter::ALL {
            let matches = self.matches_reference(filter.preset(), &frame);
            if filter.needs_tap(matches) {
                info!("Toggling {} (reference match: {})", filter.preset(), matches);
                self.tap_preset(filter.preset()).map_err(|e| fail(flags, e))?;
                flags.record_toggle(filter);
            } else {
                info!("{} already in desired state", filter.preset());
            }
        }

        info!(
            "Filter states set: mode={}, favorites={}, idle={}",
            flags.mode, flags.favorites, flags.idle
        );
        self.state = NavState::ListScreenFiltered;
        Ok(flags)
    }

    /// Replays exactly the taps recorded in `flags`. Each tap is attempted once;
    /// failures are logged and the remaining filters are still restored.
    pub fn reset_list_state(&mut self, flags: &FilterStateFlags) {
        info!("Resetting generals list state");
        for filter in flags.changed() {
            if let Err(e) = self.tap_preset(filter.preset()) {
                warn!("Failed to restore {}: {}", filter.preset(), e);
            }
        }
    }

    /// Reads the `current / total` counter and returns (current, raw text).
    pub fn read_entity_count(&mut self, pipeline: &ExtractionPipeline) -> (i64, String) {
        let frame = match self.capture_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Count screenshot failed: {}", e);
                return (0, String::new());
            }
        };
        match pipeline.extract_text(&frame, "GeneralsListCount") {
            Ok(result) => parse_count(&result.text),
            Err(failure) => {
                warn!("Count extraction failed: {}", failure);
                (0, String::new())
            }
        }
    }

    /// Opens entity `index` (1-based): the first via its own target, later ones
    /// by stepping right from the previous entity.
    pub fn open_entity(&mut self, index: usize) -> Result<(), NavError> {
        if index <= 1 {
            self.tap_preset("GeneralsFirstGeneral")?;
        } else {
            self.tap_preset("GeneralsListMoveRight")?;
        }
        self.state = NavState::EntityDetail;
        Ok(())
    }

    pub fn close_details(&mut self) -> Result<(), NavError> {
        self.tap_preset("Back")?;
        self.state = match self.state {
            NavState::CultivationSub | NavState::SpecialtySub | NavState::CovenantSub => {
                NavState::EntityDetail
            }
            _ => NavState::ListScreenFiltered,
        };
        Ok(())
    }

    pub fn enter_cultivation(&mut self) -> Result<Transition, NavError> {
        self.tap_preset("GeneralsListCultivate")?;
        self.state = NavState::CultivationSub;
        Ok(Transition::Entered)
    }

    pub fn enter_specialty(&mut self) -> Result<Transition, NavError> {
        self.tap_preset("GeneralsListSpecialty")?;
        self.state = NavState::SpecialtySub;
        Ok(Transition::Entered)
    }

    /// Skips the covenant screen when its button shows the inactive look.
    pub fn enter_covenant(&mut self) -> Result<Transition, NavError> {
        let frame = self.capture_frame()?;
        if self.matches_reference("GeneralsListCovenant", &frame) {
            info!("Covenant button is inactive, skipping covenant");
            return Ok(Transition::NotAvailable);
        }
        self.tap_preset("GeneralsListCovenant")?;
        self.state = NavState::CovenantSub;
        Ok(Transition::Entered)
    }

    pub fn open_covenant_general(&mut self) -> Result<(), NavError> {
        self.tap_preset("GeneralsListCovenantGeneral")?;
        pause(self.timing.covenant_open);
        Ok(())
    }

    pub fn next_covenant_general(&mut self) -> Result<(), NavError> {
        self.tap_preset("GeneralsListCovenantRight")
    }

    pub fn close_covenant(&mut self) -> Result<(), NavError> {
        self.tap_preset("GeneralsListCovenantXOut")
    }

    /// Whether `preset`'s region on `frame` looks like its reference image.
    /// Unknown regions and missing references never match.
    pub fn matches_reference(&mut self, preset: &str, frame: &Frame) -> bool {
        let rect = match self.registry.resolve(preset, self.screen_size) {
            Ok(Resolved::Rect(rect)) => rect,
            Ok(Resolved::Point { .. }) => {
                warn!("{} is a point, cannot compare with reference", preset);
                return false;
            }
            Err(e) => {
                warn!("No coordinates for reference check: {}", e);
                return false;
            }
        };
        let Some(region) = crop_rect(&frame.image, &rect) else {
            warn!("{} lies outside the screenshot", preset);
            return false;
        };
        let Some(reference) = self.references.get(preset) else {
            return false;
        };
        let (matched, mse) = compare_with_reference(&region, reference);
        debug!("{} reference MSE {:.2} -> match: {}", preset, mse, matched);
        matched
    }

    /// Overrides a reference image; used when references come from memory.
    pub fn set_reference(&mut self, preset: &str, image: RgbImage) {
        self.references.insert(preset, image);
    }
}

/// Parses `"current/total"`. Anything else yields `(0, text)`.
pub fn parse_count(text: &str) -> (i64, String) {
    let text = text.trim().to_string();
    let parts: Vec<&str> = text.split('/').collect();
    if parts.len() == 2 {
        if let Ok(current) = parts[0].trim().parse::<i64>() {
            return (current, text);
        }
    }
    warn!("Failed to parse count: '{}'", text);
    (0, text)
}
