//! Device access: the emulator is driven through a small trait so the collector
//! can run against a scripted device in tests.

pub mod adb;

use anyhow::Result;
use image::RgbImage;

pub use adb::AdbDevice;

/// Screen size assumed until the device reports its own.
pub const FALLBACK_SCREEN_SIZE: (u32, u32) = (540, 960);

/// Operations the navigator needs from a device.
pub trait Device {
    fn connect(&mut self) -> Result<()>;
    /// Best effort; failures are logged by the implementation.
    fn disconnect(&mut self);
    /// Returns PNG-encoded screenshot bytes.
    fn capture_screenshot(&mut self) -> Result<Vec<u8>>;
    fn send_tap(&mut self, x: u32, y: u32) -> Result<()>;
    fn screen_size(&mut self) -> Result<(u32, u32)>;
}

/// One decoded screenshot. Never mutated after capture.
#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
}

impl Frame {
    pub fn decode(bytes: &[u8]) -> image::ImageResult<Self> {
        let image = image::load_from_memory(bytes)?.to_rgb8();
        Ok(Self { image })
    }

    pub fn from_image(image: RgbImage) -> Self {
        Self { image }
    }

    pub fn size(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}
