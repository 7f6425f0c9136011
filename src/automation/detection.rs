//! Reference-image comparison for filter toggles and inactive buttons.
//!
//! A screen region "matches" its reference when the mean squared error between the
//! two (after resizing the region to the reference size) is below a strict bound.

use image::imageops::FilterType;
use image::RgbImage;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// MSE bound on the 0-255 channel scale.
pub const REFERENCE_MSE_THRESHOLD: f64 = 10.0;

/// Mean squared error over all channels of two equally sized images.
pub fn mean_squared_error(a: &RgbImage, b: &RgbImage) -> f64 {
    let n = a.as_raw().len().min(b.as_raw().len());
    if n == 0 {
        return f64::INFINITY;
    }
    let total: f64 = a.as_raw()[..n]
        .iter()
        .zip(&b.as_raw()[..n])
        .map(|(&x, &y)| {
            let d = x as f64 - y as f64;
            d * d
        })
        .sum();
    total / n as f64
}

/// Compares `region` with `reference`, resizing the region when sizes differ.
///
/// Returns whether they match and the measured error.
pub fn compare_with_reference(region: &RgbImage, reference: &RgbImage) -> (bool, f64) {
    let resized;
    let region = if region.dimensions() == reference.dimensions() {
        region
    } else {
        resized = image::imageops::resize(region, reference.width(), reference.height(), FilterType::Lanczos3);
        &resized
    };
    let mse = mean_squared_error(region, reference);
    (mse < REFERENCE_MSE_THRESHOLD, mse)
}

/// Reference images by preset name, loaded lazily from `<dir>/<name>.png`.
///
/// A missing file is remembered as missing so it is only reported once.
pub struct ReferenceImages {
    dir: PathBuf,
    cache: HashMap<String, Option<RgbImage>>,
}

impl ReferenceImages {
    pub fn new(dir: &Path) -> Self {
        Self { dir: dir.to_path_buf(), cache: HashMap::new() }
    }

    /// Registers an in-memory reference, overriding the directory.
    pub fn insert(&mut self, name: &str, image: RgbImage) {
        self.cache.insert(name.to_string(), Some(image));
    }

    pub fn get(&mut self, name: &str) -> Option<&RgbImage> {
        if !self.cache.contains_key(name) {
            let path = self.dir.join(format!("{}.png", name));
            let loaded = match image::open(&path) {
                Ok(img) => {
                    debug!("Loaded reference image {}", path.display());
                    Some(img.to_rgb8())
                }
                Err(e) => {
                    warn!("Reference image not found: {} ({})", path.display(), e);
                    None
                }
            };
            self.cache.insert(name.to_string(), loaded);
        }
        self.cache.get(name).and_then(|img| img.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_identical_images_match() {
        let img = RgbImage::from_pixel(10, 10, Rgb([100, 150, 200]));
        let (matched, mse) = compare_with_reference(&img, &img);
        assert!(matched);
        assert_eq!(mse, 0.0);
    }

    #[test]
    fn test_small_difference_matches_large_does_not() {
        let a = RgbImage::from_pixel(10, 10, Rgb([100, 100, 100]));
        let near = RgbImage::from_pixel(10, 10, Rgb([103, 103, 103]));
        let far = RgbImage::from_pixel(10, 10, Rgb([110, 100, 100]));

        // 3^2 = 9 < 10
        assert!(compare_with_reference(&near, &a).0);
        // (100 + 0 + 0) / 3 = 33.3
        assert!(!compare_with_reference(&far, &a).0);
    }

    #[test]
    fn test_region_resized_to_reference() {
        let region = RgbImage::from_pixel(20, 8, Rgb([50, 60, 70]));
        let reference = RgbImage::from_pixel(10, 4, Rgb([50, 60, 70]));
        let (matched, mse) = compare_with_reference(&region, &reference);
        assert!(matched, "mse was {}", mse);
    }

    #[test]
    fn test_missing_reference_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut refs = ReferenceImages::new(dir.path());
        assert!(refs.get("GeneralsListMode").is_none());

        refs.insert("GeneralsListMode", RgbImage::new(2, 2));
        assert!(refs.get("GeneralsListMode").is_some());
    }

    #[test]
    fn test_reference_loaded_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(3, 3, Rgb([1, 2, 3])).save(dir.path().join("Back.png")).unwrap();
        let mut refs = ReferenceImages::new(dir.path());
        assert_eq!(refs.get("Back").map(|i| i.dimensions()), Some((3, 3)));
    }
}
