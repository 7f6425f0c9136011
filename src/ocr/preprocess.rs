//! Region-class-specific image enhancement applied before OCR.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::otsu_level;
use imageproc::map::map_colors2;
use imageproc::morphology::{grayscale_dilate, grayscale_open, Mask};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::debug;

use crate::regions::{PixelRect, RegionClass};

/// Light text colors used for names, levels, power and experience.
const GENERAL_TEXT_COLORS: [[u8; 3]; 2] = [[255, 251, 214], [222, 214, 181]];
const GENERAL_TEXT_TOLERANCE: i32 = 30;

/// Percentage passed to `imageops::contrast`; doubles the slope around mid-gray.
const STANDARD_CONTRAST: f32 = 41.42;
const SHARPEN_SIGMA: f32 = 1.0;
const SHARPEN_THRESHOLD: i32 = 2;

/// Crops `rect` out of `img`, clamping to the image bounds.
///
/// Returns `None` when nothing of the rectangle lies inside the image.
pub fn crop_rect(img: &RgbImage, rect: &PixelRect) -> Option<RgbImage> {
    let (w, h) = img.dimensions();
    let x0 = rect.x0.min(w);
    let y0 = rect.y0.min(h);
    let x1 = rect.x1.min(w);
    let y1 = rect.y1.min(h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image::imageops::crop_imm(img, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Runs the enhancement chain for `class` and returns the grayscale image handed to OCR.
pub fn enhance_for_class(img: &RgbImage, class: RegionClass) -> GrayImage {
    match class {
        RegionClass::CharacterHeavy => {
            let isolated = enhance_general_text(img);
            enhance_character_recognition(&isolated)
        }
        RegionClass::Standard => {
            let lifted = enhance_light_text(img);
            let cleaned = remove_green_elements(&lifted);
            let gray = image::imageops::grayscale(&cleaned);
            let contrasted = image::imageops::contrast(&gray, STANDARD_CONTRAST);
            image::imageops::unsharpen(&contrasted, SHARPEN_SIGMA, SHARPEN_THRESHOLD)
        }
    }
}

/// Converts pixels close to the known text colors to black and everything else to white.
///
/// A pixel matches when every channel is within the tolerance of one of the colors.
pub fn enhance_general_text(img: &RgbImage) -> RgbImage {
    let mut matched = 0usize;
    let out = RgbImage::from_fn(img.width(), img.height(), |x, y| {
        let p = img.get_pixel(x, y);
        let is_text = GENERAL_TEXT_COLORS.iter().any(|color| {
            (0..3).all(|c| (p[c] as i32 - color[c] as i32).abs() <= GENERAL_TEXT_TOLERANCE)
        });
        if is_text {
            matched += 1;
            Rgb([0, 0, 0])
        } else {
            Rgb([255, 255, 255])
        }
    });
    debug!(
        "General text enhancement: {} of {} pixels matched",
        matched,
        img.width() as usize * img.height() as usize
    );
    out
}

/// Conservative stroke-preserving morphology on an already binarized crop.
///
/// Thin vertical strokes ("1", "I") survive because nothing here erodes without
/// OR-ing the Otsu binary back in at the end.
pub fn enhance_character_recognition(img: &RgbImage) -> GrayImage {
    let gray = image::imageops::grayscale(img);
    let level = otsu_level(&gray);
    let binary = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        if gray.get_pixel(x, y)[0] > level { Luma([255]) } else { Luma([0]) }
    });

    let vertical_kernel = rect_mask(1, 3);
    let vertical = grayscale_dilate(&grayscale_open(&binary, &vertical_kernel), &vertical_kernel);
    let with_vertical = map_colors2(&binary, &vertical, |b, v| blend(b, v, 0.3));

    let horizontal = grayscale_open(&with_vertical, &rect_mask(2, 1));
    let enhanced = map_colors2(&with_vertical, &horizontal, |b, h| blend(b, h, 0.1));

    map_colors2(&enhanced, &binary, |e, b| Luma([e[0] | b[0]]))
}

/// Brightens yellow and near-white text and darkens everything else.
pub fn enhance_light_text(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let mut enhanced: Vec<[f32; 3]> = Vec::with_capacity((width * height) as usize);
    let mut lifted = 0usize;

    for p in img.pixels() {
        let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
        let yellow = (20..=40).contains(&h) && s >= 30 && v >= 140;
        let bright = s <= 40 && v >= 160;
        let px = [p[0] as f32, p[1] as f32, p[2] as f32];
        if yellow || bright {
            lifted += 1;
            enhanced.push(px.map(|c| (c * 1.8 + 50.0).clamp(0.0, 255.0)));
        } else {
            enhanced.push(px.map(|c| c * 0.6));
        }
    }

    // Second pass over whatever is bright after the first adjustment.
    for px in enhanced.iter_mut() {
        let (_, s, v) = rgb_to_hsv(px[0] as u8, px[1] as u8, px[2] as u8);
        if s <= 50 && v >= 200 {
            *px = px.map(|c| (c * 1.2 + 20.0).clamp(0.0, 255.0));
        }
    }

    debug!("Enhanced {} light text pixels", lifted);
    RgbImage::from_fn(width, height, |x, y| {
        let px = enhanced[(y * width + x) as usize];
        Rgb(px.map(|c| c.clamp(0.0, 255.0) as u8))
    })
}

/// Paints over thin green progress bars with the average background color.
pub fn remove_green_elements(img: &RgbImage) -> RgbImage {
    let (width, height) = img.dimensions();
    let green = GrayImage::from_fn(width, height, |x, y| {
        let p = img.get_pixel(x, y);
        let (h, s, v) = rgb_to_hsv(p[0], p[1], p[2]);
        if h >= 33 && s >= 53 && v <= 123 { Luma([255]) } else { Luma([0]) }
    });
    let green = grayscale_open(&green, &rect_mask(2, 2));

    let labels = connected_components(&green, Connectivity::Eight, Luma([0u8]));
    let component_count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    if component_count == 0 {
        return img.clone();
    }

    // Per label: pixel count and bounding box
    let mut stats = vec![(0u32, u32::MAX, u32::MAX, 0u32, 0u32); component_count + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label[0] as usize;
        if l == 0 {
            continue;
        }
        let s = &mut stats[l];
        s.0 += 1;
        s.1 = s.1.min(x);
        s.2 = s.2.min(y);
        s.3 = s.3.max(x);
        s.4 = s.4.max(y);
    }

    let remove: Vec<bool> = stats
        .iter()
        .map(|&(area, x0, y0, x1, y1)| {
            if area <= 20 || area >= 2000 {
                return false;
            }
            let w = (x1 - x0 + 1) as f32;
            let h = (y1 - y0 + 1) as f32;
            w / h > 2.0
        })
        .collect();

    let is_removed = |x: u32, y: u32| {
        let l = labels.get_pixel(x, y)[0] as usize;
        l != 0 && remove[l]
    };

    let mut sum = [0u64; 3];
    let mut kept = 0u64;
    let mut removed = 0usize;
    for (x, y, p) in img.enumerate_pixels() {
        if is_removed(x, y) {
            removed += 1;
        } else {
            for c in 0..3 {
                sum[c] += p[c] as u64;
            }
            kept += 1;
        }
    }
    if removed == 0 {
        return img.clone();
    }

    let fill = if kept > 0 {
        Rgb(sum.map(|s| (s / kept) as u8))
    } else {
        Rgb([128, 128, 128])
    };

    debug!("Removed {} green pixels from progress bars", removed);
    RgbImage::from_fn(width, height, |x, y| {
        if is_removed(x, y) { fill } else { *img.get_pixel(x, y) }
    })
}

/// RGB to HSV on the 8-bit scale used by most vision tooling: H 0-179, S and V 0-255.
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;

    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * (((b - r) / delta) + 2.0)
    } else {
        60.0 * (((r - g) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let h = ((h / 2.0).round() as u32 % 180) as u8;

    let s = if max == 0.0 { 0.0 } else { delta / max };

    (h, (s * 255.0).round() as u8, (max * 255.0).round() as u8)
}

/// Solid `kw` x `kh` structuring element anchored at its center.
fn rect_mask(kw: u8, kh: u8) -> Mask {
    let shape = GrayImage::from_pixel(kw as u32, kh as u32, Luma([255]));
    Mask::from_image(&shape, kw / 2, kh / 2)
}

/// `base + weight * extra`, saturating at 255.
fn blend(base: Luma<u8>, extra: Luma<u8>, weight: f32) -> Luma<u8> {
    Luma([(base[0] as f32 + weight * extra[0] as f32).round().clamp(0.0, 255.0) as u8])
}
