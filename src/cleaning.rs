//! # Image Cleaner
//!
//! Removes the paper background from a glyph crop:
//!
//! - the background colour is the per-channel median of the crop's border pixels
//! - pixels farther than `background_tolerance` (Euclidean RGB) from it are foreground
//! - an optional morphological closing fills speckle holes in the foreground mask
//! - background pixels become fully transparent; foreground keeps its colour with alpha
//!   255, or a ramp over `soft_edge_width` pixels inside the mask boundary
//!
//! The output is a PNG encoded in memory, its SHA-256 checksum, and an area-averaged
//! thumbnail. Everything here is deterministic so re-cleaning reproduces the same bytes.

use std::io::Cursor;

use image::{imageops, GrayImage, ImageFormat, Luma, Rgb, Rgba, RgbaImage};
use imageproc::distance_transform::{distance_transform, Norm};
use imageproc::morphology::close;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CleaningConfig;
use crate::errors::PipelineError;
use crate::geometry::BBox;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Output of a successful cleaning pass
#[derive(Debug, Clone)]
pub struct CleanedGlyph {
    pub image: RgbaImage,
    pub png: Vec<u8>,
    /// Hex SHA-256 of `png`
    pub checksum: String,
    pub thumbnail: RgbaImage,
    pub thumbnail_png: Vec<u8>,
    pub background: Rgb<u8>,
    pub foreground_pixels: u64,
}

impl CleanedGlyph {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

fn cleaning_failed(reason: impl Into<String>) -> PipelineError {
    PipelineError::CleaningFailed {
        reason: reason.into(),
    }
}

/// Margin added around a candidate box before cropping
pub fn crop_margin(bbox: &BBox, config: &CleaningConfig) -> u32 {
    let shorter = bbox.width.min(bbox.height) as f32;
    let proportional = (shorter * config.crop_margin_ratio).round() as u32;
    config.crop_margin_px.max(proportional)
}

/// Cut a candidate (plus margin) out of a page
pub fn crop_candidate(page: &RgbaImage, bbox: &BBox, config: &CleaningConfig) -> RgbaImage {
    let region = bbox.expand(crop_margin(bbox, config), page.width(), page.height());
    imageops::crop_imm(page, region.x, region.y, region.width, region.height).to_image()
}

/// Clean one crop.
///
/// Fails with `CleaningFailed` on a zero-sized crop, when no opaque border pixel is
/// available to estimate the background, or when nothing in the crop differs from
/// the background.
pub fn clean_crop(crop: &RgbaImage, config: &CleaningConfig) -> Result<CleanedGlyph, PipelineError> {
    let (width, height) = crop.dimensions();
    if width == 0 || height == 0 {
        return Err(cleaning_failed(format!(
            "degenerate crop {}x{}",
            width, height
        )));
    }

    let background = estimate_background(crop)
        .ok_or_else(|| cleaning_failed("no opaque border pixels to estimate background"))?;

    let mut mask = foreground_mask(crop, background, config.background_tolerance);
    if config.closing_radius > 0 {
        mask = close(&mask, Norm::LInf, config.closing_radius);
    }

    let foreground_pixels = mask.pixels().filter(|p| p[0] > 0).count() as u64;
    if foreground_pixels == 0 {
        return Err(cleaning_failed(format!(
            "crop is uniform, nothing differs from background rgb({}, {}, {})",
            background[0], background[1], background[2]
        )));
    }

    let alpha = alpha_channel(&mask, config.soft_edge_width);

    let mut image = RgbaImage::new(width, height);
    for (x, y, pixel) in crop.enumerate_pixels() {
        let a = alpha.get_pixel(x, y)[0];
        let out = if a == 0 {
            TRANSPARENT
        } else {
            Rgba([pixel[0], pixel[1], pixel[2], a])
        };
        image.put_pixel(x, y, out);
    }

    let png = encode_png(&image)?;
    let checksum = sha256_hex(&png);
    let thumbnail = make_thumbnail(&image, config.thumbnail_size);
    let thumbnail_png = encode_png(&thumbnail)?;

    debug!(
        width = width,
        height = height,
        foreground_pixels = foreground_pixels,
        checksum = %checksum,
        "Crop cleaned"
    );

    Ok(CleanedGlyph {
        image,
        png,
        checksum,
        thumbnail,
        thumbnail_png,
        background,
        foreground_pixels,
    })
}

/// Per-channel median of the opaque border pixels
pub fn estimate_background(crop: &RgbaImage) -> Option<Rgb<u8>> {
    let (width, height) = crop.dimensions();
    if width == 0 || height == 0 {
        return None;
    }

    let mut channels: [Vec<u8>; 3] = [Vec::new(), Vec::new(), Vec::new()];
    let mut sample = |x: u32, y: u32| {
        let p = crop.get_pixel(x, y);
        if p[3] > 0 {
            for (channel, values) in channels.iter_mut().enumerate() {
                values.push(p[channel]);
            }
        }
    };

    for x in 0..width {
        sample(x, 0);
        if height > 1 {
            sample(x, height - 1);
        }
    }
    for y in 1..height.saturating_sub(1) {
        sample(0, y);
        if width > 1 {
            sample(width - 1, y);
        }
    }

    let mut median = [0u8; 3];
    for (slot, values) in median.iter_mut().zip(channels.iter_mut()) {
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();
        *slot = values[values.len() / 2];
    }
    Some(Rgb(median))
}

/// Foreground pixels set to 255.
///
/// Fully transparent input pixels are always background.
pub fn foreground_mask(crop: &RgbaImage, background: Rgb<u8>, tolerance: f32) -> GrayImage {
    let tolerance_sq = f64::from(tolerance) * f64::from(tolerance);
    let mut mask = GrayImage::new(crop.width(), crop.height());
    for (x, y, p) in crop.enumerate_pixels() {
        if p[3] == 0 {
            continue;
        }
        let distance_sq: f64 = (0..3)
            .map(|c| {
                let d = f64::from(p[c]) - f64::from(background[c]);
                d * d
            })
            .sum();
        if distance_sq > tolerance_sq {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// Alpha from the foreground mask.
///
/// With a soft edge of width `w`, a foreground pixel at chessboard distance `d` from
/// the nearest background pixel gets `255 * d / (w + 1)` while `d <= w`.
fn alpha_channel(mask: &GrayImage, soft_edge_width: u8) -> GrayImage {
    if soft_edge_width == 0 {
        return mask.clone();
    }

    // distance_transform measures distance to the nearest non-zero pixel
    let mut background = GrayImage::new(mask.width(), mask.height());
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            background.put_pixel(x, y, Luma([255]));
        }
    }
    let distances = distance_transform(&background, Norm::LInf);

    let ramp = u32::from(soft_edge_width) + 1;
    let mut alpha = GrayImage::new(mask.width(), mask.height());
    for (x, y, p) in mask.enumerate_pixels() {
        if p[0] == 0 {
            continue;
        }
        let d = u32::from(distances.get_pixel(x, y)[0]);
        let a = if d >= ramp { 255 } else { (255 * d / ramp).max(1) };
        alpha.put_pixel(x, y, Luma([a as u8]));
    }
    alpha
}

/// Downscale so the longest side equals `size`, area-averaged. Never upscales.
pub fn make_thumbnail(image: &RgbaImage, size: u32) -> RgbaImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if longest <= size {
        return image.clone();
    }
    let scale = f64::from(size) / f64::from(longest);
    let thumb_width = ((f64::from(width) * scale).round() as u32).max(1);
    let thumb_height = ((f64::from(height) * scale).round() as u32).max(1);
    imageops::thumbnail(image, thumb_width, thumb_height)
}

/// Encode an RGBA image as PNG bytes
pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, PipelineError> {
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|e| cleaning_failed(format!("PNG encoding failed: {}", e)))?;
    Ok(bytes)
}

/// Hex SHA-256 digest
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn white_crop_with_square(size: u32, square: BBox) -> RgbaImage {
        let mut img = RgbaImage::from_pixel(size, size, Rgba([255, 255, 255, 255]));
        for y in square.y..square.bottom() {
            for x in square.x..square.right() {
                img.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        img
    }

    #[test]
    fn test_hard_edge_alpha() {
        let crop = white_crop_with_square(48, BBox::new(4, 4, 40, 40));
        let cleaned = clean_crop(&crop, &CleaningConfig::default()).unwrap();

        assert_eq!(cleaned.background, Rgb([255, 255, 255]));
        assert_eq!(cleaned.foreground_pixels, 1600);
        assert_eq!(cleaned.image.get_pixel(0, 0)[3], 0);
        assert_eq!(*cleaned.image.get_pixel(3, 20), TRANSPARENT);
        assert_eq!(*cleaned.image.get_pixel(4, 4), Rgba([0, 0, 0, 255]));
        assert_eq!(cleaned.image.get_pixel(24, 24)[3], 255);
    }

    #[test]
    fn test_cleaning_is_byte_identical() {
        let crop = white_crop_with_square(60, BBox::new(10, 12, 30, 25));
        let config = CleaningConfig {
            soft_edge_width: 2,
            ..Default::default()
        };
        let first = clean_crop(&crop, &config).unwrap();
        let second = clean_crop(&crop, &config).unwrap();
        assert_eq!(first.png, second.png);
        assert_eq!(first.checksum, second.checksum);
        assert_eq!(first.thumbnail_png, second.thumbnail_png);
    }

    #[test]
    fn test_soft_edge_ramps_inside_boundary() {
        let crop = white_crop_with_square(40, BBox::new(10, 10, 20, 20));
        let config = CleaningConfig {
            soft_edge_width: 2,
            closing_radius: 0,
            ..Default::default()
        };
        let cleaned = clean_crop(&crop, &config).unwrap();
        assert_eq!(cleaned.image.get_pixel(10, 20)[3], 85);
        assert_eq!(cleaned.image.get_pixel(11, 20)[3], 170);
        assert_eq!(cleaned.image.get_pixel(12, 20)[3], 255);
        assert_eq!(cleaned.image.get_pixel(9, 20)[3], 0);
    }

    #[test]
    fn test_uniform_crop_fails() {
        let crop = RgbaImage::from_pixel(30, 30, Rgba([0, 0, 0, 255]));
        let err = clean_crop(&crop, &CleaningConfig::default()).unwrap_err();
        assert_eq!(err.code(), "cleaning_failed");
    }

    #[test]
    fn test_degenerate_and_transparent_crops_fail() {
        let empty = RgbaImage::new(0, 10);
        assert!(clean_crop(&empty, &CleaningConfig::default()).is_err());

        let transparent = RgbaImage::from_pixel(10, 10, TRANSPARENT);
        assert!(clean_crop(&transparent, &CleaningConfig::default()).is_err());
    }

    #[test]
    fn test_background_median_ignores_minority_border_ink() {
        let mut crop = RgbaImage::from_pixel(10, 10, Rgba([240, 235, 220, 255]));
        crop.put_pixel(0, 0, Rgba([0, 0, 0, 255]));
        crop.put_pixel(5, 0, Rgba([0, 0, 0, 255]));
        assert_eq!(estimate_background(&crop), Some(Rgb([240, 235, 220])));
    }

    #[test]
    fn test_thumbnail_keeps_aspect_and_never_upscales() {
        let wide = RgbaImage::from_pixel(400, 100, Rgba([10, 10, 10, 255]));
        let thumb = make_thumbnail(&wide, 200);
        assert_eq!(thumb.dimensions(), (200, 50));

        let small = RgbaImage::from_pixel(40, 20, Rgba([10, 10, 10, 255]));
        assert_eq!(make_thumbnail(&small, 200).dimensions(), (40, 20));
    }

    #[test]
    fn test_crop_margin() {
        let config = CleaningConfig::default();
        assert_eq!(crop_margin(&BBox::new(0, 0, 40, 40), &config), 4);
        assert_eq!(crop_margin(&BBox::new(0, 0, 400, 300), &config), 15);

        let page = RgbaImage::from_pixel(100, 100, Rgba([255, 255, 255, 255]));
        let crop = crop_candidate(&page, &BBox::new(2, 50, 40, 40), &config);
        assert_eq!(crop.dimensions(), (46, 48));
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
