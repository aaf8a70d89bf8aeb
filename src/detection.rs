//! # Region Detector
//!
//! Turns a page raster into raw candidate regions: an ink mask is built from a global
//! Otsu threshold combined with an optional local-mean (adaptive) pass, the mask is
//! labelled into 8-connected components, and every component whose pixel area reaches
//! the configured minimum is yielded with its bounding box.
//!
//! Detection is a pure function of the image and the configuration. A page without
//! any region above the threshold yields an empty scan, which is not an error.

use std::path::Path;

use image::{DynamicImage, GrayImage, Luma};
use imageproc::region_labelling::{connected_components, Connectivity};
use tracing::debug;

use crate::config::DetectionConfig;
use crate::errors::PipelineError;
use crate::geometry::BBox;

const INK: u8 = 255;
const PAPER: u8 = 0;

/// Connected component emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegion {
    pub bbox: BBox,
    /// Number of ink pixels in the component (px²)
    pub area: u32,
}

/// Decode a page image from disk
pub fn load_page(path: &Path) -> Result<DynamicImage, PipelineError> {
    image::open(path).map_err(|e| PipelineError::UnreadableImage {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Start a detection scan over a decoded page.
///
/// The returned iterator does the labelling work on its first pull. Each call
/// rescans the page from scratch.
pub fn detect_regions(page: &DynamicImage, config: &DetectionConfig) -> RegionScan {
    RegionScan {
        mask: Some(ink_mask(&page.to_luma8(), config)),
        min_area: config.min_area,
        pending: Vec::new().into_iter(),
        components: 0,
    }
}

/// Lazy, finite sequence of raw regions in label (raster discovery) order
#[derive(Debug)]
pub struct RegionScan {
    mask: Option<GrayImage>,
    min_area: u32,
    pending: std::vec::IntoIter<RawRegion>,
    components: usize,
}

impl RegionScan {
    /// Components labelled on the page, including those below the area threshold.
    ///
    /// Zero until the first call to `next`.
    pub fn components_seen(&self) -> usize {
        self.components
    }
}

impl Iterator for RegionScan {
    type Item = RawRegion;

    fn next(&mut self) -> Option<RawRegion> {
        if let Some(mask) = self.mask.take() {
            let regions = label_components(&mask);
            self.components = regions.len();
            self.pending = regions.into_iter();
        }
        let min_area = self.min_area;
        self.pending.by_ref().find(|region| region.area >= min_area)
    }
}

/// Binary mask with ink pixels set to 255.
///
/// A pixel is ink when it is at or below the Otsu threshold, or when the adaptive pass
/// is enabled and it is darker than its local mean by more than `adaptive_offset`.
pub fn ink_mask(gray: &GrayImage, config: &DetectionConfig) -> GrayImage {
    let threshold = otsu_threshold(gray);
    let (width, height) = gray.dimensions();
    let mut mask = GrayImage::new(width, height);

    let local = if config.adaptive_block_radius > 0 {
        Some(IntegralImage::new(gray))
    } else {
        None
    };
    let radius = config.adaptive_block_radius;
    let offset = f64::from(config.adaptive_offset);

    for (x, y, pixel) in gray.enumerate_pixels() {
        let intensity = pixel[0];
        let mut is_ink = intensity <= threshold;

        if !is_ink {
            if let Some(integral) = &local {
                let mean = integral.window_mean(x, y, radius);
                is_ink = f64::from(intensity) < mean - offset;
            }
        }

        mask.put_pixel(x, y, Luma([if is_ink { INK } else { PAPER }]));
    }

    debug!(
        threshold = threshold,
        adaptive = local.is_some(),
        width = width,
        height = height,
        "Ink mask built"
    );
    mask
}

/// Otsu's method: the threshold maximizing between-class variance.
///
/// Pixels at or below the returned value form the dark class. A histogram without
/// two populated classes falls back to 128.
pub fn otsu_threshold(gray: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in gray.pixels() {
        histogram[pixel[0] as usize] += 1;
    }

    let total_pixels = histogram.iter().sum::<u64>() as f64;
    if total_pixels == 0.0 {
        return 128;
    }

    let mut cumulative_sums = [0f64; 256];
    let mut cumulative_weighted_sums = [0f64; 256];
    let mut cumulative_sum = 0f64;
    let mut cumulative_weighted_sum = 0f64;
    for (i, count) in histogram.iter().enumerate() {
        let pixel_count = *count as f64;
        cumulative_sum += pixel_count;
        cumulative_weighted_sum += (i as f64) * pixel_count;
        cumulative_sums[i] = cumulative_sum;
        cumulative_weighted_sums[i] = cumulative_weighted_sum;
    }

    let total_weighted_sum = cumulative_weighted_sums[255];
    let mut max_variance = 0f64;
    let mut optimal_threshold = 128u8;

    for threshold in 0..255usize {
        let dark = cumulative_sums[threshold];
        let light = total_pixels - dark;
        if dark == 0.0 || light == 0.0 {
            continue;
        }

        let w0 = dark / total_pixels;
        let w1 = 1.0 - w0;
        let mu0 = cumulative_weighted_sums[threshold] / dark;
        let mu1 = (total_weighted_sum - cumulative_weighted_sums[threshold]) / light;

        let variance = w0 * w1 * (mu0 - mu1).powi(2);
        if variance > max_variance {
            max_variance = variance;
            optimal_threshold = threshold as u8;
        }
    }

    optimal_threshold
}

/// Summed-area table for constant-time window means
struct IntegralImage {
    width: u32,
    height: u32,
    sums: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (width, height) = gray.dimensions();
        let stride = width as usize + 1;
        let mut sums = vec![0u64; stride * (height as usize + 1)];

        for y in 0..height as usize {
            let mut row_sum = 0u64;
            for x in 0..width as usize {
                row_sum += u64::from(gray.get_pixel(x as u32, y as u32)[0]);
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row_sum;
            }
        }

        Self {
            width,
            height,
            sums,
        }
    }

    /// Mean intensity of the window of half-size `radius` around (x, y), clipped to the image
    fn window_mean(&self, x: u32, y: u32, radius: u32) -> f64 {
        let stride = self.width as usize + 1;
        let x0 = x.saturating_sub(radius) as usize;
        let y0 = y.saturating_sub(radius) as usize;
        let x1 = (x.saturating_add(radius) + 1).min(self.width) as usize;
        let y1 = (y.saturating_add(radius) + 1).min(self.height) as usize;

        let total = self.sums[y1 * stride + x1] + self.sums[y0 * stride + x0]
            - self.sums[y0 * stride + x1]
            - self.sums[y1 * stride + x0];
        let count = ((x1 - x0) * (y1 - y0)) as f64;
        total as f64 / count
    }
}

#[derive(Debug, Clone, Copy)]
struct ComponentStats {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    pixels: u32,
}

/// Label 8-connected ink components and collect their boxes and areas
fn label_components(mask: &GrayImage) -> Vec<RawRegion> {
    let labels = connected_components(mask, Connectivity::Eight, Luma([PAPER]));
    let mut stats: Vec<Option<ComponentStats>> = Vec::new();

    for (x, y, label) in labels.enumerate_pixels() {
        let label = label[0] as usize;
        if label == 0 {
            continue;
        }
        if stats.len() < label {
            stats.resize(label, None);
        }
        let slot = &mut stats[label - 1];
        match slot {
            Some(s) => {
                s.min_x = s.min_x.min(x);
                s.min_y = s.min_y.min(y);
                s.max_x = s.max_x.max(x);
                s.max_y = s.max_y.max(y);
                s.pixels += 1;
            }
            None => {
                *slot = Some(ComponentStats {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    pixels: 1,
                });
            }
        }
    }

    let regions: Vec<RawRegion> = stats
        .into_iter()
        .flatten()
        .map(|s| RawRegion {
            bbox: BBox::from_corners(s.min_x, s.min_y, s.max_x, s.max_y),
            area: s.pixels,
        })
        .collect();

    debug!(components = regions.len(), "Connected components labelled");
    regions
}
