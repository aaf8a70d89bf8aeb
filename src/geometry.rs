//! Bounding boxes and the (source, page, box) identity shared by the asset store
//! and the catalog.

use crate::errors::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Axis-aligned pixel rectangle, top-left origin, exclusive right/bottom edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Build from inclusive min/max corners as produced by a pixel scan
    pub fn from_corners(min_x: u32, min_y: u32, max_x: u32, max_y: u32) -> Self {
        Self::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height; 0 for degenerate boxes
    pub fn aspect_ratio(&self) -> f64 {
        if self.is_degenerate() {
            return 0.0;
        }
        f64::from(self.width) / f64::from(self.height)
    }

    pub fn intersection_area(&self, other: &BBox) -> u64 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left || bottom <= top {
            return 0;
        }
        u64::from(right - left) * u64::from(bottom - top)
    }

    /// Fraction of this box's area lying inside `other` (0.0 ..= 1.0)
    pub fn fraction_inside(&self, other: &BBox) -> f64 {
        let area = self.area();
        if area == 0 {
            return 0.0;
        }
        self.intersection_area(other) as f64 / area as f64
    }

    pub fn touches_border(&self, page_width: u32, page_height: u32) -> bool {
        self.x == 0 || self.y == 0 || self.right() >= page_width || self.bottom() >= page_height
    }

    /// Grow by `margin` on every side, clamped to the page
    pub fn expand(&self, margin: u32, page_width: u32, page_height: u32) -> BBox {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = self.right().saturating_add(margin).min(page_width);
        let bottom = self.bottom().saturating_add(margin).min(page_height);
        BBox::new(x, y, right.saturating_sub(x), bottom.saturating_sub(y))
    }
}

impl fmt::Display for BBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.x, self.y, self.width, self.height)
    }
}

impl FromStr for BBox {
    type Err = AppError;

    /// Parse `x,y,w,h`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(AppError::Validation(format!(
                "Bounding box must be x,y,w,h: {:?}",
                s
            )));
        }
        let mut values = [0u32; 4];
        for (slot, part) in values.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| {
                AppError::Validation(format!("Invalid bounding box component {:?} in {:?}", part, s))
            })?;
        }
        let bbox = BBox::new(values[0], values[1], values[2], values[3]);
        if bbox.is_degenerate() {
            return Err(AppError::Validation(format!(
                "Bounding box has zero width or height: {}",
                bbox
            )));
        }
        Ok(bbox)
    }
}

/// Stable identity of a candidate and of the glyph derived from it.
///
/// The same key addresses the asset files and the catalog rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionKey {
    pub source: String,
    pub page: u32,
    pub bbox: BBox,
}

impl RegionKey {
    pub fn new(source: impl Into<String>, page: u32, bbox: BBox) -> Self {
        Self {
            source: source.into(),
            page,
            bbox,
        }
    }

    /// File stem used for every asset of this key
    pub fn file_stem(&self) -> String {
        format!(
            "p{:04}_x{}_y{}_w{}_h{}",
            self.page, self.bbox.x, self.bbox.y, self.bbox.width, self.bbox.height
        )
    }

    /// Inverse of [`RegionKey::file_stem`]
    pub fn parse_file_stem(source: &str, stem: &str) -> Option<Self> {
        let mut parts = stem.split('_');
        let page = parts.next()?.strip_prefix('p')?.parse().ok()?;
        let x = parts.next()?.strip_prefix('x')?.parse().ok()?;
        let y = parts.next()?.strip_prefix('y')?.parse().ok()?;
        let w = parts.next()?.strip_prefix('w')?.parse().ok()?;
        let h = parts.next()?.strip_prefix('h')?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(source, page, BBox::new(x, y, w, h)))
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/p{}/{}", self.source, self.page, self.bbox)
    }
}
