//! Detector, filter and cleaner properties on synthetic images

mod test_helpers;

use glyph_catalog::cleaning::{clean_crop, crop_candidate};
use glyph_catalog::config::{CleaningConfig, DetectionConfig, FilterConfig};
use glyph_catalog::detection::{detect_regions, RawRegion};
use glyph_catalog::filter::{filter_candidates, CandidateStatus, RejectReason};
use glyph_catalog::geometry::BBox;
use image::{DynamicImage, RgbaImage};
use test_helpers::*;

fn detection_config(min_area: u32) -> DetectionConfig {
    DetectionConfig {
        min_area,
        ..Default::default()
    }
}

#[test]
fn test_single_rectangle_detected_iff_area_reaches_threshold() {
    for (width, height) in [(10, 10), (30, 20), (40, 40), (12, 50)] {
        let mut page = white_page(160, 160);
        fill_rect(&mut page, 50, 60, width, height, BLACK);
        let page = DynamicImage::ImageRgb8(page);
        let area = width * height;

        for min_area in [area - 1, area, area + 1] {
            let regions: Vec<RawRegion> =
                detect_regions(&page, &detection_config(min_area)).collect();
            if area >= min_area {
                assert_eq!(regions.len(), 1, "{}x{} min_area {}", width, height, min_area);
                assert_eq!(regions[0].area, area);
                assert_eq!(regions[0].bbox, BBox::new(50, 60, width, height));
            } else {
                assert!(regions.is_empty(), "{}x{} min_area {}", width, height, min_area);
            }
        }
    }
}

#[test]
fn test_filter_is_deterministic_and_row_major() {
    let mut regions = vec![
        RawRegion { bbox: BBox::new(300, 40, 30, 30), area: 900 },
        RawRegion { bbox: BBox::new(10, 200, 30, 30), area: 900 },
        RawRegion { bbox: BBox::new(10, 40, 30, 30), area: 900 },
        RawRegion { bbox: BBox::new(150, 40, 300, 10), area: 3000 },
        RawRegion { bbox: BBox::new(150, 120, 40, 40), area: 1600 },
    ];
    let config = FilterConfig::default();

    let first = filter_candidates(regions.clone(), 1000, 1000, &config);
    regions.reverse();
    let second = filter_candidates(regions.clone(), 1000, 1000, &config);
    regions.rotate_left(2);
    let third = filter_candidates(regions, 1000, 1000, &config);

    assert_eq!(first, second);
    assert_eq!(first, third);

    let accepted: Vec<(u32, u32)> = first
        .iter()
        .filter(|c| c.is_accepted())
        .map(|c| (c.bbox.y, c.bbox.x))
        .collect();
    let mut sorted = accepted.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(accepted, sorted);
    assert_eq!(accepted.len(), 4);

    let wide = first.iter().find(|c| c.bbox.width == 300).unwrap();
    assert_eq!(wide.status, CandidateStatus::Rejected);
    assert_eq!(wide.reason, Some(RejectReason::AspectRatio));
}

#[test]
fn test_contained_box_is_dropped() {
    let outer = RawRegion { bbox: BBox::new(100, 100, 200, 200), area: 6000 };
    let inner = RawRegion { bbox: BBox::new(150, 150, 50, 50), area: 2500 };
    let straddling = RawRegion { bbox: BBox::new(280, 150, 60, 60), area: 3600 };

    let candidates =
        filter_candidates(vec![inner, straddling, outer], 1000, 1000, &FilterConfig::default());

    let status_of = |bbox: BBox| candidates.iter().find(|c| c.bbox == bbox).unwrap();
    assert!(status_of(outer.bbox).is_accepted());
    assert_eq!(status_of(inner.bbox).reason, Some(RejectReason::Contained));
    // Only a third of it lies inside the outer box
    assert!(status_of(straddling.bbox).is_accepted());
}

#[test]
fn test_cleaning_the_same_crop_twice_is_byte_identical() {
    let mut page = white_page(120, 120);
    draw_cross(&mut page, 30, 30, 50, 12);
    let page: RgbaImage = DynamicImage::ImageRgb8(page).to_rgba8();

    let config = CleaningConfig {
        soft_edge_width: 2,
        ..Default::default()
    };
    let crop = crop_candidate(&page, &BBox::new(30, 30, 50, 50), &config);

    let first = clean_crop(&crop, &config).unwrap();
    let second = clean_crop(&crop, &config).unwrap();
    assert_eq!(first.png, second.png);
    assert_eq!(first.checksum, second.checksum);
    assert_eq!(first.thumbnail_png, second.thumbnail_png);
}
