//! # Region Filter
//!
//! Tags raw regions as accepted or rejected. Heuristics run in a fixed order and the
//! first one that fires is terminal:
//!
//! 1. aspect ratio outside the configured band (`aspect_ratio`)
//! 2. bounding box larger than the allowed share of the page (`oversized`)
//! 3. box mostly inside an already kept box (`contained`)
//! 4. box touching the page border, when enabled (`edge_touch`)
//!
//! Containment is decided largest box first, so of two nested detections the outer
//! one survives. Output is sorted row-major by top-left corner.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::config::FilterConfig;
use crate::detection::RawRegion;
use crate::geometry::BBox;

/// Lifecycle status of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Accepted,
    Rejected,
    /// Accepted by the filter but cleaning failed; waits for a human
    NeedsReview,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::Pending => "pending",
            CandidateStatus::Accepted => "accepted",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::NeedsReview => "needs_review",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(CandidateStatus::Pending),
            "accepted" => Some(CandidateStatus::Accepted),
            "rejected" => Some(CandidateStatus::Rejected),
            "needs_review" => Some(CandidateStatus::NeedsReview),
            _ => None,
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the filter rejected a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    AspectRatio,
    Oversized,
    Contained,
    EdgeTouch,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AspectRatio => "aspect_ratio",
            RejectReason::Oversized => "oversized",
            RejectReason::Contained => "contained",
            RejectReason::EdgeTouch => "edge_touch",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw region after filtering
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub bbox: BBox,
    /// Pixel area of the underlying component
    pub area: u32,
    pub status: CandidateStatus,
    pub reason: Option<RejectReason>,
}

impl Candidate {
    pub fn is_accepted(&self) -> bool {
        self.status == CandidateStatus::Accepted
    }
}

/// Row-major order of top-left corners, then larger first, then by size
fn reading_order(a: &Candidate, b: &Candidate) -> Ordering {
    (a.bbox.y, a.bbox.x)
        .cmp(&(b.bbox.y, b.bbox.x))
        .then_with(|| b.bbox.area().cmp(&a.bbox.area()))
        .then_with(|| b.area.cmp(&a.area))
        .then_with(|| (a.bbox.width, a.bbox.height).cmp(&(b.bbox.width, b.bbox.height)))
}

/// Largest box first, ties in reading order
fn containment_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.bbox
        .area()
        .cmp(&a.bbox.area())
        .then_with(|| b.area.cmp(&a.area))
        .then_with(|| (a.bbox.y, a.bbox.x).cmp(&(b.bbox.y, b.bbox.x)))
        .then_with(|| (a.bbox.width, a.bbox.height).cmp(&(b.bbox.width, b.bbox.height)))
}

/// Filter the raw regions of one page.
///
/// Every input region comes back exactly once, tagged. The result does not depend on
/// the order of the input.
pub fn filter_candidates<I>(
    regions: I,
    page_width: u32,
    page_height: u32,
    config: &FilterConfig,
) -> Vec<Candidate>
where
    I: IntoIterator<Item = RawRegion>,
{
    let page_area = u64::from(page_width) * u64::from(page_height);
    let max_box_area = page_area as f64 * f64::from(config.max_area_ratio);
    let min_ratio = f64::from(config.min_aspect_ratio);
    let max_ratio = f64::from(config.max_aspect_ratio);

    let mut candidates: Vec<Candidate> = regions
        .into_iter()
        .map(|region| {
            let ratio = region.bbox.aspect_ratio();
            let reason = if ratio < min_ratio || ratio > max_ratio {
                Some(RejectReason::AspectRatio)
            } else if config.max_area_ratio < 1.0 && region.bbox.area() as f64 > max_box_area {
                Some(RejectReason::Oversized)
            } else {
                None
            };
            Candidate {
                bbox: region.bbox,
                area: region.area,
                status: if reason.is_some() {
                    CandidateStatus::Rejected
                } else {
                    CandidateStatus::Pending
                },
                reason,
            }
        })
        .collect();

    candidates.sort_by(containment_order);

    let threshold = f64::from(config.containment_threshold);
    let mut kept: Vec<BBox> = Vec::new();
    for candidate in candidates
        .iter_mut()
        .filter(|c| c.status == CandidateStatus::Pending)
    {
        let contained = kept
            .iter()
            .any(|outer| candidate.bbox.fraction_inside(outer) >= threshold);
        if contained {
            candidate.status = CandidateStatus::Rejected;
            candidate.reason = Some(RejectReason::Contained);
            continue;
        }
        kept.push(candidate.bbox);

        if config.reject_edge_touching && candidate.bbox.touches_border(page_width, page_height) {
            candidate.status = CandidateStatus::Rejected;
            candidate.reason = Some(RejectReason::EdgeTouch);
        } else {
            candidate.status = CandidateStatus::Accepted;
        }
    }

    candidates.sort_by(reading_order);
    candidates
}
