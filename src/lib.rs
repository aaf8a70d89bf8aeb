//! # Glyph Catalog
//!
//! Extracts symbol glyphs from scanned grimoire pages, cleans them onto transparent
//! backgrounds and keeps a SQLite catalog of sources, candidates, glyph images and
//! curated symbols in step with the files on disk.

pub mod asset_store;
pub mod catalog;
pub mod cleaning;
pub mod config;
pub mod detection;
pub mod errors;
pub mod filter;
pub mod geometry;
pub mod key_locks;
pub mod observability;
pub mod observability_config;
pub mod pipeline;
pub mod preflight;
pub mod retry;
pub mod slug;

// Re-export types for easier access
pub use config::AppConfig;
pub use errors::{AppError, AppResult, PipelineError};
pub use geometry::{BBox, RegionKey};
pub use pipeline::{BatchSummary, Pipeline};
