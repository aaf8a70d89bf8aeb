//! # Unified Application Configuration
//!
//! All heuristic thresholds and resource settings of the pipeline live here as named,
//! validated sections. Detection, filtering and cleaning read only these structures,
//! so a page processed from the CLI and a page processed from a test behave the same.
//!
//! Configuration is loaded from `GLYPH_*` environment variables or from a JSON
//! document; missing values fall back to the section defaults.

use crate::errors::{AppError, AppResult};
use crate::observability_config::ObservabilityConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Region Detector settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum connected-component pixel area (px²) for a raw candidate
    pub min_area: u32,
    /// Half-size of the local mean window for the adaptive pass (0 disables it)
    pub adaptive_block_radius: u32,
    /// How far below the local mean a pixel must be to count as ink
    pub adaptive_offset: u8,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_area: 800,
            adaptive_block_radius: 20,
            adaptive_offset: 10,
        }
    }
}

impl DetectionConfig {
    /// Validate detection configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.min_area == 0 {
            return Err(AppError::Config("min_area must be greater than 0".to_string()));
        }
        if self.adaptive_block_radius > 255 {
            return Err(AppError::Config(format!(
                "adaptive_block_radius ({}) cannot be greater than 255",
                self.adaptive_block_radius
            )));
        }
        Ok(())
    }
}

/// Region Filter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Lowest accepted width:height ratio
    pub min_aspect_ratio: f32,
    /// Highest accepted width:height ratio
    pub max_aspect_ratio: f32,
    /// Fraction of a box that must lie inside a larger box to count as contained
    pub containment_threshold: f32,
    /// Largest accepted bounding-box area as a fraction of the page area (1.0 disables)
    pub max_area_ratio: f32,
    /// Reject candidates whose box touches the page border
    pub reject_edge_touching: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_aspect_ratio: 1.0 / 6.0,
            max_aspect_ratio: 6.0,
            containment_threshold: 0.9,
            max_area_ratio: 0.25,
            reject_edge_touching: false,
        }
    }
}

impl FilterConfig {
    /// Validate filter configuration
    pub fn validate(&self) -> AppResult<()> {
        if !(self.min_aspect_ratio > 0.0) {
            return Err(AppError::Config(
                "min_aspect_ratio must be greater than 0".to_string(),
            ));
        }
        if !(self.max_aspect_ratio >= self.min_aspect_ratio) {
            return Err(AppError::Config(format!(
                "max_aspect_ratio ({}) must be >= min_aspect_ratio ({})",
                self.max_aspect_ratio, self.min_aspect_ratio
            )));
        }
        if !(self.containment_threshold > 0.0 && self.containment_threshold <= 1.0) {
            return Err(AppError::Config(format!(
                "containment_threshold ({}) must be in (0, 1]",
                self.containment_threshold
            )));
        }
        if !(self.max_area_ratio > 0.0 && self.max_area_ratio <= 1.0) {
            return Err(AppError::Config(format!(
                "max_area_ratio ({}) must be in (0, 1]",
                self.max_area_ratio
            )));
        }
        Ok(())
    }
}

/// Image Cleaner settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CleaningConfig {
    /// RGB distance from the background colour above which a pixel is foreground
    pub background_tolerance: f32,
    /// Width in pixels of the alpha ramp inside the foreground boundary (0 = hard edge)
    pub soft_edge_width: u8,
    /// Radius of the morphological closing applied to the mask (0 disables it)
    pub closing_radius: u8,
    /// Longest side of generated thumbnails
    pub thumbnail_size: u32,
    /// Minimum margin added around a candidate box before cropping
    pub crop_margin_px: u32,
    /// Margin as a fraction of the shorter box side, when larger than `crop_margin_px`
    pub crop_margin_ratio: f32,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            background_tolerance: 48.0,
            soft_edge_width: 0,
            closing_radius: 1,
            thumbnail_size: 256,
            crop_margin_px: 4,
            crop_margin_ratio: 0.05,
        }
    }
}

impl CleaningConfig {
    /// Largest possible Euclidean distance between two RGB colours
    pub const MAX_RGB_DISTANCE: f32 = 441.7;

    /// Validate cleaning configuration
    pub fn validate(&self) -> AppResult<()> {
        if !(self.background_tolerance > 0.0 && self.background_tolerance <= Self::MAX_RGB_DISTANCE)
        {
            return Err(AppError::Config(format!(
                "background_tolerance ({}) must be in (0, {}]",
                self.background_tolerance,
                Self::MAX_RGB_DISTANCE
            )));
        }
        if self.soft_edge_width > 16 {
            return Err(AppError::Config(
                "soft_edge_width cannot be greater than 16".to_string(),
            ));
        }
        if self.closing_radius > 8 {
            return Err(AppError::Config(
                "closing_radius cannot be greater than 8".to_string(),
            ));
        }
        if self.thumbnail_size < 16 || self.thumbnail_size > 4096 {
            return Err(AppError::Config(format!(
                "thumbnail_size ({}) must be between 16 and 4096",
                self.thumbnail_size
            )));
        }
        if !(0.0..=0.5).contains(&self.crop_margin_ratio) {
            return Err(AppError::Config(format!(
                "crop_margin_ratio ({}) must be between 0 and 0.5",
                self.crop_margin_ratio
            )));
        }
        Ok(())
    }
}

/// Asset Store settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory holding one subtree per source
    pub asset_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            asset_root: PathBuf::from("data/assets"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.asset_root.as_os_str().is_empty() {
            return Err(AppError::Config("asset_root cannot be empty".to_string()));
        }
        Ok(())
    }
}

/// Catalog database settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// How long SQLite waits on a locked database file before reporting busy
    pub busy_timeout_ms: u64,
    /// How long an upsert waits for the per-key lock before a conflict is reported
    pub lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/catalog.db".to_string(),
            max_connections: 4,
            busy_timeout_ms: 5000,
            lock_timeout_ms: 10_000,
        }
    }
}

impl DatabaseConfig {
    /// Validate database configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.url.trim().is_empty() {
            return Err(AppError::Config("Database URL cannot be empty".to_string()));
        }
        if !self.url.starts_with("sqlite:") {
            return Err(AppError::Config(
                "Database URL must start with 'sqlite:'".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(AppError::Config("Max connections cannot be 0".to_string()));
        }
        if self.max_connections > 32 {
            return Err(AppError::Config(
                "Max connections cannot be greater than 32".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(AppError::Config("lock_timeout_ms cannot be 0".to_string()));
        }
        Ok(())
    }
}

/// Retry settings for transient file and database failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Maximum number of retry attempts after the first try
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_retry_delay_ms: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 50,
            max_retry_delay_ms: 2000,
        }
    }
}

impl RecoveryConfig {
    /// Validate recovery configuration parameters
    pub fn validate(&self) -> AppResult<()> {
        if self.max_retries == 0 {
            return Err(AppError::Config(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(AppError::Config(
                "base_retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(AppError::Config(format!(
                "max_retry_delay_ms ({}) must be >= base_retry_delay_ms ({})",
                self.max_retry_delay_ms, self.base_retry_delay_ms
            )));
        }
        Ok(())
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum number of CPU-bound detection/cleaning jobs running at once
    pub workers: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
        }
    }
}

impl ConcurrencyConfig {
    /// Validate concurrency configuration
    pub fn validate(&self) -> AppResult<()> {
        if self.workers == 0 || self.workers > 256 {
            return Err(AppError::Config(format!(
                "workers ({}) must be between 1 and 256",
                self.workers
            )));
        }
        Ok(())
    }
}

/// Unified application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub detection: DetectionConfig,
    pub filter: FilterConfig,
    pub cleaning: CleaningConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub recovery: RecoveryConfig,
    pub concurrency: ConcurrencyConfig,
    pub observability: ObservabilityConfig,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> AppResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{} has an invalid value: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppResult<Self> {
        let defaults = Self::default();
        let mut config = defaults.clone();

        config.detection.min_area = parse_env("GLYPH_MIN_AREA", defaults.detection.min_area)?;
        config.detection.adaptive_block_radius = parse_env(
            "GLYPH_ADAPTIVE_BLOCK_RADIUS",
            defaults.detection.adaptive_block_radius,
        )?;
        config.detection.adaptive_offset =
            parse_env("GLYPH_ADAPTIVE_OFFSET", defaults.detection.adaptive_offset)?;

        config.filter.min_aspect_ratio =
            parse_env("GLYPH_MIN_ASPECT_RATIO", defaults.filter.min_aspect_ratio)?;
        config.filter.max_aspect_ratio =
            parse_env("GLYPH_MAX_ASPECT_RATIO", defaults.filter.max_aspect_ratio)?;
        config.filter.containment_threshold = parse_env(
            "GLYPH_CONTAINMENT_THRESHOLD",
            defaults.filter.containment_threshold,
        )?;
        config.filter.max_area_ratio =
            parse_env("GLYPH_MAX_AREA_RATIO", defaults.filter.max_area_ratio)?;
        config.filter.reject_edge_touching = parse_env(
            "GLYPH_REJECT_EDGE_TOUCHING",
            defaults.filter.reject_edge_touching,
        )?;

        config.cleaning.background_tolerance = parse_env(
            "GLYPH_BACKGROUND_TOLERANCE",
            defaults.cleaning.background_tolerance,
        )?;
        config.cleaning.soft_edge_width =
            parse_env("GLYPH_SOFT_EDGE_WIDTH", defaults.cleaning.soft_edge_width)?;
        config.cleaning.closing_radius =
            parse_env("GLYPH_CLOSING_RADIUS", defaults.cleaning.closing_radius)?;
        config.cleaning.thumbnail_size =
            parse_env("GLYPH_THUMBNAIL_SIZE", defaults.cleaning.thumbnail_size)?;
        config.cleaning.crop_margin_px =
            parse_env("GLYPH_CROP_MARGIN_PX", defaults.cleaning.crop_margin_px)?;
        config.cleaning.crop_margin_ratio =
            parse_env("GLYPH_CROP_MARGIN_RATIO", defaults.cleaning.crop_margin_ratio)?;

        if let Ok(root) = env::var("GLYPH_ASSET_ROOT") {
            config.storage.asset_root = PathBuf::from(root);
        }

        if let Ok(url) = env::var("GLYPH_DATABASE_URL") {
            config.database.url = url;
        }
        config.database.max_connections = parse_env(
            "GLYPH_DATABASE_MAX_CONNECTIONS",
            defaults.database.max_connections,
        )?;
        config.database.busy_timeout_ms =
            parse_env("GLYPH_DATABASE_BUSY_TIMEOUT_MS", defaults.database.busy_timeout_ms)?;
        config.database.lock_timeout_ms =
            parse_env("GLYPH_LOCK_TIMEOUT_MS", defaults.database.lock_timeout_ms)?;

        config.recovery.max_retries =
            parse_env("GLYPH_MAX_RETRIES", defaults.recovery.max_retries)?;
        config.recovery.base_retry_delay_ms = parse_env(
            "GLYPH_BASE_RETRY_DELAY_MS",
            defaults.recovery.base_retry_delay_ms,
        )?;
        config.recovery.max_retry_delay_ms = parse_env(
            "GLYPH_MAX_RETRY_DELAY_MS",
            defaults.recovery.max_retry_delay_ms,
        )?;

        config.concurrency.workers = parse_env("GLYPH_WORKERS", defaults.concurrency.workers)?;

        config.observability = ObservabilityConfig::from_env();

        Ok(config)
    }

    /// Load a complete configuration document from a JSON file
    pub fn from_json_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Cannot read config file {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::Config(format!("Invalid config file {}: {}", path.display(), e))
        })
    }

    /// Validate all configuration sections
    pub fn validate(&self) -> AppResult<()> {
        self.detection.validate()?;
        self.filter.validate()?;
        self.cleaning.validate()?;
        self.storage.validate()?;
        self.database.validate()?;
        self.recovery.validate()?;
        self.concurrency.validate()?;
        self.observability
            .validate()
            .map_err(|e| AppError::Config(format!("Invalid observability configuration: {}", e)))?;
        Ok(())
    }

    /// Get a summary of the current configuration for logging
    pub fn summary(&self) -> String {
        format!(
            "Configuration: db_url=[REDACTED], asset_root={}, min_area={}, aspect_band=[{:.3}, {:.3}], tolerance={}, thumbnail_size={}, workers={}",
            self.storage.asset_root.display(),
            self.detection.min_area,
            self.filter.min_aspect_ratio,
            self.filter.max_aspect_ratio,
            self.cleaning.background_tolerance,
            self.cleaning.thumbnail_size,
            self.concurrency.workers
        )
    }
}
