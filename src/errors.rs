//! # Application Error Types
//!
//! This module defines the error types used throughout the glyph catalog pipeline.
//! `PipelineError` covers failures isolated to a single page or candidate, which are
//! collected into a batch summary. `AppError` covers resource-level failures that end
//! the whole run (configuration, database, asset root).

use std::fmt;
use std::path::PathBuf;

/// Per-item pipeline failure.
///
/// A page with no regions above the area threshold is not an error and has no
/// variant here; detection simply yields nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    /// Page or crop could not be opened or decoded
    UnreadableImage { path: PathBuf, message: String },
    /// Degenerate crop or background estimation failure
    CleaningFailed { reason: String },
    /// Disk write failed after all retry attempts
    AssetWriteFailed {
        path: PathBuf,
        attempts: u32,
        message: String,
    },
    /// Could not obtain exclusive access to a catalog key in time
    CatalogConflict { key: String, waited_ms: u64 },
}

impl PipelineError {
    /// Whether the caller may retry the same item later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::AssetWriteFailed { .. } | PipelineError::CatalogConflict { .. }
        )
    }

    /// Short machine-readable code used in summaries and metrics labels.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::UnreadableImage { .. } => "unreadable_image",
            PipelineError::CleaningFailed { .. } => "cleaning_failed",
            PipelineError::AssetWriteFailed { .. } => "asset_write_failed",
            PipelineError::CatalogConflict { .. } => "catalog_conflict",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::UnreadableImage { path, message } => write!(
                f,
                "[UNREADABLE_IMAGE] Failed to decode image {}: {}",
                path.display(),
                message
            ),
            PipelineError::CleaningFailed { reason } => {
                write!(f, "[CLEANING_FAILED] {}", reason)
            }
            PipelineError::AssetWriteFailed {
                path,
                attempts,
                message,
            } => write!(
                f,
                "[ASSET_WRITE_FAILED] Writing {} failed after {} attempt(s): {}",
                path.display(),
                attempts,
                message
            ),
            PipelineError::CatalogConflict { key, waited_ms } => write!(
                f,
                "[CATALOG_CONFLICT] Key {} still locked after {}ms, retry later",
                key, waited_ms
            ),
        }
    }
}

impl std::error::Error for PipelineError {}

/// General application error type for resource-level failures
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration validation errors
    Config(String),
    /// Validation errors (names, bounding boxes, manifest entries)
    Validation(String),
    /// Database operation errors
    Database(String),
    /// File system errors
    FileSystem(String),
    /// A per-item failure surfaced to a caller that handles a single item
    Pipeline(PipelineError),
    /// Internal application errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "[CONFIG] {}", msg),
            AppError::Validation(msg) => write!(f, "[VALIDATION] {}", msg),
            AppError::Database(msg) => write!(f, "[DATABASE] {}", msg),
            AppError::FileSystem(msg) => write!(f, "[FILESYSTEM] {}", msg),
            AppError::Pipeline(err) => write!(f, "{}", err),
            AppError::Internal(msg) => write!(f, "[INTERNAL] {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::FileSystem(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        AppError::Pipeline(err)
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Standardized error logging utilities for consistent error reporting across the pipeline
pub mod error_logging {
    use tracing::{error, warn};

    /// Log a per-item failure that was isolated and recorded in the batch summary
    pub fn log_item_failure(
        error: &super::PipelineError,
        operation: &str,
        source_slug: &str,
        page: u32,
        candidate_key: Option<&str>,
    ) {
        warn!(
            error = %error,
            code = error.code(),
            operation = %operation,
            source = %source_slug,
            page = page,
            candidate = ?candidate_key,
            retryable = error.is_retryable(),
            "Pipeline item failed, continuing with siblings"
        );
    }

    /// Log database operation errors with contextual information
    pub fn log_database_error(
        error: &impl std::fmt::Display,
        operation: &str,
        key: Option<&str>,
        attempt: Option<u32>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            key = ?key,
            attempt = ?attempt,
            "Database operation failed"
        );
    }

    /// Log file system errors with path and operation context
    pub fn log_filesystem_error(
        error: &impl std::fmt::Display,
        operation: &str,
        path: Option<&std::path::Path>,
        attempt: Option<u32>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            path = ?path.map(|p| p.display().to_string()),
            attempt = ?attempt,
            "File system operation failed"
        );
    }
}
