//! Observability module for centralized metrics, tracing, and logging setup.
//!
//! This module provides:
//! - Structured logging with configurable levels and formats
//! - Spans for pages, candidates and database operations
//! - Metrics collection with a Prometheus text export written at the end of a run

use std::path::Path;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;

use crate::observability_config::{LogFormat, ObservabilityConfig};

/// Handle kept by the binary for exporting metrics after a run
#[derive(Clone)]
pub struct Observability {
    metrics: PrometheusHandle,
    config: ObservabilityConfig,
}

impl Observability {
    /// Render the current metrics in Prometheus text format
    pub fn render_metrics(&self) -> String {
        self.metrics.render()
    }

    /// Write the metrics exposition to the configured file, if any.
    ///
    /// The file is replaced atomically so a textfile collector never reads half of it.
    pub fn export_metrics(&self) -> Result<()> {
        let Some(path) = &self.config.metrics_export_path else {
            return Ok(());
        };
        write_metrics_file(path, &self.render_metrics())?;
        tracing::info!(path = %path.display(), "Metrics exported");
        Ok(())
    }
}

/// Initialize the complete observability stack with the given configuration
pub fn init_observability_with_config(config: ObservabilityConfig) -> Result<Observability> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid observability configuration: {}", e))?;

    init_tracing_with_config(&config)?;
    let metrics = init_metrics_with_config(&config)?;

    tracing::info!(
        environment = %config.environment,
        metrics_export_path = ?config.metrics_export_path,
        "Observability stack initialized successfully"
    );
    Ok(Observability { metrics, config })
}

/// Initialize structured logging with tracing and configuration
fn init_tracing_with_config(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("glyph_catalog={}", config.log_level).parse()?)
        .add_directive("sqlx=warn".parse()?);

    match config.effective_log_format() {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true),
            )
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    tracing::info!(
        environment = %config.environment,
        log_level = %config.log_level,
        "Tracing initialized with structured logging"
    );
    Ok(())
}

/// Initialize metrics collection with the Prometheus recorder
fn init_metrics_with_config(config: &ObservabilityConfig) -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    tracing::info!(
        export_enabled = config.metrics_export_path.is_some(),
        "Metrics collection initialized"
    );
    Ok(handle)
}

fn write_metrics_file(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create metrics directory {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents.as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("Failed to write metrics file {}", path.display()))?;
    Ok(())
}

/// Create a span for one page of a batch
pub fn page_span(source: &str, page: u32) -> tracing::Span {
    tracing::info_span!("page", source = source, page = page, component = "pipeline")
}

/// Create a span for one candidate region
pub fn candidate_span(key: &str) -> tracing::Span {
    tracing::debug_span!("candidate", key = key, component = "pipeline")
}

/// Create a span for database operations
pub fn db_span(operation: &str, table: &str) -> tracing::Span {
    tracing::info_span!(
        "db_operation",
        operation = operation,
        table = table,
        component = "database"
    )
}

/// Record page processing metrics
pub fn record_page_metrics(success: bool, duration: std::time::Duration) {
    metrics::counter!("pages_processed_total", "result" => if success { "success" } else { "failure" }).increment(1);
    metrics::histogram!("page_processing_duration_seconds").record(duration.as_secs_f64());
}

/// Count a candidate by its final status
pub fn record_candidate(status: &'static str) {
    metrics::counter!("candidates_total", "status" => status).increment(1);
}

/// Count a successfully cleaned glyph
pub fn record_glyph_cleaned() {
    metrics::counter!("glyphs_cleaned_total").increment(1);
}

/// Record database operation metrics
pub fn record_db_metrics(operation: &str, duration: std::time::Duration) {
    let operation = operation.to_string();
    metrics::counter!("db_operations_total", "operation" => operation).increment(1);
    metrics::histogram!("db_operation_duration_seconds").record(duration.as_secs_f64());
}
