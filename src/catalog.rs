//! # Catalog Synchronizer
//!
//! SQLite-backed catalog of sources, candidates, cleaned glyph images and
//! human-curated symbols.
//!
//! Candidate and glyph rows are keyed by (source, page, bounding box). Upserts on one
//! key are serialized through [`KeyedLocks`] and run inside a transaction; a row whose
//! checksum and paths are unchanged is not written at all, so its `updated_at` and
//! `revision` stay put across re-runs. Transient `SQLITE_BUSY`/`SQLITE_LOCKED` errors
//! are retried with backoff.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info, warn, Instrument};

use crate::config::{DatabaseConfig, RecoveryConfig};
use crate::errors::{error_logging, AppError, AppResult, PipelineError};
use crate::filter::CandidateStatus;
use crate::geometry::{BBox, RegionKey};
use crate::key_locks::{KeyGuard, KeyedLocks};
use crate::observability;
use crate::retry::calculate_retry_delay;
use crate::slug;

/// Glyph status before any symbol references it
pub const GLYPH_STATUS_CLEANED: &str = "cleaned";
/// Glyph status once a symbol has been attached
pub const GLYPH_STATUS_CATALOGUED: &str = "catalogued";

/// An ingested document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub tradition_tags: Vec<String>,
    pub original_file: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registration request for a source
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct NewSource {
    pub title: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub tradition_tags: Vec<String>,
    #[serde(default)]
    pub original_file: Option<String>,
}

/// Candidate state to persist for one key
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateRecord {
    pub page: u32,
    pub bbox: BBox,
    pub area: u32,
    pub status: CandidateStatus,
    pub reason: Option<String>,
    pub crop_path: Option<String>,
    pub crop_checksum: Option<String>,
}

/// Persisted candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateRow {
    pub id: i64,
    pub source_id: i64,
    pub page: u32,
    pub bbox: BBox,
    pub area: u32,
    pub status: CandidateStatus,
    pub reason: Option<String>,
    pub crop_path: Option<String>,
    pub crop_checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Cleaned asset description handed to the synchronizer
#[derive(Debug, Clone, PartialEq)]
pub struct GlyphRecord {
    pub page: u32,
    pub bbox: BBox,
    pub raster_path: String,
    pub thumb_path: String,
    pub width: u32,
    pub height: u32,
    pub checksum: String,
}

/// Persisted glyph image
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlyphImage {
    pub id: i64,
    pub source_id: i64,
    pub page: u32,
    pub bbox: BBox,
    pub raster_path: String,
    pub thumb_path: String,
    pub width: u32,
    pub height: u32,
    pub checksum: String,
    pub status: String,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Human cataloging decision for one glyph
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SymbolInput {
    pub name: String,
    pub tradition: Option<String>,
    pub function: Option<String>,
    pub evokes_or_invokes: Option<String>,
    pub deity_or_spirit: Option<String>,
    pub tags: Vec<String>,
}

/// Curated catalog entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Symbol {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub tradition: Option<String>,
    pub function: Option<String>,
    pub evokes_or_invokes: Option<String>,
    pub deity_or_spirit: Option<String>,
    pub tags: Vec<String>,
    pub page_hint: Option<String>,
    pub source_id: i64,
    pub glyph_image_id: i64,
    pub created_at: DateTime<Utc>,
}

/// What an upsert did to its row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::Updated => "updated",
            UpsertOutcome::Unchanged => "unchanged",
        }
    }
}

/// Outcome of synchronizing one region (candidate row plus optional glyph row)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionSync {
    pub candidate: UpsertOutcome,
    pub glyph: Option<UpsertOutcome>,
    /// A glyph row left over from an earlier accepted run was deleted
    pub glyph_removed: bool,
    /// Asset paths the key's rows referenced before this sync and no longer do
    pub released: Vec<String>,
}

/// Open the catalog database, creating the file if needed
pub async fn connect(config: &DatabaseConfig) -> AppResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| AppError::Config(format!("Invalid database URL: {}", e)))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

    if let Some(parent) = options.get_filename().parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| {
            error_logging::log_database_error(&e, "connect", None, None);
            AppError::Database(format!("Cannot open catalog database: {}", e))
        })?;

    info!(max_connections = config.max_connections, "Catalog database connected");
    Ok(pool)
}

/// Initialize the database schema
pub async fn init_database_schema(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Initializing catalog schema");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS sources (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            tradition_tags TEXT NOT NULL DEFAULT '[]',
            original_file TEXT,
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create sources table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS candidates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id),
            page INTEGER NOT NULL,
            bbox_x INTEGER NOT NULL,
            bbox_y INTEGER NOT NULL,
            bbox_w INTEGER NOT NULL,
            bbox_h INTEGER NOT NULL,
            area INTEGER NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            crop_path TEXT,
            crop_checksum TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (source_id, page, bbox_x, bbox_y, bbox_w, bbox_h)
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create candidates table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS glyph_images (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_id INTEGER NOT NULL REFERENCES sources(id),
            page INTEGER NOT NULL,
            bbox_x INTEGER NOT NULL,
            bbox_y INTEGER NOT NULL,
            bbox_w INTEGER NOT NULL,
            bbox_h INTEGER NOT NULL,
            raster_path TEXT NOT NULL,
            thumb_path TEXT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            checksum TEXT NOT NULL,
            status TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (source_id, page, bbox_x, bbox_y, bbox_w, bbox_h)
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create glyph_images table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS symbols (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            tradition TEXT,
            function TEXT,
            evokes_or_invokes TEXT,
            deity_or_spirit TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            page_hint TEXT,
            source_id INTEGER NOT NULL REFERENCES sources(id),
            glyph_image_id INTEGER NOT NULL UNIQUE REFERENCES glyph_images(id),
            created_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create symbols table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS candidates_source_page_idx ON candidates(source_id, page)")
        .execute(pool)
        .await
        .context("Failed to create candidates index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS glyph_images_source_page_idx ON glyph_images(source_id, page)",
    )
    .execute(pool)
    .await
    .context("Failed to create glyph_images index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS symbols_tradition_idx ON symbols(tradition)")
        .execute(pool)
        .await
        .context("Failed to create symbols index")?;

    info!("Catalog schema initialized successfully");
    Ok(())
}

fn tags_to_json(tags: &[String]) -> AppResult<String> {
    Ok(serde_json::to_string(tags)?)
}

fn tags_from_json(raw: &str, column: &str) -> Result<Vec<String>, sqlx::Error> {
    serde_json::from_str(raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn to_u32(value: i64, column: &str) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn bbox_from_row(row: &SqliteRow) -> Result<BBox, sqlx::Error> {
    Ok(BBox::new(
        to_u32(row.try_get("bbox_x")?, "bbox_x")?,
        to_u32(row.try_get("bbox_y")?, "bbox_y")?,
        to_u32(row.try_get("bbox_w")?, "bbox_w")?,
        to_u32(row.try_get("bbox_h")?, "bbox_h")?,
    ))
}

fn source_from_row(row: &SqliteRow) -> Result<Source, sqlx::Error> {
    let tags: String = row.try_get("tradition_tags")?;
    Ok(Source {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        title: row.try_get("title")?,
        tradition_tags: tags_from_json(&tags, "tradition_tags")?,
        original_file: row.try_get("original_file")?,
        created_at: row.try_get("created_at")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<CandidateRow, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(CandidateRow {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        page: to_u32(row.try_get("page")?, "page")?,
        bbox: bbox_from_row(row)?,
        area: to_u32(row.try_get("area")?, "area")?,
        status: CandidateStatus::parse(&status).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: format!("unknown candidate status '{}'", status).into(),
        })?,
        reason: row.try_get("reason")?,
        crop_path: row.try_get("crop_path")?,
        crop_checksum: row.try_get("crop_checksum")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn glyph_from_row(row: &SqliteRow) -> Result<GlyphImage, sqlx::Error> {
    Ok(GlyphImage {
        id: row.try_get("id")?,
        source_id: row.try_get("source_id")?,
        page: to_u32(row.try_get("page")?, "page")?,
        bbox: bbox_from_row(row)?,
        raster_path: row.try_get("raster_path")?,
        thumb_path: row.try_get("thumb_path")?,
        width: to_u32(row.try_get("width")?, "width")?,
        height: to_u32(row.try_get("height")?, "height")?,
        checksum: row.try_get("checksum")?,
        status: row.try_get("status")?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn symbol_from_row(row: &SqliteRow) -> Result<Symbol, sqlx::Error> {
    let tags: String = row.try_get("tags")?;
    Ok(Symbol {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        tradition: row.try_get("tradition")?,
        function: row.try_get("function")?,
        evokes_or_invokes: row.try_get("evokes_or_invokes")?,
        deity_or_spirit: row.try_get("deity_or_spirit")?,
        tags: tags_from_json(&tags, "tags")?,
        page_hint: row.try_get("page_hint")?,
        source_id: row.try_get("source_id")?,
        glyph_image_id: row.try_get("glyph_image_id")?,
        created_at: row.try_get("created_at")?,
    })
}

/// SQLite reported a lock it may release shortly
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Register a source, or update title/tags/file of an existing one with the same slug.
///
/// Once candidates reference a source it is frozen: registering the same payload again
/// returns the stored row, a different payload is a validation error.
pub async fn upsert_source(pool: &SqlitePool, new: &NewSource) -> AppResult<Source> {
    let title = new.title.trim();
    if title.is_empty() {
        return Err(AppError::Validation("Source title cannot be empty".to_string()));
    }
    let slug = match &new.slug {
        Some(explicit) => {
            slug::validate_slug(explicit)?;
            explicit.clone()
        }
        None => slug::slugify(title)?,
    };
    let tags = tags_to_json(&new.tradition_tags)?;

    let span = observability::db_span("upsert_source", "sources");
    let started = Instant::now();
    let source = write_source(pool, &slug, title, &tags, new)
        .instrument(span)
        .await
        .map_err(|e| match e {
            AppError::Validation(_) => e,
            other => {
                error_logging::log_database_error(&other, "upsert_source", Some(&slug), None);
                other
            }
        })?;
    observability::record_db_metrics("upsert_source", started.elapsed());

    debug!(source_id = source.id, slug = %source.slug, "Source registered");
    Ok(source)
}

async fn write_source(
    pool: &SqlitePool,
    slug: &str,
    title: &str,
    tags: &str,
    new: &NewSource,
) -> AppResult<Source> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query(
        "SELECT id, slug, title, tradition_tags, original_file, created_at FROM sources WHERE slug = ?1",
    )
    .bind(slug)
    .fetch_optional(&mut *tx)
    .await?
    .as_ref()
    .map(source_from_row)
    .transpose()?;

    if let Some(existing) = existing {
        let referenced: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM candidates WHERE source_id = ?1")
                .bind(existing.id)
                .fetch_one(&mut *tx)
                .await?;
        if referenced > 0 {
            let same = existing.title == title
                && existing.tradition_tags == new.tradition_tags
                && existing.original_file == new.original_file;
            if same {
                return Ok(existing);
            }
            return Err(AppError::Validation(format!(
                "Source '{}' already has {} candidate(s) and cannot be changed",
                slug, referenced
            )));
        }
    }

    let row = sqlx::query(
        "INSERT INTO sources (slug, title, tradition_tags, original_file, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(slug) DO UPDATE SET
            title = excluded.title,
            tradition_tags = excluded.tradition_tags,
            original_file = excluded.original_file
         RETURNING id, slug, title, tradition_tags, original_file, created_at",
    )
    .bind(slug)
    .bind(title)
    .bind(tags)
    .bind(&new.original_file)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(source_from_row(&row)?)
}

/// Look up a source by slug
pub async fn get_source(pool: &SqlitePool, slug: &str) -> AppResult<Option<Source>> {
    let row = sqlx::query(
        "SELECT id, slug, title, tradition_tags, original_file, created_at FROM sources WHERE slug = ?1",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(source_from_row).transpose()?)
}

/// Look up a source by slug, failing when it was never registered
pub async fn require_source(pool: &SqlitePool, slug: &str) -> AppResult<Source> {
    get_source(pool, slug)
        .await?
        .ok_or_else(|| AppError::Validation(format!("Source '{}' is not registered", slug)))
}

/// All registered sources by slug
pub async fn list_sources(pool: &SqlitePool) -> AppResult<Vec<Source>> {
    let rows = sqlx::query(
        "SELECT id, slug, title, tradition_tags, original_file, created_at FROM sources ORDER BY slug",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(source_from_row).collect::<Result<_, _>>()?)
}

/// Candidates of a source, optionally restricted to one page, in page and reading order
pub async fn list_candidates(
    pool: &SqlitePool,
    source_id: i64,
    page: Option<u32>,
) -> AppResult<Vec<CandidateRow>> {
    let rows = sqlx::query(
        "SELECT * FROM candidates
         WHERE source_id = ?1 AND (?2 IS NULL OR page = ?2)
         ORDER BY page, bbox_y, bbox_x, bbox_w, bbox_h",
    )
    .bind(source_id)
    .bind(page.map(i64::from))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(candidate_from_row).collect::<Result<_, _>>()?)
}

/// Glyph images of a source, optionally restricted to one page, in page and reading order
pub async fn list_glyphs(
    pool: &SqlitePool,
    source_id: i64,
    page: Option<u32>,
) -> AppResult<Vec<GlyphImage>> {
    let rows = sqlx::query(
        "SELECT * FROM glyph_images
         WHERE source_id = ?1 AND (?2 IS NULL OR page = ?2)
         ORDER BY page, bbox_y, bbox_x, bbox_w, bbox_h",
    )
    .bind(source_id)
    .bind(page.map(i64::from))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(glyph_from_row).collect::<Result<_, _>>()?)
}

/// Glyph image addressed by its region key
pub async fn get_glyph(pool: &SqlitePool, key: &RegionKey) -> AppResult<Option<GlyphImage>> {
    let row = sqlx::query(
        "SELECT g.* FROM glyph_images g JOIN sources s ON s.id = g.source_id
         WHERE s.slug = ?1 AND g.page = ?2
           AND g.bbox_x = ?3 AND g.bbox_y = ?4 AND g.bbox_w = ?5 AND g.bbox_h = ?6",
    )
    .bind(&key.source)
    .bind(i64::from(key.page))
    .bind(i64::from(key.bbox.x))
    .bind(i64::from(key.bbox.y))
    .bind(i64::from(key.bbox.width))
    .bind(i64::from(key.bbox.height))
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(glyph_from_row).transpose()?)
}

/// Symbol by slug
pub async fn get_symbol(pool: &SqlitePool, slug: &str) -> AppResult<Option<Symbol>> {
    let row = sqlx::query("SELECT * FROM symbols WHERE slug = ?1")
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(symbol_from_row).transpose()?)
}

/// Every file path referenced by a candidate or glyph row, with the owning row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferencedFile {
    pub table: &'static str,
    pub row_id: i64,
    pub path: String,
}

pub async fn referenced_files(pool: &SqlitePool) -> AppResult<Vec<ReferencedFile>> {
    let mut files = Vec::new();

    for row in sqlx::query("SELECT id, crop_path FROM candidates WHERE crop_path IS NOT NULL")
        .fetch_all(pool)
        .await?
    {
        files.push(ReferencedFile {
            table: "candidates",
            row_id: row.try_get("id")?,
            path: row.try_get("crop_path")?,
        });
    }

    for row in sqlx::query("SELECT id, raster_path, thumb_path FROM glyph_images")
        .fetch_all(pool)
        .await?
    {
        let id: i64 = row.try_get("id")?;
        for column in ["raster_path", "thumb_path"] {
            files.push(ReferencedFile {
                table: "glyph_images",
                row_id: id,
                path: row.try_get(column)?,
            });
        }
    }

    Ok(files)
}

/// Drop the crop reference of a candidate whose file is gone
pub async fn clear_candidate_crop(pool: &SqlitePool, candidate_id: i64) -> AppResult<bool> {
    let result = sqlx::query(
        "UPDATE candidates SET crop_path = NULL, crop_checksum = NULL, updated_at = ?2 WHERE id = ?1",
    )
    .bind(candidate_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete a glyph row whose files are gone.
///
/// Glyphs referenced by a symbol are kept; `Ok(false)` is returned for them.
pub async fn deregister_glyph(pool: &SqlitePool, glyph_id: i64) -> AppResult<bool> {
    let result = sqlx::query(
        "DELETE FROM glyph_images
         WHERE id = ?1 AND NOT EXISTS (SELECT 1 FROM symbols WHERE glyph_image_id = ?1)",
    )
    .bind(glyph_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Insert or update a candidate row; also returns the crop path it stopped referencing
async fn upsert_candidate_tx(
    conn: &mut SqliteConnection,
    source_id: i64,
    record: &CandidateRecord,
    now: DateTime<Utc>,
) -> Result<(UpsertOutcome, Option<String>), sqlx::Error> {
    let existing = sqlx::query(
        "SELECT * FROM candidates
         WHERE source_id = ?1 AND page = ?2 AND bbox_x = ?3 AND bbox_y = ?4 AND bbox_w = ?5 AND bbox_h = ?6",
    )
    .bind(source_id)
    .bind(i64::from(record.page))
    .bind(i64::from(record.bbox.x))
    .bind(i64::from(record.bbox.y))
    .bind(i64::from(record.bbox.width))
    .bind(i64::from(record.bbox.height))
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO candidates (source_id, page, bbox_x, bbox_y, bbox_w, bbox_h, area, status,
                                         reason, crop_path, crop_checksum, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
                 ON CONFLICT(source_id, page, bbox_x, bbox_y, bbox_w, bbox_h) DO UPDATE SET
                    area = excluded.area,
                    status = excluded.status,
                    reason = excluded.reason,
                    crop_path = excluded.crop_path,
                    crop_checksum = excluded.crop_checksum,
                    updated_at = excluded.updated_at",
            )
            .bind(source_id)
            .bind(i64::from(record.page))
            .bind(i64::from(record.bbox.x))
            .bind(i64::from(record.bbox.y))
            .bind(i64::from(record.bbox.width))
            .bind(i64::from(record.bbox.height))
            .bind(i64::from(record.area))
            .bind(record.status.as_str())
            .bind(&record.reason)
            .bind(&record.crop_path)
            .bind(&record.crop_checksum)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok((UpsertOutcome::Inserted, None))
        }
        Some(row) => {
            let current = candidate_from_row(&row)?;
            let unchanged = current.area == record.area
                && current.status == record.status
                && current.reason == record.reason
                && current.crop_path == record.crop_path
                && current.crop_checksum == record.crop_checksum;
            if unchanged {
                return Ok((UpsertOutcome::Unchanged, None));
            }
            let released = current
                .crop_path
                .filter(|old| record.crop_path.as_deref() != Some(old.as_str()));

            sqlx::query(
                "UPDATE candidates SET area = ?2, status = ?3, reason = ?4, crop_path = ?5,
                        crop_checksum = ?6, updated_at = ?7
                 WHERE id = ?1",
            )
            .bind(current.id)
            .bind(i64::from(record.area))
            .bind(record.status.as_str())
            .bind(&record.reason)
            .bind(&record.crop_path)
            .bind(&record.crop_checksum)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok((UpsertOutcome::Updated, released))
        }
    }
}

/// Delete the glyph row of a key that is no longer accepted, unless a symbol holds it.
///
/// Returns the raster and thumbnail paths of the deleted row.
async fn remove_glyph_tx(
    conn: &mut SqliteConnection,
    source_id: i64,
    page: u32,
    bbox: &BBox,
) -> Result<Option<(String, String)>, sqlx::Error> {
    let row = sqlx::query(
        "DELETE FROM glyph_images
         WHERE source_id = ?1 AND page = ?2 AND bbox_x = ?3 AND bbox_y = ?4 AND bbox_w = ?5 AND bbox_h = ?6
           AND NOT EXISTS (SELECT 1 FROM symbols WHERE symbols.glyph_image_id = glyph_images.id)
         RETURNING raster_path, thumb_path",
    )
    .bind(source_id)
    .bind(i64::from(page))
    .bind(i64::from(bbox.x))
    .bind(i64::from(bbox.y))
    .bind(i64::from(bbox.width))
    .bind(i64::from(bbox.height))
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        Some(row) => Ok(Some((row.try_get("raster_path")?, row.try_get("thumb_path")?))),
        None => Ok(None),
    }
}

async fn upsert_glyph_tx(
    conn: &mut SqliteConnection,
    source_id: i64,
    record: &GlyphRecord,
    now: DateTime<Utc>,
) -> Result<UpsertOutcome, sqlx::Error> {
    let existing = sqlx::query(
        "SELECT * FROM glyph_images
         WHERE source_id = ?1 AND page = ?2 AND bbox_x = ?3 AND bbox_y = ?4 AND bbox_w = ?5 AND bbox_h = ?6",
    )
    .bind(source_id)
    .bind(i64::from(record.page))
    .bind(i64::from(record.bbox.x))
    .bind(i64::from(record.bbox.y))
    .bind(i64::from(record.bbox.width))
    .bind(i64::from(record.bbox.height))
    .fetch_optional(&mut *conn)
    .await?;

    match existing {
        None => {
            sqlx::query(
                "INSERT INTO glyph_images (source_id, page, bbox_x, bbox_y, bbox_w, bbox_h, raster_path,
                                           thumb_path, width, height, checksum, status, revision,
                                           created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13, ?13)
                 ON CONFLICT(source_id, page, bbox_x, bbox_y, bbox_w, bbox_h) DO UPDATE SET
                    raster_path = excluded.raster_path,
                    thumb_path = excluded.thumb_path,
                    width = excluded.width,
                    height = excluded.height,
                    checksum = excluded.checksum,
                    revision = glyph_images.revision + 1,
                    updated_at = excluded.updated_at
                 WHERE glyph_images.checksum != excluded.checksum
                    OR glyph_images.raster_path != excluded.raster_path
                    OR glyph_images.thumb_path != excluded.thumb_path",
            )
            .bind(source_id)
            .bind(i64::from(record.page))
            .bind(i64::from(record.bbox.x))
            .bind(i64::from(record.bbox.y))
            .bind(i64::from(record.bbox.width))
            .bind(i64::from(record.bbox.height))
            .bind(&record.raster_path)
            .bind(&record.thumb_path)
            .bind(i64::from(record.width))
            .bind(i64::from(record.height))
            .bind(&record.checksum)
            .bind(GLYPH_STATUS_CLEANED)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Inserted)
        }
        Some(row) => {
            let current = glyph_from_row(&row)?;
            let unchanged = current.checksum == record.checksum
                && current.raster_path == record.raster_path
                && current.thumb_path == record.thumb_path
                && current.width == record.width
                && current.height == record.height;
            if unchanged {
                return Ok(UpsertOutcome::Unchanged);
            }

            sqlx::query(
                "UPDATE glyph_images SET raster_path = ?2, thumb_path = ?3, width = ?4, height = ?5,
                        checksum = ?6, revision = revision + 1, updated_at = ?7
                 WHERE id = ?1",
            )
            .bind(current.id)
            .bind(&record.raster_path)
            .bind(&record.thumb_path)
            .bind(i64::from(record.width))
            .bind(i64::from(record.height))
            .bind(&record.checksum)
            .bind(now)
            .execute(&mut *conn)
            .await?;
            Ok(UpsertOutcome::Updated)
        }
    }
}

/// Serialized, retrying writer for candidate and glyph rows.
///
/// Cheap to clone; clones share the pool and the lock registry.
#[derive(Debug, Clone)]
pub struct CatalogSync {
    pool: SqlitePool,
    locks: Arc<KeyedLocks>,
    lock_timeout: Duration,
    recovery: RecoveryConfig,
}

impl CatalogSync {
    pub fn new(pool: SqlitePool, database: &DatabaseConfig, recovery: RecoveryConfig) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyedLocks::new()),
            lock_timeout: Duration::from_millis(database.lock_timeout_ms),
            recovery,
        }
    }

    /// Take exclusive access to a key.
    ///
    /// Hold the guard from the first asset write until the rows are committed, so no
    /// other writer of the same key can replace the files in between.
    pub async fn lock_key(&self, key: &RegionKey) -> Result<KeyGuard, PipelineError> {
        self.locks.acquire(&key.to_string(), self.lock_timeout).await
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, key: &str, mut attempt_once: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, sqlx::Error>>,
    {
        let max_attempts = self.recovery.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            let result = attempt_once().await;
            observability::record_db_metrics(operation, started.elapsed());

            match result {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < max_attempts => {
                    let delay_ms = calculate_retry_delay(attempt, &self.recovery);
                    warn!(
                        key = %key,
                        error = %err,
                        "Catalog {operation} attempt {attempt} hit a locked database, retrying in {delay_ms}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    error_logging::log_database_error(&err, operation, Some(key), Some(attempt));
                    return Err(AppError::Database(format!(
                        "{} failed for {}: {}",
                        operation, key, err
                    )));
                }
            }
        }
    }

    async fn try_sync_region(
        &self,
        source_id: i64,
        candidate: &CandidateRecord,
        glyph: Option<&GlyphRecord>,
    ) -> Result<RegionSync, sqlx::Error> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let (candidate_outcome, released_crop) =
            upsert_candidate_tx(&mut *tx, source_id, candidate, now).await?;
        let mut released: Vec<String> = released_crop.into_iter().collect();

        let (glyph_outcome, glyph_removed) = match glyph {
            Some(record) => (Some(upsert_glyph_tx(&mut *tx, source_id, record, now).await?), false),
            None => match remove_glyph_tx(&mut *tx, source_id, candidate.page, &candidate.bbox).await? {
                Some((raster_path, thumb_path)) => {
                    released.push(raster_path);
                    released.push(thumb_path);
                    (None, true)
                }
                None => (None, false),
            },
        };
        tx.commit().await?;

        Ok(RegionSync {
            candidate: candidate_outcome,
            glyph: glyph_outcome,
            glyph_removed,
            released,
        })
    }

    /// Persist a candidate and, when cleaning succeeded, its glyph in one transaction.
    ///
    /// Without a glyph record any glyph row left for the key is deleted (kept when a
    /// symbol references it). The caller must have written and verified every file the
    /// records reference, and removes the files listed in `RegionSync::released`.
    pub async fn sync_region(
        &self,
        key: &RegionKey,
        source_id: i64,
        candidate: &CandidateRecord,
        glyph: Option<&GlyphRecord>,
    ) -> AppResult<RegionSync> {
        let guard = self.lock_key(key).await?;
        self.sync_region_locked(&guard, key, source_id, candidate, glyph)
            .await
    }

    /// [`sync_region`](Self::sync_region) for a caller already holding the key's guard
    pub async fn sync_region_locked(
        &self,
        guard: &KeyGuard,
        key: &RegionKey,
        source_id: i64,
        candidate: &CandidateRecord,
        glyph: Option<&GlyphRecord>,
    ) -> AppResult<RegionSync> {
        let key_str = key.to_string();
        if guard.key() != key_str {
            return Err(AppError::Internal(format!(
                "Guard for {} used to sync {}",
                guard.key(),
                key_str
            )));
        }

        let span = observability::db_span("sync_region", "candidates");
        let outcome = self
            .with_retry("sync_region", &key_str, || {
                self.try_sync_region(source_id, candidate, glyph)
            })
            .instrument(span)
            .await?;

        metrics::counter!("catalog_upserts_total", "outcome" => outcome.candidate.as_str())
            .increment(1);
        if let Some(glyph_outcome) = outcome.glyph {
            metrics::counter!("catalog_upserts_total", "outcome" => glyph_outcome.as_str())
                .increment(1);
        }
        debug!(
            key = %key_str,
            candidate = outcome.candidate.as_str(),
            glyph = ?outcome.glyph.map(|o| o.as_str()),
            glyph_removed = outcome.glyph_removed,
            "Region synchronized"
        );
        Ok(outcome)
    }

    async fn try_upsert_glyph(
        &self,
        source_id: i64,
        record: &GlyphRecord,
    ) -> Result<UpsertOutcome, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let outcome = upsert_glyph_tx(&mut *tx, source_id, record, Utc::now()).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Upsert a single glyph row
    pub async fn upsert_glyph(
        &self,
        key: &RegionKey,
        source_id: i64,
        record: &GlyphRecord,
    ) -> AppResult<UpsertOutcome> {
        let key_str = key.to_string();
        let _guard = self.lock_key(key).await?;

        let span = observability::db_span("upsert_glyph", "glyph_images");
        let outcome = self
            .with_retry("upsert_glyph", &key_str, || self.try_upsert_glyph(source_id, record))
            .instrument(span)
            .await?;
        metrics::counter!("catalog_upserts_total", "outcome" => outcome.as_str()).increment(1);
        Ok(outcome)
    }
}

/// Attach descriptive metadata to a cleaned glyph.
///
/// The slug comes from the name; when another glyph already holds it, `-2`, `-3`, ...
/// are tried in turn. Cataloging a glyph again updates its existing symbol.
pub async fn catalog_symbol(
    pool: &SqlitePool,
    key: &RegionKey,
    input: &SymbolInput,
) -> AppResult<Symbol> {
    let name = input.name.trim();
    let base_slug = slug::slugify(name)?;
    let tags = tags_to_json(&input.tags)?;

    let glyph = get_glyph(pool, key).await?.ok_or_else(|| {
        AppError::Validation(format!("No cleaned glyph registered for {}", key))
    })?;

    let span = observability::db_span("catalog_symbol", "symbols");
    let symbol = write_symbol(pool, &glyph, &base_slug, name, &tags, input)
        .instrument(span)
        .await?;
    info!(slug = %symbol.slug, glyph_id = glyph.id, "Symbol catalogued");
    Ok(symbol)
}

async fn write_symbol(
    pool: &SqlitePool,
    glyph: &GlyphImage,
    base_slug: &str,
    name: &str,
    tags: &str,
    input: &SymbolInput,
) -> AppResult<Symbol> {
    let mut tx = pool.begin().await?;

    let existing = sqlx::query("SELECT * FROM symbols WHERE glyph_image_id = ?1")
        .bind(glyph.id)
        .fetch_optional(&mut *tx)
        .await?
        .as_ref()
        .map(symbol_from_row)
        .transpose()?;

    let mut n = 1;
    let slug = loop {
        let candidate = slug::disambiguate(base_slug, n);
        let holder: Option<i64> =
            sqlx::query_scalar("SELECT glyph_image_id FROM symbols WHERE slug = ?1")
                .bind(&candidate)
                .fetch_optional(&mut *tx)
                .await?;
        match holder {
            None => break candidate,
            Some(id) if id == glyph.id => break candidate,
            Some(_) => n += 1,
        }
    };

    let page_hint = glyph.page.to_string();
    let row = match existing {
        Some(symbol) => sqlx::query(
            "UPDATE symbols SET slug = ?2, name = ?3, tradition = ?4, function = ?5,
                    evokes_or_invokes = ?6, deity_or_spirit = ?7, tags = ?8, page_hint = ?9
             WHERE id = ?1
             RETURNING *",
        )
        .bind(symbol.id)
        .bind(&slug)
        .bind(name)
        .bind(&input.tradition)
        .bind(&input.function)
        .bind(&input.evokes_or_invokes)
        .bind(&input.deity_or_spirit)
        .bind(tags)
        .bind(&page_hint)
        .fetch_one(&mut *tx)
        .await?,
        None => sqlx::query(
            "INSERT INTO symbols (slug, name, tradition, function, evokes_or_invokes, deity_or_spirit,
                                  tags, page_hint, source_id, glyph_image_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             RETURNING *",
        )
        .bind(&slug)
        .bind(name)
        .bind(&input.tradition)
        .bind(&input.function)
        .bind(&input.evokes_or_invokes)
        .bind(&input.deity_or_spirit)
        .bind(tags)
        .bind(&page_hint)
        .bind(glyph.source_id)
        .bind(glyph.id)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?,
    };

    sqlx::query("UPDATE glyph_images SET status = ?2 WHERE id = ?1")
        .bind(glyph.id)
        .bind(GLYPH_STATUS_CATALOGUED)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;

    Ok(symbol_from_row(&row)?)
}
