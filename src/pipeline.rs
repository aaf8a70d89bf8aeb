//! # Batch Pipeline
//!
//! Drives detection, filtering, cleaning, asset writes and catalog sync for every
//! page of a source.
//!
//! Pages and the candidates within a page run as independent tokio tasks. The CPU
//! heavy sections (decode + detect + filter, crop + clean + write) run on the blocking
//! pool and each takes a permit from a semaphore sized by `concurrency.workers`. A
//! second semaphore bounds how many decoded pages are held in memory at once. The two
//! are never nested in the other order, so tasks cannot deadlock on them.
//!
//! Per-item failures are recorded in the [`BatchSummary`] and never stop siblings.
//! Only resource-level errors (database unreachable after retries, runtime failures)
//! end the batch early.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use image::RgbaImage;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

use crate::asset_store::{AssetKind, AssetStore, WriteOutcome};
use crate::catalog::{
    self, CandidateRecord, CatalogSync, GlyphRecord, NewSource, RegionSync, Source, UpsertOutcome,
};
use crate::cleaning::{clean_crop, crop_candidate, encode_png, sha256_hex, CleanedGlyph};
use crate::config::AppConfig;
use crate::detection::{detect_regions, load_page, RawRegion};
use crate::errors::{error_logging, AppError, AppResult, PipelineError};
use crate::filter::{filter_candidates, Candidate, CandidateStatus};
use crate::geometry::RegionKey;
use crate::key_locks::KeyGuard;
use crate::observability;

lazy_static! {
    static ref TRAILING_DIGITS: Regex = Regex::new(r"(\d+)$").expect("Invalid page number pattern");
}

const PAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "tif", "tiff", "bmp", "webp"];

/// One rendered page image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageInput {
    pub number: u32,
    pub path: PathBuf,
}

/// List the page images of a renderer output directory.
///
/// Page numbers come from the trailing digits of the file stem (`page0007.png` is page 7);
/// files without digits are numbered by their sorted position.
pub fn discover_pages(dir: &Path) -> AppResult<Vec<PageInput>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| {
            AppError::FileSystem(format!("Cannot read pages directory {}: {}", dir.display(), e))
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| PAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut seen = HashSet::new();
    let mut pages = Vec::with_capacity(files.len());
    for (index, path) in files.into_iter().enumerate() {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let number = TRAILING_DIGITS
            .captures(stem)
            .and_then(|c| c[1].parse::<u32>().ok())
            .unwrap_or(index as u32 + 1);

        if !seen.insert(number) {
            return Err(AppError::Validation(format!(
                "Duplicate page number {} in {}",
                number,
                dir.display()
            )));
        }
        pages.push(PageInput { number, path });
    }

    pages.sort_by_key(|p| p.number);
    Ok(pages)
}

/// One isolated failure, keyed by candidate identity (or page for page-level failures)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub key: String,
    pub code: String,
    pub reason: String,
}

impl ItemFailure {
    fn new(key: impl Into<String>, error: &PipelineError) -> Self {
        Self {
            key: key.into(),
            code: error.code().to_string(),
            reason: error.to_string(),
        }
    }
}

/// Counts returned by a batch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub source: String,
    pub pages: usize,
    pub pages_failed: usize,
    /// Connected components found, before the minimum-area gate
    pub detected: usize,
    pub below_min_area: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    pub rows_unchanged: usize,
    /// Glyph rows deleted because their candidate is no longer accepted
    pub rows_removed: usize,
    pub files_written: usize,
    pub files_unchanged: usize,
    /// Files deleted because no row references them any more
    pub files_removed: usize,
    pub cancelled: bool,
    pub failures: Vec<ItemFailure>,
}

impl BatchSummary {
    fn merge(&mut self, other: BatchSummary) {
        self.pages += other.pages;
        self.pages_failed += other.pages_failed;
        self.detected += other.detected;
        self.below_min_area += other.below_min_area;
        self.accepted += other.accepted;
        self.rejected += other.rejected;
        self.cleaned += other.cleaned;
        self.failed += other.failed;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_unchanged += other.rows_unchanged;
        self.rows_removed += other.rows_removed;
        self.files_written += other.files_written;
        self.files_unchanged += other.files_unchanged;
        self.files_removed += other.files_removed;
        self.cancelled |= other.cancelled;
        self.failures.extend(other.failures);
    }

    fn record_failure(&mut self, failure: ItemFailure) {
        self.failed += 1;
        self.failures.push(failure);
    }

    fn record_upsert(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.rows_inserted += 1,
            UpsertOutcome::Updated => self.rows_updated += 1,
            UpsertOutcome::Unchanged => self.rows_unchanged += 1,
        }
    }

    fn record_sync(&mut self, sync: &RegionSync) {
        self.record_upsert(sync.candidate);
        if let Some(glyph) = sync.glyph {
            self.record_upsert(glyph);
        }
        if sync.glyph_removed {
            self.rows_removed += 1;
        }
    }

    fn record_write(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Written => self.files_written += 1,
            WriteOutcome::Unchanged => self.files_unchanged += 1,
        }
    }
}

struct DetectedPage {
    image: Arc<RgbaImage>,
    candidates: Vec<Candidate>,
    components: usize,
}

fn detect_page(path: &Path, config: &AppConfig) -> Result<DetectedPage, PipelineError> {
    let page = load_page(path)?;
    let mut scan = detect_regions(&page, &config.detection);
    let raw: Vec<RawRegion> = scan.by_ref().collect();
    let components = scan.components_seen();
    let candidates = filter_candidates(raw, page.width(), page.height(), &config.filter);
    Ok(DetectedPage {
        image: Arc::new(page.to_rgba8()),
        candidates,
        components,
    })
}

/// Files written for an accepted candidate and the cleaning result
struct PreparedRegion {
    crop_path: String,
    crop_checksum: String,
    writes: Vec<WriteOutcome>,
    /// Files this call wrote and then deleted again after a later step failed
    discarded: usize,
    glyph: Result<GlyphRecord, PipelineError>,
}

fn verification_failed(store: &AssetStore, relative: &str) -> PipelineError {
    PipelineError::AssetWriteFailed {
        path: store.resolve(relative),
        attempts: 1,
        message: "written file failed verification".to_string(),
    }
}

fn store_cleaned(
    store: &AssetStore,
    key: &RegionKey,
    cleaned: &CleanedGlyph,
    written: &mut Vec<(AssetKind, WriteOutcome)>,
) -> Result<GlyphRecord, PipelineError> {
    for (kind, bytes) in [
        (AssetKind::Cleaned, &cleaned.png),
        (AssetKind::Thumbnail, &cleaned.thumbnail_png),
    ] {
        let outcome = store.write_asset(key, kind, bytes)?;
        written.push((kind, outcome));
    }

    let raster_path = store.relative_path(key, AssetKind::Cleaned);
    let thumb_path = store.relative_path(key, AssetKind::Thumbnail);
    if !store.verify(&raster_path, Some(&cleaned.checksum)) {
        return Err(verification_failed(store, &raster_path));
    }
    if !store.exists(&thumb_path) {
        return Err(verification_failed(store, &thumb_path));
    }

    Ok(GlyphRecord {
        page: key.page,
        bbox: key.bbox,
        raster_path,
        thumb_path,
        width: cleaned.width(),
        height: cleaned.height(),
        checksum: cleaned.checksum.clone(),
    })
}

/// Delete the files a failed `store_cleaned` call wrote; returns how many went
fn discard_written(store: &AssetStore, key: &RegionKey, written: &[(AssetKind, WriteOutcome)]) -> usize {
    let mut discarded = 0;
    for (kind, outcome) in written {
        if *outcome != WriteOutcome::Written {
            continue;
        }
        match store.remove(&store.relative_path(key, *kind)) {
            Ok(true) => discarded += 1,
            Ok(false) => {}
            Err(err) => warn!(key = %key, error = %err, "Could not discard partially written glyph"),
        }
    }
    discarded
}

/// Crop, clean and write every asset of one accepted candidate, then verify the files.
///
/// An `Err` means the raw crop itself could not be stored. Cleaning and later write
/// failures are reported through `PreparedRegion::glyph`; cleaned or thumbnail files
/// written before such a failure are deleted again.
fn prepare_region(
    page: &RgbaImage,
    key: &RegionKey,
    candidate: &Candidate,
    config: &AppConfig,
    store: &AssetStore,
) -> Result<PreparedRegion, PipelineError> {
    let crop = crop_candidate(page, &candidate.bbox, &config.cleaning);
    let crop_png = encode_png(&crop)?;
    let crop_checksum = sha256_hex(&crop_png);
    let crop_path = store.relative_path(key, AssetKind::Crop);

    let mut writes = vec![store.write_asset(key, AssetKind::Crop, &crop_png)?];
    if !store.verify(&crop_path, Some(&crop_checksum)) {
        return Err(verification_failed(store, &crop_path));
    }

    let mut written = Vec::new();
    let glyph = clean_crop(&crop, &config.cleaning)
        .and_then(|cleaned| store_cleaned(store, key, &cleaned, &mut written));
    let discarded = match glyph {
        Ok(_) => 0,
        Err(_) => discard_written(store, key, &written),
    };
    writes.extend(written.iter().map(|(_, outcome)| *outcome));

    Ok(PreparedRegion {
        crop_path,
        crop_checksum,
        writes,
        discarded,
        glyph,
    })
}

/// Cooperative cancellation flag; clones share the same state
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Stop signal seen by the tasks of one batch.
///
/// Set either by the caller's flag or by the batch itself after a resource-level
/// failure; the latter never touches the caller's flag.
#[derive(Debug, Clone)]
struct BatchStop {
    requested: CancelFlag,
    aborted: CancelFlag,
}

impl BatchStop {
    fn new(requested: &CancelFlag) -> Self {
        Self {
            requested: requested.clone(),
            aborted: CancelFlag::new(),
        }
    }

    fn cancel(&self) {
        self.aborted.cancel();
    }

    fn is_cancelled(&self) -> bool {
        self.requested.is_cancelled() || self.aborted.is_cancelled()
    }
}

/// Source identity shared by the tasks of one batch
#[derive(Debug)]
struct SourceRef {
    id: i64,
    slug: String,
}

/// Batch runner; clones share configuration, store, catalog and worker permits
#[derive(Clone)]
pub struct Pipeline {
    config: Arc<AppConfig>,
    store: AssetStore,
    catalog: CatalogSync,
    cpu_permits: Arc<Semaphore>,
    page_permits: Arc<Semaphore>,
}

fn closed_semaphore(_: tokio::sync::AcquireError) -> AppError {
    AppError::Internal("worker pool closed".to_string())
}

fn join_failed(e: tokio::task::JoinError) -> AppError {
    AppError::Internal(format!("worker task failed: {}", e))
}

impl Pipeline {
    pub fn new(config: AppConfig, store: AssetStore, catalog: CatalogSync) -> Self {
        let workers = config.concurrency.workers.max(1);
        Self {
            config: Arc::new(config),
            store,
            catalog,
            cpu_permits: Arc::new(Semaphore::new(workers)),
            page_permits: Arc::new(Semaphore::new(workers)),
        }
    }

    async fn cpu_permit(&self) -> AppResult<OwnedSemaphorePermit> {
        Arc::clone(&self.cpu_permits)
            .acquire_owned()
            .await
            .map_err(closed_semaphore)
    }

    /// Process every page of a source.
    ///
    /// Cancelling `cancel` stops the batch between pages and between candidates; the
    /// summary then has `cancelled` set and the next run resumes where this one left off.
    pub async fn run(
        &self,
        source: &Source,
        pages: Vec<PageInput>,
        cancel: &CancelFlag,
    ) -> AppResult<BatchSummary> {
        let started = Instant::now();
        let batch = BatchStop::new(cancel);
        let source_ref = Arc::new(SourceRef {
            id: source.id,
            slug: source.slug.clone(),
        });

        info!(source = %source.slug, pages = pages.len(), "Starting batch");

        let mut tasks = JoinSet::new();
        for page in pages {
            let pipeline = self.clone();
            let source_ref = Arc::clone(&source_ref);
            let batch = batch.clone();
            let span = observability::page_span(&source_ref.slug, page.number);
            tasks.spawn(
                async move { pipeline.process_page(source_ref, page, batch).await }.instrument(span),
            );
        }

        let mut summary = BatchSummary {
            source: source.slug.clone(),
            ..Default::default()
        };
        let mut fatal: Option<AppError> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(join_failed).and_then(|r| r) {
                Ok(page_summary) => summary.merge(page_summary),
                Err(err) => {
                    if fatal.is_none() {
                        warn!(error = %err, "Stopping batch after resource-level failure");
                        batch.cancel();
                        fatal = Some(err);
                    }
                }
            }
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        summary.cancelled |= cancel.is_cancelled();
        summary.failures.sort_by(|a, b| a.key.cmp(&b.key));

        info!(
            source = %summary.source,
            pages = summary.pages,
            detected = summary.detected,
            accepted = summary.accepted,
            rejected = summary.rejected,
            cleaned = summary.cleaned,
            failed = summary.failed,
            cancelled = summary.cancelled,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        Ok(summary)
    }

    async fn process_page(
        self,
        source: Arc<SourceRef>,
        page: PageInput,
        cancel: BatchStop,
    ) -> AppResult<BatchSummary> {
        let _page_permit = Arc::clone(&self.page_permits)
            .acquire_owned()
            .await
            .map_err(closed_semaphore)?;

        let mut summary = BatchSummary::default();
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        let started = Instant::now();
        summary.pages = 1;

        let detected = {
            let _cpu = self.cpu_permit().await?;
            let config = Arc::clone(&self.config);
            let path = page.path.clone();
            tokio::task::spawn_blocking(move || detect_page(&path, &config))
                .await
                .map_err(join_failed)?
        };

        let detected = match detected {
            Ok(detected) => detected,
            Err(err) => {
                error_logging::log_item_failure(&err, "detect_page", &source.slug, page.number, None);
                summary.pages_failed = 1;
                summary.record_failure(ItemFailure::new(
                    format!("{}/p{}", source.slug, page.number),
                    &err,
                ));
                observability::record_page_metrics(false, started.elapsed());
                return Ok(summary);
            }
        };

        summary.detected = detected.components;
        summary.below_min_area = detected.components.saturating_sub(detected.candidates.len());
        summary.accepted = detected.candidates.iter().filter(|c| c.is_accepted()).count();
        summary.rejected = detected.candidates.len() - summary.accepted;

        if detected.candidates.is_empty() {
            info!(
                components = detected.components,
                min_area = self.config.detection.min_area,
                "No candidates found on page"
            );
        }

        let mut tasks = JoinSet::new();
        for candidate in detected.candidates {
            let key = RegionKey::new(source.slug.as_str(), page.number, candidate.bbox);
            let span = observability::candidate_span(&key.to_string());
            let pipeline = self.clone();
            let image = Arc::clone(&detected.image);
            let cancel = cancel.clone();
            let source_id = source.id;
            tasks.spawn(
                async move {
                    pipeline
                        .process_candidate(source_id, key, candidate, image, cancel)
                        .await
                }
                .instrument(span),
            );
        }

        let mut fatal: Option<AppError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(join_failed).and_then(|r| r) {
                Ok(candidate_summary) => summary.merge(candidate_summary),
                Err(err) => {
                    if fatal.is_none() {
                        cancel.cancel();
                        fatal = Some(err);
                    }
                }
            }
        }
        if let Some(err) = fatal {
            observability::record_page_metrics(false, started.elapsed());
            return Err(err);
        }

        observability::record_page_metrics(true, started.elapsed());
        debug!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            failed = summary.failed,
            "Page processed"
        );
        Ok(summary)
    }

    /// Sync one region under its key guard, then delete the files its rows let go of.
    ///
    /// Per-item errors land in `summary`, resource-level ones propagate.
    async fn sync(
        &self,
        summary: &mut BatchSummary,
        guard: &KeyGuard,
        key: &RegionKey,
        source_id: i64,
        record: &CandidateRecord,
        glyph: Option<&GlyphRecord>,
    ) -> AppResult<bool> {
        match self
            .catalog
            .sync_region_locked(guard, key, source_id, record, glyph)
            .await
        {
            Ok(sync) => {
                summary.record_sync(&sync);
                for path in &sync.released {
                    match self.store.remove(path) {
                        Ok(true) => summary.files_removed += 1,
                        Ok(false) => {}
                        Err(err) => warn!(key = %key, path = %path, error = %err, "Released asset could not be removed"),
                    }
                }
                Ok(true)
            }
            Err(AppError::Pipeline(err)) => {
                self.record_item_failure(summary, "sync_region", key, &err);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn record_item_failure(
        &self,
        summary: &mut BatchSummary,
        operation: &str,
        key: &RegionKey,
        err: &PipelineError,
    ) {
        error_logging::log_item_failure(err, operation, &key.source, key.page, Some(&key.to_string()));
        summary.record_failure(ItemFailure::new(key.to_string(), err));
    }

    async fn process_candidate(
        self,
        source_id: i64,
        key: RegionKey,
        candidate: Candidate,
        page_image: Arc<RgbaImage>,
        cancel: BatchStop,
    ) -> AppResult<BatchSummary> {
        let mut summary = BatchSummary::default();
        if cancel.is_cancelled() {
            summary.cancelled = true;
            return Ok(summary);
        }

        // Held from the first asset write until the rows commit
        let guard = match self.catalog.lock_key(&key).await {
            Ok(guard) => guard,
            Err(err) => {
                self.record_item_failure(&mut summary, "lock_key", &key, &err);
                return Ok(summary);
            }
        };

        if !candidate.is_accepted() {
            let record = CandidateRecord {
                page: key.page,
                bbox: candidate.bbox,
                area: candidate.area,
                status: CandidateStatus::Rejected,
                reason: candidate.reason.map(|r| r.as_str().to_string()),
                crop_path: None,
                crop_checksum: None,
            };
            self.sync(&mut summary, &guard, &key, source_id, &record, None)
                .await?;
            observability::record_candidate(CandidateStatus::Rejected.as_str());
            return Ok(summary);
        }

        let prepared = {
            let _cpu = self.cpu_permit().await?;
            if cancel.is_cancelled() {
                summary.cancelled = true;
                return Ok(summary);
            }
            let config = Arc::clone(&self.config);
            let store = self.store.clone();
            let key = key.clone();
            let candidate = candidate.clone();
            tokio::task::spawn_blocking(move || {
                prepare_region(&page_image, &key, &candidate, &config, &store)
            })
            .await
            .map_err(join_failed)?
        };

        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.record_item_failure(&mut summary, "prepare_region", &key, &err);
                return Ok(summary);
            }
        };

        for outcome in &prepared.writes {
            summary.record_write(*outcome);
        }
        summary.files_removed += prepared.discarded;

        let (status, reason, glyph) = match &prepared.glyph {
            Ok(glyph) => (CandidateStatus::Accepted, None, Some(glyph)),
            Err(err) => {
                self.record_item_failure(&mut summary, "clean_region", &key, err);
                (CandidateStatus::NeedsReview, Some(err.to_string()), None)
            }
        };

        let record = CandidateRecord {
            page: key.page,
            bbox: candidate.bbox,
            area: candidate.area,
            status,
            reason,
            crop_path: Some(prepared.crop_path.clone()),
            crop_checksum: Some(prepared.crop_checksum.clone()),
        };

        let synced = self
            .sync(&mut summary, &guard, &key, source_id, &record, glyph)
            .await?;
        if synced && glyph.is_some() {
            summary.cleaned += 1;
            observability::record_glyph_cleaned();
        }
        observability::record_candidate(status.as_str());
        Ok(summary)
    }
}

/// Manifest entry describing one source
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum ManifestEntry {
    Path(String),
    Source {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        slug: Option<String>,
        #[serde(default)]
        tradition_tags: Vec<String>,
        #[serde(default, alias = "local_path", alias = "url")]
        original_file: Option<String>,
    },
}

fn title_from_file(file: &str) -> Option<String> {
    let stem = Path::new(file.trim_end_matches('/')).file_stem()?.to_str()?;
    let title = stem.replace(['-', '_'], " ").trim().to_string();
    (!title.is_empty()).then_some(title)
}

impl ManifestEntry {
    fn into_new_source(self) -> AppResult<NewSource> {
        let (title, slug, tradition_tags, original_file) = match self {
            ManifestEntry::Path(file) => (None, None, Vec::new(), Some(file)),
            ManifestEntry::Source {
                title,
                slug,
                tradition_tags,
                original_file,
            } => (title, slug, tradition_tags, original_file),
        };

        let title = title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| original_file.as_deref().and_then(title_from_file))
            .ok_or_else(|| {
                AppError::Validation("Manifest entry needs a title or a file reference".to_string())
            })?;

        Ok(NewSource {
            title,
            slug,
            tradition_tags,
            original_file,
        })
    }
}

/// Parse a source manifest: a JSON array of entries, or an object of such arrays.
///
/// An entry is a file path/URL string or an object with `title`, `slug`,
/// `tradition_tags` and `original_file`.
pub fn parse_manifest(raw: &str) -> AppResult<Vec<NewSource>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let items: Vec<serde_json::Value> = match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(groups) => groups
            .into_iter()
            .filter_map(|(_, group)| match group {
                serde_json::Value::Array(items) => Some(items),
                _ => None,
            })
            .flatten()
            .collect(),
        _ => {
            return Err(AppError::Validation(
                "Manifest must be a JSON array or an object of arrays".to_string(),
            ))
        }
    };

    items
        .into_iter()
        .map(|item| serde_json::from_value::<ManifestEntry>(item)?.into_new_source())
        .collect()
}

/// Register every source listed in a manifest file, in order
pub async fn ingest_manifest(pool: &SqlitePool, path: &Path) -> AppResult<Vec<Source>> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
        AppError::FileSystem(format!("Cannot read manifest {}: {}", path.display(), e))
    })?;
    let entries = parse_manifest(&raw)?;

    let mut sources = Vec::with_capacity(entries.len());
    for entry in &entries {
        sources.push(catalog::upsert_source(pool, entry).await?);
    }
    info!(manifest = %path.display(), sources = sources.len(), "Manifest ingested");
    Ok(sources)
}

/// What a reconciliation pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub glyph_rows_removed: usize,
    pub glyph_rows_kept_for_symbols: usize,
    pub candidate_crops_cleared: usize,
    pub files_removed: usize,
}

/// Restore file/row consistency after crashes or manual deletions.
///
/// Rows pointing at missing files are deregistered (glyphs referenced by a symbol are
/// kept and reported), then files no row references are deleted. Run it while no
/// batch is writing to the same store.
pub async fn reconcile(pool: &SqlitePool, store: &AssetStore) -> AppResult<ReconcileReport> {
    let mut report = ReconcileReport::default();

    let mut handled_glyphs = HashSet::new();
    for file in catalog::referenced_files(pool).await? {
        if store.exists(&file.path) {
            continue;
        }
        match file.table {
            "candidates" => {
                if catalog::clear_candidate_crop(pool, file.row_id).await? {
                    report.candidate_crops_cleared += 1;
                }
            }
            _ => {
                if !handled_glyphs.insert(file.row_id) {
                    continue;
                }
                if catalog::deregister_glyph(pool, file.row_id).await? {
                    report.glyph_rows_removed += 1;
                } else {
                    warn!(glyph_id = file.row_id, path = %file.path, "Catalogued glyph is missing its file");
                    report.glyph_rows_kept_for_symbols += 1;
                }
            }
        }
    }

    let referenced: HashSet<String> = catalog::referenced_files(pool)
        .await?
        .into_iter()
        .map(|f| f.path)
        .collect();

    for (_source, assets) in store.list_assets()? {
        for asset in assets {
            if !referenced.contains(&asset.relative_path) && store.remove(&asset.relative_path)? {
                report.files_removed += 1;
            }
        }
    }

    info!(
        glyph_rows_removed = report.glyph_rows_removed,
        candidate_crops_cleared = report.candidate_crops_cleared,
        files_removed = report.files_removed,
        "Reconciliation finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_pages_numbers_from_stems() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page0002.png", "page0010.png", "page0001.PNG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let pages = discover_pages(dir.path()).unwrap();
        let numbers: Vec<u32> = pages.iter().map(|p| p.number).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
    }

    #[test]
    fn test_discover_pages_without_digits_uses_position() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.png", "a.png"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let pages = discover_pages(dir.path()).unwrap();
        assert_eq!(pages[0].number, 1);
        assert!(pages[0].path.ends_with("a.png"));
        assert_eq!(pages[1].number, 2);
    }

    #[test]
    fn test_discover_pages_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page1.png", "scan001.png"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert!(matches!(
            discover_pages(dir.path()),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_parse_manifest_shapes() {
        let sources = parse_manifest(
            r#"[
                "downloads/key-of-solomon.pdf",
                { "title": "Picatrix", "tradition_tags": ["astral"], "local_path": "picatrix.pdf" }
            ]"#,
        )
        .unwrap();
        assert_eq!(sources[0].title, "key of solomon");
        assert_eq!(sources[1].title, "Picatrix");
        assert_eq!(sources[1].original_file.as_deref(), Some("picatrix.pdf"));

        let grouped = parse_manifest(r#"{ "grimoires": [{ "title": "Arbatel" }], "other": 3 }"#).unwrap();
        assert_eq!(grouped.len(), 1);

        assert!(parse_manifest(r#"[{ "slug": "nameless" }]"#).is_err());
        assert!(parse_manifest("42").is_err());
    }

    #[test]
    fn test_failed_thumbnail_write_discards_cleaned_file() {
        use crate::config::RecoveryConfig;
        use crate::geometry::BBox;
        use image::Rgba;

        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.recovery = RecoveryConfig {
            max_retries: 1,
            base_retry_delay_ms: 1,
            max_retry_delay_ms: 1,
        };
        let root = dir.path().join("assets");
        let store = AssetStore::open(&root, config.recovery.clone()).unwrap();

        // Plus sign inside a 40x40 box at (40, 40)
        let mut page = RgbaImage::from_pixel(120, 120, Rgba([255, 255, 255, 255]));
        for y in 40..80 {
            for x in 40..80 {
                if (55..65).contains(&x) || (55..65).contains(&y) {
                    page.put_pixel(x, y, Rgba([0, 0, 0, 255]));
                }
            }
        }
        let key = RegionKey::new("sworn-book", 1, BBox::new(40, 40, 40, 40));
        let candidate = Candidate {
            bbox: key.bbox,
            area: 700,
            status: CandidateStatus::Accepted,
            reason: None,
        };

        // A regular file where the thumbnail directory should be
        std::fs::create_dir_all(root.join("sworn-book")).unwrap();
        std::fs::write(root.join("sworn-book").join("thumbs"), b"").unwrap();

        let prepared = prepare_region(&page, &key, &candidate, &config, &store).unwrap();
        assert!(matches!(
            prepared.glyph,
            Err(PipelineError::AssetWriteFailed { .. })
        ));
        assert_eq!(prepared.discarded, 1);
        assert_eq!(prepared.writes, vec![WriteOutcome::Written, WriteOutcome::Written]);
        assert!(store.verify(&prepared.crop_path, Some(&prepared.crop_checksum)));
        assert!(!store.exists(&store.relative_path(&key, AssetKind::Cleaned)));
    }

    #[test]
    fn test_summary_merge() {
        let mut total = BatchSummary::default();
        let mut page = BatchSummary {
            pages: 1,
            detected: 3,
            ..Default::default()
        };
        page.record_failure(ItemFailure {
            key: "k".to_string(),
            code: "cleaning_failed".to_string(),
            reason: "uniform".to_string(),
        });
        total.merge(page.clone());
        total.merge(page);
        assert_eq!(total.pages, 2);
        assert_eq!(total.detected, 6);
        assert_eq!(total.failed, 2);
        assert_eq!(total.failures.len(), 2);
    }
}
