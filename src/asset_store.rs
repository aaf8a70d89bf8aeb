//! # Asset Store
//!
//! Deterministic on-disk layout for glyph assets:
//!
//! ```text
//! <root>/<source-slug>/crops/p0001_x10_y20_w40_h40.png
//! <root>/<source-slug>/cleaned/p0001_x10_y20_w40_h40.png
//! <root>/<source-slug>/thumbs/p0001_x10_y20_w40_h40.png
//! ```
//!
//! Writes go to a temporary file in the target directory and are renamed over the
//! destination, so readers see either the old or the new file. A destination that
//! already holds identical bytes is left untouched.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::cleaning::sha256_hex;
use crate::config::RecoveryConfig;
use crate::errors::{error_logging, AppError, AppResult, PipelineError};
use crate::geometry::RegionKey;
use crate::retry::calculate_retry_delay;

/// Kind of asset stored for a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetKind {
    Crop,
    Cleaned,
    Thumbnail,
}

impl AssetKind {
    pub const ALL: [AssetKind; 3] = [AssetKind::Crop, AssetKind::Cleaned, AssetKind::Thumbnail];

    pub fn dir_name(&self) -> &'static str {
        match self {
            AssetKind::Crop => "crops",
            AssetKind::Cleaned => "cleaned",
            AssetKind::Thumbnail => "thumbs",
        }
    }

    fn from_dir_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.dir_name() == name)
    }
}

/// Result of a write that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// Destination already held the same bytes
    Unchanged,
}

impl WriteOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteOutcome::Written => "written",
            WriteOutcome::Unchanged => "unchanged",
        }
    }
}

/// A stored file, as found by [`AssetStore::list_assets`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAsset {
    pub key: RegionKey,
    pub kind: AssetKind,
    /// Path relative to the store root, `/`-separated
    pub relative_path: String,
}

/// Owner of the asset directory tree
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
    recovery: RecoveryConfig,
}

impl AssetStore {
    /// Open (creating if needed) the store root.
    ///
    /// Failure here is resource-level and ends the run.
    pub fn open(root: impl Into<PathBuf>, recovery: RecoveryConfig) -> AppResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            error_logging::log_filesystem_error(&e, "open_asset_store", Some(&root), None);
            AppError::FileSystem(format!(
                "Cannot open asset root {}: {}",
                root.display(),
                e
            ))
        })?;
        Ok(Self { root, recovery })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relative path of an asset, as stored in catalog rows
    pub fn relative_path(&self, key: &RegionKey, kind: AssetKind) -> String {
        format!(
            "{}/{}/{}.png",
            key.source,
            kind.dir_name(),
            key.file_stem()
        )
    }

    /// Absolute path of a relative asset path
    pub fn resolve(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    pub fn path_for(&self, key: &RegionKey, kind: AssetKind) -> PathBuf {
        self.resolve(&self.relative_path(key, kind))
    }

    /// Atomically write an asset, retrying transient failures with backoff.
    ///
    /// Blocking; callers on the async runtime run it on a blocking thread.
    pub fn write_asset(
        &self,
        key: &RegionKey,
        kind: AssetKind,
        bytes: &[u8],
    ) -> Result<WriteOutcome, PipelineError> {
        let target = self.path_for(key, kind);

        if let Ok(existing) = fs::read(&target) {
            if existing == bytes {
                debug!(path = %target.display(), "Asset unchanged, skipping write");
                metrics::counter!("asset_writes_total", "outcome" => "unchanged").increment(1);
                return Ok(WriteOutcome::Unchanged);
            }
        }

        let max_attempts = self.recovery.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write_atomically(&target, bytes) {
                Ok(()) => {
                    debug!(path = %target.display(), bytes = bytes.len(), attempt = attempt, "Asset written");
                    metrics::counter!("asset_writes_total", "outcome" => "written").increment(1);
                    return Ok(WriteOutcome::Written);
                }
                Err(err) => {
                    if attempt >= max_attempts {
                        error_logging::log_filesystem_error(
                            &err,
                            "write_asset",
                            Some(&target),
                            Some(attempt),
                        );
                        metrics::counter!("asset_writes_total", "outcome" => "failed")
                            .increment(1);
                        return Err(PipelineError::AssetWriteFailed {
                            path: target,
                            attempts: attempt,
                            message: err.to_string(),
                        });
                    }

                    let delay_ms = calculate_retry_delay(attempt, &self.recovery);
                    warn!(
                        path = %target.display(),
                        error = %err,
                        "Asset write attempt {attempt} failed, retrying in {delay_ms}ms"
                    );
                    std::thread::sleep(Duration::from_millis(delay_ms));
                }
            }
        }
    }

    /// True when the file exists and, if a checksum is given, its content matches it
    pub fn verify(&self, relative: &str, checksum: Option<&str>) -> bool {
        let path = self.resolve(relative);
        match checksum {
            None => path.is_file(),
            Some(expected) => match fs::read(&path) {
                Ok(bytes) => sha256_hex(&bytes) == expected,
                Err(_) => false,
            },
        }
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.resolve(relative).is_file()
    }

    /// All stored assets grouped by source slug.
    ///
    /// Files that do not follow the naming scheme are ignored.
    pub fn list_assets(&self) -> AppResult<BTreeMap<String, Vec<StoredAsset>>> {
        let mut grouped: BTreeMap<String, Vec<StoredAsset>> = BTreeMap::new();

        for source_entry in read_dir_sorted(&self.root)? {
            if !source_entry.is_dir() {
                continue;
            }
            let Some(source) = file_name(&source_entry) else {
                continue;
            };

            let mut assets = Vec::new();
            for kind_dir in read_dir_sorted(&source_entry)? {
                let Some(kind) = file_name(&kind_dir).and_then(|n| AssetKind::from_dir_name(&n))
                else {
                    continue;
                };
                if !kind_dir.is_dir() {
                    continue;
                }
                for file in read_dir_sorted(&kind_dir)? {
                    if file.extension().and_then(|e| e.to_str()) != Some("png") {
                        continue;
                    }
                    let Some(stem) = file.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    if let Some(key) = RegionKey::parse_file_stem(&source, stem) {
                        let relative_path = self.relative_path(&key, kind);
                        assets.push(StoredAsset {
                            key,
                            kind,
                            relative_path,
                        });
                    }
                }
            }

            if !assets.is_empty() {
                grouped.insert(source, assets);
            }
        }

        Ok(grouped)
    }

    /// Delete an asset; `Ok(false)` when it was already gone
    pub fn remove(&self, relative: &str) -> AppResult<bool> {
        let path = self.resolve(relative);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Asset removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                error_logging::log_filesystem_error(&e, "remove_asset", Some(&path), None);
                Err(AppError::FileSystem(format!(
                    "Cannot remove {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    /// Probe that the root accepts new files
    pub fn check_writable(&self) -> AppResult<()> {
        let mut probe = NamedTempFile::new_in(&self.root).map_err(|e| {
            AppError::FileSystem(format!(
                "Asset root {} is not writable: {}",
                self.root.display(),
                e
            ))
        })?;
        probe.write_all(b"probe")?;
        Ok(())
    }
}

fn write_atomically(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = target.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "asset path has no parent")
    })?;
    fs::create_dir_all(dir)?;

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(target).map_err(|e| e.error)?;
    Ok(())
}

fn read_dir_sorted(dir: &Path) -> AppResult<Vec<PathBuf>> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| AppError::FileSystem(format!("Cannot list {}: {}", dir.display(), e)))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BBox;
    use tempfile::TempDir;

    fn store() -> (TempDir, AssetStore) {
        let dir = TempDir::new().unwrap();
        let store = AssetStore::open(dir.path().join("assets"), RecoveryConfig::default()).unwrap();
        (dir, store)
    }

    fn key() -> RegionKey {
        RegionKey::new("key-of-solomon", 3, BBox::new(12, 40, 64, 60))
    }

    #[test]
    fn test_deterministic_layout() {
        let (_dir, store) = store();
        assert_eq!(
            store.relative_path(&key(), AssetKind::Cleaned),
            "key-of-solomon/cleaned/p0003_x12_y40_w64_h60.png"
        );
        assert_eq!(
            store.path_for(&key(), AssetKind::Thumbnail),
            store
                .root()
                .join("key-of-solomon")
                .join("thumbs")
                .join("p0003_x12_y40_w64_h60.png")
        );
    }

    #[test]
    fn test_rewrite_with_same_bytes_is_unchanged() {
        let (_dir, store) = store();
        assert_eq!(
            store.write_asset(&key(), AssetKind::Crop, b"first").unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(
            store.write_asset(&key(), AssetKind::Crop, b"first").unwrap(),
            WriteOutcome::Unchanged
        );
        assert_eq!(
            store.write_asset(&key(), AssetKind::Crop, b"second").unwrap(),
            WriteOutcome::Written
        );
        assert_eq!(fs::read(store.path_for(&key(), AssetKind::Crop)).unwrap(), b"second");

        // No temp files left behind
        let dir = store.path_for(&key(), AssetKind::Crop);
        let siblings = fs::read_dir(dir.parent().unwrap()).unwrap().count();
        assert_eq!(siblings, 1);
    }

    #[test]
    fn test_verify_checks_content() {
        let (_dir, store) = store();
        store.write_asset(&key(), AssetKind::Cleaned, b"png").unwrap();
        let rel = store.relative_path(&key(), AssetKind::Cleaned);
        assert!(store.verify(&rel, None));
        assert!(store.verify(&rel, Some(&sha256_hex(b"png"))));
        assert!(!store.verify(&rel, Some(&sha256_hex(b"other"))));
        assert!(!store.verify("missing/cleaned/p0001_x1_y1_w1_h1.png", None));
    }

    #[test]
    fn test_write_failure_after_retries() {
        let (dir, store) = store();
        // A regular file where the source directory should be
        fs::write(store.root().join("blocked"), b"").unwrap();
        let store = AssetStore {
            recovery: RecoveryConfig {
                max_retries: 1,
                base_retry_delay_ms: 1,
                max_retry_delay_ms: 1,
            },
            ..store
        };
        let key = RegionKey::new("blocked", 1, BBox::new(0, 0, 5, 5));
        let err = store.write_asset(&key, AssetKind::Crop, b"x").unwrap_err();
        match err {
            PipelineError::AssetWriteFailed { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("unexpected error: {other}"),
        }
        drop(dir);
    }

    #[test]
    fn test_list_assets_grouped_by_source() {
        let (_dir, store) = store();
        let a = RegionKey::new("alpha", 1, BBox::new(1, 2, 3, 4));
        let b = RegionKey::new("beta", 2, BBox::new(5, 6, 7, 8));
        store.write_asset(&a, AssetKind::Crop, b"a").unwrap();
        store.write_asset(&a, AssetKind::Cleaned, b"a").unwrap();
        store.write_asset(&b, AssetKind::Thumbnail, b"b").unwrap();
        fs::write(store.root().join("alpha").join("crops").join("notes.txt"), b"").unwrap();

        let grouped = store.list_assets().unwrap();
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped["alpha"].len(), 2);
        assert_eq!(grouped["beta"][0].key, b);
        assert_eq!(grouped["beta"][0].kind, AssetKind::Thumbnail);

        assert!(store.remove(&grouped["beta"][0].relative_path).unwrap());
        assert!(!store.remove(&grouped["beta"][0].relative_path).unwrap());
    }

    #[test]
    fn test_check_writable() {
        let (_dir, store) = store();
        assert!(store.check_writable().is_ok());
    }
}
