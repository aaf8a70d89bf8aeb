//! # Test Helper Library
//!
//! Common setup for the integration tests: a scratch directory holding an on-disk
//! SQLite catalog and an asset root, plus builders for synthetic page images.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use glyph_catalog::asset_store::AssetStore;
use glyph_catalog::catalog::{self, CatalogSync, NewSource, Source};
use glyph_catalog::config::AppConfig;
use glyph_catalog::pipeline::Pipeline;
use image::{Rgb, RgbImage};
use sqlx::SqlitePool;
use tempfile::TempDir;

pub const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

/// Scratch catalog, asset store and configuration, removed on drop
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: SqlitePool,
    pub store: AssetStore,
    pub config: AppConfig,
}

/// Create a fresh catalog database and asset root in a temporary directory
pub async fn setup_test_env() -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let mut config = AppConfig::default();
    config.storage.asset_root = dir.path().join("assets");
    config.database.url = format!("sqlite://{}", dir.path().join("catalog.db").display());
    config.concurrency.workers = 2;

    let pool = catalog::connect(&config.database)
        .await
        .expect("Failed to open test database");
    catalog::init_database_schema(&pool)
        .await
        .expect("Failed to initialize schema");
    let store = AssetStore::open(&config.storage.asset_root, config.recovery.clone())
        .expect("Failed to open asset store");

    TestEnv {
        dir,
        pool,
        store,
        config,
    }
}

impl TestEnv {
    /// Directory the synthetic pages are saved into
    pub fn pages_dir(&self) -> PathBuf {
        let pages = self.dir.path().join("pages");
        std::fs::create_dir_all(&pages).expect("Failed to create pages dir");
        pages
    }

    pub async fn register_source(&self, title: &str) -> Source {
        catalog::upsert_source(
            &self.pool,
            &NewSource {
                title: title.to_string(),
                ..Default::default()
            },
        )
        .await
        .expect("Failed to register source")
    }

    /// Pipeline over this environment's store and catalog with the current config
    pub fn pipeline(&self) -> Pipeline {
        let sync = CatalogSync::new(
            self.pool.clone(),
            &self.config.database,
            self.config.recovery.clone(),
        );
        Pipeline::new(self.config.clone(), self.store.clone(), sync)
    }

    pub async fn count_rows(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .expect("Failed to count rows")
    }
}

pub fn white_page(width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, WHITE)
}

pub fn fill_rect(page: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, color: Rgb<u8>) {
    for py in y..y + height {
        for px in x..x + width {
            page.put_pixel(px, py, color);
        }
    }
}

/// Plus sign centred in a `size` box with arms `thickness` wide
pub fn draw_cross(page: &mut RgbImage, x: u32, y: u32, size: u32, thickness: u32) {
    let offset = (size - thickness) / 2;
    fill_rect(page, x + offset, y, thickness, size, BLACK);
    fill_rect(page, x, y + offset, size, thickness, BLACK);
}

/// Save a page as `page{number:04}.png`
pub fn save_page(dir: &Path, number: u32, page: &RgbImage) -> PathBuf {
    let path = dir.join(format!("page{:04}.png", number));
    page.save(&path).expect("Failed to save page");
    path
}
