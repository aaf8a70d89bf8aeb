//! End-to-end batch runs over synthetic pages

mod test_helpers;

use std::collections::HashSet;

use glyph_catalog::catalog::{self, CatalogSync};
use glyph_catalog::filter::CandidateStatus;
use glyph_catalog::geometry::{BBox, RegionKey};
use glyph_catalog::pipeline::{self, BatchSummary, CancelFlag, Pipeline};
use test_helpers::*;

/// 200x200 white page with one 40x40 black square at (80, 80)
fn single_square_page(env: &TestEnv) {
    let mut page = white_page(200, 200);
    fill_rect(&mut page, 80, 80, 40, 40, BLACK);
    save_page(&env.pages_dir(), 1, &page);
}

async fn run_source(env: &TestEnv, slug: &str) -> BatchSummary {
    let source = catalog::require_source(&env.pool, slug).await.unwrap();
    let pages = pipeline::discover_pages(&env.pages_dir()).unwrap();
    env.pipeline()
        .run(&source, pages, &CancelFlag::new())
        .await
        .unwrap()
}

/// Every file under the store belongs to some candidate or glyph row
async fn assert_every_file_referenced(env: &TestEnv) {
    let referenced: HashSet<String> = catalog::referenced_files(&env.pool)
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.path)
        .collect();
    for (_source, assets) in env.store.list_assets().unwrap() {
        for asset in assets {
            assert!(
                referenced.contains(&asset.relative_path),
                "{} has no row",
                asset.relative_path
            );
        }
    }
}

#[tokio::test]
async fn test_single_square_becomes_one_transparent_glyph() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);

    let summary = run_source(&env, &source.slug).await;
    assert_eq!(summary.detected, 1);
    assert_eq!(summary.accepted, 1);
    assert_eq!(summary.cleaned, 1);
    assert_eq!(summary.failed, 0);
    assert!(!summary.cancelled);

    let candidates = catalog::list_candidates(&env.pool, source.id, None).await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].area, 1600);
    assert_eq!(candidates[0].bbox, BBox::new(80, 80, 40, 40));
    assert_eq!(candidates[0].status, CandidateStatus::Accepted);

    let glyphs = catalog::list_glyphs(&env.pool, source.id, Some(1)).await.unwrap();
    assert_eq!(glyphs.len(), 1);
    let glyph = &glyphs[0];
    assert!(env.store.verify(&glyph.raster_path, Some(&glyph.checksum)));
    assert!(env.store.exists(&glyph.thumb_path));

    // Cropped with a 4px margin: the square spans 4..44 of a 48x48 raster
    let cleaned = image::open(env.store.resolve(&glyph.raster_path))
        .unwrap()
        .to_rgba8();
    assert_eq!(cleaned.dimensions(), (48, 48));
    assert_eq!((glyph.width, glyph.height), (48, 48));
    for (x, y, pixel) in cleaned.enumerate_pixels() {
        let inside = (4..44).contains(&x) && (4..44).contains(&y);
        if inside {
            assert_eq!(pixel[3], 255, "alpha at ({}, {})", x, y);
            assert_eq!(&pixel.0[..3], &[0, 0, 0]);
        } else {
            assert_eq!(pixel[3], 0, "alpha at ({}, {})", x, y);
        }
    }
}

#[tokio::test]
async fn test_square_below_min_area_is_detected_but_not_accepted() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 2000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);

    let summary = run_source(&env, &source.slug).await;
    assert_eq!(summary.detected, 1);
    assert_eq!(summary.below_min_area, 1);
    assert_eq!(summary.accepted, 0);
    assert_eq!(summary.cleaned, 0);
    assert_eq!(env.count_rows("candidates").await, 0);
    assert_eq!(env.count_rows("glyph_images").await, 0);
}

#[tokio::test]
async fn test_second_run_is_a_no_op() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 500;
    let source = env.register_source("Lemegeton").await;

    let pages_dir = env.pages_dir();
    let mut first = white_page(300, 300);
    fill_rect(&mut first, 30, 30, 40, 40, BLACK);
    draw_cross(&mut first, 150, 30, 50, 12);
    // Rule line, rejected on aspect ratio
    fill_rect(&mut first, 20, 250, 200, 5, BLACK);
    save_page(&pages_dir, 1, &first);

    let mut second = white_page(300, 300);
    draw_cross(&mut second, 100, 100, 60, 14);
    save_page(&pages_dir, 2, &second);

    let initial = run_source(&env, &source.slug).await;
    assert_eq!(initial.pages, 2);
    assert_eq!(initial.accepted, 3);
    assert_eq!(initial.rejected, 1);
    assert_eq!(initial.cleaned, 3);
    assert_eq!(initial.failed, 0);
    // 4 candidate rows plus 3 glyph rows; crop, cleaned and thumb per accepted candidate
    assert_eq!(initial.rows_inserted, 7);
    assert_eq!(initial.files_written, 9);

    let glyphs_before = catalog::list_glyphs(&env.pool, source.id, None).await.unwrap();
    let candidates_before = catalog::list_candidates(&env.pool, source.id, None).await.unwrap();
    let assets_before = env.store.list_assets().unwrap();

    let rerun = run_source(&env, &source.slug).await;
    assert_eq!(rerun.rows_inserted, 0);
    assert_eq!(rerun.rows_updated, 0);
    assert_eq!(rerun.rows_unchanged, 7);
    assert_eq!(rerun.files_written, 0);
    assert_eq!(rerun.files_unchanged, 9);

    let glyphs_after = catalog::list_glyphs(&env.pool, source.id, None).await.unwrap();
    let candidates_after = catalog::list_candidates(&env.pool, source.id, None).await.unwrap();
    assert_eq!(glyphs_after, glyphs_before);
    assert_eq!(candidates_after, candidates_before);
    assert_eq!(env.store.list_assets().unwrap(), assets_before);
}

#[tokio::test]
async fn test_uniform_crop_fails_without_stopping_siblings() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 500;
    env.config.cleaning.crop_margin_px = 0;
    env.config.cleaning.crop_margin_ratio = 0.0;
    let source = env.register_source("Sworn Book").await;

    let mut page = white_page(300, 200);
    // Cropped without margin, the solid square is one flat colour
    fill_rect(&mut page, 40, 40, 40, 40, BLACK);
    draw_cross(&mut page, 150, 40, 40, 10);
    save_page(&env.pages_dir(), 1, &page);

    let summary = run_source(&env, &source.slug).await;
    assert_eq!(summary.accepted, 2);
    assert_eq!(summary.cleaned, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].code, "cleaning_failed");
    assert_eq!(
        summary.failures[0].key,
        format!("{}/p1/40,40,40,40", source.slug)
    );

    let candidates = catalog::list_candidates(&env.pool, source.id, Some(1)).await.unwrap();
    let square = candidates
        .iter()
        .find(|c| c.bbox == BBox::new(40, 40, 40, 40))
        .unwrap();
    assert_eq!(square.status, CandidateStatus::NeedsReview);
    assert!(square.reason.is_some());
    let crop_path = square.crop_path.as_deref().unwrap();
    assert!(env.store.verify(crop_path, square.crop_checksum.as_deref()));

    let glyphs = catalog::list_glyphs(&env.pool, source.id, Some(1)).await.unwrap();
    assert_eq!(glyphs.len(), 1);
    assert_eq!(glyphs[0].bbox, BBox::new(150, 40, 40, 40));
}

#[tokio::test]
async fn test_unreadable_page_is_isolated() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);
    std::fs::write(env.pages_dir().join("page0002.png"), b"not an image").unwrap();

    let summary = run_source(&env, &source.slug).await;
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.pages_failed, 1);
    assert_eq!(summary.cleaned, 1);
    assert_eq!(summary.failures.len(), 1);
    assert_eq!(summary.failures[0].code, "unreadable_image");
    assert_eq!(summary.failures[0].key, format!("{}/p2", source.slug));
}

#[tokio::test]
async fn test_cancelled_batch_writes_nothing() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);

    let cancel = CancelFlag::new();
    cancel.cancel();
    let pages = pipeline::discover_pages(&env.pages_dir()).unwrap();
    let summary = env.pipeline().run(&source, pages, &cancel).await.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.pages, 0);
    assert_eq!(env.count_rows("candidates").await, 0);
    assert!(env.store.list_assets().unwrap().is_empty());

    // Resuming processes the page normally
    let resumed = run_source(&env, &source.slug).await;
    assert_eq!(resumed.cleaned, 1);
}

#[tokio::test]
async fn test_reconcile_restores_file_row_consistency() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);
    run_source(&env, &source.slug).await;

    let glyph = catalog::list_glyphs(&env.pool, source.id, None).await.unwrap().remove(0);
    std::fs::remove_file(env.store.resolve(&glyph.raster_path)).unwrap();

    let stray = format!("{}/crops/p0009_x1_y1_w20_h20.png", source.slug);
    std::fs::write(env.store.resolve(&stray), b"stray").unwrap();

    let report = pipeline::reconcile(&env.pool, &env.store).await.unwrap();
    assert_eq!(report.glyph_rows_removed, 1);
    assert_eq!(report.candidate_crops_cleared, 0);
    // The stray crop and the thumbnail of the removed glyph
    assert_eq!(report.files_removed, 2);
    assert!(!env.store.exists(&stray));
    assert!(!env.store.exists(&glyph.thumb_path));
    assert_eq!(env.count_rows("glyph_images").await, 0);

    let second = pipeline::reconcile(&env.pool, &env.store).await.unwrap();
    assert_eq!(second, Default::default());

    let rerun = run_source(&env, &source.slug).await;
    assert_eq!(rerun.cleaned, 1);
    assert_eq!(rerun.rows_inserted, 1);
    assert_eq!(env.count_rows("glyph_images").await, 1);
}

#[tokio::test]
async fn test_ingest_manifest_registers_sources() {
    let env = setup_test_env().await;
    let manifest = env.dir.path().join("sources.json");
    std::fs::write(
        &manifest,
        r#"{
            "grimoires": [
                { "title": "The Lesser Key of Solomon", "tradition_tags": ["solomonic"] },
                "scans/picatrix.pdf"
            ]
        }"#,
    )
    .unwrap();

    let sources = pipeline::ingest_manifest(&env.pool, &manifest).await.unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].slug, "the-lesser-key-of-solomon");
    assert_eq!(sources[1].slug, "picatrix");
    assert_eq!(sources[1].original_file.as_deref(), Some("scans/picatrix.pdf"));

    // Ingesting again updates in place
    pipeline::ingest_manifest(&env.pool, &manifest).await.unwrap();
    assert_eq!(env.count_rows("sources").await, 2);
}

#[tokio::test]
async fn test_glyph_that_becomes_rejected_leaves_no_orphans() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    let mut page = white_page(200, 200);
    fill_rect(&mut page, 0, 80, 40, 40, BLACK);
    save_page(&env.pages_dir(), 1, &page);

    let first = run_source(&env, &source.slug).await;
    assert_eq!(first.cleaned, 1);
    assert_eq!(env.count_rows("glyph_images").await, 1);

    env.config.filter.reject_edge_touching = true;
    let second = run_source(&env, &source.slug).await;
    assert_eq!(second.rejected, 1);
    assert_eq!(second.rows_removed, 1);
    // Crop, cleaned raster and thumbnail
    assert_eq!(second.files_removed, 3);

    let candidates = catalog::list_candidates(&env.pool, source.id, None).await.unwrap();
    assert_eq!(candidates[0].status, CandidateStatus::Rejected);
    assert_eq!(candidates[0].crop_path, None);
    assert_eq!(env.count_rows("glyph_images").await, 0);
    assert!(env.store.list_assets().unwrap().is_empty());
    assert_every_file_referenced(&env).await;
}

#[tokio::test]
async fn test_glyph_that_fails_cleaning_keeps_only_its_crop() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);

    let first = run_source(&env, &source.slug).await;
    assert_eq!(first.cleaned, 1);

    // Without a margin the crop is one flat colour and cleaning fails
    env.config.cleaning.crop_margin_px = 0;
    env.config.cleaning.crop_margin_ratio = 0.0;
    let second = run_source(&env, &source.slug).await;
    assert_eq!(second.failed, 1);
    assert_eq!(second.rows_removed, 1);
    assert_eq!(second.files_removed, 2);

    let candidates = catalog::list_candidates(&env.pool, source.id, None).await.unwrap();
    assert_eq!(candidates[0].status, CandidateStatus::NeedsReview);
    let crop_path = candidates[0].crop_path.as_deref().unwrap();
    assert!(env.store.verify(crop_path, candidates[0].crop_checksum.as_deref()));
    assert_eq!(env.count_rows("glyph_images").await, 0);

    let assets = env.store.list_assets().unwrap();
    assert_eq!(assets[&source.slug].len(), 1);
    assert_every_file_referenced(&env).await;
}

#[tokio::test]
async fn test_locked_key_writes_no_files() {
    let mut env = setup_test_env().await;
    env.config.detection.min_area = 1000;
    env.config.database.lock_timeout_ms = 50;
    let source = env.register_source("Key of Solomon").await;
    single_square_page(&env);

    let sync = CatalogSync::new(
        env.pool.clone(),
        &env.config.database,
        env.config.recovery.clone(),
    );
    let pipeline = Pipeline::new(env.config.clone(), env.store.clone(), sync.clone());
    let key = RegionKey::new(source.slug.as_str(), 1, BBox::new(80, 80, 40, 40));
    let guard = sync.lock_key(&key).await.unwrap();

    let pages = pipeline::discover_pages(&env.pages_dir()).unwrap();
    let blocked = pipeline
        .run(&source, pages.clone(), &CancelFlag::new())
        .await
        .unwrap();
    assert_eq!(blocked.failures.len(), 1);
    assert_eq!(blocked.failures[0].code, "catalog_conflict");
    assert_eq!(blocked.files_written, 0);
    assert!(env.store.list_assets().unwrap().is_empty());
    assert_eq!(env.count_rows("candidates").await, 0);

    drop(guard);
    let resumed = pipeline.run(&source, pages, &CancelFlag::new()).await.unwrap();
    assert_eq!(resumed.cleaned, 1);
    assert_every_file_referenced(&env).await;
}
