use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use glyph_catalog::asset_store::AssetStore;
use glyph_catalog::catalog::{self, CatalogSync, SymbolInput};
use glyph_catalog::config::AppConfig;
use glyph_catalog::geometry::{BBox, RegionKey};
use glyph_catalog::observability;
use glyph_catalog::pipeline::{self, CancelFlag, Pipeline};
use glyph_catalog::preflight;

#[derive(Parser, Debug)]
#[command(name = "glyph-catalog")]
#[command(version, about = "Extract, clean and catalog symbol glyphs from scanned pages", long_about = None)]
struct Cli {
    /// JSON configuration file (default: GLYPH_* environment variables)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register the sources listed in a JSON manifest
    Ingest {
        #[arg(long)]
        manifest: PathBuf,
    },

    /// Detect, clean and catalog every page image of a source
    Run {
        /// Source slug
        #[arg(long)]
        source: String,

        /// Directory of rendered page images
        #[arg(long)]
        pages: PathBuf,

        /// Override the minimum component area in pixels
        #[arg(long)]
        min_area: Option<u32>,

        /// Override the number of CPU workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Print the glyph rows of a source as JSON
    List {
        #[arg(long)]
        source: String,

        #[arg(long)]
        page: Option<u32>,

        /// Print candidate rows instead of glyphs
        #[arg(long)]
        candidates: bool,
    },

    /// Attach symbol metadata to a cleaned glyph
    Catalog {
        #[arg(long)]
        source: String,

        #[arg(long)]
        page: u32,

        /// Bounding box as x,y,w,h
        #[arg(long)]
        bbox: BBox,

        #[arg(long)]
        name: String,

        #[arg(long)]
        tradition: Option<String>,

        #[arg(long)]
        function: Option<String>,

        #[arg(long)]
        evokes_or_invokes: Option<String>,

        #[arg(long)]
        deity_or_spirit: Option<String>,

        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },

    /// Remove rows whose files are missing and files no row references
    Reconcile,
}

/// Load and validate configuration from the JSON file or the environment
fn load_configuration(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_json_file(path)?,
        None => AppConfig::from_env()?,
    };
    config.validate().map_err(|e| {
        anyhow::anyhow!("Configuration validation failed: {}. Please check your configuration values.", e)
    })?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_batch(
    config: AppConfig,
    pool: SqlitePool,
    source_slug: &str,
    pages_dir: &Path,
) -> Result<()> {
    let store = AssetStore::open(&config.storage.asset_root, config.recovery.clone())?;
    preflight::batch_checks(&store, pages_dir).run()?;

    let source = catalog::require_source(&pool, source_slug).await?;
    let pages = pipeline::discover_pages(pages_dir)?;
    if pages.is_empty() {
        warn!(pages_dir = %pages_dir.display(), "No page images found");
    }

    let catalog_sync = CatalogSync::new(pool, &config.database, config.recovery.clone());
    let pipeline = Pipeline::new(config, store, catalog_sync);

    let cancel = CancelFlag::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight items");
                cancel.cancel();
            }
        })
    };

    let result = pipeline.run(&source, pages, &cancel).await;
    ctrl_c.abort();

    print_json(&result?)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file first
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = load_configuration(cli.config.as_deref())?;

    if let Commands::Run {
        min_area, workers, ..
    } = &cli.command
    {
        if let Some(min_area) = min_area {
            config.detection.min_area = *min_area;
        }
        if let Some(workers) = workers {
            config.concurrency.workers = *workers;
        }
        config.validate()?;
    }

    let obs = observability::init_observability_with_config(config.observability.clone())?;
    info!("{}", config.summary());

    let pool = catalog::connect(&config.database).await?;
    catalog::init_database_schema(&pool)
        .await
        .context("Failed to initialize catalog schema")?;

    let outcome = match cli.command {
        Commands::Ingest { manifest } => {
            let sources = pipeline::ingest_manifest(&pool, &manifest).await?;
            print_json(&sources)
        }
        Commands::Run { source, pages, .. } => {
            run_batch(config, pool.clone(), &source, &pages).await
        }
        Commands::List {
            source,
            page,
            candidates,
        } => {
            let source = catalog::require_source(&pool, &source).await?;
            if candidates {
                print_json(&catalog::list_candidates(&pool, source.id, page).await?)
            } else {
                print_json(&catalog::list_glyphs(&pool, source.id, page).await?)
            }
        }
        Commands::Catalog {
            source,
            page,
            bbox,
            name,
            tradition,
            function,
            evokes_or_invokes,
            deity_or_spirit,
            tags,
        } => {
            let key = RegionKey::new(source, page, bbox);
            let input = SymbolInput {
                name,
                tradition,
                function,
                evokes_or_invokes,
                deity_or_spirit,
                tags,
            };
            let symbol = catalog::catalog_symbol(&pool, &key, &input).await?;
            print_json(&symbol)
        }
        Commands::Reconcile => {
            let store = AssetStore::open(&config.storage.asset_root, config.recovery.clone())?;
            let report = pipeline::reconcile(&pool, &store).await?;
            print_json(&report)
        }
    };

    if let Err(e) = obs.export_metrics() {
        warn!(error = %e, "Failed to export metrics");
    }
    pool.close().await;

    outcome
}
