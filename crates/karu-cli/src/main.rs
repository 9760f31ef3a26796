//! Karu CLI
//!
//! Batch utilities over the catalog: sweep for new files, generate missing
//! fingerprints, run the duplicate-pair scan, rebuild from raw metadata,
//! remove duplicate files, and report stats.
//!
//! Exit codes: 0 on success, 1 on failure (including per-file errors above
//! the configured tolerance). Tag sources are live only inside the host
//! application; sweeps here commit files with fingerprints and leave
//! enrichment to a later retry pass.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use karu_core::{
    maintenance, rebuild, similarity, CacheManager, Catalog, Config, HashEngine, IngestPipeline,
    MonitorService, PreviewFrameExtractor, ReviewService, SourceRegistry, ZeroEmbedder,
};

/// Karu - self-hosted image archive batch tools
#[derive(Parser)]
#[command(name = "karu")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Batch utilities for the Karu image archive")]
struct Cli {
    /// Catalog database path (defaults to KARU_DB_PATH or ./karu.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sweep the managed and ingest directories for uncataloged files
    Scan {
        /// Tolerated per-file failures before the run counts as failed
        #[arg(long, default_value = "0")]
        max_failures: usize,
    },

    /// Generate missing perceptual and color hashes
    Hashes {
        /// Tolerated per-file failures before the run counts as failed
        #[arg(long, default_value = "0")]
        max_failures: usize,
    },

    /// Run the O(n^2) duplicate-pair scan into the review cache
    ScanDuplicates {
        /// Maximum hamming distance to store
        #[arg(long)]
        threshold: Option<u32>,
        /// Also precompute per-pair suggestion records
        #[arg(long)]
        suggestions: bool,
    },

    /// Rebuild tags and sources from retained raw metadata
    Rebuild,

    /// Remove files whose MD5 already exists under another path
    Dedupe {
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove catalog rows whose file is gone; list unknown files
    CleanOrphans {
        /// Report without deleting
        #[arg(long)]
        dry_run: bool,
    },

    /// Print catalog statistics
    Stats,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let catalog = Arc::new(
        Catalog::open(&config.db_path)
            .with_context(|| format!("opening catalog at {}", config.db_path.display()))?,
    );

    let ok = match cli.command {
        Commands::Scan { max_failures } => run_scan(catalog, config, max_failures)?,
        Commands::Hashes { max_failures } => run_hashes(catalog, config, max_failures)?,
        Commands::ScanDuplicates {
            threshold,
            suggestions,
        } => run_scan_duplicates(catalog, config, threshold, suggestions)?,
        Commands::Rebuild => run_rebuild(catalog, config)?,
        Commands::Dedupe { dry_run } => run_dedupe(catalog, config, dry_run)?,
        Commands::CleanOrphans { dry_run } => run_clean_orphans(catalog, config, dry_run)?,
        Commands::Stats => run_stats(catalog, config)?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn hash_engine(config: &Config) -> Arc<HashEngine> {
    Arc::new(HashEngine::new(Arc::new(PreviewFrameExtractor {
        image_directory: config.image_directory.clone(),
        thumb_directory: config.thumb_directory.clone(),
    })))
}

/// Sweep for uncataloged files
fn run_scan(catalog: Arc<Catalog>, config: Config, max_failures: usize) -> anyhow::Result<bool> {
    let cache = Arc::new(CacheManager::new(
        config.images_per_page,
        config.homepage_buffer_size,
    ));
    let monitor = Arc::new(MonitorService::new());
    let pipeline = Arc::new(IngestPipeline::new(
        catalog,
        config.clone(),
        SourceRegistry::default(),
        hash_engine(&config),
        Arc::new(ZeroEmbedder::new(config.embedding_dim)),
        cache,
        monitor,
    ));

    let runtime = tokio::runtime::Runtime::new()?;
    let stats = runtime.block_on(async { pipeline.sweep().await })?;

    println!(
        "Processed {} files: {} committed, {} duplicates, {} failures",
        stats.processed, stats.committed, stats.duplicates, stats.failures
    );
    if stats.failures > max_failures {
        eprintln!(
            "error: {} failures exceeded tolerance of {}",
            stats.failures, max_failures
        );
        return Ok(false);
    }
    Ok(true)
}

/// Generate missing fingerprints
fn run_hashes(catalog: Arc<Catalog>, config: Config, max_failures: usize) -> anyhow::Result<bool> {
    let engine = hash_engine(&config);
    let images = catalog.all_images()?;
    let worklist: Vec<_> = images
        .into_iter()
        .filter(|img| img.phash.is_none() || img.colorhash.is_none())
        .collect();

    if worklist.is_empty() {
        println!("All images already have fingerprints");
        return Ok(true);
    }

    println!("Generating fingerprints for {} images", worklist.len());
    let mut generated = 0usize;
    let mut failures = 0usize;

    for (done, image) in worklist.iter().enumerate() {
        let full_path = config.image_directory.join(&image.filepath);
        match engine.compute(&full_path) {
            Ok(pair) => {
                catalog.set_hashes(image.id, Some(&pair.phash), Some(&pair.colorhash))?;
                generated += 1;
            }
            Err(e) => {
                eprintln!("  {} failed: {}", image.filepath, e);
                failures += 1;
            }
        }
        if (done + 1) % 100 == 0 {
            println!("  {}/{}", done + 1, worklist.len());
        }
    }

    println!("Done: {} generated, {} failures", generated, failures);
    Ok(failures <= max_failures)
}

/// Duplicate-pair scan
fn run_scan_duplicates(
    catalog: Arc<Catalog>,
    config: Config,
    threshold: Option<u32>,
    suggestions: bool,
) -> anyhow::Result<bool> {
    let threshold = threshold.unwrap_or(config.duplicate_scan_threshold);
    let stats = similarity::pairs::scan_duplicate_pairs(&catalog, threshold, None)?;
    println!(
        "Scanned {} images ({} comparisons) in {:.2}s: {} pairs within distance {}",
        stats.image_count, stats.comparisons, stats.elapsed_seconds, stats.pair_count, threshold
    );

    if suggestions {
        let review = ReviewService::new(catalog, config);
        let built = review.compute_suggestions(None)?;
        println!(
            "Suggestion records: {}/{} pairs in {:.2}s",
            built.pair_count, built.source_pairs, built.elapsed_seconds
        );
    }
    Ok(true)
}

/// Full rebuild from raw metadata
fn run_rebuild(catalog: Arc<Catalog>, config: Config) -> anyhow::Result<bool> {
    let engine = rebuild::RebuildEngine::new(catalog, config, Arc::new(MonitorService::new()));
    let stats = engine.full_rebuild(Some(&|done, total| {
        if done % 500 == 0 {
            println!("  {}/{}", done, total);
        }
    }))?;
    println!(
        "Rebuilt {} images ({} skipped), {} deltas replayed, {} rules restored",
        stats.images_processed, stats.images_skipped, stats.deltas_applied, stats.rules_restored
    );
    Ok(true)
}

/// MD5 duplicate sweep
fn run_dedupe(catalog: Arc<Catalog>, config: Config, dry_run: bool) -> anyhow::Result<bool> {
    let report = maintenance::scan_and_remove_duplicates(&catalog, &config, dry_run)?;
    for (duplicate, original, md5) in &report.duplicates {
        println!("  {} duplicates {} (md5 {})", duplicate, original, md5);
    }
    println!(
        "Scanned {} files: {} duplicates, {} removed{}",
        report.scanned,
        report.duplicates_found,
        report.removed,
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(true)
}

/// Orphan cleanup
fn run_clean_orphans(catalog: Arc<Catalog>, config: Config, dry_run: bool) -> anyhow::Result<bool> {
    let report = maintenance::clean_orphans(&catalog, &config, dry_run)?;
    for path in &report.rows_without_files {
        println!("  row without file: {}", path);
    }
    for path in &report.files_without_rows {
        println!("  file without row: {}", path);
    }
    println!(
        "{} rows without files ({} removed), {} files without rows{}",
        report.rows_without_files.len(),
        report.removed_rows,
        report.files_without_rows.len(),
        if dry_run { " (dry run)" } else { "" }
    );
    Ok(true)
}

/// Catalog statistics
fn run_stats(catalog: Arc<Catalog>, config: Config) -> anyhow::Result<bool> {
    println!("=== Karu Catalog Statistics ===");
    println!("Images: {}", catalog.image_count()?);
    println!("Avg tags/image: {:.1}", catalog.avg_tags_per_image()?);

    println!("\nBy source:");
    for (source, count) in catalog.source_breakdown()? {
        println!("  {:<14} {}", source, count);
    }

    println!("\nTags by category:");
    for (category, count) in catalog.category_counts()? {
        println!("  {:<14} {}", category, count);
    }

    let broken = maintenance::find_broken_images(&catalog, &config)?;
    if !broken.is_empty() {
        println!("\nBroken images: {}", broken.len());
        for b in broken.iter().take(10) {
            let issues: Vec<&str> = b.issues.iter().map(|i| i.as_str()).collect();
            println!("  {} [{}]", b.filepath, issues.join(", "));
        }
        if broken.len() > 10 {
            println!("  ... and {} more", broken.len() - 10);
        }
    }
    Ok(true)
}
