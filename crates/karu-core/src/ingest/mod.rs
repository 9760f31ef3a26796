//! Ingest pipeline
//!
//! Work arrives from the filesystem watcher and from sweeps; every artifact
//! flows through the same bounded worker pool. The per-artifact worker is
//! pure analysis (MD5, source fan-out, fallback ladder, hashes, embedding);
//! the commit step owns every mutation and runs as one catalog transaction.
//!
//! Fallback ladder: per-source MD5 lookups, then reverse image search, then
//! Pixiv-by-filename (always complemented by the local tagger), then the
//! local tagger alone unless online-only mode was requested.

pub mod watcher;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cache::CacheManager;
use crate::catalog::{Catalog, CatalogError, IngestCommit, RawMetadata};
use crate::config::Config;
use crate::hash::{file_md5, HashEngine};
use crate::monitor::{LogLevel, MonitorService};
use crate::semantic::SemanticEmbedder;
use crate::sources::{
    self, ActiveSelection, SourceHit, SourceId, SourceRegistry,
};
use crate::tags::TagRepository;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Ingest error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Hash error: {0}")]
    Hash(#[from] crate::hash::HashError),
    #[error("Not an ingestable artifact: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, IngestError>;

// ============================================================================
// TYPES
// ============================================================================

/// Where an artifact came from; staged files move into the managed tree and
/// staged duplicates are deleted, in-place duplicates are left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOrigin {
    /// Already under the managed image directory.
    InPlace,
    /// Dropped into the ingest staging directory.
    Staged,
}

/// Analysis options.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyzeOptions {
    /// Skip the local-tagger fallback (online-only mode).
    pub skip_local_fallback: bool,
}

/// What the analysis worker found, without having mutated anything.
#[derive(Debug)]
pub enum Analysis {
    /// The MD5 already exists in the catalog.
    Duplicate { md5: String, existing: String },
    /// A commit-ready description of the artifact.
    Ready(Box<ReadyArtifact>),
}

/// Commit-ready analysis output.
#[derive(Debug)]
pub struct ReadyArtifact {
    pub source_path: PathBuf,
    pub relative_path: String,
    pub commit: IngestCommit,
}

/// Outcome of one artifact through analyze + commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Committed { image_id: i64, filepath: String },
    DuplicateRemoved { md5: String },
    DuplicateLeft { md5: String, filepath: String },
    Failed { filepath: String, error: String },
}

/// Batch statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BatchStats {
    pub processed: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub failures: usize,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// The ingest pipeline.
pub struct IngestPipeline {
    catalog: Arc<Catalog>,
    config: Config,
    registry: SourceRegistry,
    hash_engine: Arc<HashEngine>,
    embedder: Arc<dyn SemanticEmbedder>,
    cache: Arc<CacheManager>,
    monitor: Arc<MonitorService>,
    workers: Arc<Semaphore>,
}

impl IngestPipeline {
    pub fn new(
        catalog: Arc<Catalog>,
        config: Config,
        registry: SourceRegistry,
        hash_engine: Arc<HashEngine>,
        embedder: Arc<dyn SemanticEmbedder>,
        cache: Arc<CacheManager>,
        monitor: Arc<MonitorService>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.effective_workers()));
        Self {
            catalog,
            config,
            registry,
            hash_engine,
            embedder,
            cache,
            monitor,
            workers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    // ========================================================================
    // ANALYSIS (worker side, no shared-state mutation)
    // ========================================================================

    /// Analyze one artifact: MD5, source fan-out with the fallback ladder,
    /// fingerprints, and embedding. Network failures per source are skipped;
    /// hash/embedding failures leave those fields unset.
    pub fn analyze(
        &self,
        path: &Path,
        origin: IngestOrigin,
        options: AnalyzeOptions,
    ) -> Result<Analysis> {
        if !Config::is_supported_artifact(path) {
            return Err(IngestError::Unsupported(path.display().to_string()));
        }

        let md5 = file_md5(path)?;
        if let Some(existing) = self.catalog.image_by_md5(&md5)? {
            return Ok(Analysis::Duplicate {
                md5,
                existing: existing.filepath,
            });
        }

        let file_size = std::fs::metadata(path)?.len() as i64;
        let relative_path = self.relative_destination(path, origin, &md5);

        let mut hits = self.fan_out_md5(&md5);
        let mut used_saucenao = false;
        let mut saucenao_response = None;
        let mut used_local_tagger = false;

        // Reverse image search when the MD5 lookups came up empty
        if hits.is_empty() {
            if let Some(reverse) = &self.registry.reverse_search {
                used_saucenao = true;
                match reverse.search(path) {
                    Ok(outcome) => {
                        saucenao_response = Some(outcome.raw.clone());
                        for m in outcome.matches {
                            if m.similarity < self.config.saucenao_min_similarity {
                                continue;
                            }
                            if let Some(source) = self.registry.tag_source(m.source) {
                                match source.fetch_by_post_id(&m.post_id) {
                                    Ok(Some(hit)) => {
                                        hits.insert(m.source.as_str().to_string(), hit);
                                    }
                                    Ok(None) => {}
                                    Err(e) => tracing::warn!(
                                        source = %m.source,
                                        "post-id resolve failed: {}",
                                        e
                                    ),
                                }
                            }
                        }
                    }
                    Err(e) => tracing::warn!("reverse search failed: {}", e),
                }
            }
        }

        // Pixiv id in the filename; a Pixiv hit always also runs the local
        // tagger since Pixiv has no structured booru-style tags
        if hits.is_empty() {
            if let Some(pixiv) = &self.registry.pixiv {
                let filename = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default();
                if let Some(pixiv_id) = sources::extract_pixiv_id(&filename) {
                    match pixiv.fetch_by_post_id(&pixiv_id) {
                        Ok(Some(hit)) => {
                            hits.insert(SourceId::Pixiv.as_str().to_string(), hit);
                            if let Some(tagger) = &self.registry.local_tagger {
                                used_local_tagger = true;
                                if let Ok(Some(local)) = tagger.tag_file(path) {
                                    hits.insert(SourceId::LocalTagger.as_str().to_string(), local);
                                }
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!("pixiv lookup failed: {}", e),
                    }
                }
            }
        }

        // Last resort: local tagger alone
        if hits.is_empty() && !options.skip_local_fallback {
            if let Some(tagger) = &self.registry.local_tagger {
                used_local_tagger = true;
                match tagger.tag_file(path) {
                    Ok(Some(hit)) => {
                        hits.insert(SourceId::LocalTagger.as_str().to_string(), hit);
                    }
                    Ok(None) => {}
                    Err(e) => tracing::warn!("local tagger failed: {}", e),
                }
            }
        }

        let selection = sources::select_active(
            &hits,
            &self.config.booru_priority,
            self.config.use_merged_sources_by_default,
        );

        let raw_metadata = RawMetadata {
            md5: md5.clone(),
            relative_path: relative_path.clone(),
            saucenao_lookup: used_saucenao,
            saucenao_response,
            local_tagger_lookup: used_local_tagger,
            sources: hits
                .iter()
                .map(|(name, hit)| (name.clone(), hit.raw.clone()))
                .collect(),
        };

        // Fingerprints and dimensions are non-fatal: a failed decode commits
        // with NULLs and surfaces in the broken-images report
        let frame = self.hash_engine.load_frame(path);
        let (width, height, hashes) = match frame {
            Ok(frame) => {
                use image::GenericImageView;
                let (w, h) = frame.dimensions();
                (w as i64, h as i64, Some(HashEngine::compute_from_frame(&frame)))
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "frame load failed: {}", e);
                (0, 0, None)
            }
        };

        let embedding = match self.embedder.embed_file(path) {
            Ok(v) if v.len() == self.config.embedding_dim => Some(v),
            Ok(v) => {
                tracing::warn!(
                    path = %path.display(),
                    got = v.len(),
                    expected = self.config.embedding_dim,
                    "embedder returned wrong dimension"
                );
                None
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "embedding failed: {}", e);
                None
            }
        };

        let commit = match selection {
            Some(ActiveSelection {
                active_source,
                tags,
                post_id,
                parent_id,
                has_children,
                rating,
                score,
            }) => IngestCommit {
                filepath: relative_path.clone(),
                md5,
                width,
                height,
                file_size,
                active_source: Some(active_source),
                tags,
                post_id,
                parent_id,
                has_children,
                score,
                rating,
                source_names: raw_metadata.sources.keys().cloned().collect(),
                raw_metadata,
                phash: hashes.as_ref().map(|h| h.phash.clone()),
                colorhash: hashes.as_ref().map(|h| h.colorhash.clone()),
                embedding,
            },
            None => IngestCommit {
                filepath: relative_path.clone(),
                md5,
                width,
                height,
                file_size,
                active_source: None,
                tags: Default::default(),
                post_id: None,
                parent_id: None,
                has_children: false,
                score: None,
                rating: None,
                source_names: vec![],
                raw_metadata,
                phash: hashes.as_ref().map(|h| h.phash.clone()),
                colorhash: hashes.as_ref().map(|h| h.colorhash.clone()),
                embedding,
            },
        };

        Ok(Analysis::Ready(Box::new(ReadyArtifact {
            source_path: path.to_path_buf(),
            relative_path,
            commit,
        })))
    }

    /// Query every configured tag source by MD5. Failures log and skip.
    fn fan_out_md5(&self, md5: &str) -> BTreeMap<String, SourceHit> {
        let mut hits = BTreeMap::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .registry
                .tag_sources
                .iter()
                .map(|source| {
                    let md5 = md5.to_string();
                    scope.spawn(move || (source.id(), source.fetch_by_md5(&md5)))
                })
                .collect();
            for handle in handles {
                if let Ok((id, result)) = handle.join() {
                    match result {
                        Ok(Some(hit)) => {
                            hits.insert(id.as_str().to_string(), hit);
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(source = %id, "source lookup failed: {}", e),
                    }
                }
            }
        });
        hits
    }

    /// Destination path relative to the managed directory: in-place files
    /// keep their path, staged files bucket under the first MD5 chars.
    fn relative_destination(&self, path: &Path, origin: IngestOrigin, md5: &str) -> String {
        match origin {
            IngestOrigin::InPlace => path
                .strip_prefix(&self.config.image_directory)
                .unwrap_or(path)
                .to_string_lossy()
                .replace('\\', "/"),
            IngestOrigin::Staged => {
                let filename = path
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_else(|| format!("{}.bin", md5));
                format!("{}/{}", &md5[..2.min(md5.len())], filename)
            }
        }
    }

    // ========================================================================
    // COMMIT (caller side, owns all mutation)
    // ========================================================================

    /// Commit an analysis. Staged files move into the managed tree first;
    /// on an integrity failure the transaction rolls back and a staged file
    /// is parked in the reject directory.
    pub fn commit(&self, analysis: Analysis, origin: IngestOrigin) -> Result<IngestOutcome> {
        let ready = match analysis {
            Analysis::Duplicate { md5, existing } => {
                return Ok(self.handle_duplicate(&md5, &existing, None, origin));
            }
            Analysis::Ready(ready) => ready,
        };

        if origin == IngestOrigin::Staged {
            let destination = self.config.image_directory.join(&ready.relative_path);
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent)?;
            }
            move_file(&ready.source_path, &destination)?;
        }

        match self.catalog.commit_ingest(&ready.commit) {
            Ok(image_id) => {
                self.cache.mark_activity();
                self.monitor.add_log(
                    format!("Ingested {}", ready.relative_path),
                    LogLevel::Success,
                );
                Ok(IngestOutcome::Committed {
                    image_id,
                    filepath: ready.relative_path,
                })
            }
            Err(CatalogError::Duplicate(md5)) => {
                // A racing worker got there first
                let existing = self
                    .catalog
                    .image_by_md5(&md5)?
                    .map(|i| i.filepath)
                    .unwrap_or_default();
                let committed_path = self.config.image_directory.join(&ready.relative_path);
                Ok(self.handle_duplicate(&md5, &existing, Some(&committed_path), origin))
            }
            Err(e) => {
                if origin == IngestOrigin::Staged {
                    let parked = self.park_in_reject(&ready.relative_path)?;
                    self.monitor.add_log(
                        format!(
                            "Commit failed for {}, moved to {}: {}",
                            ready.relative_path,
                            parked.display(),
                            e
                        ),
                        LogLevel::Error,
                    );
                }
                Ok(IngestOutcome::Failed {
                    filepath: ready.relative_path,
                    error: e.to_string(),
                })
            }
        }
    }

    fn handle_duplicate(
        &self,
        md5: &str,
        existing: &str,
        staged_copy: Option<&Path>,
        origin: IngestOrigin,
    ) -> IngestOutcome {
        match origin {
            IngestOrigin::Staged => {
                if let Some(copy) = staged_copy {
                    let _ = std::fs::remove_file(copy);
                }
                self.monitor.add_log(
                    format!("Duplicate (md5 {}) discarded; original is {}", md5, existing),
                    LogLevel::Warning,
                );
                IngestOutcome::DuplicateRemoved {
                    md5: md5.to_string(),
                }
            }
            IngestOrigin::InPlace => {
                self.monitor.add_log(
                    format!("Duplicate in place (md5 {}), matches {}", md5, existing),
                    LogLevel::Warning,
                );
                IngestOutcome::DuplicateLeft {
                    md5: md5.to_string(),
                    filepath: existing.to_string(),
                }
            }
        }
    }

    fn park_in_reject(&self, relative_path: &str) -> Result<PathBuf> {
        let committed = self.config.image_directory.join(relative_path);
        let target = self.config.reject_directory.join(
            Path::new(relative_path)
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("rejected.bin")),
        );
        std::fs::create_dir_all(&self.config.reject_directory)?;
        if committed.exists() {
            move_file(&committed, &target)?;
        }
        Ok(target)
    }

    /// Analyze + commit one artifact. Staged duplicates delete the source
    /// file directly (it never moved).
    pub fn ingest_one(
        &self,
        path: &Path,
        origin: IngestOrigin,
        options: AnalyzeOptions,
    ) -> IngestOutcome {
        match self.analyze(path, origin, options) {
            Ok(Analysis::Duplicate { md5, existing }) => {
                if origin == IngestOrigin::Staged {
                    let _ = std::fs::remove_file(path);
                }
                self.handle_duplicate(&md5, &existing, None, origin)
            }
            Ok(ready) => match self.commit(ready, origin) {
                Ok(outcome) => outcome,
                Err(e) => IngestOutcome::Failed {
                    filepath: path.display().to_string(),
                    error: e.to_string(),
                },
            },
            Err(e) => IngestOutcome::Failed {
                filepath: path.display().to_string(),
                error: e.to_string(),
            },
        }
    }

    // ========================================================================
    // WORKER POOL
    // ========================================================================

    /// Run a batch through the bounded worker pool. Per-file panics and
    /// errors are contained; the pool keeps draining.
    pub async fn process_files(
        self: &Arc<Self>,
        files: Vec<(PathBuf, IngestOrigin)>,
        options: AnalyzeOptions,
    ) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut joins = Vec::with_capacity(files.len());

        for (path, origin) in files {
            let permit = match Arc::clone(&self.workers).acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let pipeline = Arc::clone(self);
            joins.push(tokio::task::spawn_blocking(move || {
                let outcome = pipeline.ingest_one(&path, origin, options);
                drop(permit);
                outcome
            }));
        }

        for join in joins {
            stats.processed += 1;
            match join.await {
                Ok(IngestOutcome::Committed { .. }) => stats.committed += 1,
                Ok(IngestOutcome::DuplicateRemoved { .. })
                | Ok(IngestOutcome::DuplicateLeft { .. }) => stats.duplicates += 1,
                Ok(IngestOutcome::Failed { filepath, error }) => {
                    stats.failures += 1;
                    self.monitor.add_log(
                        format!("Ingest failed for {}: {}", filepath, error),
                        LogLevel::Error,
                    );
                }
                Err(e) => {
                    stats.failures += 1;
                    self.monitor
                        .add_log(format!("Ingest worker panicked: {}", e), LogLevel::Error);
                }
            }
        }
        stats
    }

    /// Enumerate artifacts present on disk but absent from the catalog: the
    /// managed tree plus everything in the staging directory.
    pub fn find_unprocessed(&self) -> Result<Vec<(PathBuf, IngestOrigin)>> {
        let known: std::collections::HashSet<String> =
            self.catalog.all_filepaths()?.into_iter().collect();

        let mut work = Vec::new();
        for file in crate::maintenance::walk_artifacts(&self.config.image_directory) {
            if let Ok(rel) = file.strip_prefix(&self.config.image_directory) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !known.contains(&rel) {
                    work.push((file, IngestOrigin::InPlace));
                }
            }
        }
        for file in crate::maintenance::walk_artifacts(&self.config.ingest_directory) {
            work.push((file, IngestOrigin::Staged));
        }
        Ok(work)
    }

    /// Full sweep: enumerate, process, then reload the caches directly (bulk
    /// work skips the per-commit debounce).
    pub async fn sweep(self: &Arc<Self>) -> Result<BatchStats> {
        let work = self.find_unprocessed()?;
        if work.is_empty() {
            self.monitor.add_log("No new images found", LogLevel::Info);
            self.monitor.record_scan(0);
            return Ok(BatchStats::default());
        }

        self.monitor.add_log(
            format!("Found {} new artifacts, analyzing", work.len()),
            LogLevel::Info,
        );
        let stats = self.process_files(work, AnalyzeOptions::default()).await;

        if stats.committed > 0 {
            self.cache.reload_all(&self.catalog)?;
        }
        self.monitor.record_scan(stats.committed);
        Ok(stats)
    }

    // ========================================================================
    // RETRY TAGGING
    // ========================================================================

    /// Re-run the source ladder for an already-cataloged image and replace
    /// its tags from the fresh result. Raw metadata and source links are
    /// updated; manual deltas are untouched.
    pub fn retry_tagging(&self, filepath: &str, options: AnalyzeOptions) -> Result<bool> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;
        let full_path = self.config.image_directory.join(filepath);
        if !full_path.exists() {
            return Err(IngestError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                full_path.display().to_string(),
            )));
        }

        let mut hits = self.fan_out_md5(&image.md5);
        let mut used_saucenao = false;
        let mut saucenao_response = None;
        let mut used_local_tagger = false;

        if hits.is_empty() {
            if let Some(reverse) = &self.registry.reverse_search {
                used_saucenao = true;
                if let Ok(outcome) = reverse.search(&full_path) {
                    saucenao_response = Some(outcome.raw.clone());
                    for m in outcome.matches {
                        if m.similarity < self.config.saucenao_min_similarity {
                            continue;
                        }
                        if let Some(source) = self.registry.tag_source(m.source) {
                            if let Ok(Some(hit)) = source.fetch_by_post_id(&m.post_id) {
                                hits.insert(m.source.as_str().to_string(), hit);
                                break;
                            }
                        }
                    }
                }
            }
        }

        if hits.is_empty() {
            if let Some(pixiv) = &self.registry.pixiv {
                let filename = Path::new(filepath)
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default();
                if let Some(pixiv_id) = sources::extract_pixiv_id(&filename) {
                    if let Ok(Some(hit)) = pixiv.fetch_by_post_id(&pixiv_id) {
                        hits.insert(SourceId::Pixiv.as_str().to_string(), hit);
                        if let Some(tagger) = &self.registry.local_tagger {
                            used_local_tagger = true;
                            if let Ok(Some(local)) = tagger.tag_file(&full_path) {
                                hits.insert(SourceId::LocalTagger.as_str().to_string(), local);
                            }
                        }
                    }
                }
            }
        }

        if hits.is_empty() && !options.skip_local_fallback {
            if let Some(tagger) = &self.registry.local_tagger {
                used_local_tagger = true;
                if let Ok(Some(hit)) = tagger.tag_file(&full_path) {
                    hits.insert(SourceId::LocalTagger.as_str().to_string(), hit);
                }
            }
        }

        let selection = match sources::select_active(
            &hits,
            &self.config.booru_priority,
            self.config.use_merged_sources_by_default,
        ) {
            Some(s) => s,
            None => {
                self.monitor.add_log(
                    format!("Retry tagging found nothing for {}", filepath),
                    LogLevel::Warning,
                );
                return Ok(false);
            }
        };

        let raw_metadata = RawMetadata {
            md5: image.md5.clone(),
            relative_path: filepath.to_string(),
            saucenao_lookup: used_saucenao,
            saucenao_response,
            local_tagger_lookup: used_local_tagger,
            sources: hits
                .iter()
                .map(|(name, hit)| (name.clone(), hit.raw.clone()))
                .collect(),
        };

        {
            let mut writer = self.catalog.writer()?;
            let tx = writer.transaction().map_err(CatalogError::from)?;
            TagRepository::apply_selection_tx(&tx, image.id, &selection)?;
            tx.execute(
                "INSERT OR REPLACE INTO raw_metadata (image_id, data) VALUES (?1, ?2)",
                rusqlite::params![
                    image.id,
                    serde_json::to_string(&raw_metadata).map_err(CatalogError::from)?
                ],
            )
            .map_err(CatalogError::from)?;
            tx.execute(
                "DELETE FROM image_sources WHERE image_id = ?1",
                [image.id],
            )
            .map_err(CatalogError::from)?;
            for name in raw_metadata.sources.keys() {
                let source_id =
                    Catalog::upsert_source_tx(&tx, name)?;
                tx.execute(
                    "INSERT OR IGNORE INTO image_sources (image_id, source_id) VALUES (?1, ?2)",
                    rusqlite::params![image.id, source_id],
                )
                .map_err(CatalogError::from)?;
            }
            tx.commit().map_err(CatalogError::from)?;
        }

        self.cache.invalidate_image(&self.catalog, filepath)?;
        self.monitor.add_log(
            format!("Retagged {} from {}", filepath, selection.active_source),
            LogLevel::Success,
        );
        Ok(true)
    }
}

/// Bulk retry statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BulkRetryStats {
    pub processed: usize,
    pub retagged: usize,
    pub unchanged: usize,
    pub failures: usize,
}

impl IngestPipeline {
    /// Re-run the tagging ladder for every image whose active source is the
    /// local tagger (or that has no source at all). Long-running; callers
    /// put it behind a task and pass its progress callback here.
    pub fn bulk_retry_tagging(
        &self,
        options: AnalyzeOptions,
        progress: Option<&dyn Fn(usize, usize)>,
        keep_going: Option<&dyn Fn() -> bool>,
    ) -> Result<BulkRetryStats> {
        let worklist: Vec<String> = self
            .catalog
            .all_images()?
            .into_iter()
            .filter(|img| {
                matches!(
                    img.active_source.as_deref(),
                    None | Some("local_tagger")
                )
            })
            .map(|img| img.filepath)
            .collect();

        let total = worklist.len();
        let mut stats = BulkRetryStats::default();

        for (done, filepath) in worklist.into_iter().enumerate() {
            if let Some(check) = keep_going {
                if !check() {
                    break;
                }
            }
            stats.processed += 1;
            match self.retry_tagging(&filepath, options) {
                Ok(true) => stats.retagged += 1,
                Ok(false) => stats.unchanged += 1,
                Err(e) => {
                    stats.failures += 1;
                    self.monitor.add_log(
                        format!("Bulk retry failed for {}: {}", filepath, e),
                        LogLevel::Error,
                    );
                }
            }
            if let Some(cb) = progress {
                if done % 10 == 0 || done + 1 == total {
                    cb(done + 1, total);
                }
            }
        }

        self.monitor.add_log(
            format!(
                "Bulk retry complete: {} retagged, {} unchanged, {} failures",
                stats.retagged, stats.unchanged, stats.failures
            ),
            LogLevel::Success,
        );
        Ok(stats)
    }
}

/// Rename, falling back to copy+remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::hash::PreviewFrameExtractor;
    use crate::semantic::ZeroEmbedder;
    use crate::sources::tests::danbooru_raw;
    use crate::sources::{ReverseImageSearch, ReverseMatch, ReverseSearchOutcome, TagSource};
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;

    /// Scripted tag source for tests.
    pub(crate) struct FakeSource {
        pub id: SourceId,
        pub by_md5: Mutex<std::collections::HashMap<String, serde_json::Value>>,
        pub by_post: Mutex<std::collections::HashMap<String, serde_json::Value>>,
    }

    impl FakeSource {
        pub fn new(id: SourceId) -> Self {
            Self {
                id,
                by_md5: Mutex::new(Default::default()),
                by_post: Mutex::new(Default::default()),
            }
        }
    }

    impl TagSource for FakeSource {
        fn id(&self) -> SourceId {
            self.id
        }
        fn fetch_by_md5(&self, md5: &str) -> sources::Result<Option<SourceHit>> {
            Ok(self
                .by_md5
                .lock()
                .unwrap()
                .get(md5)
                .and_then(|raw| sources::hit_from_raw(self.id, raw)))
        }
        fn fetch_by_post_id(&self, post_id: &str) -> sources::Result<Option<SourceHit>> {
            Ok(self
                .by_post
                .lock()
                .unwrap()
                .get(post_id)
                .and_then(|raw| sources::hit_from_raw(self.id, raw)))
        }
    }

    struct FakeReverse {
        matches: Vec<ReverseMatch>,
    }

    impl ReverseImageSearch for FakeReverse {
        fn search(&self, _path: &Path) -> sources::Result<ReverseSearchOutcome> {
            Ok(ReverseSearchOutcome {
                matches: self.matches.clone(),
                raw: serde_json::json!({"results": []}),
            })
        }
    }

    pub(crate) struct FakeTagger;

    impl crate::sources::LocalTagger for FakeTagger {
        fn tag_file(&self, _path: &Path) -> sources::Result<Option<SourceHit>> {
            let raw = serde_json::json!({
                "rating": "g",
                "tags": {"general": ["ai_tagged"], "character": [], "copyright": [],
                          "artist": [], "species": [], "meta": []}
            });
            Ok(sources::hit_from_raw(SourceId::LocalTagger, &raw))
        }
    }

    pub(crate) struct PipelineFixture {
        pub pipeline: Arc<IngestPipeline>,
        pub catalog: Arc<Catalog>,
        pub config: Config,
        pub danbooru: Arc<FakeSource>,
        pub _tmp: tempfile::TempDir,
    }

    pub(crate) fn fixture(with_tagger: bool) -> PipelineFixture {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.image_directory = tmp.path().join("images");
        config.ingest_directory = tmp.path().join("ingest");
        config.thumb_directory = tmp.path().join("thumbs");
        config.reject_directory = tmp.path().join("rejects");
        config.embedding_dim = 8;
        config.max_workers = 2;
        std::fs::create_dir_all(&config.image_directory).unwrap();
        std::fs::create_dir_all(&config.ingest_directory).unwrap();

        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let danbooru = Arc::new(FakeSource::new(SourceId::Danbooru));

        let mut registry = SourceRegistry::default();
        registry.tag_sources.push(danbooru.clone() as Arc<dyn TagSource>);
        if with_tagger {
            registry.local_tagger = Some(Arc::new(FakeTagger));
        }

        let hash_engine = Arc::new(HashEngine::new(Arc::new(PreviewFrameExtractor {
            image_directory: config.image_directory.clone(),
            thumb_directory: config.thumb_directory.clone(),
        })));
        let pipeline = Arc::new(IngestPipeline::new(
            catalog.clone(),
            config.clone(),
            registry,
            hash_engine,
            Arc::new(ZeroEmbedder::new(8)),
            Arc::new(CacheManager::new(50, 3)),
            Arc::new(MonitorService::new()),
        ));

        PipelineFixture {
            pipeline,
            catalog,
            config,
            danbooru,
            _tmp: tmp,
        }
    }

    pub(crate) fn write_png(path: &Path, seed: u8) -> String {
        let img = RgbaImage::from_fn(32, 32, |x, y| {
            Rgba([seed.wrapping_add(x as u8), y as u8, 128, 255])
        });
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        img.save(path).unwrap();
        file_md5(path).unwrap()
    }

    #[test]
    fn staged_ingest_commits_and_moves_file() {
        let fx = fixture(false);
        let staged = fx.config.ingest_directory.join("drop.png");
        let md5 = write_png(&staged, 1);
        fx.danbooru
            .by_md5
            .lock()
            .unwrap()
            .insert(md5.clone(), danbooru_raw());

        let outcome = fx
            .pipeline
            .ingest_one(&staged, IngestOrigin::Staged, AnalyzeOptions::default());
        let filepath = match outcome {
            IngestOutcome::Committed { filepath, .. } => filepath,
            other => panic!("unexpected outcome: {:?}", other),
        };

        // File moved out of ingest into an MD5-bucketed path
        assert!(!staged.exists());
        assert!(filepath.starts_with(&md5[..2]));
        assert!(fx.config.image_directory.join(&filepath).exists());

        let img = fx.catalog.image_by_filepath(&filepath).unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("danbooru"));
        assert_eq!(img.tags_character, "aoi_(sample)");
        assert!(img.tags_general.contains("blue_hair"));
        assert_eq!(img.rating.as_deref(), Some("general"));
        assert!(img.phash.is_some());
        assert!(img.colorhash.is_some());
        assert_eq!(img.width, 32);
        // The rating tag carries original trust for danbooru
        let tags = fx.catalog.tags_for_image(img.id).unwrap();
        let rating = tags.iter().find(|(n, _, _)| n == "rating:general").unwrap();
        assert_eq!(rating.2, crate::catalog::TagOrigin::Original);
    }

    #[test]
    fn staged_duplicate_is_removed_and_original_kept() {
        let fx = fixture(false);
        let first = fx.config.ingest_directory.join("one.png");
        let md5 = write_png(&first, 3);
        fx.danbooru
            .by_md5
            .lock()
            .unwrap()
            .insert(md5.clone(), danbooru_raw());
        let outcome = fx
            .pipeline
            .ingest_one(&first, IngestOrigin::Staged, AnalyzeOptions::default());
        assert!(matches!(outcome, IngestOutcome::Committed { .. }));
        let count_before = fx.catalog.image_count().unwrap();

        // Same bytes, different name
        let second = fx.config.ingest_directory.join("two.png");
        write_png(&second, 3);
        let outcome = fx
            .pipeline
            .ingest_one(&second, IngestOrigin::Staged, AnalyzeOptions::default());
        assert!(matches!(outcome, IngestOutcome::DuplicateRemoved { .. }));
        assert!(!second.exists());
        assert_eq!(fx.catalog.image_count().unwrap(), count_before);
    }

    #[test]
    fn local_tagger_fallback_sets_ai_rating_origin() {
        let fx = fixture(true);
        let staged = fx.config.ingest_directory.join("unknown.png");
        write_png(&staged, 9);

        let outcome = fx
            .pipeline
            .ingest_one(&staged, IngestOrigin::Staged, AnalyzeOptions::default());
        let filepath = match outcome {
            IngestOutcome::Committed { filepath, .. } => filepath,
            other => panic!("unexpected outcome: {:?}", other),
        };

        let img = fx.catalog.image_by_filepath(&filepath).unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("local_tagger"));
        assert!(img.tags_general.contains("ai_tagged"));
        let tags = fx.catalog.tags_for_image(img.id).unwrap();
        let rating = tags.iter().find(|(n, _, _)| n == "rating:general").unwrap();
        assert_eq!(rating.2, crate::catalog::TagOrigin::AiInference);
    }

    #[test]
    fn online_only_mode_skips_local_fallback() {
        let fx = fixture(true);
        let staged = fx.config.ingest_directory.join("unknown.png");
        write_png(&staged, 11);

        let outcome = fx.pipeline.ingest_one(
            &staged,
            IngestOrigin::Staged,
            AnalyzeOptions {
                skip_local_fallback: true,
            },
        );
        let filepath = match outcome {
            IngestOutcome::Committed { filepath, .. } => filepath,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let img = fx.catalog.image_by_filepath(&filepath).unwrap().unwrap();
        assert!(img.active_source.is_none());
        assert_eq!(img.tags_general, "");
    }

    #[test]
    fn saucenao_resolves_post_ids() {
        let mut fx = fixture(false);
        // Rebuild the pipeline with a scripted reverse search
        let mut registry = SourceRegistry::default();
        registry.tag_sources.push(fx.danbooru.clone() as Arc<dyn TagSource>);
        registry.reverse_search = Some(Arc::new(FakeReverse {
            matches: vec![
                ReverseMatch {
                    source: SourceId::Danbooru,
                    post_id: "123456".into(),
                    similarity: 92.0,
                },
                ReverseMatch {
                    source: SourceId::Danbooru,
                    post_id: "999".into(),
                    similarity: 30.0, // below threshold, never fetched
                },
            ],
        }));
        let hash_engine = Arc::new(HashEngine::new(Arc::new(PreviewFrameExtractor {
            image_directory: fx.config.image_directory.clone(),
            thumb_directory: fx.config.thumb_directory.clone(),
        })));
        fx.pipeline = Arc::new(IngestPipeline::new(
            fx.catalog.clone(),
            fx.config.clone(),
            registry,
            hash_engine,
            Arc::new(ZeroEmbedder::new(8)),
            Arc::new(CacheManager::new(50, 3)),
            Arc::new(MonitorService::new()),
        ));
        fx.danbooru
            .by_post
            .lock()
            .unwrap()
            .insert("123456".into(), danbooru_raw());

        let staged = fx.config.ingest_directory.join("reverse.png");
        write_png(&staged, 17);
        let outcome = fx
            .pipeline
            .ingest_one(&staged, IngestOrigin::Staged, AnalyzeOptions::default());
        let filepath = match outcome {
            IngestOutcome::Committed { filepath, .. } => filepath,
            other => panic!("unexpected outcome: {:?}", other),
        };
        let img = fx.catalog.image_by_filepath(&filepath).unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("danbooru"));
        assert_eq!(img.post_id, Some(123456));
        // Raw metadata records the reverse lookup
        let raw = fx.catalog.raw_metadata(img.id).unwrap().unwrap();
        assert!(raw.saucenao_lookup);
        assert!(raw.sources.contains_key("danbooru"));
    }

    #[tokio::test]
    async fn sweep_processes_in_place_and_staged_files() {
        let fx = fixture(true);
        write_png(&fx.config.image_directory.join("existing/a.png"), 21);
        write_png(&fx.config.ingest_directory.join("b.png"), 22);

        let stats = fx.pipeline.sweep().await.unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.committed, 2);
        assert_eq!(fx.catalog.image_count().unwrap(), 2);
        // In-place file kept its path
        assert!(fx
            .catalog
            .image_by_filepath("existing/a.png")
            .unwrap()
            .is_some());
    }

    #[test]
    fn bulk_retry_targets_ai_and_untagged_images_only() {
        let fx = fixture(true);
        // One booru-tagged image, one tagger-tagged image
        let booru_file = fx.config.ingest_directory.join("known.png");
        let md5 = write_png(&booru_file, 61);
        fx.danbooru
            .by_md5
            .lock()
            .unwrap()
            .insert(md5, danbooru_raw());
        fx.pipeline
            .ingest_one(&booru_file, IngestOrigin::Staged, AnalyzeOptions::default());

        let ai_file = fx.config.ingest_directory.join("unknown.png");
        write_png(&ai_file, 62);
        fx.pipeline
            .ingest_one(&ai_file, IngestOrigin::Staged, AnalyzeOptions::default());

        let stats = fx
            .pipeline
            .bulk_retry_tagging(AnalyzeOptions::default(), None, None)
            .unwrap();
        // Only the tagger-tagged image is a retry candidate
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failures, 0);

        // Cooperative cancellation stops before any work
        let stats = fx
            .pipeline
            .bulk_retry_tagging(AnalyzeOptions::default(), None, Some(&|| false))
            .unwrap();
        assert_eq!(stats.processed, 0);
    }

    #[test]
    fn retry_tagging_switches_from_ai_to_booru() {
        let fx = fixture(true);
        let staged = fx.config.ingest_directory.join("later.png");
        let md5 = write_png(&staged, 31);

        let outcome = fx
            .pipeline
            .ingest_one(&staged, IngestOrigin::Staged, AnalyzeOptions::default());
        let filepath = match outcome {
            IngestOutcome::Committed { filepath, .. } => filepath,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert_eq!(
            fx.catalog
                .image_by_filepath(&filepath)
                .unwrap()
                .unwrap()
                .active_source
                .as_deref(),
            Some("local_tagger")
        );

        // The booru has since indexed the file
        fx.danbooru
            .by_md5
            .lock()
            .unwrap()
            .insert(md5, danbooru_raw());
        let changed = fx
            .pipeline
            .retry_tagging(&filepath, AnalyzeOptions::default())
            .unwrap();
        assert!(changed);
        let img = fx.catalog.image_by_filepath(&filepath).unwrap().unwrap();
        assert_eq!(img.active_source.as_deref(), Some("danbooru"));
        assert_eq!(img.tags_character, "aoi_(sample)");
    }
}
