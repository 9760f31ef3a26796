//! Maintenance operations
//!
//! The cleanup toolbox behind the admin surface: full image deletion (file,
//! thumbnail, rows, caches), the broken-images report, orphan cleanup, the
//! MD5 duplicate sweep, and tag recounting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::cache::CacheManager;
use crate::catalog::{Catalog, CatalogError, ImageRecord};
use crate::config::Config;
use crate::hash::file_md5;
use crate::semantic::embedding_from_bytes;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Maintenance error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum MaintenanceError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MaintenanceError>;

// ============================================================================
// FULL DELETE
// ============================================================================

/// Thumbnail mirror path for a managed file.
pub fn thumbnail_path(config: &Config, filepath: &str) -> PathBuf {
    config.thumb_directory.join(filepath).with_extension("webp")
}

/// Delete an image everywhere: catalog rows (plus its duplicate-pair and
/// similars cache entries), the managed file, and the thumbnail. Missing
/// files are tolerated; the database footprint is what matters.
pub fn delete_image_completely(
    catalog: &Catalog,
    config: &Config,
    image_id: i64,
) -> Result<Option<ImageRecord>> {
    let record = match catalog.delete_image(image_id)? {
        Some(r) => r,
        None => return Ok(None),
    };

    let file = config.image_directory.join(&record.filepath);
    remove_if_present(&file)?;
    remove_if_present(&thumbnail_path(config, &record.filepath))?;

    tracing::info!(filepath = %record.filepath, "image deleted");
    Ok(Some(record))
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

// ============================================================================
// BROKEN IMAGES
// ============================================================================

/// Issues the broken-images report can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokenIssue {
    MissingFile,
    MissingPhash,
    MissingColorhash,
    MissingEmbedding,
    InvalidEmbeddingDim,
    MalformedRawMetadata,
}

impl BrokenIssue {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokenIssue::MissingFile => "missing_file",
            BrokenIssue::MissingPhash => "missing_phash",
            BrokenIssue::MissingColorhash => "missing_colorhash",
            BrokenIssue::MissingEmbedding => "missing_embedding",
            BrokenIssue::InvalidEmbeddingDim => "invalid_embedding_dim",
            BrokenIssue::MalformedRawMetadata => "malformed_raw_metadata",
        }
    }
}

/// One broken row.
#[derive(Debug, Clone, Serialize)]
pub struct BrokenImage {
    pub image_id: i64,
    pub filepath: String,
    pub issues: Vec<BrokenIssue>,
}

/// Scan the catalog for rows with missing files, missing fingerprints, or
/// data-shape problems (embedding dimension, unreadable raw blob). Rows in
/// the report are eligible for retry or permanent deletion.
pub fn find_broken_images(catalog: &Catalog, config: &Config) -> Result<Vec<BrokenImage>> {
    use std::collections::HashMap;

    let mut embedding_dims: HashMap<i64, Option<usize>> = HashMap::new();
    for (id, blob, _) in catalog.all_embeddings()? {
        embedding_dims.insert(id, embedding_from_bytes(&blob).map(|v| v.len()));
    }

    let raw_blobs: HashMap<i64, String> = catalog.all_raw_metadata()?.into_iter().collect();

    let mut broken = Vec::new();
    for image in catalog.all_images()? {
        let mut issues = Vec::new();

        if !config.image_directory.join(&image.filepath).exists() {
            issues.push(BrokenIssue::MissingFile);
        }
        if image.phash.is_none() {
            issues.push(BrokenIssue::MissingPhash);
        }
        if image.colorhash.is_none() {
            issues.push(BrokenIssue::MissingColorhash);
        }
        match embedding_dims.get(&image.id) {
            None => issues.push(BrokenIssue::MissingEmbedding),
            Some(Some(dim)) if *dim != config.embedding_dim => {
                issues.push(BrokenIssue::InvalidEmbeddingDim)
            }
            Some(None) => issues.push(BrokenIssue::InvalidEmbeddingDim),
            Some(Some(_)) => {}
        }
        if let Some(blob) = raw_blobs.get(&image.id) {
            if serde_json::from_str::<crate::catalog::RawMetadata>(blob).is_err() {
                issues.push(BrokenIssue::MalformedRawMetadata);
            }
        }

        if !issues.is_empty() {
            broken.push(BrokenImage {
                image_id: image.id,
                filepath: image.filepath,
                issues,
            });
        }
    }
    Ok(broken)
}

/// Drop an embedding row whose stored vector is unusable, so the next hash
/// generation pass regenerates it.
pub fn clear_invalid_embedding(catalog: &Catalog, image_id: i64) -> Result<bool> {
    Ok(catalog.delete_embedding(image_id)?)
}

// ============================================================================
// ORPHANS
// ============================================================================

/// Orphan-cleanup report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    /// Catalog rows whose file is gone (removed unless dry run).
    pub rows_without_files: Vec<String>,
    /// Files on disk with no catalog row.
    pub files_without_rows: Vec<String>,
    pub removed_rows: usize,
}

/// Find (and unless `dry_run`, remove) catalog rows whose file has vanished,
/// and list on-disk files the catalog does not know.
pub fn clean_orphans(catalog: &Catalog, config: &Config, dry_run: bool) -> Result<OrphanReport> {
    let mut report = OrphanReport::default();

    for image in catalog.all_images()? {
        if !config.image_directory.join(&image.filepath).exists() {
            report.rows_without_files.push(image.filepath.clone());
            if !dry_run {
                catalog.delete_image(image.id)?;
                report.removed_rows += 1;
            }
        }
    }

    let known: std::collections::HashSet<String> =
        catalog.all_filepaths()?.into_iter().collect();
    for file in walk_artifacts(&config.image_directory) {
        if let Ok(rel) = file.strip_prefix(&config.image_directory) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !known.contains(&rel) {
                report.files_without_rows.push(rel);
            }
        }
    }

    Ok(report)
}

// ============================================================================
// DUPLICATE SWEEP
// ============================================================================

/// MD5 sweep report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupeReport {
    pub scanned: usize,
    pub duplicates_found: usize,
    pub removed: usize,
    /// (duplicate path, original path, md5)
    pub duplicates: Vec<(String, String, String)>,
}

/// Walk the managed directory and find files whose MD5 already belongs to a
/// different cataloged path. Unless `dry_run`, the redundant copies (and
/// their thumbnails) are removed; the cataloged original is retained.
pub fn scan_and_remove_duplicates(
    catalog: &Catalog,
    config: &Config,
    dry_run: bool,
) -> Result<DedupeReport> {
    let mut report = DedupeReport::default();

    for file in walk_artifacts(&config.image_directory) {
        let rel = match file.strip_prefix(&config.image_directory) {
            Ok(r) => r.to_string_lossy().replace('\\', "/"),
            Err(_) => continue,
        };
        report.scanned += 1;

        let md5 = match file_md5(&file) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(path = %rel, "md5 failed during sweep: {}", e);
                continue;
            }
        };

        if let Some(existing) = catalog.image_by_md5(&md5)? {
            if existing.filepath != rel {
                report.duplicates_found += 1;
                report
                    .duplicates
                    .push((rel.clone(), existing.filepath.clone(), md5));
                if !dry_run {
                    remove_if_present(&file)?;
                    remove_if_present(&thumbnail_path(config, &rel))?;
                    report.removed += 1;
                    tracing::info!(duplicate = %rel, original = %existing.filepath, "removed duplicate file");
                }
            }
        }
    }

    Ok(report)
}

/// Recursively list supported artifacts under a directory.
pub fn walk_artifacts(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if Config::is_supported_artifact(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

// ============================================================================
// TAG RECOUNT
// ============================================================================

/// Usage counts are derived, so a recount is a cache rebuild. Returns the
/// number of distinct tags counted.
pub fn recount_tags(catalog: &Arc<Catalog>, cache: &CacheManager) -> Result<usize> {
    cache.reload_all(catalog)?;
    Ok(catalog.all_tags()?.len())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;

    fn temp_config() -> (tempfile::TempDir, Config) {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.image_directory = tmp.path().join("images");
        config.thumb_directory = tmp.path().join("thumbs");
        config.embedding_dim = 8;
        std::fs::create_dir_all(&config.image_directory).unwrap();
        (tmp, config)
    }

    fn write_file(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn delete_image_completely_removes_file_and_rows() {
        let (_tmp, config) = temp_config();
        let catalog = Catalog::open_in_memory().unwrap();
        let id = catalog.commit_ingest(&sample_commit("a.jpg", "m1")).unwrap();
        write_file(&config.image_directory.join("a.jpg"), b"data");

        let removed = delete_image_completely(&catalog, &config, id).unwrap();
        assert!(removed.is_some());
        assert!(!config.image_directory.join("a.jpg").exists());
        assert!(catalog.image_by_id(id).unwrap().is_none());
        // Second delete is a clean no-op
        assert!(delete_image_completely(&catalog, &config, id).unwrap().is_none());
    }

    #[test]
    fn broken_report_flags_embedding_dimension() {
        let (_tmp, config) = temp_config();
        let catalog = Catalog::open_in_memory().unwrap();
        let mut commit = sample_commit("a.jpg", "m1");
        commit.embedding = Some(vec![0.0; 4]); // wrong dim (configured 8)
        let id = catalog.commit_ingest(&commit).unwrap();
        write_file(&config.image_directory.join("a.jpg"), b"data");

        let broken = find_broken_images(&catalog, &config).unwrap();
        let entry = broken.iter().find(|b| b.image_id == id).unwrap();
        assert!(entry.issues.contains(&BrokenIssue::InvalidEmbeddingDim));

        // Clearing the bad row downgrades the issue to missing
        assert!(clear_invalid_embedding(&catalog, id).unwrap());
        let broken = find_broken_images(&catalog, &config).unwrap();
        let entry = broken.iter().find(|b| b.image_id == id).unwrap();
        assert!(entry.issues.contains(&BrokenIssue::MissingEmbedding));
    }

    #[test]
    fn broken_report_flags_missing_file_and_hashes() {
        let (_tmp, config) = temp_config();
        let catalog = Catalog::open_in_memory().unwrap();
        let mut commit = sample_commit("a.jpg", "m1");
        commit.phash = None;
        commit.embedding = Some(vec![0.0; 8]);
        catalog.commit_ingest(&commit).unwrap();

        let broken = find_broken_images(&catalog, &config).unwrap();
        assert_eq!(broken.len(), 1);
        assert!(broken[0].issues.contains(&BrokenIssue::MissingFile));
        assert!(broken[0].issues.contains(&BrokenIssue::MissingPhash));
    }

    #[test]
    fn orphan_cleanup_drops_rows_without_files() {
        let (_tmp, config) = temp_config();
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.commit_ingest(&sample_commit("gone.jpg", "m1")).unwrap();
        catalog.commit_ingest(&sample_commit("kept.jpg", "m2")).unwrap();
        write_file(&config.image_directory.join("kept.jpg"), b"data");
        write_file(&config.image_directory.join("unknown.jpg"), b"other");

        let dry = clean_orphans(&catalog, &config, true).unwrap();
        assert_eq!(dry.rows_without_files, vec!["gone.jpg"]);
        assert_eq!(dry.files_without_rows, vec!["unknown.jpg"]);
        assert_eq!(dry.removed_rows, 0);
        assert_eq!(catalog.image_count().unwrap(), 2);

        let wet = clean_orphans(&catalog, &config, false).unwrap();
        assert_eq!(wet.removed_rows, 1);
        assert_eq!(catalog.image_count().unwrap(), 1);
    }

    #[test]
    fn duplicate_sweep_removes_redundant_copy() {
        let (_tmp, config) = temp_config();
        let catalog = Catalog::open_in_memory().unwrap();
        let payload = b"identical-bytes";
        let md5 = crate::hash::bytes_md5(payload);

        let mut commit = sample_commit("original.jpg", &md5);
        commit.md5 = md5.clone();
        catalog.commit_ingest(&commit).unwrap();
        write_file(&config.image_directory.join("original.jpg"), payload);
        write_file(&config.image_directory.join("copy.jpg"), payload);

        let report = scan_and_remove_duplicates(&catalog, &config, false).unwrap();
        assert_eq!(report.duplicates_found, 1);
        assert_eq!(report.removed, 1);
        assert!(!config.image_directory.join("copy.jpg").exists());
        assert!(config.image_directory.join("original.jpg").exists());
    }
}
