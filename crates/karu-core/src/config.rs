//! Runtime configuration
//!
//! Central configuration for every subsystem. Values come from `KARU_*`
//! environment variables layered over built-in defaults; tests construct
//! `Config::default()` and override fields directly.

use std::collections::HashMap;
use std::path::PathBuf;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Perceptual-hash width. 64 bits = an 8x8 DCT reduction, which keeps the
/// hamming primitive a single XOR + popcount on a `u64`.
pub const PHASH_BITS: u32 = 64;

/// Supported still-image extensions.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// Supported video extensions (hashed via a sampled middle frame).
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm"];

/// Zip animations (hashed via the first extracted frame).
pub const ZIP_EXTENSIONS: &[&str] = &["zip"];

/// Hard cap for page sizes regardless of configuration.
pub const MAX_IMAGES_PER_PAGE: usize = 500;

// ============================================================================
// CONFIG
// ============================================================================

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Canonical managed image directory.
    pub image_directory: PathBuf,
    /// Drop zone; ingested files move from here into `image_directory`.
    pub ingest_directory: PathBuf,
    /// Thumbnail mirror of `image_directory` (`.webp`), produced externally.
    pub thumb_directory: PathBuf,
    /// Files that failed an ingest commit end up here.
    pub reject_directory: PathBuf,
    /// Catalog database path.
    pub db_path: PathBuf,

    /// Source priority, highest first. The first source present in a result
    /// set becomes the active source.
    pub booru_priority: Vec<String>,
    /// When set, images with more than one booru-quality source get the
    /// synthetic `merged` active source.
    pub use_merged_sources_by_default: bool,

    /// Ingest worker pool size; 0 means `cores - 1`.
    pub max_workers: usize,
    /// Idle window before a debounced cache reload fires, in seconds.
    pub reload_debounce_secs: f64,

    /// Minimum SauceNAO similarity (percent) to chase a booru post id.
    pub saucenao_min_similarity: f32,

    /// Default hamming threshold for visual similarity queries.
    pub visual_similarity_threshold: u32,
    /// Hamming threshold stored by the duplicate-pair scan (covers the full
    /// review slider).
    pub duplicate_scan_threshold: u32,
    /// Embedding dimension expected from the semantic embedder.
    pub embedding_dim: usize,
    /// Top-N entries kept per (image, type) in the similars cache.
    pub similarity_cache_size: usize,

    /// Blended-similarity channel weights.
    pub blended_visual_weight: f64,
    pub blended_tag_weight: f64,
    pub blended_semantic_weight: f64,
    /// Per-channel admission thresholds for the blended query.
    pub blended_visual_threshold: u32,
    pub blended_tag_threshold: f64,
    pub blended_semantic_threshold: f64,

    /// Asymmetric weight in the tag-similarity score.
    pub tag_similarity_alpha: f64,
    /// Category weight overrides for tag similarity, keyed by base or
    /// extended category name. Missing keys fall back to 1.0.
    pub tag_category_weights: HashMap<String, f64>,

    /// Duplicate-review suggestion classification bounds.
    pub suggestion_lower_bound: f64,
    pub suggestion_upper_bound: f64,
    /// Append a calibration JSONL line per review action.
    pub review_calibration_enabled: bool,
    pub review_calibration_log: PathBuf,

    /// Correlation miner: minimum co-occurrence count and rate.
    pub implication_min_co_occurrence: i64,
    pub implication_min_confidence: f64,
    /// Extended categories the correlation miner may suggest from
    /// (permanent traits only; empty = allow all).
    pub implication_allowed_extended_categories: Vec<String>,

    /// Gallery page size (capped at `MAX_IMAGES_PER_PAGE`).
    pub images_per_page: usize,
    /// Pre-built homepage pages kept ready.
    pub homepage_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        let mut tag_category_weights = HashMap::new();
        tag_category_weights.insert("character".to_string(), 3.0);
        tag_category_weights.insert("copyright".to_string(), 2.0);
        tag_category_weights.insert("artist".to_string(), 1.5);
        tag_category_weights.insert("species".to_string(), 1.5);
        tag_category_weights.insert("meta".to_string(), 0.5);
        tag_category_weights.insert("general".to_string(), 1.0);
        // Permanent visual traits score higher than contextual axes
        tag_category_weights.insert("01_Body_Physique".to_string(), 2.5);
        tag_category_weights.insert("02_Body_Hair".to_string(), 2.5);
        tag_category_weights.insert("03_Body_Face".to_string(), 2.0);
        tag_category_weights.insert("15_Framing".to_string(), 0.4);
        tag_category_weights.insert("16_Focus".to_string(), 0.4);
        tag_category_weights.insert("17_Style_Art".to_string(), 0.6);
        tag_category_weights.insert("18_Style_Tech".to_string(), 0.4);

        Self {
            image_directory: PathBuf::from("static/images"),
            ingest_directory: PathBuf::from("ingest"),
            thumb_directory: PathBuf::from("static/thumbnails"),
            reject_directory: PathBuf::from("ingest_rejected"),
            db_path: PathBuf::from("karu.db"),
            booru_priority: vec![
                "danbooru".to_string(),
                "e621".to_string(),
                "gelbooru".to_string(),
                "yandere".to_string(),
                "pixiv".to_string(),
                "local_tagger".to_string(),
            ],
            use_merged_sources_by_default: false,
            max_workers: 0,
            reload_debounce_secs: 2.0,
            saucenao_min_similarity: 70.0,
            visual_similarity_threshold: 8,
            duplicate_scan_threshold: 15,
            embedding_dim: 1024,
            similarity_cache_size: 24,
            blended_visual_weight: 0.3,
            blended_tag_weight: 0.4,
            blended_semantic_weight: 0.3,
            blended_visual_threshold: 15,
            blended_tag_threshold: 0.1,
            blended_semantic_threshold: 0.3,
            tag_similarity_alpha: 0.6,
            tag_category_weights,
            suggestion_lower_bound: 0.012,
            suggestion_upper_bound: 0.04,
            review_calibration_enabled: false,
            review_calibration_log: PathBuf::from("logs/duplicate_review_calibration.jsonl"),
            implication_min_co_occurrence: 3,
            implication_min_confidence: 0.85,
            implication_allowed_extended_categories: vec![
                "01_Body_Physique".to_string(),
                "02_Body_Hair".to_string(),
                "03_Body_Face".to_string(),
                "04_Body_Genitalia".to_string(),
            ],
            images_per_page: 50,
            homepage_buffer_size: 3,
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(v) = env_var("KARU_IMAGE_DIRECTORY") {
            cfg.image_directory = PathBuf::from(v);
        }
        if let Some(v) = env_var("KARU_INGEST_DIRECTORY") {
            cfg.ingest_directory = PathBuf::from(v);
        }
        if let Some(v) = env_var("KARU_THUMB_DIRECTORY") {
            cfg.thumb_directory = PathBuf::from(v);
        }
        if let Some(v) = env_var("KARU_REJECT_DIRECTORY") {
            cfg.reject_directory = PathBuf::from(v);
        }
        if let Some(v) = env_var("KARU_DB_PATH") {
            cfg.db_path = PathBuf::from(v);
        }
        if let Some(v) = env_var("KARU_BOORU_PRIORITY") {
            let list: Vec<String> = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !list.is_empty() {
                cfg.booru_priority = list;
            }
        }
        if let Some(v) = env_parse::<u8>("KARU_USE_MERGED_SOURCES") {
            cfg.use_merged_sources_by_default = v != 0;
        }
        if let Some(v) = env_parse("KARU_MAX_WORKERS") {
            cfg.max_workers = v;
        }
        if let Some(v) = env_parse("KARU_VISUAL_THRESHOLD") {
            cfg.visual_similarity_threshold = v;
        }
        if let Some(v) = env_parse("KARU_SCAN_THRESHOLD") {
            cfg.duplicate_scan_threshold = v;
        }
        if let Some(v) = env_parse("KARU_EMBEDDING_DIM") {
            cfg.embedding_dim = v;
        }
        if let Some(v) = env_parse("KARU_SIMILARITY_CACHE_SIZE") {
            cfg.similarity_cache_size = v;
        }
        if let Some(v) = env_parse("KARU_IMAGES_PER_PAGE") {
            cfg.images_per_page = v;
        }
        if let Some(v) = env_parse::<u8>("KARU_REVIEW_CALIBRATION") {
            cfg.review_calibration_enabled = v != 0;
        }
        if let Some(v) = env_var("KARU_REVIEW_CALIBRATION_LOG") {
            cfg.review_calibration_log = PathBuf::from(v);
        }

        cfg
    }

    /// Effective ingest worker pool size.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            self.max_workers
        } else {
            num_cpus::get().saturating_sub(1).max(1)
        }
    }

    /// Page size clamped to the hard cap.
    pub fn page_size(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.images_per_page)
            .clamp(1, MAX_IMAGES_PER_PAGE)
    }

    /// Whether a path names a supported artifact (image, video, or zip).
    pub fn is_supported_artifact(path: &std::path::Path) -> bool {
        let ext = match path.extension().and_then(|e| e.to_str()) {
            Some(e) => e.to_lowercase(),
            None => return false,
        };
        IMAGE_EXTENSIONS.contains(&ext.as_str())
            || VIDEO_EXTENSIONS.contains(&ext.as_str())
            || ZIP_EXTENSIONS.contains(&ext.as_str())
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_var(key).and_then(|v| v.parse().ok())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn page_size_is_capped() {
        let cfg = Config::default();
        assert_eq!(cfg.page_size(None), 50);
        assert_eq!(cfg.page_size(Some(100)), 100);
        assert_eq!(cfg.page_size(Some(10_000)), MAX_IMAGES_PER_PAGE);
        assert_eq!(cfg.page_size(Some(0)), 1);
    }

    #[test]
    fn artifact_extension_filter() {
        assert!(Config::is_supported_artifact(Path::new("a/b.JPG")));
        assert!(Config::is_supported_artifact(Path::new("anim.zip")));
        assert!(Config::is_supported_artifact(Path::new("clip.webm")));
        assert!(!Config::is_supported_artifact(Path::new("notes.txt")));
        assert!(!Config::is_supported_artifact(Path::new("no_extension")));
    }

    #[test]
    fn effective_workers_never_zero() {
        let mut cfg = Config::default();
        cfg.max_workers = 0;
        assert!(cfg.effective_workers() >= 1);
        cfg.max_workers = 3;
        assert_eq!(cfg.effective_workers(), 3);
    }
}
