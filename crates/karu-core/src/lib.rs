//! # Karu Core
//!
//! Self-hosted image archive ("booru") engine:
//!
//! - **Ingest pipeline**: watched-directory producer, bounded worker pool,
//!   per-source fetchers with priority and merging, MD5 deduplication, and
//!   debounced batched cache invalidation
//! - **Tag model**: categorized tags per image, a delta journal that keeps
//!   manual edits alive across full catalog rebuilds, and an implication
//!   graph with automatic suggestion mining
//! - **Similarity**: 64-bit DCT perceptual hashes, a pre-computed
//!   duplicate-pair index, semantic embeddings with HNSW search, and a
//!   blended visual/tag/semantic ranker with a cached top-N similars table
//! - **Duplicate review**: preview-diff suggestions (likely duplicate vs.
//!   variation), queue pagination by suggestion class, and transactional
//!   batch commit of review actions
//!
//! External collaborators stay behind trait seams: `TagSource`,
//! `ReverseImageSearch`, `LocalTagger`, `SemanticEmbedder`, and
//! `FrameExtractor`. The HTTP surface, template rendering, thumbnailing,
//! and the models themselves live elsewhere.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use karu_core::{Catalog, Config, QueryService};
//!
//! let config = Config::from_env();
//! let catalog = Arc::new(Catalog::open(&config.db_path)?);
//! let query = QueryService::new(catalog.clone(), config.clone());
//! let page = query.search("1girl -landscape order:newest", 1, None)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `vector-search` (default): HNSW nearest-neighbor search over stored
//!   embeddings via USearch; without it semantic queries fall back to an
//!   exact scan

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod cache;
pub mod catalog;
pub mod config;
pub mod hash;
pub mod ingest;
pub mod maintenance;
pub mod monitor;
pub mod pools;
pub mod query;
pub mod rebuild;
pub mod relations;
pub mod review;
pub mod semantic;
pub mod similarity;
pub mod sources;
pub mod tags;
pub mod tasks;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Catalog store and record types
pub use catalog::{
    Catalog, CatalogError, CategorizedTags, DeltaOp, ExtendedCategory, ImageRecord,
    ImageRelation, IngestCommit, Rating, RawMetadata, RelationSource, RelationType, TagCategory,
    TagDelta, TagOrigin, TagRecord,
};

// Configuration
pub use config::{Config, PHASH_BITS};

// Hash engine
pub use hash::{
    file_md5, hamming_distance, hamming_distance_hex, ArtifactKind, FrameExtractor, HashEngine,
    HashError, HashPair, PreviewFrameExtractor,
};

// Semantic engine
pub use semantic::{
    cosine_similarity, embedding_from_bytes, embedding_to_bytes, EmbeddingError, SemanticEmbedder,
    ZeroEmbedder,
};

#[cfg(feature = "vector-search")]
pub use semantic::{VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError};

// Source adapters
pub use sources::{
    extract_pixiv_id, hit_from_raw, ActiveSelection, LocalTagger, ReverseImageSearch,
    ReverseMatch, ReverseSearchOutcome, SourceError, SourceHit, SourceId, SourceRegistry,
    TagSource, MERGED_SOURCE,
};

// Tag model
pub use tags::{
    apply_deltas, clear_deltas, clear_deltas_for_md5, compute_deltas, image_deltas,
    normalize_tag_name, record_delta, DeltaView, EditOutcome, ImplicationChain,
    ImplicationEngine, ImplicationError, ImplicationRule, ImplicationSuggestion, PreviewImpact,
    ReapplyStats, TagRepository,
};

// Pools and relations
pub use pools::{PoolDetails, PoolRepository, PoolSummary};
pub use relations::{RelationDisplay, RelationRepository};

// Similarity
pub use similarity::{
    BlendWeights, SimilarMatch, SimilarityError, SimilarityService, SimilarityStats,
};

// Duplicate review
pub use review::{
    QueueMode, QueuePage, QueuePair, ReviewAction, ReviewActionKind, ReviewError, ReviewService,
    Suggestion, SuggestionClass,
};

// Ingest
pub use ingest::{
    Analysis, AnalyzeOptions, BatchStats, BulkRetryStats, IngestError, IngestOrigin,
    IngestOutcome, IngestPipeline,
};

// Query service
pub use query::{parse_query, QueryService, SearchExpr, SearchPage, SearchResult, SortOrder};

// Caches, tasks, monitoring, rebuild, maintenance
pub use cache::{CacheManager, HomepageEntry};
pub use maintenance::{BrokenImage, BrokenIssue, DedupeReport, OrphanReport};
pub use monitor::{LogEntry, LogLevel, MonitorService, MonitorStatus};
pub use rebuild::{check_priority_changes, priority_hash, RebuildEngine, RebuildStats};
pub use tasks::{TaskHandle, TaskManager, TaskRecord, TaskStatus};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Catalog, CatalogError, CategorizedTags, Config, ImageRecord, IngestPipeline,
        QueryService, Rating, ReviewService, SimilarityService, TagCategory, TagOrigin,
        TagRepository, TaskManager,
    };

    pub use crate::{LocalTagger, ReverseImageSearch, SemanticEmbedder, SourceId, TagSource};
}
