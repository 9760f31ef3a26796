//! Source adapter set
//!
//! A uniform `TagSource` interface over the external tag providers, plus the
//! logic that turns a set of per-source hits into one active selection:
//! priority scan, or a merged union with per-category reconciliation.
//!
//! The HTTP clients themselves are external collaborators; this module owns
//! the trait seams, the normalized hit shape, and the extraction of that
//! shape from each provider's raw payload (which is also what the rebuild
//! engine replays from).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::catalog::{CategorizedTags, Rating, TagCategory, TagOrigin};

// ============================================================================
// SOURCE IDS
// ============================================================================

/// Known providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceId {
    Danbooru,
    E621,
    Gelbooru,
    Yandere,
    Pixiv,
    LocalTagger,
}

/// Synthetic active-source name used when tags are a union of sources.
pub const MERGED_SOURCE: &str = "merged";

impl SourceId {
    pub const ALL: [SourceId; 6] = [
        SourceId::Danbooru,
        SourceId::E621,
        SourceId::Gelbooru,
        SourceId::Yandere,
        SourceId::Pixiv,
        SourceId::LocalTagger,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceId::Danbooru => "danbooru",
            SourceId::E621 => "e621",
            SourceId::Gelbooru => "gelbooru",
            SourceId::Yandere => "yandere",
            SourceId::Pixiv => "pixiv",
            SourceId::LocalTagger => "local_tagger",
        }
    }

    /// Parse a stored name. Accepts the legacy `camie_tagger` identifier for
    /// the local tagger; nothing ever writes it back.
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "danbooru" => Some(SourceId::Danbooru),
            "e621" => Some(SourceId::E621),
            "gelbooru" => Some(SourceId::Gelbooru),
            "yandere" => Some(SourceId::Yandere),
            "pixiv" => Some(SourceId::Pixiv),
            "local_tagger" | "camie_tagger" => Some(SourceId::LocalTagger),
            _ => None,
        }
    }

    /// Booru-quality sources carry structured post metadata.
    pub fn is_booru(&self) -> bool {
        matches!(
            self,
            SourceId::Danbooru | SourceId::E621 | SourceId::Gelbooru | SourceId::Yandere
        )
    }

    /// Trust ladder for rating tags: danbooru/e621 ratings are original
    /// metadata, local-tagger ratings are model output.
    pub fn rating_origin(&self) -> TagOrigin {
        match self {
            SourceId::LocalTagger => TagOrigin::AiInference,
            _ => TagOrigin::Original,
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Source adapter error type
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    /// Upstream transport failure (timeout, 5xx, connection refused)
    #[error("Network error from {source_name}: {message}")]
    Network { source_name: String, message: String },
    /// Payload did not match the expected shape
    #[error("Malformed payload from {source_name}: {message}")]
    Decode { source_name: String, message: String },
    /// Provider requires configuration that is absent (e.g. an API key)
    #[error("Source not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, SourceError>;

// ============================================================================
// NORMALIZED HIT
// ============================================================================

/// One provider's normalized answer for an artifact.
#[derive(Debug, Clone)]
pub struct SourceHit {
    pub source: SourceId,
    pub tags: CategorizedTags,
    pub post_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub has_children: bool,
    pub rating: Option<Rating>,
    pub score: Option<i64>,
    /// Full payload as returned by the provider; retained verbatim in the
    /// raw-metadata blob so the rebuild engine can re-derive everything.
    pub raw: Value,
}

/// A reverse-image-search match pointing at a booru post.
#[derive(Debug, Clone)]
pub struct ReverseMatch {
    pub source: SourceId,
    pub post_id: String,
    /// Similarity percentage reported by the service.
    pub similarity: f32,
}

/// Reverse-image-search outcome: candidate posts plus the raw response.
#[derive(Debug, Clone)]
pub struct ReverseSearchOutcome {
    pub matches: Vec<ReverseMatch>,
    pub raw: Value,
}

// ============================================================================
// PROVIDER TRAITS
// ============================================================================

/// A tag provider queried by MD5 or post id.
pub trait TagSource: Send + Sync {
    fn id(&self) -> SourceId;

    /// Look up an artifact by content hash. `Ok(None)` means "no post".
    fn fetch_by_md5(&self, md5: &str) -> Result<Option<SourceHit>>;

    /// Look up a specific post id (used to resolve SauceNAO matches and the
    /// Pixiv filename path).
    fn fetch_by_post_id(&self, post_id: &str) -> Result<Option<SourceHit>>;
}

/// Reverse image search (SauceNAO-shaped).
pub trait ReverseImageSearch: Send + Sync {
    fn search(&self, path: &Path) -> Result<ReverseSearchOutcome>;
}

/// The local AI tagger: categorized tag lists plus a rating.
pub trait LocalTagger: Send + Sync {
    fn tag_file(&self, path: &Path) -> Result<Option<SourceHit>>;
}

/// The provider set the ingest pipeline fans out over.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    pub tag_sources: Vec<Arc<dyn TagSource>>,
    pub reverse_search: Option<Arc<dyn ReverseImageSearch>>,
    pub local_tagger: Option<Arc<dyn LocalTagger>>,
    /// Pixiv metadata lookup, driven by filename-extracted ids.
    pub pixiv: Option<Arc<dyn TagSource>>,
}

impl SourceRegistry {
    pub fn tag_source(&self, id: SourceId) -> Option<&Arc<dyn TagSource>> {
        self.tag_sources.iter().find(|s| s.id() == id)
    }
}

// ============================================================================
// RAW PAYLOAD EXTRACTION
// ============================================================================

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("")
}

fn split_tags(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

fn string_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Re-derive a normalized hit from a retained raw payload.
///
/// This is the single place that knows each provider's field layout; both
/// the live adapters and the rebuild engine go through it.
pub fn hit_from_raw(source: SourceId, raw: &Value) -> Option<SourceHit> {
    if !raw.is_object() {
        return None;
    }

    let mut tags = CategorizedTags::default();
    let mut parent_id = raw.get("parent_id").and_then(Value::as_i64);
    let mut has_children = raw
        .get("has_children")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let post_id = raw.get("id").and_then(Value::as_i64);
    let mut score = raw.get("score").and_then(Value::as_i64);

    match source {
        SourceId::Danbooru => {
            tags.character = split_tags(str_field(raw, "tag_string_character"));
            tags.copyright = split_tags(str_field(raw, "tag_string_copyright"));
            tags.artist = split_tags(str_field(raw, "tag_string_artist"));
            tags.meta = split_tags(str_field(raw, "tag_string_meta"));
            tags.general = split_tags(str_field(raw, "tag_string_general"));
        }
        SourceId::E621 => {
            if let Some(t) = raw.get("tags") {
                tags.character = string_list(t, "character");
                tags.copyright = string_list(t, "copyright");
                tags.artist = string_list(t, "artist");
                tags.species = string_list(t, "species");
                tags.meta = string_list(t, "meta");
                tags.general = string_list(t, "general");
            }
            if let Some(rel) = raw.get("relationships") {
                parent_id = rel.get("parent_id").and_then(Value::as_i64);
                has_children = rel
                    .get("has_children")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            }
            score = raw
                .get("score")
                .and_then(|s| s.get("total"))
                .and_then(Value::as_i64)
                .or(score);
        }
        SourceId::Gelbooru | SourceId::Yandere => {
            // Flat tag strings only; everything lands in general
            tags.general = split_tags(str_field(raw, "tags"));
        }
        SourceId::Pixiv | SourceId::LocalTagger => {
            if let Some(t) = raw.get("tags") {
                tags.character = string_list(t, "character");
                tags.copyright = string_list(t, "copyright");
                tags.artist = string_list(t, "artist");
                tags.species = string_list(t, "species");
                tags.meta = string_list(t, "meta");
                tags.general = string_list(t, "general");
            }
        }
    }

    let rating = raw
        .get("rating")
        .and_then(Value::as_str)
        .map(Rating::from_code)
        .filter(|r| *r != Rating::Unknown);

    Some(SourceHit {
        source,
        tags,
        post_id,
        parent_id,
        has_children,
        rating,
        score,
        raw: raw.clone(),
    })
}

// ============================================================================
// ACTIVE-SOURCE SELECTION
// ============================================================================

/// The outcome of selecting an active source over a set of hits.
#[derive(Debug, Clone)]
pub struct ActiveSelection {
    /// Source name, or `merged`.
    pub active_source: String,
    pub tags: CategorizedTags,
    pub post_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub has_children: bool,
    pub rating: Option<(Rating, TagOrigin)>,
    pub score: Option<i64>,
}

/// Select the active source for a hit set.
///
/// Scans `priority` left to right and takes the first source present. When
/// `use_merged` is set and more than one booru-quality source matched, the
/// synthetic `merged` source wins instead and the tag union is used. A
/// "merged" selection over a single source degenerates to that source.
pub fn select_active(
    hits: &BTreeMap<String, SourceHit>,
    priority: &[String],
    use_merged: bool,
) -> Option<ActiveSelection> {
    if hits.is_empty() {
        return None;
    }

    let booru_hits = hits.values().filter(|h| h.source.is_booru()).count();
    if use_merged && booru_hits > 1 {
        return merge_hits(hits, priority);
    }

    let hit = priority
        .iter()
        .find_map(|name| hits.get(name))
        .or_else(|| hits.values().next())?;

    let mut selection = selection_from_hit(hit);

    // Pixiv carries no structured booru-style tags; when the local tagger
    // also ran, fold its categorized tags in.
    if hit.source == SourceId::Pixiv {
        if let Some(local) = hits.get(SourceId::LocalTagger.as_str()) {
            for category in TagCategory::DENORMALIZED {
                let extra = local.tags.category(category).to_vec();
                selection.tags.category_mut(category).extend(extra);
            }
            selection.tags.normalize();
            if selection.rating.is_none() {
                selection.rating = local
                    .rating
                    .map(|r| (r, SourceId::LocalTagger.rating_origin()));
            }
        }
    }

    Some(selection)
}

fn selection_from_hit(hit: &SourceHit) -> ActiveSelection {
    let mut tags = hit.tags.clone();
    tags.normalize();
    ActiveSelection {
        active_source: hit.source.as_str().to_string(),
        tags,
        post_id: hit.post_id,
        parent_id: hit.parent_id,
        has_children: hit.has_children,
        rating: hit.rating.map(|r| (r, hit.source.rating_origin())),
        score: hit.score,
    }
}

/// Union the categorized tags of every hit, reconciling each tag's category
/// by `character > species > copyright > artist > meta > general`.
pub fn merge_hits(
    hits: &BTreeMap<String, SourceHit>,
    priority: &[String],
) -> Option<ActiveSelection> {
    if hits.is_empty() {
        return None;
    }

    let mut merged: BTreeMap<String, TagCategory> = BTreeMap::new();
    for hit in hits.values() {
        for (category, tag) in hit.tags.iter() {
            merged
                .entry(tag.to_string())
                .and_modify(|existing| {
                    if category.merge_priority() > existing.merge_priority() {
                        *existing = category;
                    }
                })
                .or_insert(category);
        }
    }

    let mut tags = CategorizedTags::default();
    for (tag, category) in merged {
        tags.category_mut(category).push(tag);
    }
    tags.normalize();

    // Post linkage and rating come from the highest-priority hit that has one
    let ordered: Vec<&SourceHit> = priority
        .iter()
        .filter_map(|name| hits.get(name))
        .chain(hits.values())
        .collect();

    let post_id = ordered.iter().find_map(|h| h.post_id);
    let parent_id = ordered.iter().find_map(|h| h.parent_id);
    let has_children = ordered.iter().any(|h| h.has_children);
    let rating = ordered
        .iter()
        .find_map(|h| h.rating.map(|r| (r, h.source.rating_origin())));
    let score = ordered.iter().find_map(|h| h.score);

    Some(ActiveSelection {
        active_source: MERGED_SOURCE.to_string(),
        tags,
        post_id,
        parent_id,
        has_children,
        rating,
        score,
    })
}

/// Extract a Pixiv work id from a filename like `123456_p0.png`.
pub fn extract_pixiv_id(filename: &str) -> Option<String> {
    static PATTERN: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^(\d{4,12})_p\d+").expect("static pattern")
    });
    re.captures(filename).map(|c| c[1].to_string())
}

// ============================================================================
// TESTS
// ============================================================================
