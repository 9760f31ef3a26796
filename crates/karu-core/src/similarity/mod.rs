//! Similarity service
//!
//! Three public queries over one artifact: visual (pHash hamming scan),
//! semantic (embedding nearest-neighbor), and tag-based (asymmetric weighted
//! Jaccard), plus the blended combination of all three. Also owns the
//! duplicate-pair cache (`pairs`) and the top-N similars cache (`cache`).

pub mod cache;
pub mod pairs;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::catalog::{Catalog, CatalogError, ImageRecord};
use crate::config::{Config, PHASH_BITS};
use crate::hash::hamming_distance_hex;
use crate::relations::RelationRepository;
use crate::semantic::{embedding_from_bytes, SemanticEmbedder};

#[cfg(not(feature = "vector-search"))]
use crate::semantic::cosine_similarity;

#[cfg(feature = "vector-search")]
use crate::semantic::VectorIndex;
#[cfg(feature = "vector-search")]
use std::sync::RwLock;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Similarity error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum SimilarityError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] crate::semantic::EmbeddingError),
    #[cfg(feature = "vector-search")]
    #[error("Vector index error: {0}")]
    Index(#[from] crate::semantic::VectorSearchError),
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, SimilarityError>;

// ============================================================================
// TYPES
// ============================================================================

/// One similarity match.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarMatch {
    pub image_id: i64,
    pub filepath: String,
    pub score: f64,
    /// Hamming distance, for visual matches.
    pub distance: Option<u32>,
    /// `visual` | `semantic` | `tag` | `blended`
    pub match_type: String,
}

/// Snapshot of hash/embedding coverage.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityStats {
    pub total_images: i64,
    pub with_phash: i64,
    pub with_colorhash: i64,
    pub with_embedding: i64,
    pub phash_bits: u32,
}

/// Per-channel inputs to the blended query.
#[derive(Debug, Clone)]
pub struct BlendWeights {
    pub visual_weight: f64,
    pub tag_weight: f64,
    pub semantic_weight: f64,
    pub visual_threshold: u32,
    pub tag_threshold: f64,
    pub semantic_threshold: f64,
}

impl BlendWeights {
    pub fn from_config(config: &Config) -> Self {
        Self {
            visual_weight: config.blended_visual_weight,
            tag_weight: config.blended_tag_weight,
            semantic_weight: config.blended_semantic_weight,
            visual_threshold: config.blended_visual_threshold,
            tag_threshold: config.blended_tag_threshold,
            semantic_threshold: config.blended_semantic_threshold,
        }
    }
}

// ============================================================================
// SERVICE
// ============================================================================

/// The similarity service.
pub struct SimilarityService {
    catalog: Arc<Catalog>,
    config: Config,
    embedder: Arc<dyn SemanticEmbedder>,
    relations: RelationRepository,
    #[cfg(feature = "vector-search")]
    index: RwLock<Option<VectorIndex>>,
}

impl SimilarityService {
    pub fn new(catalog: Arc<Catalog>, config: Config, embedder: Arc<dyn SemanticEmbedder>) -> Self {
        Self {
            relations: RelationRepository::new(catalog.clone()),
            catalog,
            config,
            embedder,
            #[cfg(feature = "vector-search")]
            index: RwLock::new(None),
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    // ========================================================================
    // VISUAL
    // ========================================================================

    /// Candidate-scan every stored pHash against the target's. An image
    /// without a stored pHash yields an empty list, not an error.
    pub fn find_visual(
        &self,
        filepath: &str,
        threshold: u32,
        limit: usize,
        exclude_family: bool,
    ) -> Result<Vec<SimilarMatch>> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;

        let target_hash = match &image.phash {
            Some(h) => h.clone(),
            None => return Ok(vec![]),
        };

        let excluded = if exclude_family {
            self.family_ids(image.id)?
        } else {
            HashSet::new()
        };

        let mut matches: Vec<(i64, u32)> = Vec::new();
        for (id, phash) in self.catalog.images_with_phash()? {
            if id == image.id || excluded.contains(&id) {
                continue;
            }
            if let Some(distance) = hamming_distance_hex(&target_hash, &phash) {
                if distance <= threshold {
                    matches.push((id, distance));
                }
            }
        }
        matches.sort_by_key(|(_, d)| *d);
        matches.truncate(limit);

        let mut out = Vec::with_capacity(matches.len());
        for (id, distance) in matches {
            if let Some(other) = self.catalog.image_by_id(id)? {
                out.push(SimilarMatch {
                    image_id: id,
                    filepath: other.filepath,
                    score: 1.0 - distance as f64 / PHASH_BITS as f64,
                    distance: Some(distance),
                    match_type: "visual".to_string(),
                });
            }
        }
        Ok(out)
    }

    // ========================================================================
    // SEMANTIC
    // ========================================================================

    /// Embedding nearest-neighbor query. Uses the stored embedding when
    /// present, embedding the file otherwise.
    pub fn find_semantic(
        &self,
        filepath: &str,
        limit: usize,
        exclude_family: bool,
    ) -> Result<Vec<SimilarMatch>> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;

        let query = match self.catalog.embedding_for_image(image.id)? {
            Some(blob) => embedding_from_bytes(&blob)
                .filter(|v| v.len() == self.config.embedding_dim),
            None => None,
        };
        let query = match query {
            Some(v) => v,
            None => {
                let full_path = self.config.image_directory.join(filepath);
                match self.embedder.embed_file(&full_path) {
                    Ok(v) if v.len() == self.config.embedding_dim => v,
                    _ => return Ok(vec![]),
                }
            }
        };

        let excluded = if exclude_family {
            self.family_ids(image.id)?
        } else {
            HashSet::new()
        };

        let neighbors = self.nearest_neighbors(&query, limit + excluded.len() + 1)?;

        let mut out = Vec::new();
        for (id, score) in neighbors {
            if id == image.id || excluded.contains(&id) {
                continue;
            }
            if let Some(other) = self.catalog.image_by_id(id)? {
                out.push(SimilarMatch {
                    image_id: id,
                    filepath: other.filepath,
                    score: score as f64,
                    distance: None,
                    match_type: "semantic".to_string(),
                });
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    #[cfg(feature = "vector-search")]
    fn nearest_neighbors(&self, query: &[f32], limit: usize) -> Result<Vec<(i64, f32)>> {
        {
            let guard = self
                .index
                .read()
                .map_err(|_| CatalogError::Init("index lock poisoned".into()))?;
            if let Some(index) = guard.as_ref() {
                return Ok(index.search(query, limit)?);
            }
        }
        self.rebuild_index()?;
        let guard = self
            .index
            .read()
            .map_err(|_| CatalogError::Init("index lock poisoned".into()))?;
        match guard.as_ref() {
            Some(index) => Ok(index.search(query, limit)?),
            None => Ok(vec![]),
        }
    }

    #[cfg(not(feature = "vector-search"))]
    fn nearest_neighbors(&self, query: &[f32], limit: usize) -> Result<Vec<(i64, f32)>> {
        // Exact scan fallback when the HNSW index is compiled out
        let mut scored: Vec<(i64, f32)> = self
            .catalog
            .all_embeddings()?
            .into_iter()
            .filter_map(|(id, blob, _)| {
                let vector = embedding_from_bytes(&blob)?;
                if vector.len() != query.len() {
                    return None;
                }
                Some((id, cosine_similarity(query, &vector)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    /// Rebuild the ANN index from every stored embedding, skipping rows whose
    /// dimension does not match the configuration.
    #[cfg(feature = "vector-search")]
    pub fn rebuild_index(&self) -> Result<usize> {
        let mut index = VectorIndex::new(self.config.embedding_dim)
            .map_err(SimilarityError::Index)?;
        let rows = self.catalog.all_embeddings()?;
        index.reserve(rows.len().max(16)).map_err(SimilarityError::Index)?;

        let mut loaded = 0usize;
        for (id, blob, _) in rows {
            if let Some(vector) = embedding_from_bytes(&blob) {
                if vector.len() == self.config.embedding_dim {
                    index.add(id, &vector).map_err(SimilarityError::Index)?;
                    loaded += 1;
                } else {
                    tracing::warn!(image_id = id, dims = vector.len(), "skipping embedding with wrong dimension");
                }
            }
        }

        let mut guard = self
            .index
            .write()
            .map_err(|_| CatalogError::Init("index lock poisoned".into()))?;
        *guard = Some(index);
        Ok(loaded)
    }

    /// Register one new embedding with the live index.
    #[cfg(feature = "vector-search")]
    pub fn index_embedding(&self, image_id: i64, vector: &[f32]) -> Result<()> {
        let mut guard = self
            .index
            .write()
            .map_err(|_| CatalogError::Init("index lock poisoned".into()))?;
        if let Some(index) = guard.as_mut() {
            index.add(image_id, vector).map_err(SimilarityError::Index)?;
        }
        Ok(())
    }

    // ========================================================================
    // TAG SIMILARITY
    // ========================================================================

    /// "Related by tags": asymmetric weighted Jaccard with IDF-style tag
    /// weights and category multipliers. Candidates are pre-filtered to
    /// images sharing at least one tag with the target.
    pub fn find_related_by_tags(&self, filepath: &str, limit: usize) -> Result<Vec<SimilarMatch>> {
        let image = self
            .catalog
            .image_by_filepath(filepath)?
            .ok_or_else(|| CatalogError::NotFound(filepath.to_string()))?;

        let target_tags: HashSet<String> = image.all_tags().into_iter().collect();
        if target_tags.is_empty() {
            return Ok(vec![]);
        }

        let weights = self.tag_weight_table()?;
        let candidates = self.candidates_sharing_tags(image.id)?;

        let mut scored: Vec<(i64, f64)> = Vec::new();
        for candidate_id in candidates {
            let other = match self.catalog.image_by_id(candidate_id)? {
                Some(img) => img,
                None => continue,
            };
            let other_tags: HashSet<String> = other.all_tags().into_iter().collect();
            let score = weighted_tag_similarity(
                &target_tags,
                &other_tags,
                &weights,
                self.config.tag_similarity_alpha,
            );
            if score > 0.0 {
                scored.push((candidate_id, score));
            }
        }
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);

        let mut out = Vec::with_capacity(scored.len());
        for (id, score) in scored {
            if let Some(other) = self.catalog.image_by_id(id)? {
                out.push(SimilarMatch {
                    image_id: id,
                    filepath: other.filepath,
                    score,
                    distance: None,
                    match_type: "tag".to_string(),
                });
            }
        }
        Ok(out)
    }

    /// Per-tag weight: `1 / ln(usage + 1)` scaled by the category weight,
    /// preferring the extended category's configured weight when present.
    fn tag_weight_table(&self) -> Result<HashMap<String, f64>> {
        let mut table = HashMap::new();
        for tag in self.catalog.all_tags()? {
            let idf = 1.0 / ((tag.usage_count as f64 + 1.0).ln()).max(0.1);
            let category_weight = tag
                .extended_category
                .as_deref()
                .and_then(|e| self.config.tag_category_weights.get(e))
                .or_else(|| self.config.tag_category_weights.get(tag.category.as_str()))
                .copied()
                .unwrap_or(1.0);
            table.insert(tag.name, idf * category_weight);
        }
        Ok(table)
    }

    fn candidates_sharing_tags(&self, image_id: i64) -> Result<Vec<i64>> {
        let reader = self.catalog.reader()?;
        let mut stmt = reader.prepare(
            "SELECT DISTINCT it2.image_id
             FROM image_tags it1
             JOIN image_tags it2 ON it2.tag_id = it1.tag_id
             WHERE it1.image_id = ?1 AND it2.image_id != ?1",
        )?;
        let rows = stmt
            .query_map([image_id], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(rows)
    }

    // ========================================================================
    // BLENDED
    // ========================================================================

    /// Linear combination of the three channels. A candidate must clear at
    /// least one channel threshold to appear.
    pub fn find_blended(
        &self,
        filepath: &str,
        weights: &BlendWeights,
        limit: usize,
        exclude_family: bool,
    ) -> Result<Vec<SimilarMatch>> {
        let pool = limit.max(16) * 4;

        let visual = self.find_visual(filepath, weights.visual_threshold, pool, exclude_family)?;
        let tag = self.find_related_by_tags(filepath, pool)?;
        let semantic = self.find_semantic(filepath, pool, exclude_family)?;

        struct Channels {
            filepath: String,
            visual: Option<f64>,
            tag: Option<f64>,
            semantic: Option<f64>,
        }
        let mut merged: HashMap<i64, Channels> = HashMap::new();

        for m in visual {
            // Normalize against the channel threshold rather than the full
            // bit width so nearby distances spread over [0, 1]
            let normalized = 1.0
                - m.distance.unwrap_or(PHASH_BITS) as f64
                    / (weights.visual_threshold.max(1) as f64 + 1.0);
            merged
                .entry(m.image_id)
                .or_insert_with(|| Channels {
                    filepath: m.filepath.clone(),
                    visual: None,
                    tag: None,
                    semantic: None,
                })
                .visual = Some(normalized.clamp(0.0, 1.0));
        }
        for m in tag {
            if m.score < weights.tag_threshold {
                continue;
            }
            merged
                .entry(m.image_id)
                .or_insert_with(|| Channels {
                    filepath: m.filepath.clone(),
                    visual: None,
                    tag: None,
                    semantic: None,
                })
                .tag = Some(m.score.clamp(0.0, 1.0));
        }
        for m in semantic {
            if m.score < weights.semantic_threshold {
                continue;
            }
            merged
                .entry(m.image_id)
                .or_insert_with(|| Channels {
                    filepath: m.filepath.clone(),
                    visual: None,
                    tag: None,
                    semantic: None,
                })
                .semantic = Some(m.score.clamp(0.0, 1.0));
        }

        let mut out: Vec<SimilarMatch> = merged
            .into_iter()
            .filter(|(_, c)| c.visual.is_some() || c.tag.is_some() || c.semantic.is_some())
            .map(|(id, c)| {
                let score = c.visual.unwrap_or(0.0) * weights.visual_weight
                    + c.tag.unwrap_or(0.0) * weights.tag_weight
                    + c.semantic.unwrap_or(0.0) * weights.semantic_weight;
                SimilarMatch {
                    image_id: id,
                    filepath: c.filepath,
                    score,
                    distance: None,
                    match_type: "blended".to_string(),
                }
            })
            .collect();
        out.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        out.truncate(limit);
        Ok(out)
    }

    // ========================================================================
    // SUPPORT
    // ========================================================================

    /// Ids related to `image_id` by parent/child or sibling rows.
    fn family_ids(&self, image_id: i64) -> Result<HashSet<i64>> {
        let related = self.relations.relations_for_image(image_id)?;
        Ok(related
            .into_iter()
            .filter(|r| {
                matches!(
                    r.relation_type,
                    crate::catalog::RelationType::ParentChild | crate::catalog::RelationType::Sibling
                )
            })
            .map(|r| r.other_image_id)
            .collect())
    }

    pub fn stats(&self) -> Result<SimilarityStats> {
        let reader = self.catalog.reader()?;
        let total_images: i64 = reader.query_row("SELECT COUNT(*) FROM images", [], |r| r.get(0))?;
        let with_phash: i64 =
            reader.query_row("SELECT COUNT(*) FROM images WHERE phash IS NOT NULL", [], |r| r.get(0))?;
        let with_colorhash: i64 = reader.query_row(
            "SELECT COUNT(*) FROM images WHERE colorhash IS NOT NULL",
            [],
            |r| r.get(0),
        )?;
        let with_embedding: i64 =
            reader.query_row("SELECT COUNT(*) FROM embeddings", [], |r| r.get(0))?;
        Ok(SimilarityStats {
            total_images,
            with_phash,
            with_colorhash,
            with_embedding,
            phash_bits: PHASH_BITS,
        })
    }

    /// Images missing a pHash or an embedding (hash-generation worklist).
    pub fn images_missing_fingerprints(&self) -> Result<Vec<ImageRecord>> {
        let all = self.catalog.all_images()?;
        let with_embedding: HashSet<i64> = self
            .catalog
            .all_embeddings()?
            .into_iter()
            .map(|(id, _, _)| id)
            .collect();
        Ok(all
            .into_iter()
            .filter(|img| {
                img.phash.is_none() || img.colorhash.is_none() || !with_embedding.contains(&img.id)
            })
            .collect())
    }
}

/// Asymmetric weighted Jaccard:
/// `alpha * (w(A∩B) / w(A)) + (1 - alpha) * (w(A∩B) / w(A∪B))`.
pub fn weighted_tag_similarity(
    a: &HashSet<String>,
    b: &HashSet<String>,
    weights: &HashMap<String, f64>,
    alpha: f64,
) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let weight_of = |tag: &String| weights.get(tag).copied().unwrap_or(0.1);

    let intersection: f64 = a.intersection(b).map(weight_of).sum();
    let query: f64 = a.iter().map(weight_of).sum();
    let union: f64 = a.union(b).map(weight_of).sum();

    if query == 0.0 || union == 0.0 {
        return 0.0;
    }
    alpha * (intersection / query) + (1.0 - alpha) * (intersection / union)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::catalog::store::tests::sample_commit;
    use crate::catalog::CategorizedTags;
    use crate::semantic::ZeroEmbedder;

    pub(crate) fn service_with(
        commits: Vec<(&str, &str, Option<&str>)>,
    ) -> (Arc<Catalog>, SimilarityService) {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        for (path, md5, phash) in commits {
            let mut commit = sample_commit(path, md5);
            commit.phash = phash.map(str::to_string);
            commit.embedding = None;
            catalog.commit_ingest(&commit).unwrap();
        }
        let mut config = Config::default();
        config.embedding_dim = 4;
        let embedder = Arc::new(ZeroEmbedder::new(4));
        let service = SimilarityService::new(catalog.clone(), config, embedder);
        (catalog, service)
    }

    #[test]
    fn visual_query_sorts_by_distance() {
        let (_c, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000003")), // distance 2
            ("c.jpg", "m3", Some("000000000000000f")), // distance 4
            ("d.jpg", "m4", Some("ffffffffffffffff")), // distance 64
        ]);

        let matches = service.find_visual("a.jpg", 8, 10, false).unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].filepath, "b.jpg");
        assert_eq!(matches[0].distance, Some(2));
        assert_eq!(matches[1].filepath, "c.jpg");
    }

    #[test]
    fn visual_query_without_phash_is_empty_not_error() {
        let (_c, service) = service_with(vec![
            ("a.jpg", "m1", None),
            ("b.jpg", "m2", Some("0000000000000000")),
        ]);
        let matches = service.find_visual("a.jpg", 8, 10, false).unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn visual_query_excludes_family() {
        let (catalog, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("b.jpg", "m2", Some("0000000000000001")),
        ]);
        let a = catalog.image_by_filepath("a.jpg").unwrap().unwrap().id;
        let b = catalog.image_by_filepath("b.jpg").unwrap().unwrap().id;
        RelationRepository::new(catalog.clone())
            .add_relation(a, b, crate::catalog::RelationType::Sibling, crate::catalog::RelationSource::Manual)
            .unwrap();

        assert_eq!(service.find_visual("a.jpg", 8, 10, false).unwrap().len(), 1);
        assert!(service.find_visual("a.jpg", 8, 10, true).unwrap().is_empty());
    }

    #[test]
    fn tag_similarity_prefers_shared_character() {
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let mk = |path: &str, md5: &str, character: Vec<&str>, general: Vec<&str>| {
            let mut commit = sample_commit(path, md5);
            commit.embedding = None;
            commit.tags = CategorizedTags {
                character: character.into_iter().map(String::from).collect(),
                general: general.into_iter().map(String::from).collect(),
                ..Default::default()
            };
            commit
        };
        catalog
            .commit_ingest(&mk("target.jpg", "m1", vec!["aoi"], vec!["1girl", "smile"]))
            .unwrap();
        catalog
            .commit_ingest(&mk("same_char.jpg", "m2", vec!["aoi"], vec!["1girl"]))
            .unwrap();
        catalog
            .commit_ingest(&mk("general_only.jpg", "m3", vec![], vec!["1girl", "smile"]))
            .unwrap();
        catalog
            .commit_ingest(&mk("unrelated.jpg", "m4", vec![], vec!["landscape"]))
            .unwrap();

        let mut config = Config::default();
        config.embedding_dim = 4;
        let service =
            SimilarityService::new(catalog.clone(), config, Arc::new(ZeroEmbedder::new(4)));

        let matches = service.find_related_by_tags("target.jpg", 10).unwrap();
        assert_eq!(matches[0].filepath, "same_char.jpg");
        assert!(matches.iter().any(|m| m.filepath == "general_only.jpg"));
        assert!(!matches.iter().any(|m| m.filepath == "unrelated.jpg"));
    }

    #[test]
    fn weighted_similarity_is_asymmetric() {
        let weights: HashMap<String, f64> =
            [("a", 1.0), ("b", 1.0), ("c", 1.0), ("d", 1.0)]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
        let small: HashSet<String> = ["a".to_string()].into_iter().collect();
        let large: HashSet<String> =
            ["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()]
                .into_iter()
                .collect();

        let small_to_large = weighted_tag_similarity(&small, &large, &weights, 0.6);
        let large_to_small = weighted_tag_similarity(&large, &small, &weights, 0.6);
        // Full coverage of the small query scores higher than partial
        // coverage of the large one
        assert!(small_to_large > large_to_small);
    }

    #[test]
    fn blended_excludes_candidates_failing_all_channels() {
        let (_c, service) = service_with(vec![
            ("a.jpg", "m1", Some("0000000000000000")),
            ("near.jpg", "m2", Some("0000000000000001")),
            ("far.jpg", "m3", Some("ffffffffffffffff")),
        ]);
        let weights = BlendWeights {
            visual_weight: 1.0,
            tag_weight: 0.0,
            semantic_weight: 0.0,
            visual_threshold: 8,
            // Thresholds high enough that tag/semantic channels never admit
            tag_threshold: 2.0,
            semantic_threshold: 2.0,
        };
        let matches = service.find_blended("a.jpg", &weights, 10, false).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].filepath, "near.jpg");
        assert_eq!(matches[0].match_type, "blended");
    }
}
