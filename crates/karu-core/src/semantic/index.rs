//! Approximate-nearest-neighbor index
//!
//! USearch HNSW index over the stored embeddings, keyed by image id.
//! Cosine metric; scores returned as similarity (1 - distance).

use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

// ============================================================================
// CONSTANTS
// ============================================================================

/// HNSW connectivity parameter (higher = better recall, more memory)
pub const DEFAULT_CONNECTIVITY: usize = 16;

/// HNSW expansion factor for index building
pub const DEFAULT_EXPANSION_ADD: usize = 128;

/// HNSW expansion factor for search (higher = better recall, slower)
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Vector search error types
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum VectorSearchError {
    #[error("Index creation failed: {0}")]
    IndexCreation(String),
    #[error("Failed to add vector: {0}")]
    IndexAdd(String),
    #[error("Search failed: {0}")]
    IndexSearch(String),
    #[error("Invalid dimensions: expected {0}, got {1}")]
    InvalidDimensions(usize, usize),
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the vector index
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    /// Number of dimensions
    pub dimensions: usize,
    /// HNSW connectivity parameter
    pub connectivity: usize,
    /// Expansion factor for adding vectors
    pub expansion_add: usize,
    /// Expansion factor for searching
    pub expansion_search: usize,
}

impl VectorIndexConfig {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
        }
    }
}

/// Index statistics
#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub total_vectors: usize,
    pub dimensions: usize,
    pub connectivity: usize,
    pub memory_bytes: usize,
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

/// HNSW vector index keyed by image id
pub struct VectorIndex {
    index: Index,
    config: VectorIndexConfig,
    keys: std::collections::HashSet<i64>,
}

impl VectorIndex {
    /// Create a new index for the given embedding dimension.
    pub fn new(dimensions: usize) -> Result<Self, VectorSearchError> {
        Self::with_config(VectorIndexConfig::with_dimensions(dimensions))
    }

    /// Create a new index with custom configuration.
    pub fn with_config(config: VectorIndexConfig) -> Result<Self, VectorSearchError> {
        let options = IndexOptions {
            dimensions: config.dimensions,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: config.connectivity,
            expansion_add: config.expansion_add,
            expansion_search: config.expansion_search,
            multi: false,
        };

        let index =
            Index::new(&options).map_err(|e| VectorSearchError::IndexCreation(e.to_string()))?;

        Ok(Self {
            index,
            config,
            keys: std::collections::HashSet::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    pub fn contains(&self, image_id: i64) -> bool {
        self.keys.contains(&image_id)
    }

    /// Reserve capacity. usearch requires reserve() before add(), so `add`
    /// grows capacity itself when needed.
    pub fn reserve(&self, capacity: usize) -> Result<(), VectorSearchError> {
        self.index
            .reserve(capacity)
            .map_err(|e| VectorSearchError::IndexCreation(format!("reserve failed: {}", e)))
    }

    /// Add or replace a vector for an image id.
    pub fn add(&mut self, image_id: i64, vector: &[f32]) -> Result<(), VectorSearchError> {
        if vector.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                vector.len(),
            ));
        }

        let key = image_id as u64;
        if self.keys.contains(&image_id) {
            self.index
                .remove(key)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            self.reserve(self.index.size() + 1)?;
            self.index
                .add(key, vector)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            return Ok(());
        }

        let capacity = self.index.capacity();
        if self.index.size() >= capacity {
            self.reserve(std::cmp::max(capacity * 2, 16))?;
        }

        self.index
            .add(key, vector)
            .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
        self.keys.insert(image_id);
        Ok(())
    }

    /// Remove a vector; returns whether it existed.
    pub fn remove(&mut self, image_id: i64) -> Result<bool, VectorSearchError> {
        if self.keys.remove(&image_id) {
            self.index
                .remove(image_id as u64)
                .map_err(|e| VectorSearchError::IndexAdd(e.to_string()))?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Nearest neighbors as (image id, similarity), best first.
    pub fn search(
        &self,
        query: &[f32],
        limit: usize,
    ) -> Result<Vec<(i64, f32)>, VectorSearchError> {
        if query.len() != self.config.dimensions {
            return Err(VectorSearchError::InvalidDimensions(
                self.config.dimensions,
                query.len(),
            ));
        }
        if self.is_empty() {
            return Ok(vec![]);
        }

        let results = self
            .index
            .search(query, limit)
            .map_err(|e| VectorSearchError::IndexSearch(e.to_string()))?;

        Ok(results
            .keys
            .iter()
            .zip(results.distances.iter())
            .map(|(key, distance)| (*key as i64, 1.0 - distance))
            .collect())
    }

    /// Search filtered to a minimum similarity.
    pub fn search_with_threshold(
        &self,
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<(i64, f32)>, VectorSearchError> {
        let results = self.search(query, limit)?;
        Ok(results
            .into_iter()
            .filter(|(_, score)| *score >= min_similarity)
            .collect())
    }

    pub fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            total_vectors: self.len(),
            dimensions: self.config.dimensions,
            connectivity: self.config.connectivity,
            memory_bytes: self.index.serialized_length(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 16;

    fn test_vector(seed: f32) -> Vec<f32> {
        (0..DIM)
            .map(|i| ((i as f32 + seed) / DIM as f32).sin())
            .collect()
    }

    #[test]
    fn add_and_search() {
        let mut index = VectorIndex::new(DIM).unwrap();
        index.add(1, &test_vector(1.0)).unwrap();
        index.add(2, &test_vector(2.0)).unwrap();
        index.add(3, &test_vector(50.0)).unwrap();

        assert_eq!(index.len(), 3);
        assert!(index.contains(1));
        assert!(!index.contains(99));

        let results = index.search(&test_vector(1.0), 3).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn update_replaces_without_growing() {
        let mut index = VectorIndex::new(DIM).unwrap();
        index.add(1, &test_vector(1.0)).unwrap();
        index.add(1, &test_vector(9.0)).unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_forgets_key() {
        let mut index = VectorIndex::new(DIM).unwrap();
        index.add(1, &test_vector(1.0)).unwrap();
        assert!(index.remove(1).unwrap());
        assert!(!index.remove(1).unwrap());
        assert!(!index.contains(1));
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mut index = VectorIndex::new(DIM).unwrap();
        let err = index.add(1, &[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, VectorSearchError::InvalidDimensions(_, 2)));
    }

    #[test]
    fn empty_search_returns_nothing() {
        let index = VectorIndex::new(DIM).unwrap();
        assert!(index.search(&test_vector(0.0), 5).unwrap().is_empty());
    }
}
