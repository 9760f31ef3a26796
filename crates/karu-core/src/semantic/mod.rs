//! Semantic engine
//!
//! Wraps an external embedding model behind the `SemanticEmbedder` seam and
//! owns the vector plumbing: the byte codec for stored vectors, cosine
//! similarity, and (behind `vector-search`) the approximate-nearest-neighbor
//! index over all stored embeddings.

use std::path::Path;

#[cfg(feature = "vector-search")]
mod index;

#[cfg(feature = "vector-search")]
pub use index::{VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Embedding error type
#[non_exhaustive]
#[derive(Debug, Clone, thiserror::Error)]
pub enum EmbeddingError {
    /// The model failed to initialize or is unavailable
    #[error("Embedder unavailable: {0}")]
    Unavailable(String),
    /// Inference failed for one file
    #[error("Embedding failed for {path}: {message}")]
    Failed { path: String, message: String },
    /// A vector with the wrong dimension was produced or stored
    #[error("Invalid embedding dimension: expected {expected}, got {got}")]
    InvalidDimensions { expected: usize, got: usize },
}

pub type Result<T> = std::result::Result<T, EmbeddingError>;

// ============================================================================
// EMBEDDER SEAM
// ============================================================================

/// Produces a fixed-length vector per artifact file.
///
/// Implementations include an in-process ONNX runtime and a remote ML worker;
/// both are external collaborators. `ZeroEmbedder` is the test stub.
pub trait SemanticEmbedder: Send + Sync {
    /// Embed the artifact at `path`.
    fn embed_file(&self, path: &Path) -> Result<Vec<f32>>;

    /// The vector length this embedder produces.
    fn dim(&self) -> usize;
}

/// Stub embedder returning fixed zeros, for tests and embedder-less setups.
pub struct ZeroEmbedder {
    dim: usize,
}

impl ZeroEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl SemanticEmbedder for ZeroEmbedder {
    fn embed_file(&self, _path: &Path) -> Result<Vec<f32>> {
        Ok(vec![0.0; self.dim])
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ============================================================================
// VECTOR CODEC
// ============================================================================

/// Serialize a vector as little-endian `f32` bytes for BLOB storage.
pub fn embedding_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

/// Deserialize a stored BLOB; `None` when the length is not a multiple of 4.
pub fn embedding_from_bytes(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

// ============================================================================
// SIMILARITY
// ============================================================================

/// Cosine similarity between two vectors; 0.0 when lengths differ or either
/// norm vanishes.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// TESTS
// ============================================================================
