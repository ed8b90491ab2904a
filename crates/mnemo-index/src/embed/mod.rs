//! Text embedding capability.
//!
//! A single small interface: text in, fixed-dimension vector out. Capture
//! and recall treat every failure here as soft; a memory without a vector
//! is still reachable through scalar and text search until a later sync
//! fills the vector in.

#[cfg(feature = "local-embeddings")]
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{EmbeddingError, EmbeddingResult};

/// Trait for generating text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Embed several texts.
    ///
    /// The default calls [`Embedder::embed`] sequentially; implementations
    /// with real batch inference should override.
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Output vector dimension.
    fn dimensions(&self) -> usize;

    /// Short provider name recorded in the index meta table.
    fn name(&self) -> &str;
}

/// A shared embedder handle.
pub type SharedEmbedder = Arc<dyn Embedder>;

// ─────────────────────────────────────────────────────────────────────────────
// Mock embedder
// ─────────────────────────────────────────────────────────────────────────────

/// Deterministic hash-based embedder.
///
/// The same text always produces the same unit-length vector, which makes
/// similarity search exercisable without a model on disk.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedder {
    /// 384 dimensions, matching all-MiniLM-L6-v2.
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        let mut state = djb2(text);
        let mut embedding = vec![0.0f32; self.dimensions];
        for slot in embedding.iter_mut() {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            *slot = ((state >> 16) as f32 / 32768.0) - 1.0;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn djb2(s: &str) -> u64 {
    let mut hash: u64 = 5381;
    for byte in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(byte as u64);
    }
    hash
}

// ─────────────────────────────────────────────────────────────────────────────
// Failing embedder
// ─────────────────────────────────────────────────────────────────────────────

/// An embedder that always fails.
///
/// Stands in when no model is available, and exercises the degradation
/// paths: capture proceeds unindexed, recall falls back to text search.
#[derive(Debug, Clone)]
pub struct FailingEmbedder {
    dimensions: usize,
}

impl FailingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> EmbeddingResult<Vec<f32>> {
        Err(EmbeddingError::Load("no embedding model available".into()))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        "none"
    }
}
