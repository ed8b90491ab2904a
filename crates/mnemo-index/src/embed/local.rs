//! Local embeddings via fastembed.
//!
//! Requires the `local-embeddings` feature. The model is downloaded into
//! (or loaded from) a cache directory under the data dir, initialized once
//! on first use, and shared process-wide.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{EmbeddingError, EmbeddingResult};

use super::Embedder;

/// Inference chunk size; bounds peak memory on large batches.
const BATCH_CHUNK: usize = 32;

/// Embedder backed by a local ONNX model through fastembed.
pub struct LocalEmbedder {
    model_name: String,
    dimensions: usize,
    cache_dir: PathBuf,
    // Lazy: nothing is downloaded or mapped until the first embed call.
    model: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl LocalEmbedder {
    /// Configure a local embedder. No model work happens here.
    pub fn new(model_name: impl Into<String>, dimensions: usize, cache_dir: PathBuf) -> Self {
        Self {
            model_name: model_name.into(),
            dimensions,
            cache_dir,
            model: OnceCell::new(),
        }
    }

    fn resolve_model(&self) -> EmbeddingModel {
        match self.model_name.as_str() {
            "all-MiniLM-L6-v2" => EmbeddingModel::AllMiniLML6V2,
            "all-MiniLM-L12-v2" => EmbeddingModel::AllMiniLML12V2,
            "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
            "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
            other => {
                warn!(model = other, "unknown embedding model, using all-MiniLM-L6-v2");
                EmbeddingModel::AllMiniLML6V2
            }
        }
    }

    async fn model(&self) -> EmbeddingResult<Arc<Mutex<TextEmbedding>>> {
        self.model
            .get_or_try_init(|| async {
                let model = self.resolve_model();
                let cache_dir = self.cache_dir.clone();
                let loaded = tokio::task::spawn_blocking(move || {
                    TextEmbedding::try_new(
                        InitOptions::new(model)
                            .with_cache_dir(cache_dir)
                            .with_show_download_progress(false),
                    )
                })
                .await
                .map_err(|e| EmbeddingError::Load(e.to_string()))?
                .map_err(|e| EmbeddingError::Load(e.to_string()))?;
                info!(model = %self.model_name, "embedding model loaded");
                Ok(Arc::new(Mutex::new(loaded)))
            })
            .await
            .cloned()
    }

    async fn run_batch(&self, texts: Vec<String>) -> EmbeddingResult<Vec<Vec<f32>>> {
        let model = self.model().await?;
        let expected = self.dimensions;
        tokio::task::spawn_blocking(move || {
            let mut guard = model.lock().map_err(|_| {
                EmbeddingError::Inference("embedding model mutex poisoned".into())
            })?;
            let mut out = Vec::with_capacity(texts.len());
            for chunk in texts.chunks(BATCH_CHUNK) {
                let embeddings = guard
                    .embed(chunk.to_vec(), None)
                    .map_err(|e| classify(&e.to_string()))?;
                out.extend(embeddings);
            }
            for embedding in &out {
                if embedding.len() != expected {
                    return Err(EmbeddingError::Inference(format!(
                        "model produced {} dimensions, expected {expected}",
                        embedding.len()
                    )));
                }
            }
            Ok(out)
        })
        .await
        .map_err(|e| EmbeddingError::Inference(e.to_string()))?
    }
}

/// Sort a library error message into the embedding taxonomy.
fn classify(message: &str) -> EmbeddingError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("memory") || lower.contains("alloc") {
        EmbeddingError::Oom(message.to_string())
    } else {
        EmbeddingError::Inference(message.to_string())
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        let mut results = self.run_batch(vec![text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| EmbeddingError::Inference("model returned no embedding".into()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run_batch(texts.iter().map(|s| s.to_string()).collect())
            .await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}
