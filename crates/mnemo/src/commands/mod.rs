//! CLI command implementations.

pub mod capture;
pub mod gc;
pub mod recall;
pub mod search;
pub mod status;
pub mod sync;

use std::path::PathBuf;
use std::sync::Arc;

use mnemo_config::Config;
use mnemo_engine::{EngineResult, Engines};
use mnemo_index::SharedEmbedder;

/// Shared command context resolved from global flags.
pub struct Context {
    pub json: bool,
    pub verbose: bool,
    pub repo: PathBuf,
    pub config: Config,
}

impl Context {
    /// Build the embedder the binary was compiled for.
    fn embedder(&self) -> SharedEmbedder {
        #[cfg(feature = "local-embeddings")]
        {
            Arc::new(mnemo_index::LocalEmbedder::new(
                self.config.embedding_model.clone(),
                self.config.embedding_dim,
                self.config.layout().models_dir(),
            ))
        }
        #[cfg(not(feature = "local-embeddings"))]
        {
            // No model compiled in: captures and text search still work,
            // vector rows are filled by a sync from a build that has one.
            Arc::new(mnemo_index::FailingEmbedder::new(self.config.embedding_dim))
        }
    }

    /// Open the full engine set for this invocation.
    pub async fn engines(&self) -> EngineResult<Engines> {
        Engines::open(&self.repo, self.config.clone(), self.embedder()).await
    }
}

/// Clip text for one-line terminal output.
pub fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        format!("{clipped}…")
    }
}
