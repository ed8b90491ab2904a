//! One-stop construction of the engine set.
//!
//! Handles are built once per process and passed by reference; there is no
//! hidden global state.

use std::path::Path;
use std::sync::Arc;

use mnemo_config::Config;
use mnemo_index::{IndexStore, SharedEmbedder};
use mnemo_notes::GitNoteStore;

use crate::capture::CaptureEngine;
use crate::error::EngineResult;
use crate::lifecycle::LifecycleEngine;
use crate::patterns::PatternEngine;
use crate::recall::RecallEngine;
use crate::sync::SyncEngine;

/// The full engine set over one repository and the shared index.
pub struct Engines {
    pub git: Arc<GitNoteStore>,
    pub index: Arc<IndexStore>,
    pub capture: CaptureEngine,
    pub recall: RecallEngine,
    pub sync: SyncEngine,
    pub lifecycle: LifecycleEngine,
    pub patterns: PatternEngine,
}

impl Engines {
    /// Open every store and wire the engines together.
    ///
    /// Ensures the data directory layout, verifies the repository, makes
    /// sure notes refspecs are configured, and initializes the vector
    /// table at the embedder's dimension (a mismatch with an existing
    /// index is a hard error).
    pub async fn open(
        repo: &Path,
        config: Config,
        embedder: SharedEmbedder,
    ) -> EngineResult<Self> {
        config
            .layout()
            .ensure()
            .map_err(mnemo_notes::StorageError::Io)?;

        let git = Arc::new(
            GitNoteStore::open(repo, &config.git_prefix, config.subprocess_timeout()).await?,
        );
        git.ensure_sync_config().await?;

        let index = Arc::new(IndexStore::open(config.layout().index_db())?);
        index.init_vectors(embedder.dimensions(), embedder.name())?;

        Ok(Self::assemble(git, index, embedder, config))
    }

    /// Wire engines over already-opened stores (tests use an in-memory
    /// index here).
    pub fn assemble(
        git: Arc<GitNoteStore>,
        index: Arc<IndexStore>,
        embedder: SharedEmbedder,
        config: Config,
    ) -> Self {
        Self {
            capture: CaptureEngine::new(
                git.clone(),
                index.clone(),
                embedder.clone(),
                config.clone(),
            ),
            recall: RecallEngine::new(
                git.clone(),
                index.clone(),
                embedder.clone(),
                config.clone(),
            ),
            sync: SyncEngine::new(git.clone(), index.clone(), embedder.clone(), config.clone()),
            lifecycle: LifecycleEngine::new(index.clone(), config.clone()),
            patterns: PatternEngine::new(index.clone(), config),
            git,
            index,
        }
    }
}
