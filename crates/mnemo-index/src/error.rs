//! Error types for the index store and embedder.

use thiserror::Error;

/// Sub-kind of an index failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexErrorKind {
    Schema,
    Migration,
    Corrupt,
    Constraint,
    Txn,
}

/// Errors from the embedded index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Schema creation or shape problem, including embedding dimension
    /// mismatches against the stored configuration.
    #[error("schema error: {0}")]
    Schema(String),

    /// A forward migration failed; the version row is unchanged.
    #[error("migration to version {version} failed: {reason}")]
    Migration { version: i32, reason: String },

    /// The database file failed its integrity check.
    #[error("index database is corrupt: {0}")]
    Corrupt(String),

    /// A row violated an invariant (duplicate id, wrong dimension, missing
    /// repo_path).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A transaction could not complete.
    #[error("transaction error: {0}")]
    Txn(String),

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row contents failed to serialize/deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IndexError {
    pub fn kind(&self) -> IndexErrorKind {
        match self {
            IndexError::Schema(_) => IndexErrorKind::Schema,
            IndexError::Migration { .. } => IndexErrorKind::Migration,
            IndexError::Corrupt(_) => IndexErrorKind::Corrupt,
            IndexError::Constraint(_) => IndexErrorKind::Constraint,
            IndexError::Txn(_) | IndexError::Database(_) | IndexError::Serialization(_) => {
                IndexErrorKind::Txn
            }
        }
    }

    /// Operator guidance for this failure.
    pub fn recovery_action(&self) -> &'static str {
        match self {
            IndexError::Corrupt(_) => {
                "the index is a derived cache; run `mnemo sync full` to rebuild it from git"
            }
            IndexError::Schema(_) | IndexError::Migration { .. } => {
                "run `mnemo sync full` to rebuild the index at the current schema"
            }
            IndexError::Constraint(_) => "fix the offending input and retry",
            IndexError::Txn(_) | IndexError::Database(_) | IndexError::Serialization(_) => {
                "retry; if it persists, run `mnemo sync verify --repair`"
            }
        }
    }
}

/// Result alias for index operations.
pub type IndexResult<T> = std::result::Result<T, IndexError>;

/// Errors from embedding text.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The model failed to load or download.
    #[error("embedding model failed to load: {0}")]
    Load(String),

    /// The process ran out of memory during inference.
    #[error("embedding ran out of memory: {0}")]
    Oom(String),

    /// Inference failed for any other reason.
    #[error("embedding inference failed: {0}")]
    Inference(String),
}

impl EmbeddingError {
    /// Operator guidance for this failure.
    pub fn recovery_action(&self) -> &'static str {
        match self {
            EmbeddingError::Load(_) => {
                "check the model cache under the data dir; captures still succeed without vectors"
            }
            EmbeddingError::Oom(_) => "reduce batch size or free memory, then run `mnemo sync`",
            EmbeddingError::Inference(_) => {
                "retry; memories captured meanwhile are indexed by `mnemo sync`"
            }
        }
    }
}

/// Result alias for embedding operations.
pub type EmbeddingResult<T> = std::result::Result<T, EmbeddingError>;
