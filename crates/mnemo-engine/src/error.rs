//! Engine-level error aggregation.

use thiserror::Error;

use mnemo_index::{EmbeddingError, IndexError};
use mnemo_notes::{ParseError, StorageError, ValidationError};

/// Every failure an engine operation can surface.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller-correctable input problem; no side effects occurred.
    #[error("validation failed on {}: {0}", .0.field())]
    Validation(#[from] ValidationError),

    /// A note failed to parse.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// Git or filesystem failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Index store failure.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Embedding failure that could not be degraded around.
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    /// The per-repo capture lock could not be acquired in time.
    #[error("could not acquire capture lock within {waited_ms}ms")]
    LockTimeout { waited_ms: u64 },

    /// Git and index disagree in a way that needs manual attention.
    #[error("stores are inconsistent: {0}")]
    Inconsistent(String),

    /// A pattern lifecycle gate refused the transition.
    #[error("pattern operation rejected: {0}")]
    PatternRejected(String),

    /// The requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

impl EngineError {
    /// Process exit code for the CLI surface.
    ///
    /// 0 success, 2 usage/validation, 3 storage/git, 4 index,
    /// 5 embedding, 6 lock timeout.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Validation(_)
            | EngineError::Parse(_)
            | EngineError::NotFound(_)
            | EngineError::PatternRejected(_) => 2,
            EngineError::Storage(_) => 3,
            EngineError::Index(_) | EngineError::Inconsistent(_) => 4,
            EngineError::Embedding(_) => 5,
            EngineError::LockTimeout { .. } => 6,
        }
    }

    /// Operator guidance for this failure.
    pub fn recovery_action(&self) -> String {
        match self {
            EngineError::Validation(e) => format!("correct the '{}' field and retry", e.field()),
            EngineError::Parse(_) => {
                "the note text is malformed; `mnemo sync verify` lists affected notes".into()
            }
            EngineError::Storage(e) => e.recovery_action().into(),
            EngineError::Index(e) => e.recovery_action().into(),
            EngineError::Embedding(e) => e.recovery_action().into(),
            EngineError::LockTimeout { .. } => {
                "another capture is in flight; retry, or remove a stale .capture.lock".into()
            }
            EngineError::Inconsistent(_) => "run `mnemo sync verify --repair`".into(),
            EngineError::PatternRejected(_) => {
                "gather more supporting memories, then retry the transition".into()
            }
            EngineError::NotFound(_) => "check the id and retry".into(),
        }
    }
}

/// Result alias for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
