//! Error types for note parsing, validation, and git storage.

use thiserror::Error;

/// Errors raised while parsing note text into blocks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Input was empty or whitespace only.
    #[error("note content is empty")]
    Empty,

    /// No opening `---` fence was found.
    #[error("note has no front matter fence")]
    MissingFrontMatter,

    /// An opening fence was never closed.
    #[error("front matter fence opened at line {line} is never closed")]
    UnclosedHeader { line: usize },

    /// The header is not valid YAML.
    #[error("front matter is not valid yaml: {0}")]
    InvalidYaml(String),

    /// The header parsed but is not a mapping.
    #[error("front matter must be a yaml mapping")]
    NotAMapping,

    /// The header nests deeper than the allowed limit.
    #[error("front matter nesting depth {depth} exceeds limit {limit}")]
    DepthExceeded { depth: usize, limit: usize },

    /// A required header field is absent.
    #[error("front matter is missing required field '{0}'")]
    MissingField(&'static str),

    /// A header field has the wrong shape or an invalid value.
    #[error("front matter field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Input bytes were not valid UTF-8.
    #[error("note content is not valid utf-8")]
    InvalidUtf8,
}

/// Field-specific validation failures for memory ingress.
///
/// These are caller-correctable and never leave side effects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("summary is empty")]
    EmptySummary,

    #[error("summary is {len} characters, maximum is {max}")]
    SummaryTooLong { len: usize, max: usize },

    #[error("summary must be a single line")]
    SummaryMultiline,

    #[error("content is {bytes} bytes, maximum is {max}")]
    ContentTooLarge { bytes: usize, max: usize },

    #[error(transparent)]
    UnknownNamespace(#[from] mnemo_types::UnknownNamespace),

    #[error("spec '{0}' contains non-printable characters")]
    InvalidSpec(String),

    #[error("tag '{0}' contains non-printable characters")]
    InvalidTag(String),

    #[error("status transition {from} -> {to} is not allowed")]
    InvalidTransition {
        from: mnemo_types::MemoryStatus,
        to: mnemo_types::MemoryStatus,
    },

    #[error("file path '{path}' is rejected: {reason}")]
    InvalidPath { path: String, reason: String },
}

impl ValidationError {
    /// Name of the offending field, for structured error output.
    pub fn field(&self) -> &'static str {
        match self {
            ValidationError::EmptySummary
            | ValidationError::SummaryTooLong { .. }
            | ValidationError::SummaryMultiline => "summary",
            ValidationError::ContentTooLarge { .. } => "content",
            ValidationError::UnknownNamespace(_) => "namespace",
            ValidationError::InvalidSpec(_) => "spec",
            ValidationError::InvalidTag(_) => "tags",
            ValidationError::InvalidTransition { .. } => "status",
            ValidationError::InvalidPath { .. } => "path",
        }
    }
}

/// Sub-kind of a storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    Timeout,
    NotAGitRepo,
    RefInvalid,
    Exec,
    Io,
}

/// Errors from git subprocesses and surrounding I/O.
#[derive(Debug, Error)]
pub enum StorageError {
    /// A git invocation exceeded its wall-clock budget.
    #[error("git {command} timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    /// The target directory is not inside a git work tree.
    #[error("'{0}' is not a git repository")]
    NotAGitRepo(String),

    /// A ref, sha, or path failed sanitization.
    #[error("invalid ref or path '{value}': {reason}")]
    RefInvalid { value: String, reason: String },

    /// git exited non-zero.
    #[error("git {command} failed: {stderr}")]
    Exec { command: String, stderr: String },

    /// Plain I/O failure talking to the subprocess or filesystem.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::Timeout { .. } => StorageErrorKind::Timeout,
            StorageError::NotAGitRepo(_) => StorageErrorKind::NotAGitRepo,
            StorageError::RefInvalid { .. } => StorageErrorKind::RefInvalid,
            StorageError::Exec { .. } => StorageErrorKind::Exec,
            StorageError::Io(_) => StorageErrorKind::Io,
        }
    }

    /// Operator guidance for this failure.
    pub fn recovery_action(&self) -> &'static str {
        match self {
            StorageError::Timeout { .. } => {
                "retry; if it persists, check repository size and disk health"
            }
            StorageError::NotAGitRepo(_) => "run inside a git repository or pass --repo",
            StorageError::RefInvalid { .. } => {
                "use a 4-64 character hex commit sha and plain relative paths"
            }
            StorageError::Exec { .. } => "inspect the git error output above",
            StorageError::Io(_) => "check permissions and free disk space",
        }
    }
}

/// Result alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
