//! Note block codec and git-notes storage for mnemo.
//!
//! Git is the authoritative store: every memory is a fenced block inside a
//! note under `refs/notes/<prefix>/<namespace>`. This crate owns the block
//! text format ([`codec`]) and the sanitized git facade ([`git`]); nothing
//! else in the workspace shells out to git or touches note text directly.

pub mod codec;
pub mod error;
pub mod git;

pub use codec::{
    count_blocks, decode, decode_lenient, dedup_tags, encode, join_blocks, validate, Block,
    NoteLimits, NoteMeta, MAX_HEADER_DEPTH,
};
pub use error::{ParseError, StorageError, StorageErrorKind, StorageResult, ValidationError};
pub use git::{validate_rel_path, validate_sha, FileBatch, FileReadLimits, GitNoteStore};
