//! Shared types for the mnemo memory engine.
//!
//! Every other crate in the workspace consumes these value types: the
//! [`Memory`] record and its identifier, the closed [`Namespace`] set, the
//! status lifecycle, and the derived [`Pattern`] entity.

use chrono::{DateTime, Utc};

pub mod memory;
pub mod pattern;

pub use memory::{
    CommitInfo, HydratedMemory, HydrationLevel, IdParseError, Memory, MemoryId, MemoryResult,
    MemoryStatus, Namespace, UnknownNamespace,
};
pub use pattern::{Pattern, PatternStatus, PatternType};

/// Timestamp type used throughout the system.
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}
