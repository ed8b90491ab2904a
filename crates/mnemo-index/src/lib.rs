//! Derived index for mnemo memories.
//!
//! A single SQLite file combining scalar rows, a sqlite-vec ANN table, and
//! an FTS5 table. Everything here is a cache over git notes and can be
//! rebuilt from them at any time.
//!
//! # Concurrency
//!
//! One connection, wrapped in a mutex; a single transaction is in flight
//! per process. WAL mode keeps concurrent readers cheap.

pub mod embed;
pub mod error;
pub mod fts;
pub mod store;
pub mod vector;

pub use embed::{Embedder, FailingEmbedder, MockEmbedder, SharedEmbedder};
#[cfg(feature = "local-embeddings")]
pub use embed::local::LocalEmbedder;
pub use error::{
    EmbeddingError, EmbeddingResult, IndexError, IndexErrorKind, IndexResult,
};
pub use store::{IndexStats, IndexStore, MemoryPatch, SearchFilters, VerificationReport};
pub use vector::DEFAULT_EMBEDDING_DIM;
