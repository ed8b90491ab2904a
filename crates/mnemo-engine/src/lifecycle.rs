//! Temporal decay and status lifecycle.
//!
//! Memories cool down over time: active → aging → archived → tombstone,
//! with archival compressing the body in place and garbage collection
//! eventually dropping tombstoned rows from the index. Git notes are never
//! rewritten by any of this; the lifecycle is an index-side concern.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info};

use mnemo_config::Config;
use mnemo_index::{IndexStore, MemoryPatch, SearchFilters};
use mnemo_types::{Memory, MemoryId, MemoryStatus, Namespace, Timestamp};

use crate::error::{EngineError, EngineResult};

/// Marker prefix for compressed bodies stored in the index.
pub const ARCHIVED_PREFIX: &str = "gzip64:";

/// Gzip level used for archival.
const COMPRESSION_LEVEL: u32 = 6;

/// Decay below which an unaccessed active memory starts aging.
const MIN_RELEVANCE_FOR_ACTIVE: f64 = 0.5;

/// Floor applied to decay so very old memories never reach exactly zero.
const MIN_DECAY: f64 = 0.01;

/// Sweep page size.
const SWEEP_BATCH: usize = 1_000;

/// Exponential decay: `2^(-age_days / half_life_days)`.
///
/// Future timestamps clamp to age zero; the result is floored at
/// [`MIN_DECAY`].
pub fn decay(timestamp: Timestamp, half_life_days: f64, now: Timestamp) -> f64 {
    let age = age_days(timestamp, now);
    if half_life_days <= 0.0 {
        return MIN_DECAY;
    }
    (2f64).powf(-age / half_life_days).max(MIN_DECAY)
}

/// Age in fractional days; future timestamps count as zero.
pub fn age_days(timestamp: Timestamp, now: Timestamp) -> f64 {
    let seconds = (now - timestamp).num_seconds();
    if seconds <= 0 {
        0.0
    } else {
        seconds as f64 / 86_400.0
    }
}

/// Compress a body for archival storage.
pub fn compress_body(body: &str) -> String {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
    // Writing into a Vec cannot fail.
    encoder.write_all(body.as_bytes()).expect("gzip write");
    let compressed = encoder.finish().expect("gzip finish");
    format!("{ARCHIVED_PREFIX}{}", BASE64.encode(compressed))
}

/// Transparently decompress an archived body; non-archived text passes
/// through unchanged, as does text that fails to decode.
pub fn decompress_body(content: &str) -> String {
    let Some(encoded) = content.strip_prefix(ARCHIVED_PREFIX) else {
        return content.to_string();
    };
    let Ok(compressed) = BASE64.decode(encoded) else {
        return content.to_string();
    };
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = String::new();
    match decoder.read_to_string(&mut out) {
        Ok(_) => out,
        Err(_) => content.to_string(),
    }
}

/// Whether a stored body is in archived form.
pub fn is_archived_body(content: &str) -> bool {
    content.starts_with(ARCHIVED_PREFIX)
}

/// Counts from one lifecycle sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub examined: usize,
    pub aged: usize,
    pub archived: usize,
    pub tombstoned: usize,
}

/// Counts from a garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub candidates: usize,
    pub deleted: usize,
}

/// Drives decay-based status transitions over the index.
pub struct LifecycleEngine {
    index: Arc<IndexStore>,
    config: Config,
}

impl LifecycleEngine {
    pub fn new(index: Arc<IndexStore>, config: Config) -> Self {
        Self { index, config }
    }

    /// Apply a manual status transition, enforcing the transition matrix.
    pub fn transition(&self, id: &MemoryId, to: MemoryStatus) -> EngineResult<Memory> {
        let memory = self
            .index
            .get(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if !memory.status.can_transition_to(to) {
            return Err(mnemo_notes::ValidationError::InvalidTransition {
                from: memory.status,
                to,
            }
            .into());
        }

        let mut patch = MemoryPatch::status(to);
        match to {
            MemoryStatus::Archived if !is_archived_body(&memory.content) => {
                patch.body = Some(compress_body(&memory.content));
            }
            MemoryStatus::Tombstone => {
                // Header survives for dedup; the body is dropped.
                patch.body = Some(String::new());
            }
            MemoryStatus::Active if is_archived_body(&memory.content) => {
                patch.body = Some(decompress_body(&memory.content));
            }
            _ => {}
        }

        let updated = self
            .index
            .update(id, &patch)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        debug!(id = %id, from = %memory.status, to = %to, "lifecycle transition");
        Ok(updated)
    }

    /// Archive a memory now, compressing its body.
    pub fn archive(&self, id: &MemoryId) -> EngineResult<Memory> {
        self.transition(id, MemoryStatus::Archived)
    }

    /// Restore an archived or tombstoned memory to active.
    pub fn restore(&self, id: &MemoryId) -> EngineResult<Memory> {
        self.transition(id, MemoryStatus::Active)
    }

    /// Periodic sweep applying the decay-driven transition rules.
    pub fn sweep(&self, repo_path: Option<&Path>) -> EngineResult<SweepStats> {
        let now = mnemo_types::now();
        let half_life = self.config.decay_half_life_days;
        let mut stats = SweepStats::default();

        let list = |status: MemoryStatus| -> EngineResult<Vec<Memory>> {
            let filters = SearchFilters {
                repo_path: repo_path.map(Path::to_path_buf),
                status: Some(status),
                ..SearchFilters::default()
            };
            Ok(self.index.list_filtered(&filters, SWEEP_BATCH)?)
        };

        // active → aging: decayed and not recently touched.
        for memory in list(MemoryStatus::Active)? {
            stats.examined += 1;
            // Open blockers stay hot until resolved, no matter how old.
            if memory.namespace == Namespace::Blockers {
                continue;
            }
            if decay(memory.timestamp, half_life, now) >= MIN_RELEVANCE_FOR_ACTIVE {
                continue;
            }
            let last_access = self
                .index
                .last_accessed(&memory.id)?
                .unwrap_or(memory.timestamp);
            if age_days(last_access, now) < half_life {
                continue;
            }
            self.transition(&memory.id, MemoryStatus::Aging)?;
            stats.aged += 1;
        }

        // aging/resolved → archived after the archive threshold.
        for status in [MemoryStatus::Aging, MemoryStatus::Resolved] {
            for memory in list(status)? {
                stats.examined += 1;
                let age = age_days(memory.timestamp, now);
                if age >= self.config.gc_horizon_days {
                    self.transition(&memory.id, MemoryStatus::Tombstone)?;
                    stats.tombstoned += 1;
                } else if age >= self.config.archive_after_days {
                    self.transition(&memory.id, MemoryStatus::Archived)?;
                    stats.archived += 1;
                }
            }
        }

        // archived → tombstone at the GC horizon.
        for memory in list(MemoryStatus::Archived)? {
            stats.examined += 1;
            if age_days(memory.timestamp, now) >= self.config.gc_horizon_days {
                self.transition(&memory.id, MemoryStatus::Tombstone)?;
                stats.tombstoned += 1;
            }
        }

        info!(?stats, "lifecycle sweep complete");
        Ok(stats)
    }

    /// Physically delete tombstones older than the GC horizon.
    ///
    /// Only index rows are removed; git notes keep their history. Because
    /// incremental sync skips notes whose blob is unchanged, collected
    /// memories do not resurrect outside a full reindex.
    pub fn gc(&self, repo_path: Option<&Path>, dry_run: bool) -> EngineResult<GcStats> {
        let now = mnemo_types::now();
        let filters = SearchFilters {
            repo_path: repo_path.map(Path::to_path_buf),
            status: Some(MemoryStatus::Tombstone),
            ..SearchFilters::default()
        };

        let mut stats = GcStats::default();
        for memory in self.index.list_filtered(&filters, SWEEP_BATCH)? {
            if age_days(memory.timestamp, now) < self.config.gc_horizon_days {
                continue;
            }
            stats.candidates += 1;
            if !dry_run && self.index.delete(&memory.id)? {
                stats.deleted += 1;
            }
        }
        info!(?stats, dry_run, "garbage collection complete");
        Ok(stats)
    }
}
