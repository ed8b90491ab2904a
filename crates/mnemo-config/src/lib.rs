//! Configuration for the mnemo memory engine.
//!
//! Provides the typed [`Config`] with every tunable knob and the
//! [`DataDirLayout`] describing where state lives on disk. Values resolve
//! from environment variables (`MNEMO_*`) over built-in defaults; parsing a
//! configuration file is a caller concern.

pub mod paths;

pub use paths::DataDirLayout;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine configuration.
///
/// All durations are stored in their natural units and exposed as
/// [`Duration`] through accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for the index, models, locks, and repair hints.
    /// Default: `~/.local/share/mnemo`.
    pub data_dir: Option<PathBuf>,
    /// Root under `refs/notes/` for memory refs.
    pub git_prefix: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Embedding vector dimension; fixed per index.
    pub embedding_dim: usize,
    /// Maximum note body size in bytes.
    pub max_content_bytes: usize,
    /// Maximum summary length in characters.
    pub max_summary_chars: usize,
    /// Maximum file snapshots loaded per hydration.
    pub max_hydration_files: usize,
    /// Maximum bytes read per file snapshot.
    pub max_file_bytes: usize,
    /// Capture lock acquisition deadline in milliseconds.
    pub capture_lock_timeout_ms: u64,
    /// Wall-clock timeout for every git subprocess in milliseconds.
    pub subprocess_timeout_ms: u64,
    /// Temporal decay half-life in days.
    pub decay_half_life_days: f64,
    /// Age at which non-blocker memories are archived, in days.
    pub archive_after_days: f64,
    /// Age past which tombstones are garbage collected, in days.
    pub gc_horizon_days: f64,
    /// Recall cache entry time-to-live in milliseconds.
    pub recall_cache_ttl_ms: u64,
    /// Recall cache capacity in entries.
    pub recall_cache_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: None,
            git_prefix: "mem".into(),
            embedding_model: "all-MiniLM-L6-v2".into(),
            embedding_dim: 384,
            max_content_bytes: 102_400,
            max_summary_chars: 100,
            max_hydration_files: 20,
            max_file_bytes: 102_400,
            capture_lock_timeout_ms: 5_000,
            subprocess_timeout_ms: 30_000,
            decay_half_life_days: 30.0,
            archive_after_days: 90.0,
            gc_horizon_days: 365.0,
            recall_cache_ttl_ms: 300_000,
            recall_cache_entries: 100,
        }
    }
}

impl Config {
    /// Build a config from defaults overlaid with `MNEMO_*` environment
    /// variables.
    ///
    /// Unparseable values fall back to the default rather than failing:
    /// configuration must never make the engine unusable.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Ok(dir) = std::env::var("MNEMO_DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }
        if let Ok(prefix) = std::env::var("MNEMO_GIT_PREFIX") {
            if !prefix.is_empty() {
                config.git_prefix = prefix;
            }
        }
        if let Ok(model) = std::env::var("MNEMO_EMBEDDING_MODEL") {
            if !model.is_empty() {
                config.embedding_model = model;
            }
        }
        env_parse(&mut config.embedding_dim, "MNEMO_EMBEDDING_DIM");
        env_parse(&mut config.max_content_bytes, "MNEMO_MAX_CONTENT_BYTES");
        env_parse(&mut config.max_summary_chars, "MNEMO_MAX_SUMMARY_CHARS");
        env_parse(&mut config.max_hydration_files, "MNEMO_MAX_HYDRATION_FILES");
        env_parse(&mut config.max_file_bytes, "MNEMO_MAX_FILE_BYTES");
        env_parse(
            &mut config.capture_lock_timeout_ms,
            "MNEMO_CAPTURE_LOCK_TIMEOUT_MS",
        );
        env_parse(
            &mut config.subprocess_timeout_ms,
            "MNEMO_SUBPROCESS_TIMEOUT_MS",
        );
        env_parse(&mut config.decay_half_life_days, "MNEMO_DECAY_HALF_LIFE_DAYS");
        env_parse(&mut config.archive_after_days, "MNEMO_ARCHIVE_AFTER_DAYS");
        env_parse(&mut config.gc_horizon_days, "MNEMO_GC_HORIZON_DAYS");
        env_parse(&mut config.recall_cache_ttl_ms, "MNEMO_RECALL_CACHE_TTL_MS");
        env_parse(
            &mut config.recall_cache_entries,
            "MNEMO_RECALL_CACHE_ENTRIES",
        );

        config
    }

    /// The effective data directory.
    ///
    /// Resolution order: explicit `data_dir`, `MNEMO_DATA_DIR` (already
    /// folded in by [`Config::from_env`]), then the platform data dir.
    pub fn effective_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("mnemo")
        })
    }

    /// Filesystem layout rooted at the effective data dir.
    pub fn layout(&self) -> DataDirLayout {
        DataDirLayout::new(self.effective_data_dir())
    }

    /// Fully qualified notes ref for a namespace,
    /// e.g. `refs/notes/mem/decisions`.
    pub fn notes_ref(&self, namespace: &str) -> String {
        format!("refs/notes/{}/{}", self.git_prefix, namespace)
    }

    /// Refspec that moves all memory notes alongside code.
    pub fn notes_refspec(&self) -> String {
        format!(
            "+refs/notes/{prefix}/*:refs/notes/{prefix}/*",
            prefix = self.git_prefix
        )
    }

    pub fn capture_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_lock_timeout_ms)
    }

    pub fn subprocess_timeout(&self) -> Duration {
        Duration::from_millis(self.subprocess_timeout_ms)
    }

    pub fn recall_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.recall_cache_ttl_ms)
    }
}

/// Overwrite `slot` with the parsed value of `var`, if set and valid.
fn env_parse<T: std::str::FromStr>(slot: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse() {
            *slot = value;
        }
    }
}
