//! Memory records, identifiers, and the namespace/status vocabularies.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

// ─────────────────────────────────────────────────────────────────────────────
// Namespace
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of memory namespaces.
///
/// Each namespace maps to a dedicated notes ref (`refs/notes/<prefix>/<ns>`)
/// and partitions the index. The set is fixed; free-form namespaces are
/// rejected at every ingress point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Inception,
    Elicitation,
    Research,
    Decisions,
    Progress,
    Blockers,
    Reviews,
    Learnings,
    Retrospective,
    Patterns,
}

impl Namespace {
    /// All namespaces, in declaration order.
    pub const ALL: [Namespace; 10] = [
        Namespace::Inception,
        Namespace::Elicitation,
        Namespace::Research,
        Namespace::Decisions,
        Namespace::Progress,
        Namespace::Blockers,
        Namespace::Reviews,
        Namespace::Learnings,
        Namespace::Retrospective,
        Namespace::Patterns,
    ];

    /// The canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Inception => "inception",
            Namespace::Elicitation => "elicitation",
            Namespace::Research => "research",
            Namespace::Decisions => "decisions",
            Namespace::Progress => "progress",
            Namespace::Blockers => "blockers",
            Namespace::Reviews => "reviews",
            Namespace::Learnings => "learnings",
            Namespace::Retrospective => "retrospective",
            Namespace::Patterns => "patterns",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string is not a member of the namespace set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown namespace '{0}' (valid: inception, elicitation, research, decisions, progress, blockers, reviews, learnings, retrospective, patterns)")]
pub struct UnknownNamespace(pub String);

impl FromStr for Namespace {
    type Err = UnknownNamespace;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Namespace::ALL
            .iter()
            .find(|ns| ns.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownNamespace(s.to_string()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle status of a memory.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MemoryStatus {
    #[default]
    Active,
    Resolved,
    Aging,
    Archived,
    Tombstone,
}

impl MemoryStatus {
    /// The canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryStatus::Active => "active",
            MemoryStatus::Resolved => "resolved",
            MemoryStatus::Aging => "aging",
            MemoryStatus::Archived => "archived",
            MemoryStatus::Tombstone => "tombstone",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    ///
    /// Forward transitions follow decay; `Archived` and `Tombstone` can be
    /// restored to `Active`. Self-transitions are always invalid.
    pub fn can_transition_to(&self, to: MemoryStatus) -> bool {
        use MemoryStatus::*;
        match (self, to) {
            (Active, Resolved) | (Active, Aging) | (Active, Archived) | (Active, Tombstone) => true,
            (Resolved, Aging) | (Resolved, Archived) | (Resolved, Tombstone) => true,
            (Aging, Archived) | (Aging, Tombstone) | (Aging, Active) => true,
            (Archived, Tombstone) | (Archived, Active) => true,
            (Tombstone, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MemoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(MemoryStatus::Active),
            "resolved" => Ok(MemoryStatus::Resolved),
            "aging" => Ok(MemoryStatus::Aging),
            "archived" => Ok(MemoryStatus::Archived),
            "tombstone" => Ok(MemoryStatus::Tombstone),
            other => Err(format!("unknown status '{other}'")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Id
// ─────────────────────────────────────────────────────────────────────────────

/// Stable memory identifier: `{namespace}:{commit_sha}:{ordinal}`.
///
/// The ordinal is the 0-based position of the memory's block within its
/// `(commit, namespace)` note, assigned at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryId {
    pub namespace: Namespace,
    pub commit_sha: String,
    pub ordinal: u32,
}

/// Error returned when a memory id string does not parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdParseError {
    #[error("memory id '{0}' is not of the form namespace:sha:ordinal")]
    Malformed(String),
    #[error(transparent)]
    Namespace(#[from] UnknownNamespace),
    #[error("memory id '{0}' has a non-numeric ordinal")]
    Ordinal(String),
    #[error("memory id '{0}' has an invalid commit sha")]
    Sha(String),
}

impl MemoryId {
    /// Build an id from parts.
    pub fn new(namespace: Namespace, commit_sha: impl Into<String>, ordinal: u32) -> Self {
        Self {
            namespace,
            commit_sha: commit_sha.into(),
            ordinal,
        }
    }

    /// Parse a `namespace:sha:ordinal` string.
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        let mut parts = s.splitn(3, ':');
        let (ns, sha, ord) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ns), Some(sha), Some(ord)) => (ns, sha, ord),
            _ => return Err(IdParseError::Malformed(s.to_string())),
        };
        let namespace: Namespace = ns.parse()?;
        if sha.len() < 4 || sha.len() > 64 || !sha.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdParseError::Sha(s.to_string()));
        }
        let ordinal: u32 = ord.parse().map_err(|_| IdParseError::Ordinal(s.to_string()))?;
        Ok(Self {
            namespace,
            commit_sha: sha.to_ascii_lowercase(),
            ordinal,
        })
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.commit_sha, self.ordinal)
    }
}

impl Serialize for MemoryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MemoryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MemoryId::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory
// ─────────────────────────────────────────────────────────────────────────────

/// A memory: one structured note block attached to a commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    pub commit_sha: String,
    /// Absolute canonical path of the owning repository.
    pub repo_path: PathBuf,
    pub namespace: Namespace,
    /// Single-line summary, at most 100 characters.
    pub summary: String,
    /// Markdown body, at most 100 KiB of UTF-8.
    pub content: String,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: MemoryStatus,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub relates_to: Vec<MemoryId>,
}

/// A memory plus its vector-search distance (lower is closer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryResult {
    pub memory: Memory,
    pub distance: f32,
}

// ─────────────────────────────────────────────────────────────────────────────
// Hydration
// ─────────────────────────────────────────────────────────────────────────────

/// Staged detail levels for loading a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HydrationLevel {
    /// Header metadata only.
    Summary,
    /// Metadata plus the note body read back from git.
    Full,
    /// Everything, plus file snapshots from the attached commit.
    Files,
}

/// A memory hydrated to some level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydratedMemory {
    pub memory: Memory,
    /// The markdown body as stored in git; `None` at `Summary` level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_body: Option<String>,
    /// Path → commit-time snapshot, present at `Files` level.
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub files: BTreeMap<String, Vec<u8>>,
    /// Non-fatal problems encountered while hydrating (missing objects,
    /// capped reads).
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<String>,
}

impl HydratedMemory {
    /// A summary-level hydration: metadata only.
    pub fn summary(memory: Memory) -> Self {
        Self {
            memory,
            full_body: None,
            files: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commit info
// ─────────────────────────────────────────────────────────────────────────────

/// Metadata about a commit, as reported by git.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub author: String,
    pub timestamp: Timestamp,
    pub subject: String,
    pub changed_paths: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_round_trip() {
        for ns in Namespace::ALL {
            assert_eq!(ns.as_str().parse::<Namespace>().unwrap(), ns);
        }
    }

    #[test]
    fn namespace_rejects_unknown() {
        assert!("sessions".parse::<Namespace>().is_err());
        assert!("".parse::<Namespace>().is_err());
        // Case sensitive, like the ref names they map to.
        assert!("Decisions".parse::<Namespace>().is_err());
    }

    #[test]
    fn status_transition_matrix() {
        use MemoryStatus::*;
        assert!(Active.can_transition_to(Resolved));
        assert!(Active.can_transition_to(Aging));
        assert!(Active.can_transition_to(Tombstone));
        assert!(!Active.can_transition_to(Active));
        assert!(Resolved.can_transition_to(Archived));
        assert!(!Resolved.can_transition_to(Active));
        assert!(Archived.can_transition_to(Active));
        assert!(Tombstone.can_transition_to(Active));
        assert!(!Tombstone.can_transition_to(Archived));
    }

    #[test]
    fn memory_id_parse_and_display() {
        let id = MemoryId::parse("decisions:abc1234:0").unwrap();
        assert_eq!(id.namespace, Namespace::Decisions);
        assert_eq!(id.commit_sha, "abc1234");
        assert_eq!(id.ordinal, 0);
        assert_eq!(id.to_string(), "decisions:abc1234:0");
    }

    #[test]
    fn memory_id_normalizes_sha_case() {
        let id = MemoryId::parse("blockers:ABC1234:2").unwrap();
        assert_eq!(id.commit_sha, "abc1234");
    }

    #[test]
    fn memory_id_rejects_malformed() {
        assert!(matches!(
            MemoryId::parse("decisions:abc1234"),
            Err(IdParseError::Malformed(_))
        ));
        assert!(matches!(
            MemoryId::parse("nope:abc1234:0"),
            Err(IdParseError::Namespace(_))
        ));
        assert!(matches!(
            MemoryId::parse("decisions:abc1234:x"),
            Err(IdParseError::Ordinal(_))
        ));
        assert!(matches!(
            MemoryId::parse("decisions:zzz:0"),
            Err(IdParseError::Sha(_))
        ));
        // Too short to be a sha prefix.
        assert!(MemoryId::parse("decisions:ab:0").is_err());
    }

    #[test]
    fn memory_id_serde_as_string() {
        let id = MemoryId::new(Namespace::Learnings, "def5678", 1);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"learnings:def5678:1\"");
        let back: MemoryId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
