//! Derived pattern entities.
//!
//! A pattern summarizes a cluster of related memories. It is stored as a
//! regular memory in the `patterns` namespace; the extra fields here ride in
//! the note header.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::memory::MemoryId;
use crate::Timestamp;

/// Kind of pattern detected across memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// A practice that repeatedly worked.
    Success,
    /// A practice that repeatedly caused trouble.
    Anti,
    /// A recurring sequence of steps.
    Workflow,
    /// A recurring decision shape.
    Decision,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Success => "success",
            PatternType::Anti => "anti",
            PatternType::Workflow => "workflow",
            PatternType::Decision => "decision",
        }
    }
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PatternType::Success),
            "anti" => Ok(PatternType::Anti),
            "workflow" => Ok(PatternType::Workflow),
            "decision" => Ok(PatternType::Decision),
            other => Err(format!("unknown pattern type '{other}'")),
        }
    }
}

/// Validation lifecycle of a pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternStatus {
    /// Freshly detected, not yet reviewed.
    #[default]
    Candidate,
    /// Confirmed by review or sufficient support.
    Validated,
    /// Actively recommended.
    Promoted,
    /// Contradicted; kept for the record.
    Demoted,
}

impl PatternStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternStatus::Candidate => "candidate",
            PatternStatus::Validated => "validated",
            PatternStatus::Promoted => "promoted",
            PatternStatus::Demoted => "demoted",
        }
    }
}

impl fmt::Display for PatternStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected pattern with its supporting evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Short slug naming the pattern, derived from its top terms.
    pub name: String,
    pub pattern_type: PatternType,
    /// Cohesion-and-size confidence in `[0, 1]`.
    pub confidence: f32,
    pub status: PatternStatus,
    /// Memories that contributed to this pattern.
    pub evidence: Vec<MemoryId>,
    /// Highest-weight terms shared across the cluster.
    pub terms: Vec<String>,
    pub detected_at: Timestamp,
}

impl Pattern {
    /// Number of contributing memories.
    pub fn occurrence_count(&self) -> usize {
        self.evidence.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Namespace;

    #[test]
    fn pattern_type_round_trip() {
        for ty in [
            PatternType::Success,
            PatternType::Anti,
            PatternType::Workflow,
            PatternType::Decision,
        ] {
            assert_eq!(ty.as_str().parse::<PatternType>().unwrap(), ty);
        }
    }

    #[test]
    fn occurrence_count_tracks_evidence() {
        let pattern = Pattern {
            name: "retry-backoff".into(),
            pattern_type: PatternType::Success,
            confidence: 0.8,
            status: PatternStatus::Candidate,
            evidence: vec![
                MemoryId::new(Namespace::Learnings, "abc1234", 0),
                MemoryId::new(Namespace::Learnings, "def5678", 1),
            ],
            terms: vec!["retry".into(), "backoff".into()],
            detected_at: crate::now(),
        };
        assert_eq!(pattern.occurrence_count(), 2);
    }
}
