//! Cross-memory pattern detection.
//!
//! Scans recent learnings, decisions, and retrospectives for recurring
//! term clusters. Each cluster becomes a candidate pattern whose
//! confidence grows with support, cohesion, and recency; promotion and
//! demotion move patterns through candidate → validated → promoted, with
//! demotion available from any live status.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use mnemo_config::Config;
use mnemo_index::{IndexStore, SearchFilters};
use mnemo_types::{Memory, MemoryId, Namespace, Pattern, PatternStatus, PatternType};

use crate::error::{EngineError, EngineResult};
use crate::lifecycle;

/// Minimum memories sharing a term before it seeds a candidate.
pub const MIN_OCCURRENCES_FOR_CANDIDATE: usize = 3;

/// Minimum confidence required to validate a candidate.
pub const MIN_CONFIDENCE_FOR_VALIDATION: f32 = 0.6;

/// Minimum supporting memories required to promote a validated pattern.
pub const MIN_OCCURRENCES_FOR_PROMOTION: usize = 5;

/// Detection returns at most this many candidates, best first.
pub const MAX_CANDIDATES: usize = 10;

/// Shortest term considered meaningful.
const MIN_TERM_LEN: usize = 3;

/// Default detection window in days.
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Evidence-overlap threshold for merging term groups into one cluster.
const CLUSTER_OVERLAP: f64 = 0.5;

/// Words carrying no pattern signal. Deliberately excludes technical
/// vocabulary: "database" or "timeout" are exactly what we want to catch.
const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "was", "one", "our", "out",
    "use", "has", "had", "have", "this", "that", "with", "from", "they", "been", "were", "when",
    "what", "will", "would", "there", "their", "which", "about", "into", "than", "then", "them",
    "these", "some", "could", "other", "after", "first", "also", "should", "because", "each",
    "between", "under", "over", "very", "just", "more", "most", "such", "only", "its", "it's",
    "did", "does", "doing", "done", "being", "both", "same", "still", "too", "how", "why", "who",
    "where", "while", "during", "before", "through", "any", "now", "new", "get", "got", "make",
    "made", "using", "used", "needs", "need", "way",
];

fn type_keywords(ty: PatternType) -> &'static [&'static str] {
    match ty {
        PatternType::Success => &[
            "works", "worked", "improved", "faster", "success", "solved", "fixed", "reliable",
            "effective", "clean",
        ],
        PatternType::Anti => &[
            "avoid", "bug", "fail", "failed", "broke", "broken", "regression", "mistake", "slow",
            "flaky", "leak", "wrong",
        ],
        PatternType::Workflow => &[
            "step", "steps", "process", "workflow", "sequence", "checklist", "routine", "order",
            "pipeline",
        ],
        PatternType::Decision => &[
            "chose", "choose", "decision", "decided", "selected", "tradeoff", "option", "versus",
            "alternative",
        ],
    }
}

/// Namespace-level classification hints, applied when keywords are
/// inconclusive.
fn namespace_hint(namespace: Namespace) -> Option<PatternType> {
    match namespace {
        Namespace::Decisions => Some(PatternType::Decision),
        Namespace::Retrospective => Some(PatternType::Workflow),
        Namespace::Learnings => Some(PatternType::Success),
        _ => None,
    }
}

/// Result of one detection run.
#[derive(Debug, Clone, Default)]
pub struct PatternDetection {
    pub candidates: Vec<Pattern>,
    /// Memories examined.
    pub scanned: usize,
}

impl PatternDetection {
    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn get_by_type(&self, ty: PatternType) -> Vec<&Pattern> {
        self.candidates
            .iter()
            .filter(|p| p.pattern_type == ty)
            .collect()
    }
}

/// Detects and manages patterns across memories.
pub struct PatternEngine {
    index: Arc<IndexStore>,
    config: Config,
    registry: Mutex<HashMap<String, Pattern>>,
}

impl PatternEngine {
    pub fn new(index: Arc<IndexStore>, config: Config) -> Self {
        Self {
            index,
            config,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Extract candidate terms from a memory: summary, body, and tags,
    /// lowercased, stop-words and short tokens dropped, first-seen order.
    pub fn extract_terms(memory: &Memory) -> Vec<String> {
        let text = format!(
            "{} {} {}",
            memory.summary,
            lifecycle::decompress_body(&memory.content),
            memory.tags.join(" ")
        );
        let mut seen = BTreeSet::new();
        let mut terms = Vec::new();
        for token in text.split(|c: char| !c.is_alphanumeric()) {
            let term = token.to_lowercase();
            if term.len() < MIN_TERM_LEN || STOP_WORDS.contains(&term.as_str()) {
                continue;
            }
            if seen.insert(term.clone()) {
                terms.push(term);
            }
        }
        terms
    }

    /// Detect candidate patterns over the recent window.
    pub fn detect(&self, window_days: Option<i64>) -> EngineResult<PatternDetection> {
        let since = mnemo_types::now()
            - chrono::Duration::days(window_days.unwrap_or(DEFAULT_WINDOW_DAYS));

        let mut memories = Vec::new();
        for namespace in [
            Namespace::Learnings,
            Namespace::Decisions,
            Namespace::Retrospective,
        ] {
            let filters = SearchFilters {
                namespace: Some(namespace),
                since: Some(since),
                ..SearchFilters::default()
            };
            memories.extend(self.index.list_filtered(&filters, 1_000)?);
        }

        let detection = self.detect_in(&memories);
        info!(
            scanned = detection.scanned,
            candidates = detection.candidate_count(),
            "pattern detection complete"
        );
        Ok(detection)
    }

    /// Pure detection over an explicit memory set.
    pub fn detect_in(&self, memories: &[Memory]) -> PatternDetection {
        let scanned = memories.len();
        if scanned < MIN_OCCURRENCES_FOR_CANDIDATE {
            return PatternDetection {
                candidates: Vec::new(),
                scanned,
            };
        }

        // Term → the memories mentioning it.
        let mut term_evidence: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
        for (doc, memory) in memories.iter().enumerate() {
            for term in Self::extract_terms(memory) {
                term_evidence.entry(term).or_default().insert(doc);
            }
        }
        term_evidence.retain(|_, docs| docs.len() >= MIN_OCCURRENCES_FOR_CANDIDATE);

        // Greedy clustering: highest-support term seeds a cluster; later
        // terms join the first cluster they overlap enough with.
        let mut ordered: Vec<(String, BTreeSet<usize>)> = term_evidence.into_iter().collect();
        ordered.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then(a.0.cmp(&b.0)));

        struct Cluster {
            terms: Vec<String>,
            seed_evidence: BTreeSet<usize>,
            evidence: BTreeSet<usize>,
        }
        let mut clusters: Vec<Cluster> = Vec::new();
        for (term, docs) in ordered {
            match clusters
                .iter_mut()
                .find(|c| jaccard(&c.seed_evidence, &docs) >= CLUSTER_OVERLAP)
            {
                Some(cluster) => {
                    cluster.terms.push(term);
                    cluster.evidence.extend(docs.iter().copied());
                }
                None => clusters.push(Cluster {
                    terms: vec![term],
                    seed_evidence: docs.clone(),
                    evidence: docs,
                }),
            }
        }

        let now = mnemo_types::now();
        let half_life = self.config.decay_half_life_days;
        let mut candidates: Vec<Pattern> = clusters
            .into_iter()
            .map(|cluster| {
                let evidence_ids: Vec<MemoryId> = cluster
                    .evidence
                    .iter()
                    .map(|&doc| memories[doc].id.clone())
                    .collect();
                let support = evidence_ids.len();

                let cohesion = if cluster.terms.len() <= 1 {
                    1.0
                } else {
                    cluster.seed_evidence.len() as f64 / cluster.evidence.len() as f64
                };
                let recency: f64 = cluster
                    .evidence
                    .iter()
                    .map(|&doc| lifecycle::decay(memories[doc].timestamp, half_life, now))
                    .sum::<f64>()
                    / support.max(1) as f64;
                let support_factor = support as f64 / (support as f64 + 3.0);
                let confidence =
                    (support_factor * 0.7 + cohesion * 0.15 + recency * 0.15).clamp(0.0, 1.0);

                let namespaces: Vec<Namespace> = cluster
                    .evidence
                    .iter()
                    .map(|&doc| memories[doc].namespace)
                    .collect();
                let pattern_type = classify(&cluster.terms, &namespaces);

                let name = cluster
                    .terms
                    .iter()
                    .take(3)
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("-");

                Pattern {
                    name,
                    pattern_type,
                    confidence: confidence as f32,
                    status: PatternStatus::Candidate,
                    evidence: evidence_ids,
                    terms: cluster.terms,
                    detected_at: now,
                }
            })
            .collect();

        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        candidates.truncate(MAX_CANDIDATES);
        debug!(candidates = candidates.len(), "clustered patterns");

        PatternDetection {
            candidates,
            scanned,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registry and lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Track a pattern for lifecycle management.
    pub fn register(&self, pattern: Pattern) {
        self.registry
            .lock()
            .unwrap()
            .insert(pattern.name.clone(), pattern);
    }

    pub fn get(&self, name: &str) -> Option<Pattern> {
        self.registry.lock().unwrap().get(name).cloned()
    }

    /// Registered patterns, optionally filtered, highest confidence first.
    pub fn list(
        &self,
        status: Option<PatternStatus>,
        pattern_type: Option<PatternType>,
    ) -> Vec<Pattern> {
        let mut patterns: Vec<Pattern> = self
            .registry
            .lock()
            .unwrap()
            .values()
            .filter(|p| status.is_none_or(|s| p.status == s))
            .filter(|p| pattern_type.is_none_or(|t| p.pattern_type == t))
            .cloned()
            .collect();
        patterns.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        patterns
    }

    /// Candidate → validated, gated on confidence.
    pub fn validate(&self, name: &str) -> EngineResult<Pattern> {
        self.set_status(name, |pattern| {
            if pattern.status != PatternStatus::Candidate {
                return Err(format!(
                    "only candidates can be validated (status is {})",
                    pattern.status
                ));
            }
            if pattern.confidence < MIN_CONFIDENCE_FOR_VALIDATION {
                return Err(format!(
                    "confidence {:.2} below validation threshold {MIN_CONFIDENCE_FOR_VALIDATION}",
                    pattern.confidence
                ));
            }
            Ok(PatternStatus::Validated)
        })
    }

    /// Validated → promoted, gated on support.
    pub fn promote(&self, name: &str) -> EngineResult<Pattern> {
        self.set_status(name, |pattern| {
            if pattern.status != PatternStatus::Validated {
                return Err(format!(
                    "only validated patterns can be promoted (status is {})",
                    pattern.status
                ));
            }
            if pattern.occurrence_count() < MIN_OCCURRENCES_FOR_PROMOTION {
                return Err(format!(
                    "support {} below promotion threshold {MIN_OCCURRENCES_FOR_PROMOTION}",
                    pattern.occurrence_count()
                ));
            }
            Ok(PatternStatus::Promoted)
        })
    }

    /// Demote a contradicted pattern, from any status except demoted.
    pub fn demote(&self, name: &str) -> EngineResult<Pattern> {
        self.set_status(name, |pattern| {
            if pattern.status == PatternStatus::Demoted {
                return Err("pattern is already demoted".to_string());
            }
            Ok(PatternStatus::Demoted)
        })
    }

    fn set_status<F>(&self, name: &str, gate: F) -> EngineResult<Pattern>
    where
        F: FnOnce(&Pattern) -> Result<PatternStatus, String>,
    {
        let mut registry = self.registry.lock().unwrap();
        let pattern = registry
            .get_mut(name)
            .ok_or_else(|| EngineError::NotFound(format!("pattern '{name}'")))?;
        let next = gate(pattern).map_err(EngineError::PatternRejected)?;
        pattern.status = next;
        Ok(pattern.clone())
    }
}

fn jaccard(a: &BTreeSet<usize>, b: &BTreeSet<usize>) -> f64 {
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

/// Classify a cluster by keyword hits, falling back to namespace hints.
fn classify(terms: &[String], namespaces: &[Namespace]) -> PatternType {
    let mut scores: BTreeMap<PatternType, usize> = BTreeMap::new();
    for ty in [
        PatternType::Success,
        PatternType::Anti,
        PatternType::Workflow,
        PatternType::Decision,
    ] {
        let keywords = type_keywords(ty);
        let hits = terms
            .iter()
            .filter(|term| keywords.contains(&term.as_str()))
            .count();
        if hits > 0 {
            scores.insert(ty, hits);
        }
    }
    if let Some((&ty, _)) = scores.iter().max_by_key(|(_, &hits)| hits) {
        return ty;
    }

    // No keyword signal; majority namespace hint decides.
    let mut hint_counts: BTreeMap<PatternType, usize> = BTreeMap::new();
    for namespace in namespaces {
        if let Some(ty) = namespace_hint(*namespace) {
            *hint_counts.entry(ty).or_default() += 1;
        }
    }
    hint_counts
        .into_iter()
        .max_by_key(|&(_, n)| n)
        .map(|(ty, _)| ty)
        .unwrap_or(PatternType::Workflow)
}
