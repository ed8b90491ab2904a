//! Note block codec.
//!
//! A memory is serialized as a `---` fenced YAML header followed by a blank
//! line and a markdown body. A single git note may hold several blocks
//! concatenated in append order, separated by one blank line; the block
//! index within its note is the memory's ordinal.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::Serialize;

use mnemo_types::{MemoryId, MemoryStatus, Namespace, Timestamp};

use crate::error::{ParseError, ValidationError};

/// Maximum nesting depth tolerated inside a block header.
///
/// Deeper structures are rejected rather than parsed, as protection against
/// pathological inputs.
pub const MAX_HEADER_DEPTH: usize = 8;

/// Size limits enforced at ingress.
#[derive(Debug, Clone, Copy)]
pub struct NoteLimits {
    pub max_summary_chars: usize,
    pub max_content_bytes: usize,
}

impl Default for NoteLimits {
    fn default() -> Self {
        Self {
            max_summary_chars: 100,
            max_content_bytes: 102_400,
        }
    }
}

/// The structured header of a memory block.
///
/// This is the full memory header minus `repo_path`, which is derived from
/// where the note lives rather than stored in it.
#[derive(Debug, Clone, PartialEq)]
pub struct NoteMeta {
    pub namespace: Namespace,
    pub timestamp: Timestamp,
    pub summary: String,
    pub spec: Option<String>,
    pub phase: Option<String>,
    pub tags: Vec<String>,
    pub status: MemoryStatus,
    pub relates_to: Vec<MemoryId>,
}

impl NoteMeta {
    /// A minimal header with the required fields.
    pub fn new(namespace: Namespace, summary: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            namespace,
            timestamp,
            summary: summary.into(),
            spec: None,
            phase: None,
            tags: Vec::new(),
            status: MemoryStatus::Active,
            relates_to: Vec::new(),
        }
    }
}

/// One decoded block: header plus markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub meta: NoteMeta,
    pub body: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Encoding
// ─────────────────────────────────────────────────────────────────────────────

/// Serialized shape of the header. Field order here is the on-disk order.
#[derive(Serialize)]
struct HeaderSer<'a> {
    #[serde(rename = "type")]
    namespace: Namespace,
    timestamp: String,
    summary: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    spec: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    tags: &'a [String],
    status: MemoryStatus,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    relates_to: &'a [MemoryId],
}

/// Encode a header and body into block text.
///
/// Deterministic: fields are emitted in a fixed order and empty optional
/// fields are omitted entirely. The body is stored with trailing whitespace
/// trimmed; an empty body produces a bare header block.
pub fn encode(meta: &NoteMeta, body: &str) -> String {
    let header = HeaderSer {
        namespace: meta.namespace,
        timestamp: meta
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        summary: &meta.summary,
        spec: meta.spec.as_deref(),
        phase: meta.phase.as_deref(),
        tags: &meta.tags,
        status: meta.status,
        relates_to: &meta.relates_to,
    };
    // Serialization of this shape cannot fail: every value is a string,
    // enum, or list of strings.
    let yaml = serde_yaml::to_string(&header).expect("header serialization");

    let body = body.trim_end();
    if body.is_empty() {
        format!("---\n{yaml}---\n")
    } else {
        format!("---\n{yaml}---\n\n{body}\n")
    }
}

/// Join already-encoded blocks with the note separator (one blank line).
pub fn join_blocks(existing: &str, block: &str) -> String {
    let existing = existing.trim_end();
    if existing.is_empty() {
        block.to_string()
    } else {
        format!("{existing}\n\n{block}")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────────────────────────

/// Decode every block in a note, in order.
///
/// Strict: the first malformed block aborts with a [`ParseError`]. Ordinals
/// correspond to positions in the returned vector.
pub fn decode(text: &str) -> Result<Vec<Block>, ParseError> {
    let raws = split_blocks(text)?;
    raws.into_iter().map(|raw| raw.into_block()).collect()
}

/// Decode every parseable block, skipping malformed ones.
///
/// Used when scanning notes that may contain blocks written by other tools
/// or damaged by merges; the sync path must make progress past bad blocks.
pub fn decode_lenient(text: &str) -> Vec<Block> {
    match split_blocks(text) {
        Ok(raws) => raws
            .into_iter()
            .filter_map(|raw| raw.into_block().ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Count the parseable blocks in a note. The next capture on this note gets
/// this value as its ordinal.
pub fn count_blocks(text: &str) -> usize {
    decode_lenient(text).len()
}

struct RawBlock {
    header: String,
    body: String,
}

impl RawBlock {
    fn into_block(self) -> Result<Block, ParseError> {
        let meta = parse_header(&self.header)?;
        Ok(Block {
            meta,
            body: normalize_body(&self.body),
        })
    }
}

/// Split note text into raw fenced blocks.
///
/// A new block starts at a `---` line that (a) opens the note, or (b)
/// follows a blank line and is followed by a YAML mapping containing a
/// `type` key with its own closing fence. A `---` in a body that fails that
/// test (a markdown horizontal rule, say) stays body content.
fn split_blocks(text: &str) -> Result<Vec<RawBlock>, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }

    let lines: Vec<&str> = text.lines().collect();
    let mut blocks = Vec::new();
    let mut i = 0;

    // Leading content before the first fence is not a note.
    while i < lines.len() && lines[i].trim().is_empty() {
        i += 1;
    }
    if i >= lines.len() || !is_fence(lines[i]) {
        return Err(ParseError::MissingFrontMatter);
    }

    while i < lines.len() {
        debug_assert!(is_fence(lines[i]));
        let fence_line = i;
        i += 1;
        let header_start = i;
        while i < lines.len() && !is_fence(lines[i]) {
            i += 1;
        }
        if i >= lines.len() {
            return Err(ParseError::UnclosedHeader {
                line: fence_line + 1,
            });
        }
        let header = lines[header_start..i].join("\n");
        i += 1; // closing fence

        // Body runs until the next block boundary or EOF.
        let body_start = i;
        while i < lines.len() {
            if is_fence(lines[i])
                && (i == body_start || lines[i - 1].trim().is_empty())
                && looks_like_header(&lines, i)
            {
                break;
            }
            i += 1;
        }
        let body = lines[body_start..i].join("\n");
        blocks.push(RawBlock { header, body });
    }

    Ok(blocks)
}

fn is_fence(line: &str) -> bool {
    line.trim_end() == "---"
}

/// Check whether the fence at `start` opens a parseable block header.
fn looks_like_header(lines: &[&str], start: usize) -> bool {
    let mut j = start + 1;
    while j < lines.len() && !is_fence(lines[j]) {
        j += 1;
    }
    if j >= lines.len() {
        return false;
    }
    let candidate = lines[start + 1..j].join("\n");
    let type_key = serde_yaml::Value::String("type".to_string());
    matches!(
        serde_yaml::from_str::<serde_yaml::Value>(&candidate),
        Ok(serde_yaml::Value::Mapping(ref m)) if m.contains_key(&type_key)
    )
}

fn normalize_body(body: &str) -> String {
    body.trim_start_matches('\n').trim_end().to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Header parsing
// ─────────────────────────────────────────────────────────────────────────────

fn parse_header(header: &str) -> Result<NoteMeta, ParseError> {
    let value: serde_yaml::Value = serde_yaml::from_str(header)
        .map_err(|e| ParseError::InvalidYaml(e.to_string()))?;

    let depth = value_depth(&value);
    if depth > MAX_HEADER_DEPTH {
        return Err(ParseError::DepthExceeded {
            depth,
            limit: MAX_HEADER_DEPTH,
        });
    }

    let mapping = match value {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Err(ParseError::MissingField("type")),
        _ => return Err(ParseError::NotAMapping),
    };

    let get = |key: &str| mapping.get(&serde_yaml::Value::String(key.to_string()));

    let namespace = required_str(&mapping, "type")?
        .parse::<Namespace>()
        .map_err(|e| ParseError::InvalidField {
            field: "type",
            reason: e.to_string(),
        })?;

    let timestamp_raw = match get("timestamp") {
        Some(v) => yaml_scalar_string(v).ok_or(ParseError::InvalidField {
            field: "timestamp",
            reason: "expected a scalar".into(),
        })?,
        None => return Err(ParseError::MissingField("timestamp")),
    };
    let timestamp =
        parse_timestamp_flexible(&timestamp_raw).ok_or_else(|| ParseError::InvalidField {
            field: "timestamp",
            reason: format!("'{timestamp_raw}' is not an ISO-8601 instant"),
        })?;

    let summary = required_str(&mapping, "summary")?.to_string();

    let spec = optional_str(get("spec"));
    let phase = optional_str(get("phase"));

    let tags = match get("tags") {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(v) => string_list(v).ok_or(ParseError::InvalidField {
            field: "tags",
            reason: "expected a list of strings".into(),
        })?,
    };

    let status = match get("status") {
        None | Some(serde_yaml::Value::Null) => MemoryStatus::Active,
        Some(serde_yaml::Value::String(s)) => {
            s.parse().map_err(|reason| ParseError::InvalidField {
                field: "status",
                reason,
            })?
        }
        Some(_) => {
            return Err(ParseError::InvalidField {
                field: "status",
                reason: "expected a string".into(),
            })
        }
    };

    let relates_to = match get("relates_to") {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(v) => {
            let raw = string_list(v).ok_or(ParseError::InvalidField {
                field: "relates_to",
                reason: "expected a list of memory ids".into(),
            })?;
            raw.iter()
                .map(|s| {
                    MemoryId::parse(s).map_err(|e| ParseError::InvalidField {
                        field: "relates_to",
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?
        }
    };

    Ok(NoteMeta {
        namespace,
        timestamp,
        summary,
        spec,
        phase,
        tags,
        status,
        relates_to,
    })
}

fn required_str<'a>(
    mapping: &'a serde_yaml::Mapping,
    key: &'static str,
) -> Result<&'a str, ParseError> {
    match mapping.get(&serde_yaml::Value::String(key.to_string())) {
        Some(serde_yaml::Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ParseError::InvalidField {
            field: key,
            reason: "expected a string".into(),
        }),
        None => Err(ParseError::MissingField(key)),
    }
}

fn optional_str(value: Option<&serde_yaml::Value>) -> Option<String> {
    match value {
        Some(serde_yaml::Value::String(s)) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn yaml_scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(value: &serde_yaml::Value) -> Option<Vec<String>> {
    match value {
        serde_yaml::Value::Sequence(seq) => seq
            .iter()
            .map(|v| match v {
                serde_yaml::Value::String(s) => Some(s.clone()),
                _ => None,
            })
            .collect(),
        serde_yaml::Value::String(s) => Some(vec![s.clone()]),
        _ => None,
    }
}

fn value_depth(value: &serde_yaml::Value) -> usize {
    match value {
        serde_yaml::Value::Mapping(m) => {
            1 + m.values().map(value_depth).max().unwrap_or(0)
        }
        serde_yaml::Value::Sequence(s) => {
            1 + s.iter().map(value_depth).max().unwrap_or(0)
        }
        _ => 0,
    }
}

/// Parse an ISO-8601-ish instant, tolerating the variants real notes carry:
/// RFC 3339, space-separated datetimes, and bare dates. Naive values are
/// taken as UTC.
pub fn parse_timestamp_flexible(raw: &str) -> Option<Timestamp> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%:z", "%Y-%m-%d %H:%M:%S%.f%:z"] {
        if let Ok(dt) = DateTime::parse_from_str(raw, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Validate a header and body against ingress limits.
///
/// Oversized inputs are rejected outright, never truncated.
pub fn validate(meta: &NoteMeta, body: &str, limits: &NoteLimits) -> Result<(), ValidationError> {
    if meta.summary.trim().is_empty() {
        return Err(ValidationError::EmptySummary);
    }
    if meta.summary.contains('\n') {
        return Err(ValidationError::SummaryMultiline);
    }
    let summary_len = meta.summary.chars().count();
    if summary_len > limits.max_summary_chars {
        return Err(ValidationError::SummaryTooLong {
            len: summary_len,
            max: limits.max_summary_chars,
        });
    }
    if body.len() > limits.max_content_bytes {
        return Err(ValidationError::ContentTooLarge {
            bytes: body.len(),
            max: limits.max_content_bytes,
        });
    }
    if let Some(spec) = &meta.spec {
        if spec.chars().any(|c| c.is_control()) {
            return Err(ValidationError::InvalidSpec(spec.clone()));
        }
    }
    for tag in &meta.tags {
        if tag.chars().any(|c| c.is_control()) || tag.trim().is_empty() {
            return Err(ValidationError::InvalidTag(tag.clone()));
        }
    }
    Ok(())
}

/// Deduplicate tags preserving first-seen order.
pub fn dedup_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tags.into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}
