//! Core domain types for items moving through the pipeline.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Stable identifier of a work item, derived from its source artifact name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Derive the id from an input artifact path: `foo.ai_input.json` -> `foo`.
    pub fn from_input_path(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = stem.strip_suffix(".ai_input").unwrap_or(&stem);
        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Lowercase hex SHA-256 token identifying the content that drives a stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn of_str(s: &str) -> Self {
        Self::of_bytes(s.as_bytes())
    }

    /// Hash several inputs into one token. Each part is length-prefixed so
    /// `["ab", "c"]` and `["a", "bc"]` never collide.
    pub fn combine<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap a token read back from storage. Surrounding whitespace is
    /// ignored; an empty token yields `None`.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.trim();
        if token.is_empty() {
            None
        } else {
            Some(Self(token.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Stage status
// ---------------------------------------------------------------------------

/// Lifecycle of one (item, stage) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Unstarted,
    Running,
    Done,
    Failed,
}

impl StageStatus {
    /// Queue token for this status, e.g. `META_DONE`. Unstarted is blank.
    pub fn token(&self, prefix: &str) -> String {
        match self {
            Self::Unstarted => String::new(),
            Self::Running => format!("{prefix}_RUNNING"),
            Self::Done => format!("{prefix}_DONE"),
            Self::Failed => format!("{prefix}_FAILED"),
        }
    }

    /// Parse a free-text queue token. Blank or foreign tokens read as
    /// [`StageStatus::Unstarted`].
    pub fn parse(prefix: &str, token: &str) -> Self {
        let token = token.trim();
        match token.strip_prefix(prefix).and_then(|t| t.strip_prefix('_')) {
            Some(t) if t.eq_ignore_ascii_case("RUNNING") => Self::Running,
            Some(t) if t.eq_ignore_ascii_case("DONE") => Self::Done,
            Some(t) if t.eq_ignore_ascii_case("FAILED") => Self::Failed,
            _ => Self::Unstarted,
        }
    }
}

/// Names of the queue fields owned by one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFields {
    /// Upper-case token prefix (`META` for `META_DONE`).
    pub prefix: String,
    pub status: String,
    pub path: String,
    pub error: String,
    pub updated_at: String,
}

impl StageFields {
    /// Conventional field names for a stage: `<name>_status`, `<name>_path`, ...
    pub fn for_stage(name: &str) -> Self {
        Self {
            prefix: name.to_ascii_uppercase(),
            status: format!("{name}_status"),
            path: format!("{name}_path"),
            error: format!("{name}_error"),
            updated_at: format!("{name}_updated_at"),
        }
    }
}

// ---------------------------------------------------------------------------
// StageRecord
// ---------------------------------------------------------------------------

/// Recorded state of one (item, stage) pair as read from the queue and the
/// artifact's fingerprint marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub status: StageStatus,
    /// Output artifact path, if one was recorded.
    pub output_path: Option<PathBuf>,
    /// Last recorded error, already bounded in length.
    pub error: Option<String>,
    /// When the status was last written.
    pub updated_at: Option<DateTime<Utc>>,
    /// Token found in the artifact's marker file, if any.
    pub fingerprint: Option<Fingerprint>,
}

impl StageRecord {
    /// Read a record from a row's field map. Absent fields count as empty.
    pub fn from_fields(fields: &StageFields, values: &HashMap<String, String>) -> Self {
        let get = |name: &str| values.get(name).map(|v| v.trim()).unwrap_or("");
        let non_empty = |v: &str| (!v.is_empty()).then(|| v.to_string());

        Self {
            status: StageStatus::parse(&fields.prefix, get(&fields.status)),
            output_path: non_empty(get(&fields.path)).map(PathBuf::from),
            error: non_empty(get(&fields.error)),
            updated_at: DateTime::parse_from_rfc3339(get(&fields.updated_at))
                .ok()
                .map(|t| t.with_timezone(&Utc)),
            fingerprint: None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One harvested document under processing.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: ItemId,
    /// Row reference into the queue store.
    pub row: i64,
    /// Source URL as recorded in the queue (may be empty).
    pub url: String,
    /// The canonical input envelope (`*.ai_input.json`).
    pub input_path: PathBuf,
    /// Fingerprint of the canonical text payload.
    pub fingerprint: Fingerprint,
}

// ---------------------------------------------------------------------------
// Error truncation
// ---------------------------------------------------------------------------

/// Return the first `max_chars` characters of `s`, never splitting a
/// multi-byte character.
pub fn truncate_chars(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// An error message bounded to a maximum number of characters, suitable for
/// a size-capped queue field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorText(String);

impl ErrorText {
    pub fn new(message: &str, max_chars: usize) -> Self {
        Self(truncate_chars(message, max_chars).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_id_strips_input_suffix() {
        let id = ItemId::from_input_path(Path::new("/out/abc123.ai_input.json"));
        assert_eq!(id.as_str(), "abc123");

        let id = ItemId::from_input_path(Path::new("plain.json"));
        assert_eq!(id.as_str(), "plain");
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = Fingerprint::of_str("hello world");
        let b = Fingerprint::of_str("hello world");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert_ne!(a, Fingerprint::of_str("hello world!"));
    }

    #[test]
    fn combined_fingerprint_is_boundary_sensitive() {
        let a = Fingerprint::combine([b"ab".as_slice(), b"c".as_slice()]);
        let b = Fingerprint::combine([b"a".as_slice(), b"bc".as_slice()]);
        assert_ne!(a, b);
    }

    #[test]
    fn fingerprint_from_token_trims() {
        let fp = Fingerprint::from_token("  abc\n").expect("token");
        assert_eq!(fp.as_str(), "abc");
        assert!(Fingerprint::from_token(" \n").is_none());
    }

    #[test]
    fn status_tokens_roundtrip() {
        for status in [StageStatus::Running, StageStatus::Done, StageStatus::Failed] {
            let token = status.token("CLAIMS");
            assert_eq!(StageStatus::parse("CLAIMS", &token), status);
        }
        assert_eq!(StageStatus::Unstarted.token("CLAIMS"), "");
    }

    #[test]
    fn foreign_tokens_read_as_unstarted() {
        assert_eq!(StageStatus::parse("META", ""), StageStatus::Unstarted);
        assert_eq!(StageStatus::parse("META", "CLAIMS_DONE"), StageStatus::Unstarted);
        assert_eq!(StageStatus::parse("META", "METADATA_DONE"), StageStatus::Unstarted);
        assert_eq!(StageStatus::parse("META", " meta_done "), StageStatus::Unstarted);
        assert_eq!(StageStatus::parse("META", "META_done"), StageStatus::Done);
    }

    #[test]
    fn record_tolerates_missing_fields() {
        let fields = StageFields::for_stage("meta");
        let record = StageRecord::from_fields(&fields, &HashMap::new());
        assert_eq!(record.status, StageStatus::Unstarted);
        assert!(record.output_path.is_none());
        assert!(record.error.is_none());
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn record_reads_fields() {
        let fields = StageFields::for_stage("meta");
        let values = HashMap::from([
            ("meta_status".to_string(), "META_DONE".to_string()),
            ("meta_path".to_string(), "/out/x.meta_parsed.json".to_string()),
            ("meta_updated_at".to_string(), "2026-01-02T03:04:05Z".to_string()),
        ]);
        let record = StageRecord::from_fields(&fields, &values);
        assert_eq!(record.status, StageStatus::Done);
        assert_eq!(
            record.output_path.as_deref(),
            Some(Path::new("/out/x.meta_parsed.json"))
        );
        assert!(record.updated_at.is_some());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "héllo wörld";
        assert_eq!(truncate_chars(s, 2), "hé");
        assert_eq!(truncate_chars(s, 100), s);
        assert_eq!(truncate_chars("", 5), "");

        let emoji = "🦀".repeat(10);
        let cut = ErrorText::new(&emoji, 3);
        assert_eq!(cut.as_str().chars().count(), 3);
    }

    #[test]
    fn error_text_bounded_to_ceiling() {
        let long = "é".repeat(60_000);
        let text = ErrorText::new(&long, 49_000);
        assert_eq!(text.as_str().chars().count(), 49_000);
    }
}
