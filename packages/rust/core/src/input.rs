//! The `ai_input` envelope: the canonical payload every item starts from.
//!
//! ```json
//! {
//!   "url": {"original": "...", "final": "...", "canonical_hint": "...",
//!           "clean": {"canonical": "..."}, "domain": "..."},
//!   "meta": {"title": "...", "site_name": "...", "identity_candidates": {...}},
//!   "content": {"extracted_text_full": "...", "char_count": 1, "word_count": 1, "sha256": "..."}
//! }
//! ```
//!
//! The envelope is produced upstream and treated as a loose JSON document.

use std::path::Path;

use serde_json::Value;
use xaio_shared::{Fingerprint, Result, XaioError};

use crate::artifacts::{read_bytes, read_upstream};

#[derive(Debug, Clone)]
pub struct AiInput {
    raw: Value,
}

impl AiInput {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = read_upstream("input", path)?;
        Self::from_slice(&bytes, path)
    }

    fn from_slice(bytes: &[u8], path: &Path) -> Result<Self> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|e| {
            XaioError::Serialization(format!("invalid JSON in {}: {e}", path.display()))
        })?;
        Ok(Self { raw })
    }

    pub fn from_value(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn str_at(&self, pointer: &str) -> Option<&str> {
        self.raw
            .pointer(pointer)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn full_text(&self) -> &str {
        self.raw
            .pointer("/content/extracted_text_full")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// The content hash recorded upstream, or the hash of the full text.
    pub fn content_fingerprint(&self) -> Fingerprint {
        self.str_at("/content/sha256")
            .and_then(Fingerprint::from_token)
            .unwrap_or_else(|| Fingerprint::of_str(self.full_text()))
    }

    /// Clean canonical > canonical hint > final > original.
    pub fn canonical_url(&self) -> Option<&str> {
        [
            "/url/clean/canonical",
            "/url/canonical_hint",
            "/url/final",
            "/url/original",
        ]
        .into_iter()
        .find_map(|p| self.str_at(p))
    }

    /// Deep copy of the envelope without the full text, for metadata-only
    /// prompts.
    pub fn without_full_text(&self) -> Value {
        let mut copy = self.raw.clone();
        if let Some(content) = copy.get_mut("content").and_then(Value::as_object_mut) {
            content.remove("extracted_text_full");
        }
        copy
    }
}

/// Fingerprint of an item's input file: the envelope's content hash when it
/// parses as one, otherwise the hash of the raw bytes.
pub fn input_fingerprint(path: &Path) -> Result<Fingerprint> {
    let bytes = read_bytes(path)?;
    Ok(match AiInput::from_slice(&bytes, path) {
        Ok(input) if input.raw.get("content").is_some() => input.content_fingerprint(),
        _ => Fingerprint::of_bytes(&bytes),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> AiInput {
        AiInput::from_value(json!({
            "url": {
                "original": "https://example.org/a?utm_source=x",
                "final": "https://example.org/a",
                "clean": {"canonical": ""},
                "domain": "example.org"
            },
            "meta": {"title": "A title"},
            "content": {"extracted_text_full": "Body text.", "sha256": "abc123"}
        }))
    }

    #[test]
    fn canonical_url_skips_blank_candidates() {
        assert_eq!(envelope().canonical_url(), Some("https://example.org/a"));
    }

    #[test]
    fn fingerprint_prefers_recorded_hash() {
        assert_eq!(envelope().content_fingerprint().as_str(), "abc123");

        let bare = AiInput::from_value(json!({"content": {"extracted_text_full": "Body text."}}));
        assert_eq!(bare.content_fingerprint(), Fingerprint::of_str("Body text."));
    }

    #[test]
    fn meta_input_drops_only_full_text() {
        let meta_input = envelope().without_full_text();
        assert!(meta_input.pointer("/content/extracted_text_full").is_none());
        assert_eq!(meta_input["content"]["sha256"], "abc123");
        assert_eq!(meta_input["meta"]["title"], "A title");
    }

    #[test]
    fn non_envelope_inputs_hash_raw_bytes() {
        let tmp = crate::testing::temp_dir();
        let path = tmp.join("plain.txt");
        std::fs::write(&path, "not json").expect("write");
        assert_eq!(input_fingerprint(&path).expect("fp"), Fingerprint::of_str("not json"));
        let _ = std::fs::remove_dir_all(&tmp);
    }
}
