//! Metadata extraction from the envelope, without the article body.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, instrument};
use xaio_shared::{Fingerprint, MetaStageConfig, Result, StageFields, WorkItem};

use super::StageIdentity;
use crate::artifacts::write_json;
use crate::input::AiInput;
use crate::layout::ArtifactLayout;
use crate::llm::{ChatRequest, JsonSchema, ModelClient, complete_with_retry};
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageContext, StageOutput};

const SYSTEM_PROMPT: &str = "You extract publication metadata for an article archive.

Reply with JSON that matches the supplied schema and nothing else.

- The article body has been removed on purpose; work only from the URL and metadata fields you are given.
- organization_name and author_names must be picked from meta.identity_candidates; use null when no candidate fits.
- Any field whose value is not present in the metadata is null.
- content_mode and language must use the allowed values.";

pub struct MetaStage {
    identity: StageIdentity,
    config: MetaStageConfig,
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    layout: ArtifactLayout,
}

impl MetaStage {
    pub(crate) fn new(
        identity: StageIdentity,
        config: MetaStageConfig,
        model: Arc<dyn ModelClient>,
        retry: RetryPolicy,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            identity,
            config,
            model,
            retry,
            layout,
        }
    }

    fn schema(&self) -> JsonSchema {
        let nullable = || json!({"type": ["string", "null"]});
        let mut languages: Vec<Value> = self.config.languages.iter().map(|l| json!(l)).collect();
        languages.push(Value::Null);

        JsonSchema {
            name: "xaio_meta".into(),
            schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": [
                    "canonical_url", "domain", "site_name", "organization_name",
                    "author_names", "published_at", "modified_time",
                    "collected_at_utc", "content_mode", "language"
                ],
                "properties": {
                    "canonical_url": {"type": "string"},
                    "domain": nullable(),
                    "site_name": nullable(),
                    "organization_name": nullable(),
                    "author_names": {"type": ["array", "null"], "items": {"type": "string"}},
                    "published_at": nullable(),
                    "modified_time": nullable(),
                    "collected_at_utc": nullable(),
                    "content_mode": {"type": "string", "enum": self.config.content_modes},
                    "language": {"type": ["string", "null"], "enum": languages},
                },
            }),
        }
    }
}

#[async_trait]
impl Stage for MetaStage {
    fn name(&self) -> &str {
        &self.identity.name
    }

    fn fields(&self) -> &StageFields {
        &self.identity.fields
    }

    fn output_path(&self, item: &WorkItem) -> PathBuf {
        self.identity.output_path(item)
    }

    fn fingerprint(&self, item: &WorkItem) -> Result<Fingerprint> {
        Ok(item.fingerprint.clone())
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    async fn run(&self, item: &WorkItem, output: &Path, _ctx: &StageContext) -> Result<StageOutput> {
        let input = AiInput::load(&item.input_path)?;
        let meta_input = input.without_full_text();

        let request = ChatRequest::structured(
            &self.config.model,
            SYSTEM_PROMPT,
            serde_json::to_string(&meta_input)?,
            self.schema(),
        )
        .with_reasoning_effort(self.config.reasoning_effort.as_deref());

        let raw_path = self.layout.raw_response(self.name(), &item.id);
        let parsed = complete_with_retry(self.model.as_ref(), &self.retry, &request, &raw_path).await?;

        let out = postprocess(parsed, &input);
        debug!(fields = out.len(), "meta parsed");
        write_json(output, &out)?;
        Ok(StageOutput::artifact(output))
    }
}

/// Overwrite model output with facts the envelope states directly and
/// restrict identity fields to the envelope's candidates.
fn postprocess(parsed: Value, input: &AiInput) -> Map<String, Value> {
    let mut out = match parsed {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    if let Some(canonical) = input.canonical_url() {
        out.insert("canonical_url".into(), json!(canonical));
    }

    let mut prefer = |key: &str, pointers: &[&str]| {
        if let Some(value) = pointers.iter().find_map(|p| truthy(input.raw().pointer(p))) {
            out.insert(key.to_string(), value.clone());
        } else {
            out.entry(key.to_string()).or_insert(Value::Null);
        }
    };
    prefer("domain", &["/url/domain"]);
    prefer("site_name", &["/meta/site_name"]);
    prefer("collected_at_utc", &["/capture/collected_at_utc"]);
    prefer(
        "published_at",
        &["/meta/meta_whitelist/article:published_time", "/meta/published_at_hint"],
    );
    prefer("modified_time", &["/meta/meta_whitelist/article:modified_time"]);
    prefer("char_count", &["/content/char_count"]);
    prefer("word_count", &["/content/word_count"]);

    let orgs = candidates(input.raw().pointer("/meta/identity_candidates/organization_names"));
    let authors = candidates(input.raw().pointer("/meta/identity_candidates/author_names"));

    let organization = out
        .get("organization_name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|o| orgs.iter().any(|c| c == o))
        .map(|o| json!(o))
        .unwrap_or(Value::Null);
    out.insert("organization_name".into(), organization);

    let mut chosen: Vec<String> = Vec::new();
    for name in out
        .get("author_names")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
    {
        if !name.is_empty() && authors.iter().any(|c| c == name) && !chosen.iter().any(|c| c == name) {
            chosen.push(name.to_string());
        }
    }
    let authors_value = if chosen.is_empty() { Value::Null } else { json!(chosen) };
    out.insert("author_names".into(), authors_value);

    out
}

/// JSON pointer targets that are neither null, false, zero nor empty.
fn truthy(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    })
}

/// Trimmed, de-duplicated string candidates.
fn candidates(value: Option<&Value>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for s in value
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        if !out.iter().any(|o| o == s) {
            out.push(s.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelOutcome;
    use crate::stages::{StageServices, build_stages};
    use crate::testing::{ScriptedClient, temp_dir};
    use xaio_shared::{AppConfig, ItemId, XaioError};

    fn envelope() -> Value {
        json!({
            "url": {
                "original": "https://example.org/story?utm=1",
                "final": "https://example.org/story",
                "clean": {"canonical": "https://example.org/story"},
                "domain": "example.org"
            },
            "meta": {
                "title": "Story",
                "site_name": "Example News",
                "published_at_hint": "2024-01-01",
                "meta_whitelist": {"article:published_time": "2024-01-02T10:00:00Z"},
                "identity_candidates": {
                    "organization_names": [" Example News ", "Example News", "Example Corp"],
                    "author_names": ["Jo Writer", "Sam Editor"]
                }
            },
            "capture": {"collected_at_utc": "2024-01-03T00:00:00Z"},
            "content": {"extracted_text_full": "Body.", "char_count": 5, "word_count": 1, "sha256": "abc"}
        })
    }

    #[test]
    fn postprocess_prefers_envelope_facts_and_candidates() {
        let parsed = json!({
            "canonical_url": "https://wrong.example/",
            "domain": "wrong.example",
            "organization_name": "Invented Org",
            "author_names": ["Jo Writer", "Ghost Author", "Jo Writer"],
            "published_at": null,
            "content_mode": "article",
            "language": "en"
        });
        let out = postprocess(parsed, &AiInput::from_value(envelope()));

        assert_eq!(out["canonical_url"], "https://example.org/story");
        assert_eq!(out["domain"], "example.org");
        assert_eq!(out["site_name"], "Example News");
        assert_eq!(out["published_at"], "2024-01-02T10:00:00Z");
        assert_eq!(out["collected_at_utc"], "2024-01-03T00:00:00Z");
        assert_eq!(out["modified_time"], Value::Null);
        assert_eq!(out["char_count"], 5);
        assert_eq!(out["organization_name"], Value::Null);
        assert_eq!(out["author_names"], json!(["Jo Writer"]));
        assert_eq!(out["content_mode"], "article");
    }

    #[test]
    fn candidates_are_trimmed_and_deduplicated() {
        let c = candidates(Some(&json!([" A ", "A", "", 3, "B"])));
        assert_eq!(c, vec!["A", "B"]);
        assert!(candidates(None).is_empty());
    }

    fn config_in(tmp: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.meta_dir = tmp.join("meta");
        config.retry.remote.initial_backoff_ms = 0;
        config.retry.remote.max_backoff_ms = 0;
        config
    }

    fn item(tmp: &Path) -> WorkItem {
        let input_path = tmp.join("story.ai_input.json");
        write_json(&input_path, &envelope()).expect("input");
        WorkItem {
            id: ItemId("story".into()),
            row: 1,
            url: "https://example.org/story".into(),
            input_path,
            fingerprint: Fingerprint::of_str("abc"),
        }
    }

    #[tokio::test]
    async fn run_sends_envelope_without_body_and_writes_artifact() {
        let tmp = temp_dir();
        let client = Arc::new(ScriptedClient::new(vec![ModelOutcome::Ok(json!({
            "canonical_url": "x", "organization_name": "Example Corp", "content_mode": "report"
        }))]));
        let services = StageServices {
            model: Some(client.clone()),
        };
        let stages = build_stages(&config_in(&tmp), &["meta".to_string()], &services).expect("stages");
        let item = item(&tmp);
        let output = stages[0].output_path(&item);

        stages[0].run(&item, &output, &StageContext::default()).await.expect("run");

        let sent = &client.requests()[0];
        assert!(!sent.user.contains("extracted_text_full"));
        assert!(sent.schema.is_some());
        assert_eq!(sent.reasoning_effort.as_deref(), Some("minimal"));

        let written: Value = crate::artifacts::read_json(&output).expect("artifact");
        assert_eq!(written["organization_name"], "Example Corp");
        assert!(output.ends_with("meta/story.meta_parsed.json"));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn refusal_preserves_raw_response() {
        let tmp = temp_dir();
        let client = Arc::new(ScriptedClient::new(vec![ModelOutcome::SchemaRefused(
            json!({"choices": [{"message": {"refusal": "cannot"}}]}),
        )]));
        let services = StageServices {
            model: Some(client.clone()),
        };
        let stages = build_stages(&config_in(&tmp), &["meta".to_string()], &services).expect("stages");
        let item = item(&tmp);
        let output = stages[0].output_path(&item);

        let err = stages[0]
            .run(&item, &output, &StageContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, XaioError::SchemaRefused { .. }));
        assert!(tmp.join("meta/story.meta_response_raw.json").is_file());
        assert!(!output.exists());
        assert_eq!(client.calls(), 1);

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
