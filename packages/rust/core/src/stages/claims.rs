//! Atomic claim extraction over the full article text.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument};
use xaio_shared::{ClaimsStageConfig, Fingerprint, Result, StageFields, WorkItem};
use xaio_storage::FieldUpdate;

use super::StageIdentity;
use crate::artifacts::write_json;
use crate::input::AiInput;
use crate::layout::ArtifactLayout;
use crate::llm::{ChatRequest, JsonSchema, ModelClient, complete_with_retry};
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageContext, StageOutput};

const SYSTEM_PROMPT: &str = "You list the claims an article makes.

Reply with JSON that matches the supplied schema and nothing else.

- Take claims only from content.extracted_text_full.
- Each claim is one atomic statement that could be checked on its own.
- Do not judge whether a claim is true and do not add sources, notes or confidence.
- Each claim has exactly claim_text and claim_type.";

/// Type used for claims whose type is outside the vocabulary.
const FALLBACK_CLAIM_TYPE: &str = "other";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_text: String,
    pub claim_type: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimsArtifact {
    #[serde(default)]
    pub claims: Vec<Claim>,
}

pub struct ClaimsStage {
    identity: StageIdentity,
    config: ClaimsStageConfig,
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    layout: ArtifactLayout,
}

impl ClaimsStage {
    pub(crate) fn new(
        identity: StageIdentity,
        config: ClaimsStageConfig,
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
        JsonSchema {
            name: "xaio_claims".into(),
            schema: json!({
                "type": "object",
                "additionalProperties": false,
                "required": ["claims"],
                "properties": {
                    "claims": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "additionalProperties": false,
                            "required": ["claim_text", "claim_type"],
                            "properties": {
                                "claim_text": {"type": "string"},
                                "claim_type": {"type": "string", "enum": self.config.claim_types},
                            },
                        },
                    },
                },
            }),
        }
    }

    /// Collapse whitespace, drop empty claims, coerce unknown types and
    /// drop repeats of the same (text, type) ignoring case.
    fn normalize(&self, parsed: &Value) -> ClaimsArtifact {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut claims = Vec::new();

        for raw in parsed
            .get("claims")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let text = collapse_whitespace(raw.get("claim_text").and_then(Value::as_str).unwrap_or(""));
            if text.is_empty() {
                continue;
            }
            let kind = raw
                .get("claim_type")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| self.config.claim_types.iter().any(|c| c == t))
                .unwrap_or(FALLBACK_CLAIM_TYPE)
                .to_string();

            if seen.insert((text.to_lowercase(), kind.clone())) {
                claims.push(Claim {
                    claim_text: text,
                    claim_type: kind,
                });
            }
        }

        ClaimsArtifact { claims }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[async_trait]
impl Stage for ClaimsStage {
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
        let user = json!({
            "canonical_url": input.canonical_url(),
            "meta": input.raw().get("meta").cloned().unwrap_or_else(|| json!({})),
            "content": {"extracted_text_full": input.full_text()},
        });

        let request = ChatRequest::structured(
            &self.config.model,
            SYSTEM_PROMPT,
            serde_json::to_string(&user)?,
            self.schema(),
        )
        .with_reasoning_effort(self.config.reasoning_effort.as_deref());

        let raw_path = self.layout.raw_response(self.name(), &item.id);
        let parsed = complete_with_retry(self.model.as_ref(), &self.retry, &request, &raw_path).await?;

        let artifact = self.normalize(&parsed);
        info!(claims = artifact.claims.len(), "claims extracted");
        write_json(output, &artifact)?;

        let mut produced = StageOutput::artifact(output);
        produced
            .extra_fields
            .push(FieldUpdate::new(format!("{}_count", self.name()), artifact.claims.len().to_string()));
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelOutcome;
    use crate::stages::{StageServices, build_stages};
    use crate::testing::{ScriptedClient, temp_dir, work_item};
    use xaio_shared::{AppConfig, XaioError};

    fn stage(client: Arc<ScriptedClient>, tmp: &Path) -> Box<dyn Stage> {
        let mut config = AppConfig::default();
        config.paths.claims_dir = tmp.join("claims");
        config.retry.remote.initial_backoff_ms = 0;
        config.retry.remote.max_backoff_ms = 0;
        let services = StageServices {
            model: Some(client),
        };
        build_stages(&config, &["claims".to_string()], &services)
            .expect("stages")
            .remove(0)
    }

    #[tokio::test]
    async fn claims_are_normalized_and_counted() {
        let tmp = temp_dir();
        let client = Arc::new(ScriptedClient::new(vec![ModelOutcome::Ok(json!({
            "claims": [
                {"claim_text": "  Sales   rose\n10%. ", "claim_type": "statistic"},
                {"claim_text": "sales rose 10%.", "claim_type": "statistic"},
                {"claim_text": "Sales rose 10%.", "claim_type": "fact"},
                {"claim_text": "   ", "claim_type": "fact"},
                {"claim_text": "It will rain.", "claim_type": "astrology"}
            ]
        }))]));
        let claims = stage(client.clone(), &tmp);
        let item = work_item(&tmp, "doc", "Sales rose 10%. It will rain.");
        let output = claims.output_path(&item);

        let produced = claims.run(&item, &output, &StageContext::default()).await.expect("run");

        let artifact: ClaimsArtifact = crate::artifacts::read_json(&output).expect("artifact");
        assert_eq!(
            artifact.claims,
            vec![
                Claim {
                    claim_text: "Sales rose 10%.".into(),
                    claim_type: "statistic".into()
                },
                Claim {
                    claim_text: "Sales rose 10%.".into(),
                    claim_type: "fact".into()
                },
                Claim {
                    claim_text: "It will rain.".into(),
                    claim_type: "other".into()
                },
            ]
        );
        assert_eq!(produced.extra_fields[0].value, "3");

        let sent: Value = serde_json::from_str(&client.requests()[0].user).expect("user json");
        assert_eq!(sent["content"]["extracted_text_full"], "Sales rose 10%. It will rain.");

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn transient_errors_are_retried_then_surface() {
        let tmp = temp_dir();
        let client = Arc::new(ScriptedClient::new(vec![
            ModelOutcome::TransientError("HTTP 503".into());
            5
        ]));
        let claims = stage(client.clone(), &tmp);
        let item = work_item(&tmp, "doc", "text");
        let output = claims.output_path(&item);

        let err = claims.run(&item, &output, &StageContext::default()).await.unwrap_err();
        assert!(matches!(err, XaioError::Transient(_)));
        assert_eq!(client.calls(), 5);
        assert!(!output.exists());

        let _ = std::fs::remove_dir_all(&tmp);
    }
}
