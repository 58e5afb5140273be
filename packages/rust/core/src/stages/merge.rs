//! Local merge of meta, claims and the full text into one document.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use xaio_shared::{Fingerprint, Result, StageFields, WorkItem};

use super::{StageIdentity, upstream_path};
use crate::artifacts::{read_upstream, write_json};
use crate::input::AiInput;
use crate::layout::ArtifactLayout;
use crate::stage::{Stage, StageContext, StageOutput};

pub struct MergeStage {
    identity: StageIdentity,
    layout: ArtifactLayout,
}

impl MergeStage {
    pub(crate) fn new(identity: StageIdentity, layout: ArtifactLayout) -> Self {
        Self { identity, layout }
    }

    fn upstream(&self, stage: &str, item: &WorkItem) -> Result<Vec<u8>> {
        read_upstream(stage, &upstream_path(&self.layout, stage, &item.id)?)
    }
}

#[async_trait]
impl Stage for MergeStage {
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
        let meta = self.upstream("meta", item)?;
        let claims = self.upstream("claims", item)?;
        Ok(Fingerprint::combine([
            item.fingerprint.as_str().as_bytes(),
            meta.as_slice(),
            claims.as_slice(),
        ]))
    }

    async fn run(&self, item: &WorkItem, output: &Path, _ctx: &StageContext) -> Result<StageOutput> {
        let meta: Value = serde_json::from_slice(&self.upstream("meta", item)?)?;
        let claims: Value = serde_json::from_slice(&self.upstream("claims", item)?)?;
        let input = AiInput::load(&item.input_path)?;

        write_json(output, &merge(meta, &claims, &input))?;
        Ok(StageOutput::artifact(output))
    }
}

fn merge(meta: Value, claims: &Value, input: &AiInput) -> Map<String, Value> {
    let mut out = match meta {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    out.insert(
        "claims".into(),
        claims.get("claims").cloned().unwrap_or_else(|| Value::Array(Vec::new())),
    );
    out.insert(
        "extracted_text_full".into(),
        Value::String(input.full_text().to_string()),
    );

    // Counts from the envelope win over whatever meta carried.
    for key in ["char_count", "word_count"] {
        if let Some(count) = input.raw().pointer(&format!("/content/{key}")) {
            out.insert(key.to_string(), count.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{StageServices, build_stages};
    use crate::testing::{temp_dir, work_item};
    use serde_json::json;
    use xaio_shared::{AppConfig, XaioError};

    fn config_in(tmp: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.meta_dir = tmp.join("meta");
        config.paths.claims_dir = tmp.join("claims");
        config.paths.merge_dir = tmp.join("merge");
        config
    }

    #[tokio::test]
    async fn merges_upstream_artifacts_with_full_text() {
        let tmp = temp_dir();
        let config = config_in(&tmp);
        let stage = build_stages(&config, &["merge".to_string()], &StageServices::default())
            .expect("stages")
            .remove(0);
        let item = work_item(&tmp, "doc", "The full body.");

        write_json(&tmp.join("meta/doc.meta_parsed.json"), &json!({"title": "T", "claims": "stale"}))
            .expect("meta");
        write_json(
            &tmp.join("claims/doc.claims_parsed.json"),
            &json!({"claims": [{"claim_text": "c", "claim_type": "fact"}]}),
        )
        .expect("claims");

        let output = stage.output_path(&item);
        stage.run(&item, &output, &StageContext::default()).await.expect("run");

        let merged: Value = crate::artifacts::read_json(&output).expect("merged");
        assert_eq!(merged["title"], "T");
        assert_eq!(merged["claims"][0]["claim_text"], "c");
        assert_eq!(merged["extracted_text_full"], "The full body.");
        assert!(merged.get("char_count").is_none());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn fingerprint_tracks_both_upstreams() {
        let tmp = temp_dir();
        let config = config_in(&tmp);
        let stage = build_stages(&config, &["merge".to_string()], &StageServices::default())
            .expect("stages")
            .remove(0);
        let item = work_item(&tmp, "doc", "body");

        let err = stage.fingerprint(&item).unwrap_err();
        assert!(matches!(err, XaioError::Precondition { .. }));

        write_json(&tmp.join("meta/doc.meta_parsed.json"), &json!({"title": "T"})).expect("meta");
        write_json(&tmp.join("claims/doc.claims_parsed.json"), &json!({"claims": []})).expect("claims");
        let before = stage.fingerprint(&item).expect("fp");

        write_json(&tmp.join("claims/doc.claims_parsed.json"), &json!({"claims": [1]})).expect("claims");
        assert_ne!(stage.fingerprint(&item).expect("fp"), before);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn envelope_counts_override_meta() {
        let input = AiInput::from_value(json!({"content": {"extracted_text_full": "x", "word_count": 1}}));
        let out = merge(json!({"word_count": 99, "char_count": 5}), &json!({}), &input);
        assert_eq!(out["word_count"], 1);
        assert_eq!(out["char_count"], 5);
        assert_eq!(out["claims"], json!([]));
    }
}
