//! Analysis panels over the merged document.
//!
//! Each panel is an independent text call against the same
//! sentence-numbered rendering of the article. Panels are produced through
//! the [`ResumableGenerator`], so a run interrupted after k panels resumes
//! with the remaining ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::{info, instrument};
use xaio_shared::{
    BuffersStageConfig, Fingerprint, ItemId, Result, StageFields, WorkItem, XaioError,
    truncate_chars,
};

use super::{StageIdentity, upstream_path};
use crate::artifacts::{read_upstream, write_json};
use crate::generator::{ResumableGenerator, SubTaskRunner, SubTaskSpec};
use crate::layout::ArtifactLayout;
use crate::llm::{ChatRequest, ModelClient, complete_with_retry};
use crate::retry::RetryPolicy;
use crate::segment::{numbered_lines, split_sentences};
use crate::stage::{Stage, StageContext, StageOutput};

const BASE_SYSTEM_PROMPT: &str = "You write one analysis panel about the article supplied below.
Work only from that text; do not draw on outside knowledge.
Describe what the text presents, not what is true, and stay neutral.
Say so when you are unsure.
Cite support only with the sentence ids given (s1, s2, ...).
Reply with the panel text followed by the [PARSE] block it asks for.";

/// Panel names and prompts, in generation order.
pub const PANELS: [(&str, &str); 12] = [
    (
        "intent",
        "INTENT
In one or two short paragraphs, describe what the text is trying to do (report, explain, argue, warn, justify, mobilize) rather than whether it is right.

[PARSE]
primary_intent=<reporting|explaining|arguing|warning|justifying|mobilizing>
secondary_intents=<comma list or none>
confidence=<low|med|high>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "audience",
        "AUDIENCE
In one or two short paragraphs, describe who the text appears to be written for and what it assumes that reader already knows or believes.

[PARSE]
primary_audience=<short>
assumed_knowledge=<low|med|high>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "framing",
        "FRAMING
In one or two short paragraphs, summarize the story the text tells: the central conflict, why it matters, the cause it presents and the way forward it presents. Note word choices that steer interpretation.

[PARSE]
central_conflict=<short>
cause_as_presented=<short>
loaded_terms=<comma list or none>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "evidence",
        "EVIDENCE
In one or two short paragraphs, describe how the text handles evidence: attribution, hedging, named versus anonymous sources, and what it treats as proof. Do not verify anything.

[PARSE]
attribution=<low|med|high>
hedging=<low|med|high>
anonymous_sources=<none|limited|heavy>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "assumptions",
        "ASSUMPTIONS
In one or two short paragraphs, list the unstated premises the argument relies on.

[PARSE]
assumptions_count=<0-10>
load_bearing=<short>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "counterpoints",
        "COUNTERPOINTS
In one or two short paragraphs, describe which opposing views the text includes, how fairly it represents them, and which obvious ones it leaves out.

[PARSE]
counterpoints_present=<none|token|substantive>
missing_counterpoint=<short or none>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "gaps",
        "GAPS
In one or two short paragraphs, point out internal inconsistencies: timelines, numbers or definitions that do not line up, and questions a careful reader would still have.

[PARSE]
issues_count=<0-10>
most_severe=<timeline|number|definition|contradiction|none>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "incentives",
        "INCENTIVES
In one or two short paragraphs, describe the actors in the text and what each stands to gain or lose, as the text presents it.

[PARSE]
actors=<comma list up to 6>
most_exposed_actor=<short>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "risk",
        "RISK
In one or two short paragraphs, describe the risks the text raises or implies, for whom, and how likely and severe it makes them sound.

[PARSE]
top_risk=<short>
stated_severity=<low|med|high>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "actionability",
        "ACTIONABILITY
In one or two short paragraphs, describe what a reader could actually do with this information and what decisions it bears on.

[PARSE]
actionable=<no|somewhat|yes>
key_action=<short or none>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "comparison",
        "COMPARISON
In one or two short paragraphs, describe the baselines, precedents or comparisons the text uses, and any that would change the picture if added.

[PARSE]
baselines_used=<comma list or none>
missing_baseline=<short or none>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
    (
        "falsifiability",
        "FALSIFIABILITY
In one or two short paragraphs, name up to five main theses of the text and, for each, what evidence would undercut it. Present this as analytic scaffolding.

[PARSE]
theses_count=<0-5>
top_thesis=<short>
support_spans=<comma sentence ids or none>
[/PARSE]",
    ),
];

/// Facts about the rendering shared by every panel prompt.
#[derive(Debug, Clone, PartialEq)]
struct ArticleView {
    wrapper: String,
    text_sha256: Fingerprint,
    sentence_count: usize,
    chars_used: usize,
    truncated: bool,
    title: String,
    canonical_url: String,
    organization: String,
    author: String,
    published_at: String,
}

impl ArticleView {
    fn build(merged: &Value, max_chars: usize) -> Self {
        let first = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| merged.get(*k).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty()))
                .unwrap_or("")
                .to_string()
        };
        let title = first(&["title", "content_title"]);
        let canonical_url = first(&["canonical_url"]);
        let organization = first(&["organization_name", "site_name"]);
        let published_at = first(&["published_at"]);
        let author = merged
            .get("author_names")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();

        let (text, truncated) = head(merged, max_chars);
        let sentences = split_sentences(text);

        let mut wrapper = format!(
            "ARTICLE_META\ntitle: {title}\ncanonical_url: {canonical_url}\npublisher/organization: {organization}\nauthor/byline: {author}\npublished_at (if known): {published_at}\n\nARTICLE_TEXT_WITH_SENTENCE_IDS\n"
        );
        wrapper.push_str(&numbered_lines(&sentences));

        Self {
            wrapper,
            text_sha256: Fingerprint::of_str(text),
            sentence_count: sentences.len(),
            chars_used: text.chars().count(),
            truncated,
            title,
            canonical_url,
            organization,
            author,
            published_at,
        }
    }
}

/// The merged full text cut to `max_chars` characters (0 keeps all).
fn head(merged: &Value, max_chars: usize) -> (&str, bool) {
    let text = merged
        .get("extracted_text_full")
        .and_then(Value::as_str)
        .unwrap_or("");
    if max_chars == 0 {
        return (text, false);
    }
    let cut = truncate_chars(text, max_chars);
    (cut, cut.len() < text.len())
}

/// Runs a single panel prompt against the shared article rendering.
struct PanelRunner<'a> {
    client: &'a dyn ModelClient,
    retry: &'a RetryPolicy,
    model: &'a str,
    wrapper: &'a str,
    raw_path: PathBuf,
}

#[async_trait]
impl SubTaskRunner for PanelRunner<'_> {
    async fn run_subtask(&self, spec: &SubTaskSpec) -> Result<String> {
        let user = format!("{}\n\n{}\n", self.wrapper, spec.prompt);
        let request = ChatRequest::text(self.model, BASE_SYSTEM_PROMPT, user);
        match complete_with_retry(self.client, self.retry, &request, &self.raw_path).await? {
            Value::String(text) => Ok(text),
            other => Err(XaioError::validation(format!(
                "panel `{}` returned non-text output: {other}",
                spec.name
            ))),
        }
    }
}

pub struct BuffersStage {
    identity: StageIdentity,
    config: BuffersStageConfig,
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    layout: ArtifactLayout,
    generator: ResumableGenerator,
}

impl BuffersStage {
    pub(crate) fn new(
        identity: StageIdentity,
        config: BuffersStageConfig,
        model: Arc<dyn ModelClient>,
        retry: RetryPolicy,
        layout: ArtifactLayout,
    ) -> Self {
        let specs = PANELS
            .iter()
            .map(|(name, prompt)| SubTaskSpec {
                name: name.to_string(),
                prompt: prompt.to_string(),
            })
            .collect();
        Self {
            identity,
            config,
            model,
            retry,
            layout,
            generator: ResumableGenerator::new(specs),
        }
    }

    fn merged(&self, id: &ItemId) -> Result<Value> {
        let bytes = read_upstream("merge", &upstream_path(&self.layout, "merge", id)?)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn metadata(&self, view: &ArticleView) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("schema_version".into(), json!(self.config.schema_version));
        map.insert("model".into(), json!(self.config.model));
        map.insert("generated_at".into(), json!(Utc::now().to_rfc3339()));
        map.insert("title".into(), json!(view.title));
        map.insert("source_url".into(), json!(view.canonical_url));
        map.insert("publisher_organization".into(), json!(view.organization));
        map.insert("author_byline".into(), json!(view.author));
        map.insert("published_at".into(), json!(view.published_at));
        map.insert("sentence_count".into(), json!(view.sentence_count));
        map.insert("text_char_count_used".into(), json!(view.chars_used));
        map.insert("text_truncated".into(), json!(view.truncated));
        map
    }
}

#[async_trait]
impl Stage for BuffersStage {
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
        let merged = self.merged(&item.id)?;
        let (text, _) = head(&merged, self.config.max_chars);
        Ok(Fingerprint::of_str(text))
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    async fn run(&self, item: &WorkItem, output: &Path, ctx: &StageContext) -> Result<StageOutput> {
        let merged = self.merged(&item.id)?;
        let view = ArticleView::build(&merged, self.config.max_chars);
        if view.sentence_count == 0 {
            return Err(XaioError::precondition("merged document has no text to analyze"));
        }

        let runner = PanelRunner {
            client: self.model.as_ref(),
            retry: &self.retry,
            model: &self.config.model,
            wrapper: &view.wrapper,
            raw_path: self.layout.raw_response(self.name(), &item.id),
        };
        let report = self
            .generator
            .generate(output, &view.text_sha256, self.metadata(&view), &runner, ctx.force)
            .await?;

        info!(
            performed = report.performed.len(),
            reused = report.reused.len(),
            short_circuited = report.short_circuited,
            sentences = view.sentence_count,
            "panels ready"
        );
        Ok(StageOutput::artifact(output))
    }
}
