//! Publishing the merged document and its panels to the ingest endpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use url::Url;
use xaio_shared::{
    Fingerprint, ItemId, PublishConfig, Result, StageFields, WorkItem, XaioError, require_env,
    truncate_chars,
};
use xaio_storage::FieldUpdate;

use super::{StageIdentity, upstream_path};
use crate::artifacts::{read_upstream, write_json};
use crate::layout::ArtifactLayout;
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageContext, StageOutput};

/// Maximum characters of a response body kept in a rejection message.
const ERROR_BODY_CHARS: usize = 4_000;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "he",
    "her", "hers", "him", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "of", "on",
    "or", "our", "ours", "she", "that", "the", "their", "theirs", "them", "they", "this", "to",
    "was", "we", "were", "what", "when", "where", "which", "who", "why", "will", "with", "you",
    "your", "yours", "not",
];

static CAPITALIZED_PHRASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+){0,3})\b").expect("valid phrase regex")
});
static WORD_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z][A-Za-z\-]{3,}").expect("valid token regex"));

/// Deterministic topic labels for `text`, most frequent first.
///
/// Candidates are capitalized phrases of up to four words plus lowercased
/// word tokens that are not stopwords. Ties keep first-seen order.
/// Lowercase tokens are title-cased with hyphens turned into spaces.
pub fn derive_topics(text: &str, max: usize) -> Vec<String> {
    if text.is_empty() || max == 0 {
        return Vec::new();
    }

    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut bump = |term: &str| {
        let count = counts.entry(term.to_string()).or_insert(0);
        if *count == 0 {
            order.push(term.to_string());
        }
        *count += 1;
    };

    for caps in CAPITALIZED_PHRASE.captures_iter(text) {
        let phrase = caps[1].trim();
        if phrase.chars().count() >= 4 {
            bump(phrase);
        }
    }
    let lowered = text.to_lowercase();
    for token in WORD_TOKEN.find_iter(&lowered) {
        if !STOPWORDS.contains(&token.as_str()) {
            bump(token.as_str());
        }
    }

    let mut ranked: Vec<(usize, &String)> = order
        .iter()
        .map(|term| (counts.get(term).copied().unwrap_or(0), term))
        .collect();
    // Stable sort keeps first-seen order among equal counts.
    ranked.sort_by(|a, b| b.0.cmp(&a.0));

    let mut topics: Vec<String> = Vec::new();
    for (_, term) in ranked {
        let label = if term.chars().any(char::is_uppercase) {
            term.clone()
        } else {
            title_case(&term.replace('-', " "))
        };
        if STOPWORDS.contains(&label.to_lowercase().as_str()) || topics.contains(&label) {
            continue;
        }
        topics.push(label);
        if topics.len() >= max {
            break;
        }
    }
    topics
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `https://example.org/path` -> `example.org`.
fn normalize_domain(domain: &str) -> String {
    let d = domain.trim();
    if d.contains("://") {
        if let Some(host) = Url::parse(d).ok().and_then(|u| u.host_str().map(str::to_string)) {
            return host;
        }
    }
    d.split('/').next().unwrap_or("").to_string()
}

/// Connection to the ingest endpoint.
#[derive(Debug, Clone)]
pub struct IngestTarget {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl IngestTarget {
    pub fn new(base_url: &str, ingest_path: &str, username: String, password: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("xaio/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| XaioError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), ingest_path),
            username,
            password,
        })
    }

    /// POST `payload` once. Transport failures, 429 and 5xx are transient;
    /// any other non-success is a rejection.
    async fn send(&self, payload: &Value) -> Result<(u16, Value)> {
        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(payload)
            .send()
            .await
            .map_err(|e| XaioError::Transient(format!("ingest request failed: {e}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| XaioError::Transient(format!("ingest response unreadable: {e}")))?;
        debug!(status = status.as_u16(), bytes = text.len(), "ingest response");

        let summary = || format!("HTTP {} {}", status.as_u16(), truncate_chars(&text, ERROR_BODY_CHARS));
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(XaioError::Transient(summary()));
        }

        let body: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let ok = body.get("ok").and_then(Value::as_bool).unwrap_or(false);
        if status.as_u16() >= 300 || !ok {
            return Err(XaioError::Publish(summary()));
        }
        Ok((status.as_u16(), body))
    }
}

pub struct PublishStage {
    identity: StageIdentity,
    target: IngestTarget,
    post_status: String,
    topics_max: usize,
    retry: RetryPolicy,
    layout: ArtifactLayout,
}

impl PublishStage {
    /// Build from config, reading credentials from their env vars.
    pub(crate) fn from_config(
        identity: StageIdentity,
        config: &PublishConfig,
        retry: RetryPolicy,
        layout: ArtifactLayout,
    ) -> Result<Self> {
        let target = IngestTarget::new(
            &config.base_url,
            &config.ingest_path,
            require_env(&config.username_env)?,
            require_env(&config.password_env)?,
            Duration::from_secs(config.timeout_secs),
        )?;
        Ok(Self::new(identity, target, config, retry, layout))
    }

    pub(crate) fn new(
        identity: StageIdentity,
        target: IngestTarget,
        config: &PublishConfig,
        retry: RetryPolicy,
        layout: ArtifactLayout,
    ) -> Self {
        Self {
            identity,
            target,
            post_status: config.post_status.clone(),
            topics_max: config.topics_max,
            retry,
            layout,
        }
    }

    fn upstream(&self, stage: &str, id: &ItemId) -> Result<Vec<u8>> {
        read_upstream(stage, &upstream_path(&self.layout, stage, id)?)
    }

    fn payload(&self, id: &ItemId, merged: &Value, buffers: &Value) -> Value {
        let text = |key: &str| merged.get(key).and_then(Value::as_str).map(str::trim).unwrap_or("");
        let body = text("extracted_text_full");
        let content_mode = match text("content_mode") {
            "" => "url",
            mode => mode,
        };
        let org_name = match text("organization_name") {
            "" => text("site_name"),
            org => org,
        };
        let contributor = merged
            .get("author_names")
            .and_then(Value::as_array)
            .and_then(|a| a.first())
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("");

        json!({
            "xaio_id": id.as_str(),
            "canonical_url": text("canonical_url"),
            "content_mode": content_mode,
            "content_title": text("title"),
            "post_body": body,
            "contributor_name": contributor,
            "org_name": org_name,
            "org_domain": normalize_domain(text("domain")),
            "topics": derive_topics(body, self.topics_max),
            "buffers": buffers.get("panels").cloned().unwrap_or_else(|| json!({})),
            "post_status": self.post_status,
        })
    }
}

#[async_trait]
impl Stage for PublishStage {
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
        let merged = self.upstream("merge", &item.id)?;
        let buffers = self.upstream("buffers", &item.id)?;
        Ok(Fingerprint::combine([
            merged.as_slice(),
            buffers.as_slice(),
            self.post_status.as_bytes(),
        ]))
    }

    #[instrument(skip_all, fields(item_id = %item.id))]
    async fn run(&self, item: &WorkItem, output: &Path, _ctx: &StageContext) -> Result<StageOutput> {
        let merged: Value = serde_json::from_slice(&self.upstream("merge", &item.id)?)?;
        let buffers: Value = serde_json::from_slice(&self.upstream("buffers", &item.id)?)?;
        let payload = self.payload(&item.id, &merged, &buffers);

        let (status, body) = self
            .retry
            .run("publish", XaioError::is_transient, |_attempt| self.target.send(&payload))
            .await?;

        let post_id = ["content_id", "post_id"]
            .iter()
            .find_map(|k| match body.get(*k) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            })
            .unwrap_or_default();

        write_json(
            output,
            &json!({
                "xaio_id": item.id.as_str(),
                "post_id": post_id,
                "http_status": status,
                "post_status": self.post_status,
                "topics": payload["topics"],
                "published_at": Utc::now().to_rfc3339(),
                "response": body,
            }),
        )?;
        info!(post_id = %post_id, "published");

        let mut produced = StageOutput::artifact(output);
        produced
            .extra_fields
            .push(FieldUpdate::new(format!("{}_post_id", self.name()), post_id));
        Ok(produced)
    }
}
