//! Generative text service client.
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint. Every call
//! resolves to a tagged [`ModelOutcome`]; non-transient HTTP failures (bad
//! credentials, malformed requests) surface as `Err`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};
use xaio_shared::{ModelConfig, Result, XaioError, require_env, truncate_chars};

use crate::artifacts::write_json;
use crate::retry::RetryPolicy;

/// Maximum characters of an HTTP error body kept in error messages.
const ERROR_BODY_CHARS: usize = 4_000;

/// Result of one generative call.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutcome {
    /// Parsed JSON for structured calls; a JSON string for text calls.
    Ok(Value),
    /// The model refused, or its output did not parse. Carries the raw
    /// response for diagnosis.
    SchemaRefused(Value),
    /// Timeout, connection failure, rate limit, or server error.
    TransientError(String),
}

/// JSON schema attached to a structured request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonSchema {
    pub name: String,
    pub schema: Value,
}

/// One chat completion request: system prompt plus a single user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub user: String,
    pub reasoning_effort: Option<String>,
    /// When set, the response must be JSON matching this schema.
    pub schema: Option<JsonSchema>,
}

impl ChatRequest {
    pub fn text(model: &str, system: &str, user: String) -> Self {
        Self {
            model: model.to_string(),
            system: system.to_string(),
            user,
            reasoning_effort: None,
            schema: None,
        }
    }

    pub fn structured(model: &str, system: &str, user: String, schema: JsonSchema) -> Self {
        Self {
            schema: Some(schema),
            ..Self::text(model, system, user)
        }
    }

    #[must_use]
    pub fn with_reasoning_effort(mut self, effort: Option<&str>) -> Self {
        self.reasoning_effort = effort
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(String::from);
        self
    }
}

/// A generative text service.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelOutcome>;
}

/// Call `client` under `policy`, retrying only transient errors.
///
/// A refusal is written to `raw_path` and returned as
/// [`XaioError::SchemaRefused`] without retrying.
pub async fn complete_with_retry(
    client: &dyn ModelClient,
    policy: &RetryPolicy,
    request: &ChatRequest,
    raw_path: &Path,
) -> Result<Value> {
    policy
        .run(
            "model_call",
            XaioError::is_transient,
            |_attempt| async move {
                match client.complete(request).await? {
                    ModelOutcome::Ok(value) => Ok(value),
                    ModelOutcome::TransientError(cause) => Err(XaioError::Transient(cause)),
                    ModelOutcome::SchemaRefused(raw) => {
                        write_json(raw_path, &raw)?;
                        warn!(raw = %raw_path.display(), "model refused or returned unparsable output");
                        Err(XaioError::SchemaRefused {
                            message: refusal_message(&raw),
                            raw_path: raw_path.to_path_buf(),
                        })
                    }
                }
            },
        )
        .await
}

fn refusal_message(raw: &Value) -> String {
    raw.pointer("/choices/0/message/refusal")
        .and_then(Value::as_str)
        .map(|r| format!("refusal: {r}"))
        .unwrap_or_else(|| "output did not match the requested schema".to_string())
}

// ---------------------------------------------------------------------------
// OpenAI-compatible HTTP client
// ---------------------------------------------------------------------------

/// [`ModelClient`] over HTTP. One instance (and one connection pool) is
/// shared by every stage of a run.
pub struct OpenAiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OpenAiClient {
    /// Build a client from config, reading the API key from its env var.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let api_key = require_env(&config.api_key_env)?;
        Self::new(&config.base_url, api_key, Duration::from_secs(config.timeout_secs))
    }

    pub fn new(base_url: &str, api_key: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("xaio/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| XaioError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    fn body(request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.user},
            ],
        });
        if let Some(effort) = &request.reasoning_effort {
            body["reasoning_effort"] = json!(effort);
        }
        if let Some(schema) = &request.schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": schema.name,
                    "schema": schema.schema,
                    "strict": true,
                },
            });
        }
        body
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelOutcome> {
        let response = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&Self::body(request))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Ok(ModelOutcome::TransientError(e.to_string())),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(t) => t,
            Err(e) => return Ok(ModelOutcome::TransientError(e.to_string())),
        };
        debug!(status = status.as_u16(), bytes = text.len(), model = %request.model, "model response");

        if status.as_u16() == 429 || status.is_server_error() {
            return Ok(ModelOutcome::TransientError(format!(
                "HTTP {status}: {}",
                truncate_chars(&text, ERROR_BODY_CHARS)
            )));
        }
        if !status.is_success() {
            return Err(XaioError::Remote(format!(
                "HTTP {status}: {}",
                truncate_chars(&text, ERROR_BODY_CHARS)
            )));
        }

        Ok(interpret_response(&text, request.schema.is_some()))
    }
}

/// Map a successful response body to an outcome.
fn interpret_response(text: &str, structured: bool) -> ModelOutcome {
    let raw: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return ModelOutcome::SchemaRefused(Value::String(text.to_string())),
    };

    let message = raw.pointer("/choices/0/message");
    let refused = message
        .and_then(|m| m.get("refusal"))
        .is_some_and(|r| !r.is_null());
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");

    if refused || content.is_empty() {
        return ModelOutcome::SchemaRefused(raw);
    }
    if !structured {
        return ModelOutcome::Ok(Value::String(content.to_string()));
    }
    match serde_json::from_str::<Value>(content) {
        Ok(parsed @ Value::Object(_)) => ModelOutcome::Ok(parsed),
        _ => ModelOutcome::SchemaRefused(raw),
    }
}
