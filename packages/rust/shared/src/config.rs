//! Application configuration for the xAIO pipeline.
//!
//! User config lives at `~/.xaio/xaio.toml` unless overridden on the
//! command line. The file is read once at startup. Unknown keys are
//! rejected and [`AppConfig::validate`] runs before any item is touched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, XaioError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "xaio.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".xaio";

/// Built-in stages in their natural dependency order.
pub const BUILTIN_STAGES: [&str; 5] = ["meta", "claims", "merge", "buffers", "publish"];

// ---------------------------------------------------------------------------
// Config structs (matching xaio.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Output directory per stage.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Generative service connection.
    #[serde(default)]
    pub model: ModelConfig,

    /// Per-stage model settings.
    #[serde(default)]
    pub stages: StagesConfig,

    #[serde(default)]
    pub publish: PublishConfig,

    #[serde(default)]
    pub retry: RetrySection,

    /// Stages delegated to an external command.
    #[serde(default)]
    pub external_stages: Vec<ExternalStageConfig>,
}

/// `[queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Path to the queue database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Field gating whether a row is ready for processing.
    #[serde(default = "default_ready_field")]
    pub ready_field: String,

    /// Value of `ready_field` that marks a row ready.
    #[serde(default = "default_ready_value")]
    pub ready_value: String,

    /// Field holding the path of the item's input envelope.
    #[serde(default = "default_input_field")]
    pub input_field: String,

    #[serde(default = "default_url_field")]
    pub url_field: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            ready_field: default_ready_field(),
            ready_value: default_ready_value(),
            input_field: default_input_field(),
            url_field: default_url_field(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(".xaio/queue.db")
}
fn default_ready_field() -> String {
    "ai_status".into()
}
fn default_ready_value() -> String {
    "AI_READY".into()
}
fn default_input_field() -> String {
    "ai_input_path".into()
}
fn default_url_field() -> String {
    "url".into()
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Maximum number of items attempted per run.
    #[serde(default = "default_max_per_run")]
    pub max_per_run: usize,

    /// Ordered stage list. Names refer to built-in or external stages.
    #[serde(default = "default_stages")]
    pub stages: Vec<String>,

    /// A RUNNING status older than this is considered abandoned.
    #[serde(default = "default_running_stale_after_secs")]
    pub running_stale_after_secs: u64,

    /// Ceiling on persisted error messages, in characters.
    #[serde(default = "default_max_error_chars")]
    pub max_error_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_per_run: default_max_per_run(),
            stages: default_stages(),
            running_stale_after_secs: default_running_stale_after_secs(),
            max_error_chars: default_max_error_chars(),
        }
    }
}

fn default_max_per_run() -> usize {
    50
}
fn default_stages() -> Vec<String> {
    BUILTIN_STAGES.iter().map(|s| s.to_string()).collect()
}
fn default_running_stale_after_secs() -> u64 {
    3600
}
fn default_max_error_chars() -> usize {
    49_000
}

/// `[paths]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default = "default_meta_dir")]
    pub meta_dir: PathBuf,
    #[serde(default = "default_claims_dir")]
    pub claims_dir: PathBuf,
    #[serde(default = "default_merge_dir")]
    pub merge_dir: PathBuf,
    #[serde(default = "default_buffers_dir")]
    pub buffers_dir: PathBuf,
    #[serde(default = "default_publish_dir")]
    pub publish_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            meta_dir: default_meta_dir(),
            claims_dir: default_claims_dir(),
            merge_dir: default_merge_dir(),
            buffers_dir: default_buffers_dir(),
            publish_dir: default_publish_dir(),
        }
    }
}

fn default_meta_dir() -> PathBuf {
    PathBuf::from("./out_meta")
}
fn default_claims_dir() -> PathBuf {
    PathBuf::from("./out_claims")
}
fn default_merge_dir() -> PathBuf {
    PathBuf::from("./out_xaio")
}
fn default_buffers_dir() -> PathBuf {
    PathBuf::from("./out_buffers")
}
fn default_publish_dir() -> PathBuf {
    PathBuf::from("./out_publish")
}

/// `[model]` section: an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    #[serde(default = "default_model_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-call timeout.
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_model_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

fn default_model_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model_timeout_secs() -> u64 {
    120
}

/// `[stages]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StagesConfig {
    #[serde(default)]
    pub meta: MetaStageConfig,
    #[serde(default)]
    pub claims: ClaimsStageConfig,
    #[serde(default)]
    pub buffers: BuffersStageConfig,
}

/// `[stages.meta]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetaStageConfig {
    #[serde(default = "default_small_model")]
    pub model: String,

    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: Option<String>,

    /// Allowed values for `content_mode`.
    #[serde(default = "default_content_modes")]
    pub content_modes: Vec<String>,

    /// Allowed values for `language`.
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
}

impl Default for MetaStageConfig {
    fn default() -> Self {
        Self {
            model: default_small_model(),
            reasoning_effort: default_reasoning_effort(),
            content_modes: default_content_modes(),
            languages: default_languages(),
        }
    }
}

/// `[stages.claims]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimsStageConfig {
    #[serde(default = "default_small_model")]
    pub model: String,

    #[serde(default = "default_reasoning_effort")]
    pub reasoning_effort: Option<String>,

    /// Allowed claim types. Anything else is stored as `other`.
    #[serde(default = "default_claim_types")]
    pub claim_types: Vec<String>,
}

impl Default for ClaimsStageConfig {
    fn default() -> Self {
        Self {
            model: default_small_model(),
            reasoning_effort: default_reasoning_effort(),
            claim_types: default_claim_types(),
        }
    }
}

/// `[stages.buffers]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuffersStageConfig {
    #[serde(default = "default_buffers_model")]
    pub model: String,

    #[serde(default = "default_schema_version")]
    pub schema_version: String,

    /// Input text is cut to this many characters before panel generation.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for BuffersStageConfig {
    fn default() -> Self {
        Self {
            model: default_buffers_model(),
            schema_version: default_schema_version(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_small_model() -> String {
    "gpt-5-nano".into()
}
fn default_buffers_model() -> String {
    "gpt-4.1-mini".into()
}
fn default_reasoning_effort() -> Option<String> {
    Some("minimal".into())
}
fn default_content_modes() -> Vec<String> {
    ["article", "report", "announcement", "opinion", "research", "other"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_languages() -> Vec<String> {
    ["en", "es", "fr", "de", "pt", "it", "nl", "ja", "zh"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_claim_types() -> Vec<String> {
    ["fact", "statistic", "prediction", "opinion", "definition", "other"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
fn default_schema_version() -> String {
    "0.1.0".into()
}
fn default_max_chars() -> usize {
    120_000
}

/// `[publish]` section: the ingest endpoint of the publishing target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Site root, e.g. `https://example.org`. Required when the publish
    /// stage is enabled.
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_ingest_path")]
    pub ingest_path: String,

    #[serde(default = "default_username_env")]
    pub username_env: String,

    #[serde(default = "default_password_env")]
    pub password_env: String,

    #[serde(default = "default_post_status")]
    pub post_status: String,

    /// Maximum number of derived topics sent with a post.
    #[serde(default = "default_topics_max")]
    pub topics_max: usize,

    #[serde(default = "default_publish_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            ingest_path: default_ingest_path(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            post_status: default_post_status(),
            topics_max: default_topics_max(),
            timeout_secs: default_publish_timeout_secs(),
        }
    }
}

fn default_ingest_path() -> String {
    "/wp-json/xaio/v1/ingest".into()
}
fn default_username_env() -> String {
    "WP_USERNAME".into()
}
fn default_password_env() -> String {
    "WP_APP_PASSWORD".into()
}
fn default_post_status() -> String {
    "draft".into()
}
fn default_topics_max() -> usize {
    8
}
fn default_publish_timeout_secs() -> u64 {
    30
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    /// Remote calls whose result feeds an artifact.
    #[serde(default = "RetryConfig::remote")]
    pub remote: RetryConfig,

    /// Best-effort queue status writes.
    #[serde(default = "RetryConfig::status")]
    pub status: RetryConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            remote: RetryConfig::remote(),
            status: RetryConfig::status(),
        }
    }
}

/// Bounds for one retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl RetryConfig {
    fn remote() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }

    fn status() -> Self {
        Self {
            max_attempts: 3,
            ..Self::remote()
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(XaioError::config(format!(
                "retry.{section}.max_attempts must be at least 1"
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(XaioError::config(format!(
                "retry.{section}.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.initial_backoff_ms, self.max_backoff_ms
            )));
        }
        Ok(())
    }
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}
fn default_max_backoff_ms() -> u64 {
    10_000
}

/// `[[external_stages]]` entry: a stage whose work is done by a command.
///
/// `args` may contain the placeholders `{input}`, `{output}`, `{outdir}`,
/// `{model}` and `{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalStageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `input` for the item's envelope, or the name of an upstream stage
    /// whose artifact is fed to the command.
    #[serde(default = "default_input_from")]
    pub input_from: String,
    pub output_dir: PathBuf,
    /// Artifact file name is `<id><output_suffix>`.
    pub output_suffix: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Upper bound on a single invocation.
    #[serde(default = "default_command_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_input_from() -> String {
    "input".into()
}
fn default_command_timeout_secs() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Names of the stages `stage` consumes output from. `None` for an
    /// unknown stage.
    pub fn dependencies_of(&self, stage: &str) -> Option<Vec<String>> {
        let deps: &[&str] = match stage {
            "meta" => &[],
            "claims" => &[],
            "merge" => &["meta", "claims"],
            "buffers" => &["merge"],
            "publish" => &["merge", "buffers"],
            other => {
                let ext = self.external_stage(other)?;
                return Some(if ext.input_from == "input" {
                    Vec::new()
                } else {
                    vec![ext.input_from.clone()]
                });
            }
        };
        Some(deps.iter().map(|s| s.to_string()).collect())
    }

    pub fn external_stage(&self, name: &str) -> Option<&ExternalStageConfig> {
        self.external_stages.iter().find(|s| s.name == name)
    }

    /// Check the whole configuration. Called once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_per_run == 0 {
            return Err(XaioError::config("pipeline.max_per_run must be at least 1"));
        }
        if self.pipeline.max_error_chars == 0 {
            return Err(XaioError::config("pipeline.max_error_chars must be at least 1"));
        }
        if self.pipeline.stages.is_empty() {
            return Err(XaioError::config("pipeline.stages must name at least one stage"));
        }

        for ext in &self.external_stages {
            if BUILTIN_STAGES.contains(&ext.name.as_str()) {
                return Err(XaioError::config(format!(
                    "external stage `{}` shadows a built-in stage",
                    ext.name
                )));
            }
            if ext.name.is_empty()
                || !ext
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(XaioError::config(format!(
                    "external stage name `{}` must be non-empty ASCII alphanumerics or `_`",
                    ext.name
                )));
            }
            if ext.program.trim().is_empty() {
                return Err(XaioError::config(format!(
                    "external stage `{}` has an empty program",
                    ext.name
                )));
            }
        }

        let mut seen: HashSet<&str> = HashSet::new();
        for stage in &self.pipeline.stages {
            let deps = self.dependencies_of(stage).ok_or_else(|| {
                XaioError::config(format!("pipeline.stages: unknown stage `{stage}`"))
            })?;
            for dep in &deps {
                if !seen.contains(dep.as_str()) {
                    return Err(XaioError::config(format!(
                        "pipeline.stages: `{stage}` depends on `{dep}`, which must be listed before it"
                    )));
                }
            }
            if !seen.insert(stage.as_str()) {
                return Err(XaioError::config(format!(
                    "pipeline.stages: `{stage}` is listed twice"
                )));
            }
        }

        self.retry.remote.validate("remote")?;
        self.retry.status.validate("status")?;

        if self.pipeline.stages.iter().any(|s| s == "publish") {
            url::Url::parse(&self.publish.base_url).map_err(|e| {
                XaioError::config(format!(
                    "publish.base_url `{}` is not a valid URL: {e}",
                    self.publish.base_url
                ))
            })?;
        }
        url::Url::parse(&self.model.base_url).map_err(|e| {
            XaioError::config(format!(
                "model.base_url `{}` is not a valid URL: {e}",
                self.model.base_url
            ))
        })?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.xaio/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| XaioError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the default config file (`~/.xaio/xaio.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load and validate the config from the default location. Returns
/// defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        let config = AppConfig::default();
        config.validate()?;
        return Ok(config);
    }

    load_config_from(&path)
}

/// Load and validate the config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| XaioError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| XaioError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Write a default config file to `path` (or the default location).
/// Returns the path written.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| XaioError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content = toml::to_string_pretty(&config).map_err(|e| XaioError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| XaioError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read a required, non-empty environment variable.
pub fn require_env(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(XaioError::config(format!(
            "environment variable {var_name} is not set"
        ))),
    }
}
