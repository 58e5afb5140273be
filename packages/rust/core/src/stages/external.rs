//! Stages whose unit of work is an external command.
//!
//! The command receives its input and output locations through argument
//! placeholders. Success requires both a zero exit status and the expected
//! artifact on disk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, instrument};
use xaio_shared::{ExternalStageConfig, Fingerprint, Result, StageFields, WorkItem, XaioError};

use super::{StageIdentity, upstream_path};
use crate::artifacts::read_upstream;
use crate::layout::ArtifactLayout;
use crate::stage::{Stage, StageContext, StageOutput};

/// Characters of command output kept as the failure diagnostic.
const DIAGNOSTIC_TAIL_CHARS: usize = 4_000;

pub struct ExternalStage {
    identity: StageIdentity,
    config: ExternalStageConfig,
    layout: ArtifactLayout,
}

impl ExternalStage {
    pub(crate) fn new(identity: StageIdentity, config: ExternalStageConfig, layout: ArtifactLayout) -> Self {
        Self {
            identity,
            config,
            layout,
        }
    }

    fn input_path(&self, item: &WorkItem) -> Result<PathBuf> {
        if self.config.input_from == "input" {
            Ok(item.input_path.clone())
        } else {
            upstream_path(&self.layout, &self.config.input_from, &item.id)
        }
    }

    /// Expand placeholders in the configured arguments.
    fn args(&self, item: &WorkItem, input: &Path, output: &Path) -> Vec<String> {
        let outdir = output.parent().unwrap_or(Path::new("."));
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input.display().to_string())
                    .replace("{output}", &output.display().to_string())
                    .replace("{outdir}", &outdir.display().to_string())
                    .replace("{model}", self.config.model.as_deref().unwrap_or(""))
                    .replace("{id}", item.id.as_str())
            })
            .collect()
    }

    fn failure(&self, message: String) -> XaioError {
        XaioError::Command {
            program: self.config.program.clone(),
            message,
        }
    }
}

/// The last `max` characters of `s`.
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    match s.char_indices().nth(count - max) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Stderr, or stdout when stderr is empty, bounded to its tail.
fn diagnostic(stdout: &[u8], stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let text = if stderr.trim().is_empty() {
        String::from_utf8_lossy(stdout).into_owned()
    } else {
        stderr.into_owned()
    };
    tail(text.trim(), DIAGNOSTIC_TAIL_CHARS).to_string()
}

#[async_trait]
impl Stage for ExternalStage {
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
        let input = self.input_path(item)?;
        let bytes = read_upstream(&self.config.input_from, &input)?;
        let mut parts: Vec<&[u8]> = vec![bytes.as_slice(), self.config.program.as_bytes()];
        parts.extend(self.config.args.iter().map(|a| a.as_bytes()));
        if let Some(model) = &self.config.model {
            parts.push(model.as_bytes());
        }
        Ok(Fingerprint::combine(parts))
    }

    #[instrument(skip_all, fields(item_id = %item.id, program = %self.config.program))]
    async fn run(&self, item: &WorkItem, output: &Path, _ctx: &StageContext) -> Result<StageOutput> {
        let input = self.input_path(item)?;
        if !input.is_file() {
            return Err(XaioError::precondition(format!(
                "{} input not found at {}",
                self.config.input_from,
                input.display()
            )));
        }

        if let Some(dir) = output.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| XaioError::io(dir, e))?;
        }
        // A leftover artifact must not pass for this run's output.
        if output.exists() {
            std::fs::remove_file(output).map_err(|e| XaioError::io(output, e))?;
        }

        let args = self.args(item, &input, output);
        debug!(?args, "spawning command");

        let child = Command::new(&self.config.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.failure(format!("failed to spawn: {e}")))?;

        let limit = Duration::from_secs(self.config.timeout_secs);
        let result = tokio::time::timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| self.failure(format!("timed out after {}s", self.config.timeout_secs)))?
            .map_err(|e| self.failure(format!("failed to wait: {e}")))?;

        if !result.status.success() {
            let code = result
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(self.failure(format!(
                "exit {code}: {}",
                diagnostic(&result.stdout, &result.stderr)
            )));
        }
        if !output.is_file() {
            return Err(self.failure(format!(
                "exited 0 but did not write {}: {}",
                output.display(),
                diagnostic(&result.stdout, &result.stderr)
            )));
        }

        info!(artifact = %output.display(), "command finished");
        Ok(StageOutput::artifact(output))
    }
}
