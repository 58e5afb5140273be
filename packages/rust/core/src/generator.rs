//! Resumable multi-step generation.
//!
//! A [`ResumableGenerator`] runs a fixed, ordered list of independent
//! sub-tasks over one input and collects their text into a
//! [`MultiStepArtifact`]. The artifact is re-persisted after every
//! sub-task, so an interrupted run resumes with only the missing ones.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use xaio_shared::{Fingerprint, Result, XaioError};

use crate::artifacts::{read_json, write_json};
use crate::fingerprint::short;

/// A named sub-task.
#[derive(Debug, Clone)]
pub struct SubTaskSpec {
    pub name: String,
    pub prompt: String,
}

/// Executes one sub-task against the shared input.
#[async_trait]
pub trait SubTaskRunner: Send + Sync {
    async fn run_subtask(&self, spec: &SubTaskSpec) -> Result<String>;
}

/// Output of the generator: sub-task name to result text, plus the
/// fingerprint of the input that produced it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiStepArtifact {
    #[serde(rename = "text_sha256")]
    pub fingerprint: Option<Fingerprint>,
    /// Descriptive fields (model, schema version, source facts).
    #[serde(default, flatten)]
    pub metadata: Map<String, Value>,
    #[serde(rename = "panels", default)]
    pub results: BTreeMap<String, String>,
}

impl MultiStepArtifact {
    /// Whether `name` holds non-empty text.
    pub fn has(&self, name: &str) -> bool {
        self.results.get(name).is_some_and(|t| !t.trim().is_empty())
    }

    /// Every declared sub-task present with non-empty text.
    pub fn is_complete(&self, specs: &[SubTaskSpec]) -> bool {
        specs.iter().all(|s| self.has(&s.name))
    }
}

/// What one invocation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerateReport {
    /// Complete artifact for the same fingerprint already on disk.
    pub short_circuited: bool,
    /// Sub-tasks carried over from a partial artifact.
    pub reused: Vec<String>,
    /// Sub-tasks executed by this invocation.
    pub performed: Vec<String>,
}

pub struct ResumableGenerator {
    specs: Vec<SubTaskSpec>,
}

impl ResumableGenerator {
    pub fn new(specs: Vec<SubTaskSpec>) -> Self {
        Self { specs }
    }

    pub fn specs(&self) -> &[SubTaskSpec] {
        &self.specs
    }

    /// Load the artifact at `path`, if it exists and parses.
    pub fn load(path: &Path) -> Option<MultiStepArtifact> {
        if !path.is_file() {
            return None;
        }
        match read_json::<MultiStepArtifact>(path) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable partial artifact");
                None
            }
        }
    }

    /// Bring the artifact at `path` to completion for `fingerprint`.
    ///
    /// Results are reused only from an artifact with the same fingerprint;
    /// `force` discards them. Any sub-task error aborts the invocation
    /// after everything completed so far has been persisted.
    pub async fn generate(
        &self,
        path: &Path,
        fingerprint: &Fingerprint,
        metadata: Map<String, Value>,
        runner: &dyn SubTaskRunner,
        force: bool,
    ) -> Result<GenerateReport> {
        let existing = Self::load(path).filter(|a| a.fingerprint.as_ref() == Some(fingerprint));

        if let Some(artifact) = &existing {
            if !force && artifact.is_complete(&self.specs) {
                info!(fingerprint = %short(fingerprint), "all sub-tasks present, nothing to do");
                return Ok(GenerateReport {
                    short_circuited: true,
                    ..GenerateReport::default()
                });
            }
        }

        let mut artifact = MultiStepArtifact {
            fingerprint: Some(fingerprint.clone()),
            metadata,
            results: BTreeMap::new(),
        };
        let mut report = GenerateReport::default();

        if let Some(previous) = existing.filter(|_| !force) {
            for spec in &self.specs {
                if previous.has(&spec.name) {
                    if let Some(text) = previous.results.get(&spec.name) {
                        artifact.results.insert(spec.name.clone(), text.clone());
                        report.reused.push(spec.name.clone());
                    }
                }
            }
        }
        if !report.reused.is_empty() {
            info!(reused = report.reused.len(), total = self.specs.len(), "resuming partial artifact");
        }

        for spec in &self.specs {
            if artifact.has(&spec.name) {
                continue;
            }

            let started = Instant::now();
            debug!(subtask = %spec.name, "sub-task starting");
            let text = runner.run_subtask(spec).await?;
            let text = text.trim();
            if text.is_empty() {
                return Err(XaioError::validation(format!(
                    "sub-task `{}` returned empty text",
                    spec.name
                )));
            }

            artifact.results.insert(spec.name.clone(), text.to_string());
            write_json(path, &artifact)?;
            report.performed.push(spec.name.clone());
            info!(
                subtask = %spec.name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sub-task done"
            );
        }

        // Covers the case where nothing new ran but metadata changed.
        write_json(path, &artifact)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_dir;
    use std::sync::Mutex;

    fn specs(n: usize) -> Vec<SubTaskSpec> {
        (1..=n)
            .map(|i| SubTaskSpec {
                name: format!("panel_{i:02}"),
                prompt: format!("prompt {i}"),
            })
            .collect()
    }

    /// Answers `result for <name>`, optionally failing on one sub-task.
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl Recorder {
        fn new(fail_on: Option<&str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail_on: fail_on.map(String::from),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl SubTaskRunner for Recorder {
        async fn run_subtask(&self, spec: &SubTaskSpec) -> Result<String> {
            self.calls.lock().expect("lock").push(spec.name.clone());
            if self.fail_on.as_deref() == Some(spec.name.as_str()) {
                return Err(XaioError::Transient("connection reset".into()));
            }
            Ok(format!("result for {}", spec.name))
        }
    }

    #[tokio::test]
    async fn interrupted_run_resumes_with_only_missing_subtasks() {
        let tmp = temp_dir();
        let path = tmp.join("x.buffers.json");
        let generator = ResumableGenerator::new(specs(5));
        let fp = Fingerprint::of_str("text");

        // Crash on sub-task 4: 1..3 are persisted.
        let first = Recorder::new(Some("panel_04"));
        let err = generator
            .generate(&path, &fp, Map::new(), &first, false)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        let partial = ResumableGenerator::load(&path).expect("partial artifact");
        assert_eq!(partial.results.len(), 3);
        assert!(!partial.is_complete(generator.specs()));

        let second = Recorder::new(None);
        let report = generator
            .generate(&path, &fp, Map::new(), &second, false)
            .await
            .expect("resume");
        assert_eq!(second.calls(), vec!["panel_04", "panel_05"]);
        assert_eq!(report.reused, vec!["panel_01", "panel_02", "panel_03"]);

        let done = ResumableGenerator::load(&path).expect("artifact");
        assert!(done.is_complete(generator.specs()));
        assert_eq!(done.results["panel_01"], partial.results["panel_01"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn complete_artifact_short_circuits() {
        let tmp = temp_dir();
        let path = tmp.join("x.buffers.json");
        let generator = ResumableGenerator::new(specs(3));
        let fp = Fingerprint::of_str("text");

        generator
            .generate(&path, &fp, Map::new(), &Recorder::new(None), false)
            .await
            .expect("first");

        let again = Recorder::new(None);
        let report = generator
            .generate(&path, &fp, Map::new(), &again, false)
            .await
            .expect("second");
        assert!(report.short_circuited);
        assert!(again.calls().is_empty());

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn changed_fingerprint_discards_previous_results() {
        let tmp = temp_dir();
        let path = tmp.join("x.buffers.json");
        let generator = ResumableGenerator::new(specs(3));

        generator
            .generate(&path, &Fingerprint::of_str("v1"), Map::new(), &Recorder::new(None), false)
            .await
            .expect("v1");

        let v2 = Recorder::new(None);
        let report = generator
            .generate(&path, &Fingerprint::of_str("v2"), Map::new(), &v2, false)
            .await
            .expect("v2");
        assert_eq!(v2.calls().len(), 3);
        assert!(report.reused.is_empty());

        let artifact = ResumableGenerator::load(&path).expect("artifact");
        assert_eq!(artifact.fingerprint, Some(Fingerprint::of_str("v2")));

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn force_recomputes_everything() {
        let tmp = temp_dir();
        let path = tmp.join("x.buffers.json");
        let generator = ResumableGenerator::new(specs(2));
        let fp = Fingerprint::of_str("text");

        generator
            .generate(&path, &fp, Map::new(), &Recorder::new(None), false)
            .await
            .expect("first");
        let forced = Recorder::new(None);
        generator
            .generate(&path, &fp, Map::new(), &forced, true)
            .await
            .expect("forced");
        assert_eq!(forced.calls().len(), 2);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[tokio::test]
    async fn blank_results_are_not_complete() {
        let tmp = temp_dir();
        let path = tmp.join("x.buffers.json");
        let mut seeded = MultiStepArtifact {
            fingerprint: Some(Fingerprint::of_str("text")),
            ..MultiStepArtifact::default()
        };
        seeded.results.insert("panel_01".into(), "kept".into());
        seeded.results.insert("panel_02".into(), "   ".into());
        write_json(&path, &seeded).expect("seed");

        let generator = ResumableGenerator::new(specs(2));
        let runner = Recorder::new(None);
        generator
            .generate(&path, &Fingerprint::of_str("text"), Map::new(), &runner, false)
            .await
            .expect("generate");
        assert_eq!(runner.calls(), vec!["panel_02"]);

        let _ = std::fs::remove_dir_all(&tmp);
    }

    #[test]
    fn artifact_serializes_flat_metadata() {
        let mut metadata = Map::new();
        metadata.insert("model".into(), Value::String("m".into()));
        let artifact = MultiStepArtifact {
            fingerprint: Some(Fingerprint::of_str("t")),
            metadata,
            results: BTreeMap::from([("p".to_string(), "x".to_string())]),
        };
        let json = serde_json::to_value(&artifact).expect("serialize");
        assert_eq!(json["model"], "m");
        assert_eq!(json["panels"]["p"], "x");
        assert!(json["text_sha256"].is_string());

        let back: MultiStepArtifact = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, artifact);
    }
}
