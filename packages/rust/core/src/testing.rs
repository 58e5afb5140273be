//! Test doubles shared by the unit tests of this crate.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;
use xaio_shared::{Fingerprint, ItemId, Result, StageFields, WorkItem, XaioError};
use xaio_storage::{FieldUpdate, QueueRow, QueueSnapshot, QueueStore};

use crate::artifacts::{read_upstream, write_json};
use crate::llm::{ChatRequest, ModelClient, ModelOutcome};
use crate::stage::{Stage, StageContext, StageOutput};

/// Unique scratch directory under the system temp dir.
pub(crate) fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("xaio_test_{}", Uuid::now_v7()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// A work item whose input file holds `content`.
pub(crate) fn work_item(dir: &Path, id: &str, content: &str) -> WorkItem {
    let input_path = dir.join("in").join(format!("{id}.ai_input.json"));
    write_json(
        &input_path,
        &json!({"content": {"extracted_text_full": content}}),
    )
    .expect("write input");
    WorkItem {
        id: ItemId(id.to_string()),
        row: 1,
        url: format!("https://example.org/{id}"),
        input_path,
        fingerprint: Fingerprint::of_str(content),
    }
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

/// Queue store kept in memory, with injectable write failures.
#[derive(Default)]
pub(crate) struct MemoryQueue {
    rows: Mutex<Vec<QueueRow>>,
    failing_writes: AtomicUsize,
    write_calls: AtomicUsize,
}

impl MemoryQueue {
    /// Rows are numbered from 1 in the given order.
    pub(crate) fn with_rows(rows: Vec<Vec<(&str, &str)>>) -> Self {
        let rows = rows
            .into_iter()
            .enumerate()
            .map(|(i, fields)| QueueRow {
                row: i as i64 + 1,
                fields: fields
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
            ..Self::default()
        }
    }

    pub(crate) fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    pub(crate) fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn row_fields(&self, row: i64) -> HashMap<String, String> {
        self.rows
            .lock()
            .expect("lock")
            .iter()
            .find(|r| r.row == row)
            .map(|r| r.fields.clone())
            .unwrap_or_default()
    }

    pub(crate) fn field(&self, row: i64, field: &str) -> String {
        self.row_fields(row).get(field).cloned().unwrap_or_default()
    }

    pub(crate) fn set(&self, row: i64, field: &str, value: &str) {
        let mut rows = self.rows.lock().expect("lock");
        if let Some(r) = rows.iter_mut().find(|r| r.row == row) {
            r.fields.insert(field.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    async fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            rows: self.rows.lock().expect("lock").clone(),
        })
    }

    async fn write_fields(&self, row: i64, updates: &[FieldUpdate]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(XaioError::Queue("injected write failure".into()));
        }
        let mut rows = self.rows.lock().expect("lock");
        let r = rows
            .iter_mut()
            .find(|r| r.row == row)
            .ok_or_else(|| XaioError::Queue(format!("row {row} does not exist")))?;
        for u in updates {
            r.fields.insert(u.field.clone(), u.value.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fake stage
// ---------------------------------------------------------------------------

enum Behaviour {
    Succeed,
    Fail(String),
    PartialWriteThenFail,
}

enum FingerprintSource {
    Content,
    Url,
    /// Item content plus the artifact another stage wrote for the item.
    Upstream(PathBuf),
    File(PathBuf),
}

/// Stage writing `<dir>/<name>/<id>.json` and recording which items ran.
pub(crate) struct FakeStage {
    name: String,
    fields: StageFields,
    dir: PathBuf,
    behaviour: Behaviour,
    source: FingerprintSource,
    fail_ids: Vec<String>,
    ran: Mutex<Vec<String>>,
}

impl FakeStage {
    pub(crate) fn new(name: &str, root: &Path) -> Self {
        Self {
            name: name.to_string(),
            fields: StageFields::for_stage(name),
            dir: root.join(name),
            behaviour: Behaviour::Succeed,
            source: FingerprintSource::Content,
            fail_ids: Vec::new(),
            ran: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_with(mut self, message: &str) -> Self {
        self.behaviour = Behaviour::Fail(message.to_string());
        self
    }

    pub(crate) fn failing_for(mut self, id: &str) -> Self {
        self.fail_ids.push(id.to_string());
        self
    }

    pub(crate) fn partial_write_then_fail(mut self) -> Self {
        self.behaviour = Behaviour::PartialWriteThenFail;
        self
    }

    pub(crate) fn depending_on(mut self, file: &Path) -> Self {
        self.source = FingerprintSource::File(file.to_path_buf());
        self
    }

    pub(crate) fn after(mut self, upstream: &FakeStage) -> Self {
        self.source = FingerprintSource::Upstream(upstream.dir.clone());
        self
    }

    pub(crate) fn keyed_on_url(mut self) -> Self {
        self.source = FingerprintSource::Url;
        self
    }

    pub(crate) fn runs(&self) -> usize {
        self.ran.lock().expect("lock").len()
    }

    pub(crate) fn ran_for(&self) -> Vec<String> {
        self.ran.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Stage for FakeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn fields(&self) -> &StageFields {
        &self.fields
    }

    fn output_path(&self, item: &WorkItem) -> PathBuf {
        self.dir.join(format!("{}.json", item.id))
    }

    fn fingerprint(&self, item: &WorkItem) -> Result<Fingerprint> {
        match &self.source {
            FingerprintSource::Content => Ok(item.fingerprint.clone()),
            FingerprintSource::Url => Ok(Fingerprint::of_str(&item.url)),
            FingerprintSource::Upstream(dir) => {
                let bytes = read_upstream("upstream", &dir.join(format!("{}.json", item.id)))?;
                Ok(Fingerprint::combine([item.fingerprint.as_str().as_bytes(), bytes.as_slice()]))
            }
            FingerprintSource::File(path) => {
                let bytes = read_upstream("upstream", path)?;
                Ok(Fingerprint::of_bytes(&bytes))
            }
        }
    }

    async fn run(&self, item: &WorkItem, output: &Path, _ctx: &StageContext) -> Result<StageOutput> {
        self.ran.lock().expect("lock").push(item.id.to_string());
        if self.fail_ids.iter().any(|id| id == item.id.as_str()) {
            return Err(XaioError::Remote(format!("{} failed for {}", self.name, item.id)));
        }
        match &self.behaviour {
            Behaviour::Fail(message) => Err(XaioError::Remote(message.clone())),
            Behaviour::PartialWriteThenFail => {
                std::fs::write(output, b"{\"trunc").map_err(|e| XaioError::io(output, e))?;
                Err(XaioError::io(output, std::io::Error::other("disk full")))
            }
            Behaviour::Succeed => {
                let input = std::fs::read_to_string(&item.input_path)
                    .map_err(|e| XaioError::io(&item.input_path, e))?;
                write_json(output, &json!({"stage": self.name, "input": input}))?;
                Ok(StageOutput::artifact(output))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Model doubles
// ---------------------------------------------------------------------------

/// Returns pre-scripted outcomes in order.
pub(crate) struct ScriptedClient {
    script: Mutex<VecDeque<ModelOutcome>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedClient {
    pub(crate) fn new(script: Vec<ModelOutcome>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().expect("lock").len()
    }

    pub(crate) fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedClient {
    async fn complete(&self, request: &ChatRequest) -> Result<ModelOutcome> {
        self.requests.lock().expect("lock").push(request.clone());
        self.script
            .lock()
            .expect("lock")
            .pop_front()
            .ok_or_else(|| XaioError::Remote("script exhausted".into()))
    }
}

/// Answers every text request with a fixed reply; counts calls.
pub(crate) struct EchoClient {
    reply: String,
    calls: AtomicUsize,
}

impl EchoClient {
    pub(crate) fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for EchoClient {
    async fn complete(&self, _request: &ChatRequest) -> Result<ModelOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ModelOutcome::Ok(serde_json::Value::String(self.reply.clone())))
    }
}
