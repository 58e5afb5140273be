//! The pipeline driver: one pass over the ready rows of the queue.
//!
//! Items are processed in row order, one at a time, stages in configured
//! order. An item whose stages are all DONE and fresh is *satisfied* and
//! does not count toward the per-run cap; neither do rows that are deferred
//! or that lack an input path.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{Instrument, Span, field, info, info_span, warn};
use uuid::Uuid;
use xaio_shared::{
    ErrorText, ItemId, PipelineConfig, QueueConfig, Result, StageRecord, WorkItem, XaioError,
};
use xaio_storage::QueueStore;

use crate::input::input_fingerprint;
use crate::queue::{Candidate, QueueReader};
use crate::retry::RetryPolicy;
use crate::stage::{Stage, StageContext, StageExecutor, StageOutcome, StagePlan};
use crate::status::{Checkpoint, StatusWriter};

/// Identity of one run, passed explicitly to everything that logs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    /// Root span; item and stage spans are its children.
    pub span: Span,
}

impl RunContext {
    pub fn new() -> Self {
        let run_id = Uuid::now_v7();
        let span = info_span!("run", %run_id);
        Self { run_id, span }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Items attempted per run.
    pub max_per_run: usize,
    pub force: bool,
    pub max_error_chars: usize,
    pub running_stale_after: Duration,
}

impl DriverOptions {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_per_run: config.max_per_run,
            force: false,
            max_error_chars: config.max_error_chars,
            running_stale_after: Duration::from_secs(config.running_stale_after_secs),
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Rows in the queue store.
    pub total_rows: usize,
    /// Ready rows considered.
    pub seen: usize,
    /// Items that had at least one stage to run; bounded by the cap.
    pub attempted: usize,
    /// Items already DONE and fresh for every stage.
    pub satisfied: usize,
    /// Items left alone because a stage is RUNNING elsewhere.
    pub deferred: usize,
    /// Attempted items that stopped on a failed stage.
    pub failed: usize,
    /// Ready rows without a usable input path.
    pub missing_input: usize,
    pub stage_runs: usize,
    pub stage_skips: usize,
    pub elapsed: Duration,
}

/// Progress callbacks for a run.
pub trait RunProgress: Send + Sync {
    /// Called once the queue has been read.
    fn run_started(&self, ready: usize, cap: usize);
    /// Called before an item's stages execute.
    fn item_started(&self, item: &WorkItem, attempted: usize);
    /// Called after each stage of an attempted item.
    fn stage_finished(&self, item: &WorkItem, stage: &str, outcome: &StageOutcome);
    /// Called when the run completes.
    fn run_finished(&self, summary: &RunSummary);
}

/// No-op progress for headless and test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn run_started(&self, _ready: usize, _cap: usize) {}
    fn item_started(&self, _item: &WorkItem, _attempted: usize) {}
    fn stage_finished(&self, _item: &WorkItem, _stage: &str, _outcome: &StageOutcome) {}
    fn run_finished(&self, _summary: &RunSummary) {}
}

/// Why an item was not attempted.
enum Triage {
    Attempt,
    Satisfied,
    Deferred,
}

pub struct PipelineDriver<'a> {
    queue: &'a dyn QueueStore,
    queue_config: &'a QueueConfig,
    stages: Vec<&'a dyn Stage>,
    status_policy: RetryPolicy,
    options: DriverOptions,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(
        queue: &'a dyn QueueStore,
        queue_config: &'a QueueConfig,
        stages: Vec<&'a dyn Stage>,
        status_policy: RetryPolicy,
        options: DriverOptions,
    ) -> Self {
        Self {
            queue,
            queue_config,
            stages,
            status_policy,
            options,
        }
    }

    /// Execute one pass. Only a failure to read the queue aborts the run;
    /// per-item failures are recorded and the pass continues.
    pub async fn run(&self, ctx: &RunContext, progress: &dyn RunProgress) -> Result<RunSummary> {
        self.run_inner(progress).instrument(ctx.span.clone()).await
    }

    async fn run_inner(&self, progress: &dyn RunProgress) -> Result<RunSummary> {
        let started = Instant::now();
        let view = QueueReader::new(self.queue, self.queue_config).read().await?;
        let status = StatusWriter::new(self.queue, self.status_policy.clone());
        let executor = StageExecutor::new(
            &status,
            self.options.max_error_chars,
            self.options.running_stale_after,
            StageContext {
                force: self.options.force,
            },
        );

        let mut summary = RunSummary {
            total_rows: view.total_rows,
            seen: view.candidates.len(),
            ..RunSummary::default()
        };
        info!(
            total_rows = view.total_rows,
            ready = view.candidates.len(),
            cap = self.options.max_per_run,
            stages = self.stages.len(),
            force = self.options.force,
            "run starting"
        );
        progress.run_started(view.candidates.len(), self.options.max_per_run);

        for candidate in &view.candidates {
            if summary.attempted >= self.options.max_per_run {
                info!(cap = self.options.max_per_run, "per-run cap reached");
                break;
            }

            let span = info_span!(
                "item",
                row = candidate.row,
                url = %candidate.url,
                item_id = field::Empty
            );
            self.process(candidate, &executor, &status, &mut summary, progress)
                .instrument(span)
                .await;
        }

        summary.elapsed = started.elapsed();
        info!(
            attempted = summary.attempted,
            satisfied = summary.satisfied,
            deferred = summary.deferred,
            failed = summary.failed,
            missing_input = summary.missing_input,
            stage_runs = summary.stage_runs,
            stage_skips = summary.stage_skips,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "run complete"
        );
        progress.run_finished(&summary);
        Ok(summary)
    }

    async fn process(
        &self,
        candidate: &Candidate,
        executor: &StageExecutor<'_>,
        status: &StatusWriter<'_>,
        summary: &mut RunSummary,
        progress: &dyn RunProgress,
    ) {
        let item = match self.work_item(candidate) {
            Ok(item) => item,
            Err(e) => {
                summary.missing_input += 1;
                self.record_missing_input(candidate, &e, status).await;
                return;
            }
        };
        Span::current().record("item_id", field::display(&item.id));

        let records: Vec<StageRecord> = self
            .stages
            .iter()
            .map(|s| StageRecord::from_fields(s.fields(), &candidate.fields))
            .collect();

        match self.triage(executor, &item, &records) {
            Triage::Satisfied => {
                summary.satisfied += 1;
                return;
            }
            Triage::Deferred => {
                summary.deferred += 1;
                info!("a stage is RUNNING elsewhere, leaving item for a later run");
                return;
            }
            Triage::Attempt => {}
        }

        summary.attempted += 1;
        progress.item_started(&item, summary.attempted);
        let started = Instant::now();

        for (stage, record) in self.stages.iter().zip(records) {
            let outcome = executor.execute(*stage, &item, record).await;
            progress.stage_finished(&item, stage.name(), &outcome);
            match outcome {
                StageOutcome::Skipped => summary.stage_skips += 1,
                StageOutcome::Done { .. } => summary.stage_runs += 1,
                StageOutcome::Failed { .. } => {
                    summary.stage_runs += 1;
                    summary.failed += 1;
                    warn!(
                        stage = stage.name(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "item stopped at failed stage"
                    );
                    return;
                }
                StageOutcome::Deferred => {
                    summary.deferred += 1;
                    return;
                }
            }
        }
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "item done");
    }

    /// Plan every stage against the snapshot. Any deferral defers the
    /// item; all-skip means nothing to do.
    fn triage(&self, executor: &StageExecutor<'_>, item: &WorkItem, records: &[StageRecord]) -> Triage {
        let mut all_skip = true;
        for (stage, record) in self.stages.iter().zip(records) {
            let mut record = record.clone();
            match executor.plan(*stage, item, &mut record) {
                StagePlan::Deferred => return Triage::Deferred,
                StagePlan::Skip => {}
                StagePlan::Run { .. } | StagePlan::Blocked { .. } => all_skip = false,
            }
        }
        if all_skip {
            Triage::Satisfied
        } else {
            Triage::Attempt
        }
    }

    fn work_item(&self, candidate: &Candidate) -> Result<WorkItem> {
        if candidate.input_path.is_empty() {
            return Err(XaioError::precondition(format!(
                "row {} is ready but `{}` is empty",
                candidate.row, self.queue_config.input_field
            )));
        }
        let input_path = PathBuf::from(&candidate.input_path);
        if !input_path.is_file() {
            return Err(XaioError::precondition(format!(
                "input {} does not exist",
                input_path.display()
            )));
        }
        let fingerprint = input_fingerprint(&input_path)?;
        Ok(WorkItem {
            id: ItemId::from_input_path(&input_path),
            row: candidate.row,
            url: candidate.url.clone(),
            input_path,
            fingerprint,
        })
    }

    /// Mark the first stage FAILED so the row's problem is visible.
    async fn record_missing_input(&self, candidate: &Candidate, error: &XaioError, status: &StatusWriter<'_>) {
        warn!(error = %error, "skipping row without usable input");
        let Some(first) = self.stages.first() else {
            return;
        };
        let text = ErrorText::new(&error.to_string(), self.options.max_error_chars);
        status
            .checkpoint(
                candidate.row,
                first.fields(),
                &Checkpoint::Failed {
                    error: text.into_string(),
                },
            )
            .await;
    }
}
