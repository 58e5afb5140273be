//! The stage contract and the executor that runs one stage for one item.
//!
//! Per (item, stage) the state machine is
//! `UNSTARTED -> RUNNING -> {DONE, FAILED}`. A stage is skipped only when
//! its recorded status is DONE *and* its artifact's marker matches the
//! fingerprint computed now; otherwise it runs.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{Instrument, debug, info, info_span, warn};
use xaio_shared::{
    ErrorText, Fingerprint, Result, StageFields, StageRecord, StageStatus, WorkItem, XaioError,
};
use xaio_storage::FieldUpdate;

use crate::fingerprint::{FingerprintStore, short};
use crate::status::{Checkpoint, StatusWriter};

/// Per-run flags visible to a stage's unit of work.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageContext {
    /// Recompute even when previous output looks reusable.
    pub force: bool,
}

/// What a successful unit of work produced.
#[derive(Debug, Clone)]
pub struct StageOutput {
    /// The artifact written; must be the `output` path the stage was given.
    pub artifact: PathBuf,
    /// Additional queue fields to record with DONE.
    pub extra_fields: Vec<FieldUpdate>,
}

impl StageOutput {
    pub fn artifact(path: &Path) -> Self {
        Self {
            artifact: path.to_path_buf(),
            extra_fields: Vec::new(),
        }
    }
}

/// One named unit of processing.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Queue fields owned by this stage.
    fn fields(&self) -> &StageFields;

    /// Deterministic artifact location for `item`.
    fn output_path(&self, item: &WorkItem) -> PathBuf;

    /// Fingerprint of exactly the inputs this stage consumes. Fails with a
    /// missing-precondition error when an upstream artifact is absent.
    fn fingerprint(&self, item: &WorkItem) -> Result<Fingerprint>;

    /// Produce the artifact at `output`. Must write atomically.
    async fn run(&self, item: &WorkItem, output: &Path, ctx: &StageContext) -> Result<StageOutput>;
}

/// Planning decision for one (item, stage).
#[derive(Debug)]
pub enum StagePlan {
    /// DONE and fresh for the current fingerprint.
    Skip,
    /// Needs to run for this fingerprint.
    Run { fingerprint: Fingerprint },
    /// Cannot compute a fingerprint; running would fail on a precondition.
    Blocked { reason: XaioError },
    /// RUNNING recently, presumably in flight elsewhere.
    Deferred,
}

impl StagePlan {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip)
    }
}

/// Result of executing one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Skipped,
    Done { artifact: PathBuf },
    Failed { error: String },
    Deferred,
}

/// Runs one stage for one item and records the status transition.
pub struct StageExecutor<'a> {
    fingerprints: FingerprintStore,
    status: &'a StatusWriter<'a>,
    max_error_chars: usize,
    running_stale_after: std::time::Duration,
    ctx: StageContext,
}

impl<'a> StageExecutor<'a> {
    pub fn new(
        status: &'a StatusWriter<'a>,
        max_error_chars: usize,
        running_stale_after: std::time::Duration,
        ctx: StageContext,
    ) -> Self {
        Self {
            fingerprints: FingerprintStore::new(),
            status,
            max_error_chars,
            running_stale_after,
            ctx,
        }
    }

    /// RUNNING with a timestamp newer than the staleness window. A missing
    /// timestamp means the RUNNING row was abandoned.
    fn is_in_flight(&self, record: &StageRecord, now: DateTime<Utc>) -> bool {
        if record.status != StageStatus::Running {
            return false;
        }
        match record.updated_at {
            Some(t) => match now.signed_duration_since(t).to_std() {
                Ok(age) => age < self.running_stale_after,
                // Written "in the future" by a skewed clock: assume live.
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Decide whether `stage` must run for `item`. `record` has its
    /// `fingerprint` filled from the artifact's marker.
    pub fn plan(&self, stage: &dyn Stage, item: &WorkItem, record: &mut StageRecord) -> StagePlan {
        if self.is_in_flight(record, Utc::now()) {
            return StagePlan::Deferred;
        }

        let output = stage.output_path(item);
        record.fingerprint = self.fingerprints.read_marker(&output);

        let fingerprint = match stage.fingerprint(item) {
            Ok(fp) => fp,
            Err(reason) => return StagePlan::Blocked { reason },
        };

        let satisfied = record.status == StageStatus::Done
            && record.output_path.is_some()
            && self.fingerprints.is_fresh(&output, &fingerprint);

        if satisfied && !self.ctx.force {
            StagePlan::Skip
        } else {
            StagePlan::Run { fingerprint }
        }
    }

    /// Plan and, if needed, run `stage` for `item`.
    pub async fn execute(
        &self,
        stage: &dyn Stage,
        item: &WorkItem,
        mut record: StageRecord,
    ) -> StageOutcome {
        let span = info_span!("stage", stage = stage.name());
        async {
            match self.plan(stage, item, &mut record) {
                StagePlan::Deferred => {
                    info!("stage is RUNNING elsewhere, deferring");
                    StageOutcome::Deferred
                }
                StagePlan::Skip => {
                    debug!("stage is DONE and fresh, skipping");
                    StageOutcome::Skipped
                }
                StagePlan::Blocked { reason } => self.fail(stage, item, &reason, Instant::now()).await,
                StagePlan::Run { fingerprint } => self.run(stage, item, &record, fingerprint).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        stage: &dyn Stage,
        item: &WorkItem,
        record: &StageRecord,
        fingerprint: Fingerprint,
    ) -> StageOutcome {
        let started = Instant::now();
        let output = stage.output_path(item);
        info!(
            fingerprint = %short(&fingerprint),
            previous = ?record.fingerprint.as_ref().map(|f| short(f).to_string()),
            previous_status = ?record.status,
            "stage starting"
        );

        self.status
            .checkpoint(item.row, stage.fields(), &Checkpoint::Running)
            .await;

        if let Err(e) = self.fingerprints.invalidate(&output) {
            return self.fail(stage, item, &e, started).await;
        }

        let produced = match stage.run(item, &output, &self.ctx).await {
            Ok(produced) => produced,
            Err(e) => return self.fail(stage, item, &e, started).await,
        };

        if produced.artifact != output {
            let e = XaioError::validation(format!(
                "stage wrote {} instead of {}",
                produced.artifact.display(),
                output.display()
            ));
            return self.fail(stage, item, &e, started).await;
        }
        if !output.is_file() {
            let e = XaioError::precondition(format!(
                "stage reported success but {} does not exist",
                output.display()
            ));
            return self.fail(stage, item, &e, started).await;
        }
        if let Err(e) = self.fingerprints.mark_fresh(&output, &fingerprint) {
            return self.fail(stage, item, &e, started).await;
        }

        let checkpoint = Checkpoint::Done {
            artifact: output.display().to_string(),
            extra: produced.extra_fields,
        };
        self.status
            .checkpoint(item.row, stage.fields(), &checkpoint)
            .await;

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            artifact = %output.display(),
            "stage done"
        );
        StageOutcome::Done { artifact: output }
    }

    async fn fail(
        &self,
        stage: &dyn Stage,
        item: &WorkItem,
        error: &XaioError,
        started: Instant,
    ) -> StageOutcome {
        let text = ErrorText::new(&error.to_string(), self.max_error_chars).into_string();
        warn!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %text,
            "stage failed"
        );
        self.status
            .checkpoint(
                item.row,
                stage.fields(),
                &Checkpoint::Failed {
                    error: text.clone(),
                },
            )
            .await;
        StageOutcome::Failed { error: text }
    }
}
