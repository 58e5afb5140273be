//! Coalesced, best-effort status writes to the queue store.

use chrono::Utc;
use tracing::error;
use xaio_shared::{StageFields, StageStatus};
use xaio_storage::{FieldUpdate, QueueStore};

use crate::retry::RetryPolicy;

/// A status checkpoint for one stage of one item.
#[derive(Debug, Clone)]
pub enum Checkpoint {
    Running,
    Done {
        artifact: String,
        extra: Vec<FieldUpdate>,
    },
    Failed {
        error: String,
    },
}

impl Checkpoint {
    /// All field updates for this checkpoint, stamped with the current time.
    pub fn updates(&self, fields: &StageFields) -> Vec<FieldUpdate> {
        let now = Utc::now().to_rfc3339();
        let mut updates = match self {
            Self::Running => vec![
                FieldUpdate::new(&fields.status, StageStatus::Running.token(&fields.prefix)),
                FieldUpdate::new(&fields.error, ""),
            ],
            Self::Done { artifact, extra } => {
                let mut u = vec![
                    FieldUpdate::new(&fields.status, StageStatus::Done.token(&fields.prefix)),
                    FieldUpdate::new(&fields.path, artifact),
                    FieldUpdate::new(&fields.error, ""),
                ];
                u.extend(extra.iter().cloned());
                u
            }
            Self::Failed { error } => vec![
                FieldUpdate::new(&fields.status, StageStatus::Failed.token(&fields.prefix)),
                FieldUpdate::new(&fields.error, error),
            ],
        };
        updates.push(FieldUpdate::new(&fields.updated_at, now));
        updates
    }
}

/// Writes all field updates for an item in one call, retrying every
/// failure. A final failure is logged and reported as `false`; it never
/// propagates.
pub struct StatusWriter<'a> {
    queue: &'a dyn QueueStore,
    policy: RetryPolicy,
}

impl<'a> StatusWriter<'a> {
    pub fn new(queue: &'a dyn QueueStore, policy: RetryPolicy) -> Self {
        Self { queue, policy }
    }

    pub async fn write_fields(&self, row: i64, updates: &[FieldUpdate]) -> bool {
        let result = self
            .policy
            .run("status_write", |_| true, |_attempt| self.queue.write_fields(row, updates))
            .await;

        match result {
            Ok(()) => true,
            Err(e) => {
                error!(row, fields = updates.len(), error = %e, "status write failed, continuing");
                false
            }
        }
    }

    pub async fn checkpoint(&self, row: i64, fields: &StageFields, checkpoint: &Checkpoint) -> bool {
        self.write_fields(row, &checkpoint.updates(fields)).await
    }
}
