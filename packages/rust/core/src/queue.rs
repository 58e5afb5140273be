//! Bulk read of the queue before a run.

use std::collections::HashMap;

use tracing::{debug, instrument};
use xaio_shared::{QueueConfig, Result};
use xaio_storage::QueueStore;

/// A ready row, as read at the start of the run.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub row: i64,
    pub url: String,
    /// Raw value of the input path field; may be empty.
    pub input_path: String,
    pub fields: HashMap<String, String>,
}

/// Result of one bulk read.
#[derive(Debug, Clone, Default)]
pub struct QueueView {
    /// Rows in the store, ready or not.
    pub total_rows: usize,
    /// Ready rows in row order.
    pub candidates: Vec<Candidate>,
}

/// Pulls the current field values of every row in one snapshot.
pub struct QueueReader<'a> {
    queue: &'a dyn QueueStore,
    config: &'a QueueConfig,
}

impl<'a> QueueReader<'a> {
    pub fn new(queue: &'a dyn QueueStore, config: &'a QueueConfig) -> Self {
        Self { queue, config }
    }

    #[instrument(skip_all)]
    pub async fn read(&self) -> Result<QueueView> {
        let snapshot = self.queue.snapshot().await?;
        let total_rows = snapshot.len();

        let candidates: Vec<Candidate> = snapshot
            .rows
            .into_iter()
            .filter(|r| r.get(&self.config.ready_field).trim() == self.config.ready_value)
            .map(|r| Candidate {
                row: r.row,
                url: r.get(&self.config.url_field).trim().to_string(),
                input_path: r.get(&self.config.input_field).trim().to_string(),
                fields: r.fields,
            })
            .collect();

        debug!(total_rows, ready = candidates.len(), "read queue snapshot");
        Ok(QueueView {
            total_rows,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryQueue;

    #[tokio::test]
    async fn filters_ready_rows_and_tolerates_short_rows() {
        let queue = MemoryQueue::with_rows(vec![
            vec![("url", "https://a"), ("ai_status", "AI_READY"), ("ai_input_path", " /in/a.ai_input.json ")],
            vec![("url", "https://b"), ("ai_status", "CONDENSING")],
            vec![],
            vec![("ai_status", "AI_READY")],
        ]);
        let config = QueueConfig::default();
        let view = QueueReader::new(&queue, &config).read().await.expect("read");

        assert_eq!(view.total_rows, 4);
        assert_eq!(view.candidates.len(), 2);
        assert_eq!(view.candidates[0].row, 1);
        assert_eq!(view.candidates[0].input_path, "/in/a.ai_input.json");
        assert_eq!(view.candidates[1].row, 4);
        assert_eq!(view.candidates[1].url, "");
        assert_eq!(view.candidates[1].input_path, "");
    }
}
