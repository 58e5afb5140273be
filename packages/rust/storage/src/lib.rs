//! Queue store for the xAIO pipeline.
//!
//! The queue is a table addressed by `(row, named field)`. The pipeline
//! reads a bulk [`QueueSnapshot`] before processing and writes coalesced
//! [`FieldUpdate`]s back per item per checkpoint through [`QueueStore`].
//!
//! [`QueueDb`] is the libSQL-backed implementation (offline, local file).

mod db;
mod migrations;

use std::collections::HashMap;

use async_trait::async_trait;
use xaio_shared::Result;

pub use db::QueueDb;

/// One queued row: its position plus whatever fields are set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRow {
    pub row: i64,
    pub fields: HashMap<String, String>,
}

impl QueueRow {
    /// Value of a field, or `""` when the row is short or the field unset.
    pub fn get(&self, field: &str) -> &str {
        self.fields.get(field).map(String::as_str).unwrap_or("")
    }
}

/// All rows of the queue in stable row order, read at one point in time.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    pub rows: Vec<QueueRow>,
}

impl QueueSnapshot {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single `field = value` assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldUpdate {
    pub field: String,
    pub value: String,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// External tabular store holding per-item status and paths.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Read every row with all of its fields, ordered by row.
    async fn snapshot(&self) -> Result<QueueSnapshot>;

    /// Apply all `updates` to `row` in one write.
    async fn write_fields(&self, row: i64, updates: &[FieldUpdate]) -> Result<()>;
}
