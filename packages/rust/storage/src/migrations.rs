//! SQL migration definitions for the queue database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: queue rows and per-row named fields",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per queued document, in insertion order
CREATE TABLE IF NOT EXISTS queue_rows (
    row_id     INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at TEXT NOT NULL
);

-- Free-form (row, field) -> value cells
CREATE TABLE IF NOT EXISTS queue_fields (
    row_id     INTEGER NOT NULL REFERENCES queue_rows(row_id) ON DELETE CASCADE,
    field      TEXT NOT NULL,
    value      TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (row_id, field)
);

CREATE INDEX IF NOT EXISTS idx_queue_fields_row ON queue_fields(row_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
