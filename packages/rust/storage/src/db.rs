//! libSQL-backed [`QueueStore`].

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, Value, params};
use xaio_shared::{Result, XaioError};

use crate::migrations;
use crate::{FieldUpdate, QueueRow, QueueSnapshot, QueueStore};

fn storage_err(e: libsql::Error) -> XaioError {
    XaioError::Queue(e.to_string())
}

/// Queue handle wrapping a local libSQL database. Opened once per run and
/// shared across items.
pub struct QueueDb {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl QueueDb {
    /// Open or create a queue database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| XaioError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let queue = Self {
            db,
            conn,
            readonly: false,
        };
        queue.run_migrations().await?;
        Ok(queue)
    }

    /// Open an existing queue database for inspection only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(XaioError::Queue(format!(
                "queue database not found at {}",
                path.display()
            )));
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    XaioError::Queue(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(XaioError::Queue("queue is opened in read-only mode".into()));
        }
        Ok(())
    }

    /// Append a new row with the given fields. Returns its row number.
    pub async fn append_row(&self, fields: &[FieldUpdate]) -> Result<i64> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        tx.execute(
            "INSERT INTO queue_rows (created_at) VALUES (?1)",
            params![now.as_str()],
        )
        .await
        .map_err(storage_err)?;
        let row = tx.last_insert_rowid();

        for update in fields {
            tx.execute(
                "INSERT INTO queue_fields (row_id, field, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(row_id, field) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![row, update.field.as_str(), update.value.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;

        tracing::debug!(row, fields = fields.len(), "appended queue row");
        Ok(row)
    }

    /// Blank the given fields on a row (manual reset of a stuck stage).
    pub async fn clear_fields(&self, row: i64, fields: &[&str]) -> Result<()> {
        let updates: Vec<FieldUpdate> = fields.iter().map(|f| FieldUpdate::new(*f, "")).collect();
        self.write_fields(row, &updates).await
    }

    async fn row_exists(&self, row: i64) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM queue_rows WHERE row_id = ?1", params![row])
            .await
            .map_err(storage_err)?;
        Ok(rows.next().await.map_err(storage_err)?.is_some())
    }
}

#[async_trait]
impl QueueStore for QueueDb {
    async fn snapshot(&self) -> Result<QueueSnapshot> {
        let mut rows = self
            .conn
            .query(
                "SELECT r.row_id, f.field, f.value
                 FROM queue_rows r
                 LEFT JOIN queue_fields f ON f.row_id = r.row_id
                 ORDER BY r.row_id",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut snapshot = QueueSnapshot::default();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            let row_id = row.get::<i64>(0).map_err(storage_err)?;

            if snapshot.rows.last().map(|r| r.row) != Some(row_id) {
                snapshot.rows.push(QueueRow {
                    row: row_id,
                    fields: HashMap::new(),
                });
            }

            let field = row.get_value(1).map_err(storage_err)?;
            let value = row.get_value(2).map_err(storage_err)?;
            if let (Value::Text(field), Value::Text(value)) = (field, value) {
                if let Some(current) = snapshot.rows.last_mut() {
                    current.fields.insert(field, value);
                }
            }
        }

        Ok(snapshot)
    }

    async fn write_fields(&self, row: i64, updates: &[FieldUpdate]) -> Result<()> {
        self.check_writable()?;
        if updates.is_empty() {
            return Ok(());
        }
        if !self.row_exists(row).await? {
            return Err(XaioError::Queue(format!("row {row} does not exist")));
        }

        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction().await.map_err(storage_err)?;
        for update in updates {
            tx.execute(
                "INSERT INTO queue_fields (row_id, field, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(row_id, field) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![row, update.field.as_str(), update.value.as_str(), now.as_str()],
            )
            .await
            .map_err(storage_err)?;
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}
