use std::fmt;
use std::path::{MAIN_SEPARATOR, Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use tracing::{debug, info};

use crate::database::ports::{IndexStore, StoreOp};
use crate::error::{IndexError, Result};
use crate::types::{Category, FileEvent, FileEventKind, FileRecord, RecordState};

const RECORD_COLUMNS: &str = "path, name, extension, size_bytes, category, created_at, \
     modified_at, last_accessed_at, access_count, state, tombstoned_at";

/// SQLite-backed [`IndexStore`]. The whole index lives in one database file.
#[derive(Clone)]
pub struct SqliteIndexStore {
    pool: SqlitePool,
}

impl fmt::Debug for SqliteIndexStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteIndexStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl SqliteIndexStore {
    /// Opens (creating if needed) the database at `path` and applies pending
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IndexError::from_io(e, parent))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        info!(path = %path.display(), "opened index database");
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        crate::MIGRATOR.run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool; every later call reports `StoreUnavailable`.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn fetch_records(&self, sql: &str) -> Result<Vec<FileRecord>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn get(&self, path: &Path) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM file_records WHERE path = ?1");
        let row = sqlx::query(&sql)
            .bind(path_key(path)?)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn commit(&self, ops: Vec<StoreOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let op_count = ops.len();

        for op in ops {
            match op {
                StoreOp::Upsert(record) => {
                    sqlx::query(
                        r#"
                        INSERT INTO file_records (
                            path, name, extension, size_bytes, category, created_at,
                            modified_at, last_accessed_at, access_count, state, tombstoned_at
                        )
                        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                        ON CONFLICT (path) DO UPDATE SET
                            name = excluded.name,
                            extension = excluded.extension,
                            size_bytes = excluded.size_bytes,
                            category = excluded.category,
                            created_at = excluded.created_at,
                            modified_at = excluded.modified_at,
                            last_accessed_at = excluded.last_accessed_at,
                            access_count = excluded.access_count,
                            state = excluded.state,
                            tombstoned_at = excluded.tombstoned_at
                        "#,
                    )
                    .bind(path_key(&record.path)?)
                    .bind(&record.name)
                    .bind(&record.extension)
                    .bind(to_i64(record.size_bytes))
                    .bind(record.category.as_str())
                    .bind(record.created_at)
                    .bind(record.modified_at)
                    .bind(record.last_accessed_at)
                    .bind(to_i64(record.access_count))
                    .bind(record.state.as_str())
                    .bind(record.tombstoned_at)
                    .execute(&mut *tx)
                    .await?;
                }
                StoreOp::Tombstone { path, at } => {
                    sqlx::query(
                        r#"
                        UPDATE file_records
                        SET state = 'tombstoned', tombstoned_at = ?2
                        WHERE path = ?1 AND state = 'live'
                        "#,
                    )
                    .bind(path_key(&path)?)
                    .bind(at)
                    .execute(&mut *tx)
                    .await?;
                }
                StoreOp::AppendEvent(event) => {
                    sqlx::query(
                        r#"
                        INSERT INTO file_events (path, from_path, event_kind, occurred_at)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                    )
                    .bind(path_key(&event.path)?)
                    .bind(event.from_path.as_deref().map(path_key).transpose()?)
                    .bind(event.kind.as_str())
                    .bind(event.timestamp)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        tx.commit().await?;
        debug!(ops = op_count, "committed index batch");
        Ok(())
    }

    async fn purge_tombstoned(&self, path: &Path) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM file_records WHERE path = ?1 AND state = 'tombstoned'")
                .bind(path_key(path)?)
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_all(&self) -> Result<Vec<FileRecord>> {
        self.fetch_records(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records ORDER BY created_at DESC, path ASC"
        ))
        .await
    }

    async fn list_by_category(&self, category: Category) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM file_records \
             WHERE category = ?1 AND state = 'live' ORDER BY created_at DESC, path ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(category.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_tombstoned(&self) -> Result<Vec<FileRecord>> {
        self.fetch_records(&format!(
            "SELECT {RECORD_COLUMNS} FROM file_records \
             WHERE state = 'tombstoned' ORDER BY tombstoned_at DESC, path ASC"
        ))
        .await
    }

    async fn list_live_under(&self, dir: &Path) -> Result<Vec<FileRecord>> {
        let mut prefix = path_key(dir)?.to_owned();
        if !prefix.ends_with(MAIN_SEPARATOR) {
            prefix.push(MAIN_SEPARATOR);
        }

        // substr() counts characters for TEXT, so compare against the char length.
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM file_records \
             WHERE state = 'live' AND substr(path, 1, ?1) = ?2 ORDER BY path ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(prefix.chars().count() as i64)
            .bind(&prefix)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_recent_events(&self, limit: u32) -> Result<Vec<FileEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, path, from_path, event_kind, occurred_at
            FROM file_events
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(event_from_row).collect()
    }
}

/// Paths are stored as their exact UTF-8 text; anything else is refused
/// rather than stored under a lossy key.
fn path_key(path: &Path) -> Result<&str> {
    path.to_str().ok_or_else(|| {
        IndexError::InvalidInput(format!("path is not valid UTF-8: {}", path.display()))
    })
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn record_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let path: String = row.try_get("path")?;
    let category: String = row.try_get("category")?;
    let state: String = row.try_get("state")?;

    Ok(FileRecord {
        path: PathBuf::from(path),
        name: row.try_get("name")?,
        extension: row.try_get("extension")?,
        size_bytes: to_u64(row.try_get("size_bytes")?),
        category: Category::from_str(&category)
            .map_err(|e| IndexError::Internal(format!("corrupt file record: {e}")))?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        modified_at: row.try_get::<DateTime<Utc>, _>("modified_at")?,
        last_accessed_at: row.try_get::<DateTime<Utc>, _>("last_accessed_at")?,
        access_count: to_u64(row.try_get("access_count")?),
        state: RecordState::from_str(&state)
            .map_err(|e| IndexError::Internal(format!("corrupt file record: {e}")))?,
        tombstoned_at: row.try_get::<Option<DateTime<Utc>>, _>("tombstoned_at")?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<FileEvent> {
    let path: String = row.try_get("path")?;
    let from_path: Option<String> = row.try_get("from_path")?;
    let kind: String = row.try_get("event_kind")?;

    Ok(FileEvent {
        id: Some(row.try_get("id")?),
        path: PathBuf::from(path),
        from_path: from_path.map(PathBuf::from),
        kind: FileEventKind::from_str(&kind)
            .map_err(|e| IndexError::Internal(format!("corrupt file event: {e}")))?,
        timestamp: row.try_get::<DateTime<Utc>, _>("occurred_at")?,
    })
}
