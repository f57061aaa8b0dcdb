use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};

use crate::error::StoreError;
use crate::status::WorkStatus;

/// A work item row, keyed by the natural business key (a normalized plate,
/// or the canonical `BRAND|MODEL|YEAR_FAB|YEAR_MOD` rendering of a composite
/// key). Rows are created once by ingestion and never deleted; history lives
/// in status, reason and the timestamps.
#[derive(Debug, sqlx::FromRow)]
pub struct WorkItem {
    pub item_key: String,
    pub status: WorkStatus,
    pub error_reason: Option<String>,
    pub attempt_count: i32,
    pub inserted_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// A work-item status table in PostgreSQL.
///
/// All writes are guarded by the current status, so every operation is
/// idempotent: a key already moved past the guarded status is silently
/// skipped, never re-processed or errored.
pub struct StatusStore {
    table: String,
    pool: PgPool,
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StatusStore {
    /// Initialize a new StatusStore backed by a table in PostgreSQL.
    pub async fn new(table: &str, url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::PoolCreationError { error })?;

        Ok(Self::from_pool(table, pool))
    }

    pub fn from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    /// The connection pool, shared with the sink tables written alongside
    /// this store.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open the transaction for a batch's persistence phase. Sink inserts
    /// and status marks all run on it, so the batch commits once or not at
    /// all.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })
    }

    pub async fn commit(&self, tx: Transaction<'static, Postgres>) -> StoreResult<()> {
        tx.commit()
            .await
            .map_err(|error| StoreError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }

    /// Append-only ingestion: insert keys as New, deduplicated against every
    /// key ever seen. Returns the number of rows actually inserted.
    pub async fn insert(&self, keys: &[String]) -> StoreResult<u64> {
        let base_query = format!(
            r#"
INSERT INTO "{0}" (item_key, status)
SELECT key, 'N'::work_status FROM UNNEST($1::text[]) AS t(key)
ON CONFLICT (item_key) DO NOTHING
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(keys)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Items eligible for processing, ordered Processing > Error > New with
    /// the most recently inserted first. Processing comes first so items
    /// orphaned by a crashed run are retried promptly.
    pub async fn get_pending(&self, limit: i64) -> StoreResult<Vec<WorkItem>> {
        let base_query = format!(
            r#"
SELECT item_key, status, error_reason, attempt_count, inserted_at, last_attempt_at
FROM "{0}"
WHERE status IN ('P'::work_status, 'E'::work_status, 'N'::work_status)
ORDER BY
    CASE status
        WHEN 'P'::work_status THEN 1
        WHEN 'E'::work_status THEN 2
        ELSE 3
    END,
    inserted_at DESC
LIMIT $1
            "#,
            &self.table
        );

        sqlx::query_as(&base_query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Transition the given keys to Processing, guarded by `status IN ('N','E')`.
    /// Returns the number of rows actually transitioned, which may be less
    /// than `keys.len()` if another run claimed some of them first.
    pub async fn claim(&self, keys: &[String]) -> StoreResult<u64> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET
    status = 'P'::work_status,
    attempt_count = attempt_count + 1,
    last_attempt_at = NOW()
WHERE
    item_key = ANY($1)
    AND status IN ('N'::work_status, 'E'::work_status)
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(keys)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Select and claim up to `limit` pending items in one atomic statement.
    ///
    /// The single UPDATE over a locked CTE closes the window where two
    /// overlapping runs observe the same pending snapshot: a row is either
    /// claimed here or skipped, never both. Orphaned Processing rows are
    /// re-claimed too, with their attempt count incremented again.
    pub async fn claim_pending(&self, limit: i64) -> StoreResult<Vec<WorkItem>> {
        let base_query = format!(
            r#"
WITH pending AS (
    SELECT item_key
    FROM "{0}"
    WHERE status IN ('P'::work_status, 'E'::work_status, 'N'::work_status)
    ORDER BY
        CASE status
            WHEN 'P'::work_status THEN 1
            WHEN 'E'::work_status THEN 2
            ELSE 3
        END,
        inserted_at DESC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE "{0}"
SET
    status = 'P'::work_status,
    attempt_count = "{0}".attempt_count + 1,
    last_attempt_at = NOW()
FROM pending
WHERE "{0}".item_key = pending.item_key
RETURNING
    "{0}".item_key,
    "{0}".status,
    "{0}".error_reason,
    "{0}".attempt_count,
    "{0}".inserted_at,
    "{0}".last_attempt_at
            "#,
            &self.table
        );

        sqlx::query_as(&base_query)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })
    }

    /// Transition claimed keys to terminal Success. Guarded by
    /// `status = 'P'`, so repeating the call affects zero rows. Runs on the
    /// caller's connection, typically a batch transaction.
    pub async fn mark_success(&self, conn: &mut PgConnection, keys: &[String]) -> StoreResult<u64> {
        self.mark(conn, keys, WorkStatus::Success).await
    }

    /// Transition claimed keys back to Error, re-entering the pending pool
    /// for a future run.
    pub async fn mark_error(&self, conn: &mut PgConnection, keys: &[String]) -> StoreResult<u64> {
        self.mark(conn, keys, WorkStatus::Error).await
    }

    async fn mark(
        &self,
        conn: &mut PgConnection,
        keys: &[String],
        status: WorkStatus,
    ) -> StoreResult<u64> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET status = $1
WHERE item_key = ANY($2) AND status = 'P'::work_status
            "#,
            &self.table
        );

        let result = sqlx::query(&base_query)
            .bind(status)
            .bind(keys)
            .execute(&mut *conn)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(result.rows_affected())
    }

    /// Transition claimed keys to terminal Invalid, persisting a per-key
    /// reason. Runs on the caller's connection; inside a transaction the
    /// marks land atomically with everything else on it.
    pub async fn mark_invalid(
        &self,
        conn: &mut PgConnection,
        reasons: &HashMap<String, String>,
    ) -> StoreResult<u64> {
        let base_query = format!(
            r#"
UPDATE "{0}"
SET status = 'I'::work_status, error_reason = $1
WHERE item_key = $2 AND status = 'P'::work_status
            "#,
            &self.table
        );

        let mut rows_updated = 0;
        for (key, reason) in reasons {
            let result = sqlx::query(&base_query)
                .bind(reason)
                .bind(key)
                .execute(&mut *conn)
                .await
                .map_err(|error| StoreError::QueryError {
                    command: "UPDATE".to_owned(),
                    error,
                })?;
            rows_updated += result.rows_affected();
        }

        Ok(rows_updated)
    }
}
