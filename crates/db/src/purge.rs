//! Direct-storage purge: the backing implementation for the `Purge` release strategy.
//!
//! A `PurgeHandle` is opened once per Instance right after the first successful
//! readiness wait and lives for the Instance's whole lifetime. It holds a single
//! long-lived SQLite connection, a baseline row-id, and a DELETE statement text built
//! once from the fixed system-namespace set so that the set of protected keys can
//! never drift from what `Clean` protects.

use std::time::Duration;

use sqlx::{Row, SqlitePool};
use utils::config::SYSTEM_NAMESPACES;
use utils::retry::{with_retry, RetryConfig};

use crate::retry::is_retryable_error;

#[derive(Debug, thiserror::Error)]
pub enum PurgeError {
    #[error("failed to open storage file: {0}")]
    Open(#[source] sqlx::Error),
    #[error("failed to read baseline row-id: {0}")]
    Baseline(#[source] sqlx::Error),
    #[error("purge DELETE failed: {0}")]
    Delete(#[source] sqlx::Error),
}

/// A pre-opened handle over an Instance's kine storage, anchored to a baseline row-id.
pub struct PurgeHandle {
    pool: SqlitePool,
    baseline: i64,
    delete_sql: String,
}

impl PurgeHandle {
    /// Opens the storage file and captures the current maximum row-id as the
    /// baseline. Must be called only after the system namespaces are confirmed
    /// present, so every system-namespace row is guaranteed to be at id <= baseline.
    pub async fn open(db_path: &std::path::Path) -> Result<Self, PurgeError> {
        let pool = crate::open_single_connection(db_path)
            .await
            .map_err(PurgeError::Open)?;

        let retry_config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 20,
            max_delay_ms: 400,
        };
        let baseline: i64 = with_retry(
            &retry_config,
            "purge_baseline_query",
            is_retryable_error,
            || async {
                sqlx::query("SELECT COALESCE(MAX(id), 0) FROM kine")
                    .fetch_one(&pool)
                    .await
                    .map(|row| row.get::<i64, _>(0))
            },
        )
        .await
        .map_err(PurgeError::Baseline)?;

        let delete_sql = build_delete_sql();

        tracing::debug!(baseline, "purge handle opened");

        Ok(Self {
            pool,
            baseline,
            delete_sql,
        })
    }

    /// Baseline row-id this handle is anchored to; every row with `id <= baseline`
    /// is protected regardless of its key.
    pub fn baseline(&self) -> i64 {
        self.baseline
    }

    /// Executes the single prepared DELETE, removing every row added since the
    /// baseline whose key does not belong to a system namespace.
    pub async fn purge(&self) -> Result<u64, PurgeError> {
        let result = sqlx::query(&self.delete_sql)
            .bind(self.baseline)
            .execute(&self.pool)
            .await
            .map_err(PurgeError::Delete)?;
        tracing::debug!(rows_deleted = result.rows_affected(), "purge executed");
        Ok(result.rows_affected())
    }

    /// Busy-timeout honoured while this handle holds its connection open.
    pub fn busy_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

/// Builds the DELETE statement text once from the fixed system-namespace set: each
/// namespace contributes an exact-match guard against its own namespace object and a
/// `NOT LIKE` guard against any key scoped under it, so adding a system namespace to
/// the constant automatically protects it without touching this function.
fn build_delete_sql() -> String {
    let mut sql = String::from("DELETE FROM kine WHERE id > ?");
    for ns in SYSTEM_NAMESPACES {
        sql.push_str(&format!(
            " AND name != '/registry/namespaces/{ns}' AND name NOT LIKE '%/{ns}/%'"
        ));
    }
    sql
}
