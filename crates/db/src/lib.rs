//! Direct access to an Instance's kine-backed SQLite storage file.
//!
//! Kine (the etcd shim fronting the API server) stores every key/value pair as a row
//! in a single `kine` table: `id` is a monotonically increasing row-id, `name` is the
//! etcd-style key (e.g. `/registry/namespaces/default`). This crate never writes
//! through anything but that one table, and only the Purge release strategy writes
//! at all — kine remains the sole other writer, which the release/acquire state
//! machine in `core` guarantees by construction.

pub mod purge;
pub mod retry;

pub use purge::{PurgeError, PurgeHandle};

/// Open a SQLite connection pool tuned for a single kine-backed instance database:
/// WAL journal mode, a generous busy timeout, and a single reusable connection
/// (kine itself is the only regular writer; our side only ever opens this handle
/// for the Purge strategy, one instance at a time).
pub async fn open_single_connection(
    db_path: &std::path::Path,
) -> Result<sqlx::SqlitePool, sqlx::Error> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::time::Duration;

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(false)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(10));

    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .connect_with(options)
        .await
}
