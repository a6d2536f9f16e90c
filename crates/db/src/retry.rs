//! SQLite-specific retry predicate, grounded on the same SQLITE_BUSY/SQLITE_LOCKED
//! detection the teacher's `db::retry::is_retryable_error` performs, narrowed to the
//! codes that matter for the baseline-id query's lock-contention retries.

use sqlx::Error as SqlxError;

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6) are transient under concurrent writers;
/// everything else (including schema errors) is not worth retrying.
pub fn is_retryable_error(e: &SqlxError) -> bool {
    if let SqlxError::Database(db_err) = e {
        if let Some(code) = db_err.code() {
            return matches!(code.as_ref(), "5" | "6");
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_are_not_retryable() {
        let e = SqlxError::RowNotFound;
        assert!(!is_retryable_error(&e));
    }
}
