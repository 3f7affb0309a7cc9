//! Error classification and the retry wrapper around gateway operations
//!
//! Mirrors `wrap_db_errors` from the teacher's MySQL driver: every externally
//! exposed [`crate::db::DbGateway`] method funnels its underlying `sqlx`
//! error through [`classify`] and, for transient classes, closes the
//! offending connection and retries after a short sleep.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Errors a gateway operation can surface after retry policy is exhausted.
#[derive(Debug, Error)]
pub enum DbError {
    /// A transport-level I/O failure while talking to the server.
    #[error("database io error")]
    Io(#[source] sqlx::Error),
    /// The server could not be reached at all.
    #[error("cannot connect to database server")]
    CantConnect(#[source] sqlx::Error),
    /// The server dropped an established connection.
    #[error("database connection went away")]
    WentAway(#[source] sqlx::Error),
    /// A transaction deadlock was detected (MySQL error 1213).
    #[error("database deadlock detected")]
    Deadlock(#[source] sqlx::Error),
    /// A unique-key violation (MySQL error 1062).
    #[error("duplicate entry for column(s): {columns:?}")]
    DuplicateEntry {
        /// Best-effort column names parsed from the driver message.
        columns: Vec<String>,
        /// The underlying driver error.
        #[source]
        source: Box<sqlx::Error>,
    },
    /// Any other database error that is not known to be retryable.
    #[error("fatal database error")]
    Fatal(#[source] sqlx::Error),
}

impl DbError {
    /// Whether this error class is one the pool should retry after closing
    /// the offending connection (`DBRetryable` family plus deadlock).
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Io(_) | DbError::CantConnect(_) | DbError::WentAway(_) | DbError::Deadlock(_)
        )
    }
}

/// Classifies a raw `sqlx` error the way the teacher's MySQL driver
/// classifies raw driver exceptions: by inspecting the database error code
/// when one is present, falling back to the `sqlx::Error` variant shape.
#[must_use]
pub fn classify(err: sqlx::Error) -> DbError {
    let code = match &err {
        sqlx::Error::Database(db_err) => db_err.code().map(|c| c.into_owned()),
        _ => None,
    };

    match (&err, code.as_deref()) {
        (sqlx::Error::Io(_), _) => DbError::Io(err),
        (sqlx::Error::Database(_), Some("1062")) => {
            let columns = parse_duplicate_columns(err.to_string().as_str());
            DbError::DuplicateEntry { columns, source: Box::new(err) }
        }
        (sqlx::Error::Database(_), Some("1213")) => DbError::Deadlock(err),
        (sqlx::Error::Database(_), Some("2003")) => DbError::CantConnect(err),
        (sqlx::Error::Database(_), Some("2006")) => DbError::WentAway(err),
        (sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed, _) => DbError::CantConnect(err),
        _ => DbError::Fatal(err),
    }
}

/// Best-effort extraction of offending column names from a MySQL duplicate
/// key message of the form `Duplicate entry '...' for key 'col_name'`. The
/// original driver leaves this as a `FIXME`; we parse what we can and fall
/// back to an empty list.
fn parse_duplicate_columns(message: &str) -> Vec<String> {
    message
        .rsplit_once("for key ")
        .map(|(_, key_part)| key_part.trim_matches(|c: char| c == '\'' || c == '`').to_string())
        .into_iter()
        .collect()
}

/// How long to sleep between retry attempts of a transient database error.
pub const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Retries `op` while it fails with a retryable [`DbError`], invoking
/// `on_retryable` (typically "close this connection") before each retry.
/// Non-retryable errors are returned immediately.
pub async fn with_retry<T, F, Fut, C, CFut>(mut op: F, mut on_retryable: C) -> Result<T, DbError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    C: FnMut() -> CFut,
    CFut: std::future::Future<Output = ()>,
{
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(raw) => {
                let classified = classify(raw);
                if !classified.is_retryable() {
                    return Err(classified);
                }
                warn!(error = %classified, "retrying after transient database error");
                on_retryable().await;
                tokio::time::sleep(RETRY_SLEEP).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_column_name_from_duplicate_entry_message() {
        let columns =
            parse_duplicate_columns("Duplicate entry 'host-1' for key 'hostname_unique'");
        assert_eq!(columns, vec!["hostname_unique".to_string()]);
    }

    #[test]
    fn missing_for_key_clause_yields_no_columns() {
        assert!(parse_duplicate_columns("some unrelated message").is_empty());
    }

    #[test]
    fn retryable_classes_are_flagged() {
        let deadlock = DbError::Deadlock(sqlx::Error::RowNotFound);
        let fatal = DbError::Fatal(sqlx::Error::RowNotFound);
        assert!(deadlock.is_retryable());
        assert!(!fatal.is_retryable());
    }
}
