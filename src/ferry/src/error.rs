// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! There are two kinds of errors that can happen during a run, represented
//! as two separate error types:
//!
//! [`TransientError`]s are errors that can happen for reasons unrelated to
//! the data itself: authentication failures, connection drops, deadline
//! expiry. The component that observes one retries with backoff; only after
//! the retries are exhausted does it become fatal.
//!
//! [`DefiniteError`]s are errors that retrying cannot fix: schema drift on
//! an in-scope table, a binlog file sequence that moved backwards, an
//! unsupported primary key. They halt the run immediately. The state tracker
//! is never advanced past the failure point, so the last dumped state stays
//! a valid resume point on every fatal path.

use std::io;
use std::time::Duration;

use ghostferry_mysql_util::MySqlError;

/// A transient error. Retryable by the component that observed it.
#[derive(Debug, thiserror::Error)]
pub enum TransientError {
    #[error("couldn't decode binlog row")]
    BinlogRowDecodeError(#[from] mysql_async::binlog::row::BinlogRowToRowError),
    #[error("replication stream ended prematurely")]
    ReplicationEOF,
    #[error("operation exceeded deadline of {0:?}")]
    Deadline(Duration),
    #[error(transparent)]
    IoError(#[from] io::Error),
    #[error("sql client error")]
    SQLClient(#[from] mysql_async::Error),
    #[error(transparent)]
    MySql(#[from] MySqlError),
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// A definite error. Never retried; the run halts and dumps state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DefiniteError {
    #[error("schema of in-scope table changed: {0}")]
    SchemaDrift(String),
    #[error("binlog rotated backwards from '{from}' to '{to}'")]
    BinlogFileRegression { from: String, to: String },
    #[error("mysql server does not have the binlog available at the requested position")]
    BinlogNotAvailable,
    #[error("unsupported primary key: {0}")]
    UnsupportedPrimaryKey(String),
    #[error("table not found on the source: {0}")]
    MissingTable(String),
    #[error("mysql server configuration error: {0}")]
    ServerConfigurationError(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid resume state: {0}")]
    InvalidResumeState(String),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transient(#[from] TransientError),
    #[error(transparent)]
    Definite(#[from] DefiniteError),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Classifies a mysql-util error observed at startup: settings, missing
/// tables, and key shapes cannot be fixed by retrying.
pub(crate) fn classify_startup_error(err: MySqlError) -> Error {
    match err {
        err @ MySqlError::InvalidSystemSetting { .. }
        | err @ MySqlError::InvalidClientConfig(_) => {
            DefiniteError::ServerConfigurationError(err.to_string()).into()
        }
        err @ MySqlError::UnsupportedPrimaryKey { .. } => {
            DefiniteError::UnsupportedPrimaryKey(err.to_string()).into()
        }
        err @ MySqlError::MissingTable { .. } => {
            DefiniteError::MissingTable(err.to_string()).into()
        }
        err => TransientError::MySql(err).into(),
    }
}

/// Bounds `fut` by the configured per-operation deadline, if any.
pub(crate) async fn bounded<F, T>(
    deadline: Option<Duration>,
    fut: F,
) -> Result<T, TransientError>
where
    F: std::future::Future<Output = Result<T, TransientError>>,
{
    match deadline {
        None => fut.await,
        Some(deadline) => match tokio::time::timeout(deadline, fut).await {
            Ok(res) => res,
            Err(_) => Err(TransientError::Deadline(deadline)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn startup_error_classification() {
        let err = MySqlError::InvalidSystemSetting {
            setting: "binlog_format".to_string(),
            expected: "ROW".to_string(),
            actual: "STATEMENT".to_string(),
        };
        assert!(matches!(
            classify_startup_error(err),
            Error::Definite(DefiniteError::ServerConfigurationError(_))
        ));

        let err = MySqlError::Generic(anyhow::anyhow!("socket closed"));
        assert!(classify_startup_error(err).is_transient());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_expires_with_deadline_error() {
        let res: Result<(), _> = bounded(Some(Duration::from_millis(10)), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(res, Err(TransientError::Deadline(_))));
    }
}
