// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::time::Duration;

use mysql_async::{Conn, Opts, OptsBuilder};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::MySqlError;

pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(60);
pub const DEFAULT_SNAPSHOT_MAX_EXECUTION_TIME: Duration = Duration::ZERO;
pub const DEFAULT_SNAPSHOT_LOCK_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    // Snapshot-related configs
    pub snapshot_max_execution_time: Option<Duration>,
    pub snapshot_lock_wait_timeout: Option<Duration>,

    /// Deadline applied to individual queries against the source and target.
    /// `None` leaves operations unbounded.
    pub operation_deadline: Option<Duration>,

    // Socket-related configs
    pub tcp_keepalive: Option<Duration>,
    // There are other timeout options on `mysql_async::OptsBuilder`
    // (e.g. `conn_ttl` and `wait_timeout`) that only apply to connection
    // pools; the pool used for the target keeps their defaults.
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            snapshot_max_execution_time: Some(DEFAULT_SNAPSHOT_MAX_EXECUTION_TIME),
            snapshot_lock_wait_timeout: Some(DEFAULT_SNAPSHOT_LOCK_WAIT_TIMEOUT),
            operation_deadline: None,
            tcp_keepalive: Some(DEFAULT_TCP_KEEPALIVE),
        }
    }
}

impl TimeoutConfig {
    pub fn build(
        snapshot_max_execution_time: Duration,
        snapshot_lock_wait_timeout: Duration,
        operation_deadline: Option<Duration>,
        tcp_keepalive: Duration,
    ) -> Self {
        // Verify values are within valid ranges. Note we error log but do not
        // fail, falling back to the defaults.

        // https://dev.mysql.com/doc/refman/8.0/en/server-system-variables.html#sysvar_lock_wait_timeout
        let snapshot_lock_wait_timeout = if snapshot_lock_wait_timeout.as_secs() > 31536000 {
            error!(
                "snapshot_lock_wait_timeout is too large: {}. Maximum is 31536000.",
                snapshot_lock_wait_timeout.as_secs()
            );
            Some(DEFAULT_SNAPSHOT_LOCK_WAIT_TIMEOUT)
        } else {
            Some(snapshot_lock_wait_timeout)
        };

        // https://dev.mysql.com/doc/refman/8.0/en/server-system-variables.html#sysvar_max_execution_time
        let snapshot_max_execution_time = if snapshot_max_execution_time.as_millis() > 4294967295 {
            error!(
                "snapshot_max_execution_time is too large: {}. Maximum is 4294967295.",
                snapshot_max_execution_time.as_millis()
            );
            Some(DEFAULT_SNAPSHOT_MAX_EXECUTION_TIME)
        } else {
            Some(snapshot_max_execution_time)
        };

        let tcp_keepalive = match u32::try_from(tcp_keepalive.as_millis()) {
            Err(_) => {
                error!(
                    "tcp_keepalive is too large: {}. Maximum is {}.",
                    tcp_keepalive.as_millis(),
                    u32::MAX,
                );
                Some(DEFAULT_TCP_KEEPALIVE)
            }
            Ok(_) => Some(tcp_keepalive),
        };

        Self {
            snapshot_max_execution_time,
            snapshot_lock_wait_timeout,
            operation_deadline,
            tcp_keepalive,
        }
    }

    /// Apply relevant timeout configurations to a `mysql_async::OptsBuilder`.
    pub fn apply_to_opts(&self, mut opts_builder: OptsBuilder) -> Result<OptsBuilder, MySqlError> {
        if let Some(tcp_keepalive) = self.tcp_keepalive {
            opts_builder = opts_builder.tcp_keepalive(Some(
                u32::try_from(tcp_keepalive.as_millis()).map_err(|e| {
                    MySqlError::InvalidClientConfig(format!(
                        "invalid tcp_keepalive duration: {}",
                        e
                    ))
                })?,
            ));
        }
        Ok(opts_builder)
    }
}

/// Configuration for MySQL connections.
///
/// This wraps [`mysql_async::Opts`] to attach the timeout configuration and
/// to log connection attempts uniformly.
#[derive(Clone, Debug)]
pub struct Config {
    inner: Opts,
    timeouts: TimeoutConfig,
}

impl Config {
    pub fn new(inner: Opts, timeouts: TimeoutConfig) -> Self {
        Self { inner, timeouts }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// The underlying `mysql_async::Opts`, with the timeout configuration
    /// applied. Useful for constructing a connection pool.
    pub fn opts(&self) -> Result<Opts, MySqlError> {
        let opts_builder = self
            .timeouts
            .apply_to_opts(OptsBuilder::from_opts(self.inner.clone()))?;
        Ok(opts_builder.into())
    }

    pub async fn connect(&self, task_name: &str) -> Result<Conn, MySqlError> {
        let address = format!(
            "mysql://{}@{}:{}",
            self.inner.user().unwrap_or("<unknown-user>"),
            self.inner.ip_or_hostname(),
            self.inner.tcp_port(),
        );
        info!(%task_name, %address, "connecting");
        match Conn::new(self.opts()?).await {
            Ok(conn) => {
                info!(%task_name, %address, "connected");
                Ok(conn)
            }
            Err(e) => {
                warn!(%task_name, %address, "connection failed: {e}");
                Err(e.into())
            }
        }
    }
}
