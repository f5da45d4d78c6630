// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;

use ghostferry_mysql_util as mysql_util;

use crate::error::DefiniteError;
use crate::schema::{TableName, TableRewrites};
use crate::state::SerializableState;

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_SPEED_LOG_ENTRIES: usize = 30;
pub const DEFAULT_MAX_COPY_ATTEMPTS: usize = 5;
pub const DEFAULT_BINLOG_QUEUE_DEPTH: usize = 256;

// A constant arbitrary offset added to nothing in particular; it keeps the
// replica id this process registers with out of the range a human would pick
// for a real replica.
pub const DEFAULT_REPLICATION_SERVER_ID: u32 = 99399;

/// Configuration for a ferry run.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection configuration for the database rows are copied from.
    pub source: mysql_util::Config,
    /// Connection configuration for the database rows are written to.
    pub target: mysql_util::Config,
    /// The tables in scope for both the row copy and binlog filtering.
    pub included_tables: BTreeSet<TableName>,
    /// Rows per copier batch.
    pub batch_size: usize,
    /// Copier parallelism.
    pub worker_count: usize,
    /// Size of the throughput ring; 0 disables speed estimation.
    pub speed_log_entries: usize,
    /// Identity remapping applied to rows and binlog events on the target.
    pub rewrites: TableRewrites,
    /// Resume from this previously dumped state instead of starting fresh.
    pub resume_state: Option<SerializableState>,
    /// Server id this process registers with on the source for binlog
    /// streaming.
    pub replication_server_id: u32,
    /// Consecutive failures on one table before the run is aborted.
    pub max_copy_attempts: usize,
    /// Bound on the streamer -> applier queue.
    pub binlog_queue_depth: usize,
}

impl Config {
    pub fn new(source: mysql_util::Config, target: mysql_util::Config) -> Self {
        Self {
            source,
            target,
            included_tables: BTreeSet::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            speed_log_entries: DEFAULT_SPEED_LOG_ENTRIES,
            rewrites: TableRewrites::default(),
            resume_state: None,
            replication_server_id: DEFAULT_REPLICATION_SERVER_ID,
            max_copy_attempts: DEFAULT_MAX_COPY_ATTEMPTS,
            binlog_queue_depth: DEFAULT_BINLOG_QUEUE_DEPTH,
        }
    }

    pub fn validate(&self) -> Result<(), DefiniteError> {
        if self.included_tables.is_empty() {
            return Err(DefiniteError::InvalidConfiguration(
                "included_tables must not be empty".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(DefiniteError::InvalidConfiguration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.worker_count == 0 {
            return Err(DefiniteError::InvalidConfiguration(
                "worker_count must be positive".to_string(),
            ));
        }
        if self.max_copy_attempts == 0 {
            return Err(DefiniteError::InvalidConfiguration(
                "max_copy_attempts must be positive".to_string(),
            ));
        }
        if self.binlog_queue_depth == 0 {
            return Err(DefiniteError::InvalidConfiguration(
                "binlog_queue_depth must be positive".to_string(),
            ));
        }
        if self.replication_server_id == 0 {
            // Server id 0 tells the source we are not a replica and breaks
            // binlog streaming.
            return Err(DefiniteError::InvalidConfiguration(
                "replication_server_id must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use mysql_async::{Opts, OptsBuilder};

    use super::*;

    fn config() -> Config {
        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname("localhost")
            .user(Some("ghostferry"))
            .into();
        let mysql = mysql_util::Config::new(opts, mysql_util::TimeoutConfig::default());
        let mut config = Config::new(mysql.clone(), mysql);
        config.included_tables.insert(TableName::new("s", "t"));
        config
    }

    #[test]
    fn default_config_validates() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn zero_valued_knobs_are_rejected() {
        let mut c = config();
        c.batch_size = 0;
        assert!(matches!(
            c.validate(),
            Err(DefiniteError::InvalidConfiguration(_))
        ));

        let mut c = config();
        c.worker_count = 0;
        assert!(c.validate().is_err());

        let mut c = config();
        c.included_tables.clear();
        assert!(c.validate().is_err());

        let mut c = config();
        c.replication_server_id = 0;
        assert!(c.validate().is_err());
    }
}
