// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! MySQL utility library.

mod config;
pub use config::{Config, TimeoutConfig, DEFAULT_TCP_KEEPALIVE};

mod desc;
pub use desc::{schema_info, MySqlColumnDesc, MySqlTableDesc};

mod replication;
pub use replication::{
    ensure_full_row_binlog_format, query_master_status, query_sys_var, MasterStatus,
};

#[derive(Debug, thiserror::Error)]
pub enum MySqlError {
    #[error(
        "unsupported primary key for '{qualified_table_name}': {reason}. \
         A single integer primary key column is required."
    )]
    UnsupportedPrimaryKey {
        qualified_table_name: String,
        reason: String,
    },
    #[error("table '{qualified_table_name}' does not exist on the source")]
    MissingTable { qualified_table_name: String },
    #[error("invalid mysql system setting '{setting}'. Expected '{expected}'. Got '{actual}'.")]
    InvalidSystemSetting {
        setting: String,
        expected: String,
        actual: String,
    },
    #[error("invalid mysql client configuration: {0}")]
    InvalidClientConfig(String),
    /// Any other error we bail on.
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
    /// A mysql_async error.
    #[error(transparent)]
    MySql(#[from] mysql_async::Error),
}

// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_no_such_table
pub const ER_NO_SUCH_TABLE: u16 = 1146;

// NOTE: this error was renamed between MySQL 5.7 and 8.0
// https://dev.mysql.com/doc/mysql-errors/8.0/en/server-error-reference.html#error_er_source_fatal_error_reading_binlog
// https://dev.mysql.com/doc/mysql-errors/5.7/en/server-error-reference.html#error_er_master_fatal_error_reading_binlog
pub const ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE: u16 = 1236;
