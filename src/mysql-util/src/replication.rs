// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Row};

use crate::MySqlError;

/// Query a MySQL System Variable
pub async fn query_sys_var(conn: &mut Conn, name: &str) -> Result<String, MySqlError> {
    let value: String = conn
        .query_first(format!("SELECT @@{}", name))
        .await?
        .ok_or_else(|| anyhow::anyhow!("no value for system variable {}", name))?;
    Ok(value)
}

/// Verify a MySQL System Variable matches the expected value
async fn verify_sys_setting(
    conn: &mut Conn,
    setting: &str,
    expected: &str,
) -> Result<(), MySqlError> {
    match query_sys_var(conn, setting).await?.as_str() {
        actual if actual == expected => Ok(()),
        actual => Err(MySqlError::InvalidSystemSetting {
            setting: setting.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
    }
}

pub async fn ensure_full_row_binlog_format(conn: &mut Conn) -> Result<(), MySqlError> {
    verify_sys_setting(conn, "log_bin", "1").await?;
    verify_sys_setting(conn, "binlog_format", "ROW").await?;
    verify_sys_setting(conn, "binlog_row_image", "FULL").await?;
    Ok(())
}

/// The source's current binlog write coordinate, as reported by
/// `SHOW MASTER STATUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterStatus {
    pub file: String,
    pub position: u64,
}

pub async fn query_master_status(conn: &mut Conn) -> Result<MasterStatus, MySqlError> {
    let row: Row = conn
        .query_first("SHOW MASTER STATUS")
        .await?
        .ok_or_else(|| {
            anyhow::anyhow!("SHOW MASTER STATUS returned no rows; is binary logging enabled?")
        })?;
    let file: String = row
        .get(0)
        .ok_or_else(|| anyhow::anyhow!("SHOW MASTER STATUS returned no File column"))?;
    let position: u64 = row
        .get(1)
        .ok_or_else(|| anyhow::anyhow!("SHOW MASTER STATUS returned no Position column"))?;
    Ok(MasterStatus { file, position })
}
