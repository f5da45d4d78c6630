// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Applies work to the target database.
//!
//! Both write paths run inside a single target transaction and use
//! replace-by-primary-key semantics, so replaying a batch on a partially
//! applied target converges to the same final state. The state tracker is
//! only advanced after the transaction commits; a crash between commit and
//! the tracker update re-applies an idempotent batch on resume.
//!
//! Ordering between the two paths on the same row is resolved by time: a
//! binlog event whose source coordinate is later than the copier's read
//! snapshot is applied after the copier write and wins; one that is earlier
//! is already incorporated in the copier's snapshot.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use mysql_async::prelude::Queryable;
use mysql_async::{Pool, TxOpts, Value};
use tracing::trace;

use ghostferry_mysql_util as mysql_util;
use ghostferry_mysql_util::MySqlTableDesc;

use crate::cursor::{quote_ident, RowBatch};
use crate::error::{bounded, classify_startup_error, Error, TransientError};
use crate::events::{BinlogTx, RowChange};
use crate::schema::{TableName, TableRewrites, TableSchemaCache};
use crate::state::StateTracker;

pub struct BatchWriter {
    pool: Pool,
    schema_cache: Arc<TableSchemaCache>,
    rewrites: TableRewrites,
    state: Arc<StateTracker>,
    deadline: Option<Duration>,
}

impl BatchWriter {
    pub fn new(
        target: &mysql_util::Config,
        schema_cache: Arc<TableSchemaCache>,
        rewrites: TableRewrites,
        state: Arc<StateTracker>,
    ) -> Result<Self, Error> {
        let opts = target.opts().map_err(classify_startup_error)?;
        Ok(Self {
            pool: Pool::new(opts),
            schema_cache,
            rewrites,
            state,
            deadline: target.timeouts().operation_deadline,
        })
    }

    /// Writes one copier batch and advances the table's PK cursor.
    pub async fn write_row_batch(&self, batch: &RowBatch) -> Result<(), TransientError> {
        if batch.rows.is_empty() {
            return Ok(());
        }
        let desc = self.desc(&batch.table)?;
        let target_table = self.rewrites.rewrite(&batch.table);
        let sql = replace_sql(&target_table, desc);

        bounded(self.deadline, async {
            let mut conn = self.pool.get_conn().await?;
            let mut tx = conn.start_transaction(TxOpts::default()).await?;
            tx.exec_batch(sql.as_str(), batch.rows.iter().cloned()).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;

        trace!(table = %batch.table, rows = batch.rows.len(), max_pk = batch.max_pk,
               "wrote copier batch");
        self.state.update_last_pk(&batch.table, batch.max_pk);
        Ok(())
    }

    /// Applies one source transaction's changes in source order and
    /// advances the binlog coordinate to the transaction's end. A
    /// transaction whose changes were all filtered out skips the DB
    /// round-trip and only advances the coordinate.
    pub async fn write_binlog_tx(&self, binlog_tx: &BinlogTx) -> Result<(), TransientError> {
        if !binlog_tx.events.is_empty() {
            bounded(self.deadline, async {
                let mut conn = self.pool.get_conn().await?;
                let mut tx = conn.start_transaction(TxOpts::default()).await?;
                for event in &binlog_tx.events {
                    let desc = self.desc(&event.table)?;
                    match &event.change {
                        RowChange::Insert { after } => {
                            tx.exec_drop(replace_sql(&event.target_table, desc), after.clone())
                                .await?;
                        }
                        RowChange::Update { before, after } => {
                            // A PK change leaves the before-image row
                            // behind; remove it before replacing the after
                            // image.
                            if before.get(desc.pk_column) != after.get(desc.pk_column) {
                                self.delete_row(&mut tx, &event.target_table, desc, before)
                                    .await?;
                            }
                            tx.exec_drop(replace_sql(&event.target_table, desc), after.clone())
                                .await?;
                        }
                        RowChange::Delete { before } => {
                            self.delete_row(&mut tx, &event.target_table, desc, before)
                                .await?;
                        }
                    }
                }
                tx.commit().await?;
                Ok(())
            })
            .await?;
            trace!(events = binlog_tx.events.len(), end = %binlog_tx.end_position,
                   "applied binlog transaction");
        }
        self.state
            .update_last_binlog_position(binlog_tx.end_position.clone());
        Ok(())
    }

    async fn delete_row(
        &self,
        tx: &mut mysql_async::Transaction<'_>,
        target_table: &TableName,
        desc: &MySqlTableDesc,
        before: &[Value],
    ) -> Result<(), TransientError> {
        let pk = before.get(desc.pk_column).cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "before image for {} has no pk in column {}",
                target_table,
                desc.pk_column
            )
        })?;
        tx.exec_drop(delete_sql(target_table, desc), vec![pk]).await?;
        Ok(())
    }

    fn desc(&self, table: &TableName) -> Result<&MySqlTableDesc, TransientError> {
        self.schema_cache.get(table).ok_or_else(|| {
            TransientError::Generic(anyhow::anyhow!(
                "no schema cached for {}; writer handed a batch for an out-of-scope table",
                table
            ))
        })
    }

    pub async fn shutdown(&self) -> Result<(), TransientError> {
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

fn qualified(table: &TableName) -> String {
    format!(
        "{}.{}",
        quote_ident(table.schema_name()),
        quote_ident(table.table_name())
    )
}

fn replace_sql(target_table: &TableName, desc: &MySqlTableDesc) -> String {
    let columns = desc.columns.iter().map(|c| quote_ident(&c.name)).join(", ");
    let placeholders = desc.columns.iter().map(|_| "?").join(", ");
    format!(
        "REPLACE INTO {} ({}) VALUES ({})",
        qualified(target_table),
        columns,
        placeholders
    )
}

fn delete_sql(target_table: &TableName, desc: &MySqlTableDesc) -> String {
    format!(
        "DELETE FROM {} WHERE {} = ?",
        qualified(target_table),
        quote_ident(desc.pk_column_name())
    )
}

#[cfg(test)]
mod tests {
    use ghostferry_mysql_util::MySqlColumnDesc;

    use super::*;

    fn desc() -> MySqlTableDesc {
        MySqlTableDesc {
            schema_name: "shop".to_string(),
            name: "orders".to_string(),
            columns: vec![
                MySqlColumnDesc {
                    name: "id".to_string(),
                    column_type: "bigint".to_string(),
                    nullable: false,
                },
                MySqlColumnDesc {
                    name: "state".to_string(),
                    column_type: "varchar".to_string(),
                    nullable: true,
                },
            ],
            pk_column: 0,
        }
    }

    #[test]
    fn replace_statement_addresses_rows_by_pk() {
        assert_eq!(
            replace_sql(&TableName::new("shop_new", "orders"), &desc()),
            "REPLACE INTO `shop_new`.`orders` (`id`, `state`) VALUES (?, ?)"
        );
    }

    #[test]
    fn delete_statement_targets_pk_column() {
        assert_eq!(
            delete_sql(&TableName::new("shop", "orders"), &desc()),
            "DELETE FROM `shop`.`orders` WHERE `id` = ?"
        );
    }
}
