// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! PK-ordered batched reads from one source table.
//!
//! A cursor owns a dedicated source connection with a `REPEATABLE READ`
//! consistent-snapshot transaction open for its whole lifetime, so rows
//! inserted after the cursor opened are never observed. The table's maximum
//! PK is resolved once inside that transaction; everything the cursor
//! yields lies in `(resume_pk, max_pk]`, in strictly ascending PK order,
//! at most `batch_size` rows per batch.

use std::time::Duration;

use itertools::Itertools;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Value};
use tracing::trace;

use ghostferry_mysql_util::{Config, MySqlTableDesc, ER_NO_SUCH_TABLE};

use crate::error::{bounded, DefiniteError, Error, TransientError};
use crate::schema::TableName;

/// An ordered batch of rows read from the source, ready for the batch
/// writer. Values are passed through bit-exact.
#[derive(Debug, Clone)]
pub struct RowBatch {
    /// Source identity of the table the rows belong to.
    pub table: TableName,
    /// Rows in ascending PK order, each in table column order.
    pub rows: Vec<Vec<Value>>,
    /// The largest PK in `rows`; the tracker advances to it on commit.
    pub max_pk: u64,
}

pub struct TableCursor {
    conn: Conn,
    desc: MySqlTableDesc,
    table: TableName,
    batch_size: usize,
    /// Upper bound resolved at open; rows above it arrived after the
    /// snapshot and are left to the binlog stream.
    max_pk: u64,
    last_pk: u64,
    deadline: Option<Duration>,
    done: bool,
}

impl TableCursor {
    /// Opens a cursor resuming after `resume_pk`.
    pub async fn open(
        source: &Config,
        desc: &MySqlTableDesc,
        resume_pk: u64,
        batch_size: usize,
    ) -> Result<Self, Error> {
        let table = TableName::new(&desc.schema_name, &desc.name);
        let mut conn = source
            .connect(&format!("table cursor for {}", table))
            .await
            .map_err(TransientError::MySql)?;

        if let Some(timeout) = source.timeouts().snapshot_max_execution_time {
            if !timeout.is_zero() {
                conn.query_drop(format!(
                    "SET @@session.max_execution_time = {}",
                    timeout.as_millis()
                ))
                .await
                .map_err(TransientError::SQLClient)?;
            }
        }

        // Pin a consistent read view for the lifetime of the cursor. The
        // transaction is held open across batches, which is why this is a
        // raw statement rather than `start_transaction`.
        conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .map_err(TransientError::SQLClient)?;
        conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT, READ ONLY")
            .await
            .map_err(TransientError::SQLClient)?;

        // MAX(pk) is NULL when the table is empty. A missing table here
        // means it was dropped out-of-band since the schema snapshot was
        // taken; retrying cannot fix that.
        let max_pk: Option<Option<u64>> = conn
            .query_first(max_pk_sql(desc))
            .await
            .map_err(|err| classify_source_error(&table, TransientError::SQLClient(err)))?;
        let max_pk = max_pk.flatten();
        trace!(%table, resume_pk, ?max_pk, "opened table cursor");

        Ok(Self {
            conn,
            desc: desc.clone(),
            table,
            batch_size,
            max_pk: max_pk.unwrap_or(0),
            last_pk: resume_pk,
            deadline: source.timeouts().operation_deadline,
            // An empty table, or one already copied past its max, yields
            // nothing.
            done: max_pk.is_none() || max_pk.is_some_and(|max| resume_pk >= max),
        })
    }

    /// The next batch, or `None` once the range is exhausted. A transport
    /// error terminates the cursor and the caller retries the whole table
    /// from its last successful PK; a table dropped mid-read is definite.
    pub async fn next_batch(&mut self) -> Result<Option<RowBatch>, Error> {
        if self.done {
            return Ok(None);
        }

        let sql = select_batch_sql(&self.desc);
        let params = (self.last_pk, self.max_pk, self.batch_size as u64);
        let conn = &mut self.conn;
        let result = bounded(self.deadline, async {
            conn.exec(sql, params).await.map_err(TransientError::SQLClient)
        })
        .await;
        let rows: Vec<mysql_async::Row> = match result {
            Ok(rows) => rows,
            Err(err) => return Err(classify_source_error(&self.table, err)),
        };

        if rows.is_empty() {
            self.done = true;
            return Ok(None);
        }

        if rows.len() < self.batch_size {
            self.done = true;
        }

        let batch_max_pk: u64 = rows
            .last()
            .expect("rows is non-empty")
            .get(self.desc.pk_column)
            .ok_or_else(|| {
                TransientError::Generic(anyhow::anyhow!(
                    "row from {} has no readable pk in column {}",
                    self.table,
                    self.desc.pk_column
                ))
            })?;
        let rows: Vec<Vec<Value>> = rows.into_iter().map(|row| row.unwrap()).collect();

        trace!(
            table = %self.table,
            rows = rows.len(),
            batch_max_pk,
            "read copier batch"
        );

        self.last_pk = batch_max_pk;
        if self.last_pk >= self.max_pk {
            self.done = true;
        }

        Ok(Some(RowBatch {
            table: self.table.clone(),
            rows,
            max_pk: batch_max_pk,
        }))
    }

    pub async fn close(mut self) -> Result<(), Error> {
        self.conn
            .query_drop("COMMIT")
            .await
            .map_err(TransientError::SQLClient)?;
        self.conn
            .disconnect()
            .await
            .map_err(TransientError::SQLClient)?;
        Ok(())
    }
}

/// Handles the case where an in-scope table is dropped or renamed while the
/// cursor is reading it: the server reports `ER_NO_SUCH_TABLE`, which no
/// amount of retrying will fix. Everything else stays transient.
fn classify_source_error(table: &TableName, err: TransientError) -> Error {
    match err {
        TransientError::SQLClient(mysql_async::Error::Server(server_err))
            if server_err.code == ER_NO_SUCH_TABLE =>
        {
            DefiniteError::MissingTable(table.to_string()).into()
        }
        err => err.into(),
    }
}

pub(crate) fn quote_ident(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

fn qualified(desc: &MySqlTableDesc) -> String {
    format!(
        "{}.{}",
        quote_ident(&desc.schema_name),
        quote_ident(&desc.name)
    )
}

fn max_pk_sql(desc: &MySqlTableDesc) -> String {
    format!(
        "SELECT MAX({}) FROM {}",
        quote_ident(desc.pk_column_name()),
        qualified(desc)
    )
}

fn select_batch_sql(desc: &MySqlTableDesc) -> String {
    let pk = quote_ident(desc.pk_column_name());
    let columns = desc.columns.iter().map(|c| quote_ident(&c.name)).join(", ");
    format!(
        "SELECT {} FROM {} WHERE {} > ? AND {} <= ? ORDER BY {} ASC LIMIT ?",
        columns,
        qualified(desc),
        pk,
        pk,
        pk
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
                    name: "total".to_string(),
                    column_type: "int".to_string(),
                    nullable: true,
                },
            ],
            pk_column: 0,
        }
    }

    #[test]
    fn batch_query_pages_by_pk_range() {
        assert_eq!(
            select_batch_sql(&desc()),
            "SELECT `id`, `total` FROM `shop`.`orders` \
             WHERE `id` > ? AND `id` <= ? ORDER BY `id` ASC LIMIT ?"
        );
    }

    #[test]
    fn max_pk_query() {
        assert_eq!(
            max_pk_sql(&desc()),
            "SELECT MAX(`id`) FROM `shop`.`orders`"
        );
    }

    #[test]
    fn idents_with_backticks_are_escaped() {
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn dropped_table_is_definite_other_errors_stay_transient() {
        let table = TableName::new("shop", "orders");

        let dropped = TransientError::SQLClient(mysql_async::Error::Server(
            mysql_async::ServerError {
                code: ER_NO_SUCH_TABLE,
                message: "Table 'shop.orders' doesn't exist".to_string(),
                state: "42S02".to_string(),
            },
        ));
        assert!(matches!(
            classify_source_error(&table, dropped),
            Error::Definite(DefiniteError::MissingTable(_))
        ));

        let deadline = TransientError::Deadline(Duration::from_secs(1));
        assert!(classify_source_error(&table, deadline).is_transient());
    }
}
