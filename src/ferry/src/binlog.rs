// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Tails the source's binary log and feeds committed transactions to the
//! batch writer.
//!
//! The streamer registers as a replica at a fixed `(file, offset)`
//! coordinate and consumes events in source order. Row events for in-scope
//! tables are decoded and buffered until the enclosing transaction commits
//! (XidEvent, or a `COMMIT` query event for non-transactional engines), at
//! which point the whole transaction is handed to the applier with its end
//! coordinate. Transactions that only touch filtered tables are handed over
//! empty so the resume coordinate still advances past them.
//!
//! The streamer runs until told to stop at a target coordinate, after which
//! it halts at the first transaction boundary at or past that coordinate.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use mysql_async::binlog::events::EventData;
use mysql_async::prelude::Queryable;
use mysql_async::BinlogStreamRequest;
use tokio::sync::{mpsc, watch};
use tracing::{info, trace};

use ghostferry_mysql_util as mysql_util;
use ghostferry_mysql_util::{
    ensure_full_row_binlog_format, ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE,
};

use crate::error::{classify_startup_error, DefiniteError, Error, TransientError};
use crate::events::{ddl_targets, decode_rows_event, BinlogTx, DmlEvent};
use crate::position::BinlogPosition;
use crate::schema::{TableName, TableRewrites, TableSchemaCache};

/// Heartbeat interval requested from the source so the streamer observes
/// quiescence and can evaluate its stop condition on an idle stream.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(3);

pub(crate) struct BinlogStreamer {
    source: mysql_util::Config,
    server_id: u32,
    schema_cache: Arc<TableSchemaCache>,
    rewrites: TableRewrites,
    sink: mpsc::Sender<BinlogTx>,
    stop_position: watch::Receiver<Option<BinlogPosition>>,
    shutdown: watch::Receiver<bool>,
}

impl BinlogStreamer {
    pub(crate) fn new(
        source: mysql_util::Config,
        server_id: u32,
        schema_cache: Arc<TableSchemaCache>,
        rewrites: TableRewrites,
        sink: mpsc::Sender<BinlogTx>,
        stop_position: watch::Receiver<Option<BinlogPosition>>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            server_id,
            schema_cache,
            rewrites,
            sink,
            stop_position,
            shutdown,
        }
    }

    pub(crate) async fn run(mut self, start: BinlogPosition) -> Result<(), Error> {
        let mut conn = self
            .source
            .connect("binlog streamer")
            .await
            .map_err(classify_startup_error)?;
        ensure_full_row_binlog_format(&mut conn)
            .await
            .map_err(classify_startup_error)?;

        // Request a heartbeat whenever no other event was sent within the
        // interval.
        // https://dev.mysql.com/doc/refman/8.0/en/replication-administration-status.html
        conn.query_drop(format!(
            "SET @master_heartbeat_period = {};",
            HEARTBEAT_PERIOD.as_nanos()
        ))
        .await
        .map_err(TransientError::SQLClient)?;

        info!(%start, server_id = self.server_id, "starting binlog replication");
        let mut stream = match conn
            .get_binlog_stream(
                BinlogStreamRequest::new(self.server_id)
                    .with_filename(start.name.as_bytes())
                    .with_pos(start.pos),
            )
            .await
        {
            Ok(stream) => stream,
            Err(mysql_async::Error::Server(ref server_err))
                if server_err.code == ER_SOURCE_FATAL_ERROR_READING_BINLOG_CODE =>
            {
                // The requested coordinate has been purged from the binlog.
                return Err(DefiniteError::BinlogNotAvailable.into());
            }
            Err(err) => return Err(TransientError::SQLClient(err).into()),
        };

        let mut current_file = start.name.clone();
        let mut last_streamed = start.clone();
        // Changes of the source transaction currently being read.
        let mut pending: Vec<DmlEvent> = vec![];
        let mut in_tx = false;
        // Binlog table id -> table name, for in-scope tables.
        let mut table_id_map = BTreeMap::<u64, TableName>::new();
        let mut skipped_table_ids = BTreeSet::<u64>::new();

        loop {
            if *self.shutdown.borrow() {
                info!(position = %last_streamed, "binlog streamer cancelled");
                break;
            }
            if !in_tx {
                if let Some(target) = self.stop_position.borrow().clone() {
                    if last_streamed >= target {
                        info!(position = %last_streamed, %target, "binlog streamer caught up");
                        break;
                    }
                }
            }

            let event = tokio::select! {
                biased;
                _ = self.shutdown.changed() => continue,
                _ = self.stop_position.changed() => continue,
                event = stream.next() => event,
            };
            // We never expect the replication stream to gracefully end.
            let event = match event {
                Some(event) => event.map_err(TransientError::SQLClient)?,
                None => return Err(TransientError::ReplicationEOF.into()),
            };
            let log_pos = u64::from(event.header().log_pos());

            match event.read_data().map_err(TransientError::IoError)? {
                Some(EventData::RotateEvent(rotate)) => {
                    let next_file = rotate.name().to_string();
                    if next_file < current_file {
                        return Err(DefiniteError::BinlogFileRegression {
                            from: current_file,
                            to: next_file,
                        }
                        .into());
                    }
                    trace!(from = %current_file, to = %next_file, "binlog rotate");
                    current_file = next_file;
                    if rotate.position() > 0 && !in_tx {
                        last_streamed =
                            BinlogPosition::new(current_file.clone(), rotate.position());
                        self.send(BinlogTx {
                            events: vec![],
                            end_position: last_streamed.clone(),
                        })
                        .await?;
                    }
                }
                Some(EventData::QueryEvent(query_event)) => {
                    let query = query_event.query();
                    if query.trim().eq_ignore_ascii_case("BEGIN") {
                        in_tx = true;
                        pending.clear();
                    } else if query.trim().eq_ignore_ascii_case("COMMIT") {
                        // Non-transactional engines commit with a query
                        // event instead of an XidEvent.
                        last_streamed = self
                            .flush_transaction(&mut pending, &current_file, log_pos)
                            .await?;
                        in_tx = false;
                    } else {
                        let current_schema = query_event.schema();
                        let targets = ddl_targets(&query, &current_schema);
                        if let Some(table) =
                            targets.iter().find(|t| self.schema_cache.contains(t))
                        {
                            return Err(DefiniteError::SchemaDrift(format!(
                                "DDL affecting {} observed in the binlog: {}",
                                table, query
                            ))
                            .into());
                        }
                        // Acknowledged but not written; DDL on out-of-scope
                        // tables auto-commits and advances the coordinate.
                        if !in_tx && log_pos > 0 {
                            last_streamed = self
                                .flush_transaction(&mut pending, &current_file, log_pos)
                                .await?;
                        }
                    }
                }
                Some(EventData::XidEvent(_)) => {
                    last_streamed = self
                        .flush_transaction(&mut pending, &current_file, log_pos)
                        .await?;
                    in_tx = false;
                }
                Some(EventData::RowsEvent(data)) => {
                    let table_id = data.table_id();
                    if skipped_table_ids.contains(&table_id) {
                        continue;
                    }
                    let table = match table_id_map.get(&table_id) {
                        Some(table) => table.clone(),
                        None => {
                            let table_map_event =
                                stream.get_tme(table_id).ok_or_else(|| {
                                    TransientError::Generic(anyhow::anyhow!(
                                        "table map event not found for table id {}",
                                        table_id
                                    ))
                                })?;
                            let table = TableName::new(
                                &table_map_event.database_name(),
                                &table_map_event.table_name(),
                            );
                            if self.schema_cache.contains(&table) {
                                table_id_map.insert(table_id, table.clone());
                                table
                            } else {
                                trace!(%table, table_id, "skipping out-of-scope table");
                                skipped_table_ids.insert(table_id);
                                continue;
                            }
                        }
                    };

                    let table_map_event = stream.get_tme(table_id).ok_or_else(|| {
                        TransientError::Generic(anyhow::anyhow!(
                            "table map event not found for table id {}",
                            table_id
                        ))
                    })?;
                    let target_table = self.rewrites.rewrite(&table);
                    let events =
                        decode_rows_event(&data, table_map_event, &table, &target_table)?;
                    trace!(%table, events = events.len(), "buffered row events");
                    pending.extend(events);
                }
                // Table map events are cached by the stream itself; nothing
                // else carries row state we need.
                _ => {}
            }
        }

        Ok(())
    }

    /// Hands the current transaction (possibly empty) to the applier and
    /// returns the coordinate it ended at.
    async fn flush_transaction(
        &self,
        pending: &mut Vec<DmlEvent>,
        current_file: &str,
        log_pos: u64,
    ) -> Result<BinlogPosition, Error> {
        let end_position = BinlogPosition::new(current_file, log_pos);
        self.send(BinlogTx {
            events: std::mem::take(pending),
            end_position: end_position.clone(),
        })
        .await?;
        Ok(end_position)
    }

    async fn send(&self, tx: BinlogTx) -> Result<(), Error> {
        self.sink.send(tx).await.map_err(|_| {
            Error::Transient(TransientError::Generic(anyhow::anyhow!(
                "binlog applier queue closed"
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_position_comparison_is_total() {
        // The streamer stops once its last streamed coordinate reaches the
        // target, including across a file rotation.
        let target = BinlogPosition::new("mysql-bin.000003", 500);
        assert!(BinlogPosition::new("mysql-bin.000003", 500) >= target);
        assert!(BinlogPosition::new("mysql-bin.000003", 501) >= target);
        assert!(BinlogPosition::new("mysql-bin.000004", 4) >= target);
        assert!(!(BinlogPosition::new("mysql-bin.000003", 499) >= target));
        assert!(!(BinlogPosition::new("mysql-bin.000002", 900) >= target));
    }
}
