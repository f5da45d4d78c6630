// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Schedules table copies across the worker pool.
//!
//! Each worker pulls a table off a shared queue, opens a cursor at the
//! table's last successful PK and streams batches into the batch writer.
//! Cursor exhaustion marks the table completed; a transient error
//! re-enqueues the table with backoff until its retries are exhausted.
//! The coordinator returns once the queue is drained and every worker has
//! gone idle, which is the ferry's signal to begin cutover.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{info, warn};

use ghostferry_mysql_util as mysql_util;
use ghostferry_mysql_util::MySqlTableDesc;

use crate::cursor::TableCursor;
use crate::error::Error;
use crate::schema::{TableName, TableSchemaCache};
use crate::state::StateTracker;
use crate::writer::BatchWriter;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(500);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Idle workers poll the queue at this interval while peers may still
/// re-enqueue failed tables.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CopyOutcome {
    Completed,
    Cancelled,
}

pub(crate) struct CopyCoordinator {
    shared: Arc<Shared>,
    worker_count: usize,
}

struct Shared {
    source: mysql_util::Config,
    schema_cache: Arc<TableSchemaCache>,
    writer: Arc<BatchWriter>,
    state: Arc<StateTracker>,
    batch_size: usize,
    max_attempts: usize,
    shutdown: watch::Receiver<bool>,
    queue: Mutex<VecDeque<(TableName, usize)>>,
    in_flight: AtomicUsize,
}

impl CopyCoordinator {
    pub(crate) fn new(
        source: mysql_util::Config,
        schema_cache: Arc<TableSchemaCache>,
        writer: Arc<BatchWriter>,
        state: Arc<StateTracker>,
        batch_size: usize,
        worker_count: usize,
        max_attempts: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        // Tables already completed in a resumed run are not enqueued.
        let work: VecDeque<_> = schema_cache
            .table_names()
            .filter(|table| !state.is_completed(table))
            .cloned()
            .map(|table| (table, 0))
            .collect();
        Self {
            shared: Arc::new(Shared {
                source,
                schema_cache,
                writer,
                state,
                batch_size,
                max_attempts,
                shutdown,
                queue: Mutex::new(work),
                in_flight: AtomicUsize::new(0),
            }),
            worker_count,
        }
    }

    pub(crate) async fn run(self) -> Result<CopyOutcome, Error> {
        let table_count = self.shared.queue.lock().expect("queue poisoned").len();
        info!(tables = table_count, workers = self.worker_count, "starting row copy");
        if table_count == 0 {
            return Ok(CopyOutcome::Completed);
        }

        let mut workers = JoinSet::new();
        for worker_id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            workers.spawn(async move { shared.worker(worker_id).await });
        }

        let mut outcome = CopyOutcome::Completed;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(CopyOutcome::Completed)) => {}
                Ok(Ok(CopyOutcome::Cancelled)) => outcome = CopyOutcome::Cancelled,
                // Dropping the set aborts the remaining workers.
                Ok(Err(err)) => return Err(err),
                Err(join_err) => {
                    return Err(Error::Transient(
                        anyhow::anyhow!("copy worker panicked: {}", join_err).into(),
                    ))
                }
            }
        }
        if outcome == CopyOutcome::Completed {
            info!("row copy complete");
        }
        Ok(outcome)
    }
}

impl Shared {
    async fn worker(self: Arc<Self>, worker_id: usize) -> Result<CopyOutcome, Error> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(CopyOutcome::Cancelled);
            }
            // The in-flight count is bumped while still holding the queue
            // lock, so an idle peer can never observe an empty queue with a
            // stale zero count and quit early.
            let entry = {
                let mut queue = self.queue.lock().expect("queue poisoned");
                let entry = queue.pop_front();
                if entry.is_some() {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                }
                entry
            };
            let (table, attempt) = match entry {
                Some(entry) => entry,
                None => {
                    // Another worker may still fail and re-enqueue its
                    // table; only quit once nothing is in flight anywhere.
                    if self.in_flight.load(Ordering::SeqCst) == 0 {
                        return Ok(CopyOutcome::Completed);
                    }
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    continue;
                }
            };

            let result = self.copy_table(&table).await;
            match result {
                Ok(CopyOutcome::Completed) => {
                    self.state.mark_completed(&table);
                    info!(worker_id, %table, "table copy complete");
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Ok(CopyOutcome::Cancelled) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Ok(CopyOutcome::Cancelled);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let attempt = attempt + 1;
                    let backoff = backoff_for(attempt);
                    warn!(
                        worker_id, %table, attempt, ?backoff,
                        "table copy failed, will retry from last successful pk: {err}"
                    );
                    tokio::time::sleep(backoff).await;
                    // Re-enqueue before decrementing so idle peers do not
                    // observe an empty queue with nothing in flight.
                    self.queue
                        .lock()
                        .expect("queue poisoned")
                        .push_back((table, attempt));
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                Err(err) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
    }

    async fn copy_table(&self, table: &TableName) -> Result<CopyOutcome, Error> {
        let desc: &MySqlTableDesc = self.schema_cache.get(table).ok_or_else(|| {
            Error::Transient(anyhow::anyhow!("no schema cached for {}", table).into())
        })?;

        let resume_pk = self.state.last_pk(table);
        if resume_pk == u64::MAX {
            return Ok(CopyOutcome::Completed);
        }

        let mut cursor =
            TableCursor::open(&self.source, desc, resume_pk, self.batch_size).await?;
        loop {
            if *self.shutdown.borrow() {
                return Ok(CopyOutcome::Cancelled);
            }
            match cursor.next_batch().await? {
                Some(batch) => self.writer.write_row_batch(&batch).await?,
                None => break,
            }
        }
        if let Err(err) = cursor.close().await {
            // The table is fully copied at this point; a failure tearing
            // down the read transaction is not worth a retry.
            warn!(%table, "failed to close cursor cleanly: {err}");
        }
        Ok(CopyOutcome::Completed)
    }
}

pub(crate) fn backoff_for(attempt: usize) -> Duration {
    let exp = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX).min(6);
    RETRY_BACKOFF_CAP.min(RETRY_BACKOFF_BASE * 2u32.pow(exp))
}

#[cfg(test)]
mod tests {
    use ghostferry_mysql_util::MySqlColumnDesc;
    use mysql_async::OptsBuilder;
    use tokio::sync::watch;

    use crate::schema::TableRewrites;
    use crate::VERSION;

    use super::*;

    #[test]
    fn backoff_grows_exponentially_to_a_cap() {
        assert_eq!(backoff_for(1), Duration::from_millis(500));
        assert_eq!(backoff_for(2), Duration::from_secs(1));
        assert_eq!(backoff_for(3), Duration::from_secs(2));
        assert!(backoff_for(100) <= RETRY_BACKOFF_CAP);
    }

    fn desc(schema: &str, name: &str) -> MySqlTableDesc {
        MySqlTableDesc {
            schema_name: schema.to_string(),
            name: name.to_string(),
            columns: vec![MySqlColumnDesc {
                name: "id".to_string(),
                column_type: "bigint".to_string(),
                nullable: false,
            }],
            pk_column: 0,
        }
    }

    #[test]
    fn resumed_run_skips_completed_tables_and_resumes_after_stored_pk() {
        let t1 = TableName::new("s", "t1");
        let t2 = TableName::new("s", "t2");

        let state = Arc::new(StateTracker::new(VERSION, 0));
        state.update_last_pk(&t2, 500);
        state.mark_completed(&t1);

        let schema_cache = Arc::new(TableSchemaCache::from_descs(vec![
            desc("s", "t1"),
            desc("s", "t2"),
        ]));

        let mysql = mysql_util::Config::new(
            OptsBuilder::default().ip_or_hostname("localhost").into(),
            mysql_util::TimeoutConfig::default(),
        );
        let writer = Arc::new(
            BatchWriter::new(
                &mysql,
                Arc::clone(&schema_cache),
                TableRewrites::default(),
                Arc::clone(&state),
            )
            .unwrap(),
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = CopyCoordinator::new(
            mysql,
            schema_cache,
            writer,
            Arc::clone(&state),
            100,
            2,
            3,
            shutdown_rx,
        );

        let queued: Vec<_> = coordinator
            .shared
            .queue
            .lock()
            .unwrap()
            .iter()
            .map(|(table, _)| table.clone())
            .collect();
        // The completed table is not enqueued; the in-progress table will
        // resume strictly after its stored PK.
        assert_eq!(queued, vec![t2.clone()]);
        assert_eq!(state.last_pk(&t2), 500);
        assert_eq!(state.last_pk(&t1), u64::MAX);
    }
}
