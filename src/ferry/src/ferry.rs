// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Assembles and drives one migration run.
//!
//! Initialization loads the schema cache and builds the state tracker,
//! either fresh or from a resume state. A fresh run captures the source's
//! current binlog coordinate *before* the first row batch is read, so the
//! replication stream is guaranteed to cover every write the row copy could
//! have missed; a resumed run replays from the dumped coordinate.
//!
//! During the run three long-lived tasks cooperate: the copy coordinator's
//! worker pool, the binlog streamer, and the binlog applier draining the
//! streamer's queue into the batch writer. When the copy completes the
//! ferry reads the source's current coordinate, drives the streamer to it
//! and drains the queue; the target is then consistent with the source as
//! of that coordinate.
//!
//! Cancellation and fatal errors both fan out through a shutdown signal.
//! In every case the tracker is left at the last fully committed progress,
//! so [`Ferry::serialize_state`] produces a valid resume point.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use ghostferry_mysql_util::{ensure_full_row_binlog_format, query_master_status, schema_info};

use crate::binlog::BinlogStreamer;
use crate::config::Config;
use crate::copier::{backoff_for, CopyCoordinator, CopyOutcome};
use crate::error::{bounded, classify_startup_error, DefiniteError, Error, TransientError};
use crate::events::BinlogTx;
use crate::position::BinlogPosition;
use crate::schema::TableSchemaCache;
use crate::state::{SerializableState, StateTracker};
use crate::writer::BatchWriter;
use crate::VERSION;

/// How a run ended. Cancellation is a clean shutdown but is reported
/// distinctly from completion; only a completed run has a target consistent
/// with the cutover coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
}

pub struct Ferry {
    config: Config,
    state: Arc<StateTracker>,
    schema_cache: Arc<TableSchemaCache>,
    shutdown: watch::Sender<bool>,
}

enum TaskDone {
    Copy(Result<CopyOutcome, Error>),
    Streamer(Result<(), Error>),
    Applier(Result<(), Error>),
}

impl Ferry {
    /// Validates the configuration, loads table metadata and builds the
    /// state tracker. Configuration problems (missing tables, unsupported
    /// primary keys, wrong server settings) surface here, before any data
    /// moves.
    pub async fn initialize(config: Config) -> Result<Self, Error> {
        config.validate()?;

        let (schema_cache, state) = match &config.resume_state {
            Some(resume) => {
                // Decode binlog events against the schema snapshot of the
                // original run, not whatever the source reports now.
                let cache = resume.last_known_table_schema_cache.clone();
                for table in &config.included_tables {
                    if !cache.contains(table) {
                        return Err(DefiniteError::InvalidResumeState(format!(
                            "resume state has no schema snapshot for {}",
                            table
                        ))
                        .into());
                    }
                }
                if resume.min_binlog_position().is_zero() {
                    return Err(DefiniteError::InvalidResumeState(
                        "resume state has a zero binlog position".to_string(),
                    )
                    .into());
                }
                info!(
                    dumped_by = %resume.ghostferry_version,
                    position = %resume.min_binlog_position(),
                    completed_tables = resume.completed_tables.len(),
                    "resuming from serialized state"
                );
                let state =
                    StateTracker::from_serialized_state(VERSION, config.speed_log_entries, resume);
                (cache, state)
            }
            None => {
                let mut conn = config
                    .source
                    .connect("ferry initialization")
                    .await
                    .map_err(classify_startup_error)?;
                ensure_full_row_binlog_format(&mut conn)
                    .await
                    .map_err(classify_startup_error)?;

                let tables: Vec<(String, String)> = config
                    .included_tables
                    .iter()
                    .map(|t| (t.schema_name().to_string(), t.table_name().to_string()))
                    .collect();
                let descs = schema_info(&mut conn, &tables)
                    .await
                    .map_err(classify_startup_error)?;
                let _ = conn.disconnect().await;

                (
                    TableSchemaCache::from_descs(descs),
                    StateTracker::new(VERSION, config.speed_log_entries),
                )
            }
        };

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            config,
            state: Arc::new(state),
            schema_cache: Arc::new(schema_cache),
            shutdown,
        })
    }

    /// Requests a clean shutdown. Every component drains what it has
    /// committed and stops; the persisted state is a valid resume point.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.shutdown.send_replace(true);
    }

    pub fn state_tracker(&self) -> Arc<StateTracker> {
        Arc::clone(&self.state)
    }

    /// The current resume token. Callable at any point, including after a
    /// fatal error.
    pub fn serialize_state(&self) -> SerializableState {
        self.state.serialize(&self.schema_cache)
    }

    pub async fn run(&self) -> Result<RunOutcome, Error> {
        // Select the binlog start coordinate. This must happen before the
        // copy coordinator reads its first row batch: replication replayed
        // from here covers every concurrent write the copy snapshot missed.
        let start = {
            let saved = self.state.last_binlog_position();
            if saved.is_zero() {
                let pos = self.capture_master_status().await?;
                self.state.update_last_binlog_position(pos.clone());
                info!(position = %pos, "captured binlog start coordinate");
                pos
            } else {
                info!(position = %saved, "replaying binlog from resumed coordinate");
                saved
            }
        };

        let writer = Arc::new(BatchWriter::new(
            &self.config.target,
            Arc::clone(&self.schema_cache),
            self.config.rewrites.clone(),
            Arc::clone(&self.state),
        )?);

        let (binlog_sink, binlog_queue) = mpsc::channel(self.config.binlog_queue_depth);
        let (stop_position, stop_position_rx) = watch::channel(None::<BinlogPosition>);

        let mut tasks = JoinSet::new();

        let streamer = BinlogStreamer::new(
            self.config.source.clone(),
            self.config.replication_server_id,
            Arc::clone(&self.schema_cache),
            self.config.rewrites.clone(),
            binlog_sink,
            stop_position_rx,
            self.shutdown.subscribe(),
        );
        tasks.spawn(async move { TaskDone::Streamer(streamer.run(start).await) });

        let applier_writer = Arc::clone(&writer);
        let max_attempts = self.config.max_copy_attempts;
        tasks.spawn(async move {
            TaskDone::Applier(apply_binlog_queue(binlog_queue, applier_writer, max_attempts).await)
        });

        let coordinator = CopyCoordinator::new(
            self.config.source.clone(),
            Arc::clone(&self.schema_cache),
            Arc::clone(&writer),
            Arc::clone(&self.state),
            self.config.batch_size,
            self.config.worker_count,
            self.config.max_copy_attempts,
            self.shutdown.subscribe(),
        );
        tasks.spawn(async move { TaskDone::Copy(coordinator.run().await) });

        let mut copy_outcome = None;
        let mut fatal: Option<Error> = None;
        while let Some(joined) = tasks.join_next().await {
            let done = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    error!("ferry task panicked: {join_err}");
                    fatal.get_or_insert_with(|| {
                        TransientError::Generic(anyhow::anyhow!(
                            "ferry task panicked: {}",
                            join_err
                        ))
                        .into()
                    });
                    self.shutdown.send_replace(true);
                    continue;
                }
            };
            match done {
                TaskDone::Copy(Ok(outcome)) => {
                    copy_outcome = Some(outcome);
                    match outcome {
                        CopyOutcome::Completed if fatal.is_none() => {
                            // Cutover: drive the streamer to the source's
                            // current coordinate and let it drain.
                            match self.capture_master_status().await {
                                Ok(target) => {
                                    info!(
                                        %target,
                                        "copy complete; stopping binlog streamer at cutover \
                                         coordinate"
                                    );
                                    stop_position.send_replace(Some(target));
                                }
                                Err(err) => {
                                    fatal.get_or_insert(err);
                                    self.shutdown.send_replace(true);
                                }
                            }
                        }
                        _ => {
                            self.shutdown.send_replace(true);
                        }
                    }
                }
                TaskDone::Copy(Err(err)) => {
                    copy_outcome = Some(CopyOutcome::Cancelled);
                    fatal.get_or_insert(err);
                    self.shutdown.send_replace(true);
                }
                // The streamer task owns the queue's only sender; once it
                // returns, the applier drains the queue and exits too.
                TaskDone::Streamer(Ok(())) => {}
                TaskDone::Streamer(Err(err)) => {
                    fatal.get_or_insert(err);
                    self.shutdown.send_replace(true);
                }
                TaskDone::Applier(Ok(())) => {}
                TaskDone::Applier(Err(err)) => {
                    fatal.get_or_insert(err);
                    self.shutdown.send_replace(true);
                }
            }
        }

        if let Err(err) = writer.shutdown().await {
            warn!("failed to tear down target connection pool: {err}");
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        match copy_outcome {
            Some(CopyOutcome::Completed) => {
                info!(
                    position = %self.state.last_binlog_position(),
                    "run complete; target is consistent with the source at the cutover coordinate"
                );
                Ok(RunOutcome::Completed)
            }
            _ => Ok(RunOutcome::Cancelled),
        }
    }

    async fn capture_master_status(&self) -> Result<BinlogPosition, Error> {
        let mut conn = self
            .config
            .source
            .connect("master status probe")
            .await
            .map_err(classify_startup_error)?;
        let deadline = self.config.source.timeouts().operation_deadline;
        let status = bounded(deadline, async {
            query_master_status(&mut conn)
                .await
                .map_err(TransientError::MySql)
        })
        .await?;
        let _ = conn.disconnect().await;
        Ok(BinlogPosition::new(status.file, status.position))
    }
}

/// Drains the streamer's queue into the batch writer, in source order, one
/// task for the whole run. Batches are idempotent, so a transient write
/// failure is retried in place without risking reordering.
async fn apply_binlog_queue(
    mut queue: mpsc::Receiver<BinlogTx>,
    writer: Arc<BatchWriter>,
    max_attempts: usize,
) -> Result<(), Error> {
    while let Some(binlog_tx) = queue.recv().await {
        let mut attempt = 0;
        loop {
            match writer.write_binlog_tx(&binlog_tx).await {
                Ok(()) => break,
                Err(err) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(Error::Transient(err));
                    }
                    let backoff = backoff_for(attempt);
                    warn!(
                        attempt, ?backoff,
                        "binlog apply failed, retrying in place: {err}"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
    Ok(())
}
