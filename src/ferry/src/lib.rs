// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An online MySQL data migration engine.
//!
//! The engine copies rows between two MySQL instances while the source
//! stays under live write load, then performs a consistent cutover. It is
//! split into a row-copy side and a replication side.
//!
//! # Row copy
//!
//! The [`Ferry`] drives a pool of copy workers. Each worker claims a table,
//! opens a consistent-snapshot cursor at the table's last successful
//! primary key and streams PK-ordered batches into the batch writer, which
//! applies them to the target with replace-by-primary-key semantics.
//!
//! # Replication
//!
//! In parallel, a binlog streamer tails the source's replication log from a
//! coordinate captured before the first row was copied. Row events for
//! in-scope tables are rewritten to their target identity and applied, in
//! source order, by a single applier. Because the copy reads from snapshots
//! taken no earlier than the replication start coordinate, a binlog event
//! and a copied row for the same PK always converge on the later state.
//!
//! # Resumability
//!
//! Both sides report progress to a shared [`StateTracker`], which can be
//! serialized at any moment into a [`SerializableState`]: a JSON resume
//! token with each table's last successful PK, the completed-table set and
//! the last written binlog coordinate. Feeding the token back into
//! [`Ferry::initialize`] resumes the run with no row loss, no binlog-event
//! loss, and idempotent re-application of anything in flight when the
//! process died.

mod binlog;
mod config;
mod copier;
mod cursor;
mod error;
mod events;
mod ferry;
mod position;
mod schema;
mod state;
mod writer;

pub use config::Config;
pub use cursor::{RowBatch, TableCursor};
pub use error::{DefiniteError, Error, TransientError};
pub use events::{BinlogTx, DmlEvent, RowChange};
pub use ferry::{Ferry, RunOutcome};
pub use position::BinlogPosition;
pub use schema::{TableName, TableRewrites, TableSchemaCache};
pub use state::{SerializableState, StateTracker};
pub use writer::BatchWriter;

pub use ghostferry_mysql_util as mysql_util;

/// The version string recorded in every state dump this build produces.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
