// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Progress bookkeeping for an interruptible run.
//!
//! The state tracker is initialized and owned by the [`Ferry`]; every
//! component that makes progress (the batch writer for row copies, the
//! binlog applier for replication) holds a shared handle and reports
//! through the API here. At any point during a run the tracked state can be
//! copied into a [`SerializableState`] and dumped as JSON; feeding that
//! dump back into a new ferry resumes the interrupted run without row loss
//! or binlog-event loss.
//!
//! Two independent reader-writer locks guard the two progress domains: the
//! binlog coordinate on one side, per-table copy progress (plus the speed
//! ring) on the other. Serialization acquires both as a reader, binlog
//! first; writers only ever take their own lock.
//!
//! [`Ferry`]: crate::Ferry

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::RwLock;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::position::BinlogPosition;
use crate::schema::{dotted_pk_map, dotted_table_set, TableName, TableSchemaCache};

/// The serialization-friendly snapshot of a tracker. Field names are the
/// on-disk dump format; unknown top-level fields are ignored on load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializableState {
    #[serde(rename = "GhostferryVersion")]
    pub ghostferry_version: String,
    #[serde(rename = "LastKnownTableSchemaCache")]
    pub last_known_table_schema_cache: TableSchemaCache,
    #[serde(rename = "LastSuccessfulPrimaryKeys", with = "dotted_pk_map")]
    pub last_successful_primary_keys: BTreeMap<TableName, u64>,
    #[serde(rename = "CompletedTables", with = "dotted_table_set")]
    pub completed_tables: BTreeSet<TableName>,
    #[serde(rename = "LastWrittenBinlogPosition")]
    pub last_written_binlog_position: BinlogPosition,
}

impl SerializableState {
    /// The coordinate binlog replay must restart from when resuming from
    /// this state.
    pub fn min_binlog_position(&self) -> &BinlogPosition {
        &self.last_written_binlog_position
    }

    /// The on-disk dump encoding.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// For tracking the speed of the copy.
#[derive(Debug, Clone, Copy)]
struct PkPositionLog {
    position: u64,
    at: Instant,
}

/// Fixed-capacity window over the cumulative count of copied PKs. Slots are
/// explicitly occupied rather than inferred from a zero position, so a
/// legitimate zero cannot be confused with an unwritten slot.
#[derive(Debug)]
struct SpeedLog {
    window: VecDeque<PkPositionLog>,
    capacity: usize,
}

impl SpeedLog {
    fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        Some(Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    fn record(&mut self, delta: u64, at: Instant) {
        let position = self.window.back().map_or(0, |e| e.position) + delta;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(PkPositionLog { position, at });
    }

    /// Rate across the window, or 0 before two entries exist.
    fn rate(&self) -> f64 {
        let (earliest, current) = match (self.window.front(), self.window.back()) {
            (Some(e), Some(c)) if self.window.len() >= 2 => (e, c),
            _ => return 0.0,
        };
        let delta_pk = current.position - earliest.position;
        let delta_t = current.at.duration_since(earliest.at).as_secs_f64();
        if delta_t == 0.0 {
            return 0.0;
        }
        delta_pk as f64 / delta_t
    }
}

#[derive(Debug, Default)]
struct CopyProgress {
    last_successful_pks: BTreeMap<TableName, u64>,
    completed_tables: BTreeSet<TableName>,
    speed_log: Option<SpeedLog>,
}

#[derive(Debug)]
pub struct StateTracker {
    version: String,

    binlog: RwLock<BinlogPosition>,
    copy: RwLock<CopyProgress>,
}

impl StateTracker {
    /// A fresh tracker. `speed_log_entries == 0` disables speed estimation.
    pub fn new(version: impl Into<String>, speed_log_entries: usize) -> Self {
        Self {
            version: version.into(),
            binlog: RwLock::new(BinlogPosition::default()),
            copy: RwLock::new(CopyProgress {
                last_successful_pks: BTreeMap::new(),
                completed_tables: BTreeSet::new(),
                speed_log: SpeedLog::new(speed_log_entries),
            }),
        }
    }

    /// A tracker resuming from a previously dumped state, as opposed to
    /// starting from the beginning.
    pub fn from_serialized_state(
        version: impl Into<String>,
        speed_log_entries: usize,
        state: &SerializableState,
    ) -> Self {
        let tracker = Self::new(version, speed_log_entries);
        {
            let mut copy = tracker.copy.write().expect("copy lock poisoned");
            copy.last_successful_pks = state.last_successful_primary_keys.clone();
            copy.completed_tables = state.completed_tables.clone();
        }
        *tracker.binlog.write().expect("binlog lock poisoned") =
            state.min_binlog_position().clone();
        tracker
    }

    /// Advances the last written binlog coordinate. A coordinate at or
    /// before the current one is discarded, so racing writers settle on the
    /// latest position and readers only ever observe it moving forward.
    pub fn update_last_binlog_position(&self, pos: BinlogPosition) {
        let mut current = self.binlog.write().expect("binlog lock poisoned");
        if pos > *current {
            *current = pos;
        }
    }

    pub fn last_binlog_position(&self) -> BinlogPosition {
        self.binlog.read().expect("binlog lock poisoned").clone()
    }

    /// Records that every row of `table` up to and including `pk` has been
    /// written. `pk` must be strictly greater than the previous value.
    pub fn update_last_pk(&self, table: &TableName, pk: u64) {
        let mut copy = self.copy.write().expect("copy lock poisoned");
        let previous = copy.last_successful_pks.get(table).copied().unwrap_or(0);
        assert!(
            pk > previous,
            "pk for {} moved backwards: {} -> {}",
            table,
            previous,
            pk
        );
        copy.last_successful_pks.insert(table.clone(), pk);

        let delta = pk - previous;
        let now = Instant::now();
        if let Some(speed_log) = copy.speed_log.as_mut() {
            speed_log.record(delta, now);
        }
    }

    /// The PK a fresh iterator resumes after: `u64::MAX` for a completed
    /// table, the stored PK otherwise, 0 if the table has never reported.
    pub fn last_pk(&self, table: &TableName) -> u64 {
        let copy = self.copy.read().expect("copy lock poisoned");
        if copy.completed_tables.contains(table) {
            return u64::MAX;
        }
        copy.last_successful_pks.get(table).copied().unwrap_or(0)
    }

    pub fn mark_completed(&self, table: &TableName) {
        let mut copy = self.copy.write().expect("copy lock poisoned");
        copy.completed_tables.insert(table.clone());
    }

    pub fn is_completed(&self, table: &TableName) -> bool {
        let copy = self.copy.read().expect("copy lock poisoned");
        copy.completed_tables.contains(table)
    }

    /// Estimated copy rate in PKs per second over the speed-log window.
    ///
    /// This is reasonably accurate if the rows copied are distributed
    /// uniformly between pk = 0 and max(pk). It would not be accurate if
    /// the distribution is concentrated in a particular region.
    pub fn estimated_pks_per_second(&self) -> f64 {
        let copy = self.copy.read().expect("copy lock poisoned");
        copy.speed_log.as_ref().map_or(0.0, |log| log.rate())
    }

    /// Copies the tracked state into a [`SerializableState`] tagged with
    /// the supplied schema snapshot.
    ///
    /// Holds both read locks for the duration of the copy so the dump is a
    /// consistent snapshot: the binlog coordinate it contains was observed
    /// no later than any PK value in the same dump. The returned maps are
    /// deep copies; later tracker updates do not alias into them.
    pub fn serialize(&self, schema_cache: &TableSchemaCache) -> SerializableState {
        let binlog = self.binlog.read().expect("binlog lock poisoned");
        let copy = self.copy.read().expect("copy lock poisoned");

        SerializableState {
            ghostferry_version: self.version.clone(),
            last_known_table_schema_cache: schema_cache.clone(),
            last_successful_primary_keys: copy.last_successful_pks.clone(),
            completed_tables: copy.completed_tables.clone(),
            last_written_binlog_position: binlog.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn table(s: &str, t: &str) -> TableName {
        TableName::new(s, t)
    }

    #[test]
    fn empty_tracker_serializes_empty_maps_and_zero_position() {
        let tracker = StateTracker::new("1.0.0", 0);
        let dump = tracker.serialize(&TableSchemaCache::default());

        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["GhostferryVersion"], "1.0.0");
        assert_eq!(json["LastKnownTableSchemaCache"], serde_json::json!({}));
        assert_eq!(json["LastSuccessfulPrimaryKeys"], serde_json::json!({}));
        assert_eq!(json["CompletedTables"], serde_json::json!({}));
        assert_eq!(
            json["LastWrittenBinlogPosition"],
            serde_json::json!({"Name": "", "Pos": 0})
        );
    }

    #[test]
    fn last_pk_tracks_updates_monotonically() {
        let tracker = StateTracker::new("1.0.0", 0);
        let t = table("s", "t");

        assert_eq!(tracker.last_pk(&t), 0);
        let mut observed = vec![];
        for pk in [5u64, 10, 11, 400] {
            tracker.update_last_pk(&t, pk);
            observed.push(tracker.last_pk(&t));
        }
        assert_eq!(observed, vec![5, 10, 11, 400]);
        assert!(observed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    #[should_panic(expected = "moved backwards")]
    fn non_monotonic_pk_is_a_programming_error() {
        let tracker = StateTracker::new("1.0.0", 0);
        let t = table("s", "t");
        tracker.update_last_pk(&t, 10);
        tracker.update_last_pk(&t, 9);
    }

    #[test]
    fn completion_absorbs_pk() {
        let tracker = StateTracker::new("1.0.0", 0);
        let t = table("s", "t");

        tracker.update_last_pk(&t, 10);
        tracker.mark_completed(&t);
        // Idempotent.
        tracker.mark_completed(&t);

        assert!(tracker.is_completed(&t));
        assert_eq!(tracker.last_pk(&t), u64::MAX);

        // The dump still shows the stored PK alongside the completion flag.
        let dump = tracker.serialize(&TableSchemaCache::default());
        let json = serde_json::to_value(&dump).unwrap();
        assert_eq!(json["LastSuccessfulPrimaryKeys"]["s.t"], 10);
        assert_eq!(json["CompletedTables"]["s.t"], true);
    }

    #[test]
    fn serialized_state_is_a_deep_copy() {
        let tracker = StateTracker::new("1.0.0", 0);
        let t = table("s", "t");
        tracker.update_last_pk(&t, 10);

        let dump = tracker.serialize(&TableSchemaCache::default());

        tracker.update_last_pk(&t, 99);
        tracker.mark_completed(&t);
        tracker.update_last_binlog_position(BinlogPosition::new("mysql-bin.000007", 4));

        assert_eq!(dump.last_successful_primary_keys[&t], 10);
        assert!(dump.completed_tables.is_empty());
        assert!(dump.last_written_binlog_position.is_zero());
    }

    #[test]
    fn binlog_position_only_advances() {
        let tracker = StateTracker::new("1.0.0", 0);
        tracker.update_last_binlog_position(BinlogPosition::new("bin.0001", 200));
        // A stale coordinate from a racing writer is discarded.
        tracker.update_last_binlog_position(BinlogPosition::new("bin.0001", 100));
        assert_eq!(
            tracker.last_binlog_position(),
            BinlogPosition::new("bin.0001", 200)
        );

        let dump = tracker.serialize(&TableSchemaCache::default());
        assert_eq!(
            dump.last_written_binlog_position,
            BinlogPosition::new("bin.0001", 200)
        );
    }

    #[test]
    fn concurrent_binlog_writers_settle_on_latest() {
        let tracker = Arc::new(StateTracker::new("1.0.0", 0));
        let mut handles = vec![];
        for pos in [100u64, 200] {
            let tracker = Arc::clone(&tracker);
            handles.push(std::thread::spawn(move || {
                tracker.update_last_binlog_position(BinlogPosition::new("bin.0001", pos));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            tracker.last_binlog_position(),
            BinlogPosition::new("bin.0001", 200)
        );
    }

    #[test]
    fn speed_log_disabled_and_single_entry_report_zero() {
        let tracker = StateTracker::new("1.0.0", 0);
        assert_eq!(tracker.estimated_pks_per_second(), 0.0);
        tracker.update_last_pk(&table("s", "t"), 10);
        assert_eq!(tracker.estimated_pks_per_second(), 0.0);

        let tracker = StateTracker::new("1.0.0", 3);
        assert_eq!(tracker.estimated_pks_per_second(), 0.0);
        tracker.update_last_pk(&table("s", "t"), 10);
        assert_eq!(tracker.estimated_pks_per_second(), 0.0);
    }

    #[test]
    fn speed_log_window_wraps_around() {
        let mut log = SpeedLog::new(3).unwrap();
        let t0 = Instant::now();
        // Four updates of 10 PKs each, one second apart. The window keeps
        // the last three cumulative positions: 20, 30, 40.
        for (delta, at) in [
            (10, t0),
            (10, t0 + Duration::from_secs(1)),
            (10, t0 + Duration::from_secs(2)),
            (10, t0 + Duration::from_secs(3)),
        ] {
            log.record(delta, at);
        }
        assert_eq!(log.rate(), (40.0 - 20.0) / (3.0 - 1.0));
    }

    #[test]
    fn speed_log_partial_window() {
        let mut log = SpeedLog::new(8).unwrap();
        let t0 = Instant::now();
        log.record(100, t0);
        log.record(300, t0 + Duration::from_secs(2));
        assert_eq!(log.rate(), 300.0 / 2.0);
    }

    #[test]
    fn state_round_trips_through_json() {
        let tracker = StateTracker::new("1.0.0", 0);
        tracker.update_last_pk(&table("s", "t2"), 500);
        tracker.mark_completed(&table("s", "t1"));
        tracker.update_last_binlog_position(BinlogPosition::new("mysql-bin.000003", 1234));

        let dump = tracker.serialize(&TableSchemaCache::default());
        let json = dump.to_json().unwrap();
        let back = SerializableState::from_json(&json).unwrap();
        assert_eq!(back, dump);
    }

    #[test]
    fn resume_restores_progress_and_ignores_unknown_fields() {
        let raw = serde_json::json!({
            "GhostferryVersion": "0.9.0",
            "LastKnownTableSchemaCache": {},
            "LastSuccessfulPrimaryKeys": {"s.t2": 500},
            "CompletedTables": {"s.t1": true},
            "LastWrittenBinlogPosition": {"Name": "mysql-bin.000002", "Pos": 77},
            "SomeFutureField": {"ignored": true},
        });
        let state: SerializableState = serde_json::from_value(raw).unwrap();
        assert_eq!(
            state.min_binlog_position(),
            &BinlogPosition::new("mysql-bin.000002", 77)
        );

        let tracker = StateTracker::from_serialized_state("1.0.0", 0, &state);
        assert_eq!(tracker.last_pk(&table("s", "t1")), u64::MAX);
        assert_eq!(tracker.last_pk(&table("s", "t2")), 500);
        assert_eq!(
            tracker.last_binlog_position(),
            BinlogPosition::new("mysql-bin.000002", 77)
        );
        // The resumed tracker reports the new tool version, not the dump's.
        let dump = tracker.serialize(&TableSchemaCache::default());
        assert_eq!(dump.ghostferry_version, "1.0.0");
    }

    #[test]
    fn missing_required_fields_are_fatal_on_load() {
        let raw = serde_json::json!({
            "GhostferryVersion": "0.9.0",
            "LastSuccessfulPrimaryKeys": {},
        });
        assert!(serde_json::from_value::<SerializableState>(raw).is_err());
    }
}
