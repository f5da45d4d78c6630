// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A position in the source's binary log: `(file name, byte offset)`.
///
/// Positions are totally ordered lexicographically by file name and then
/// numerically by offset, which matches how the server names consecutive
/// binlog files (`mysql-bin.000001`, `mysql-bin.000002`, ...). The derived
/// `Ord` relies on the field order below.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct BinlogPosition {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Pos")]
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(name: impl Into<String>, pos: u64) -> Self {
        Self {
            name: name.into(),
            pos,
        }
    }

    /// The zero-valued coordinate of a tracker that has not yet observed a
    /// binlog event.
    pub fn is_zero(&self) -> bool {
        self.name.is_empty() && self.pos == 0
    }
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_by_file_then_offset() {
        let a = BinlogPosition::new("mysql-bin.000001", 2000);
        let b = BinlogPosition::new("mysql-bin.000002", 4);
        let c = BinlogPosition::new("mysql-bin.000002", 190);
        assert!(a < b);
        assert!(b < c);
        assert!(a < c);
        assert_eq!(c, BinlogPosition::new("mysql-bin.000002", 190));
    }

    #[test]
    fn serializes_name_and_pos() {
        let pos = BinlogPosition::new("mysql-bin.000042", 1337);
        let json = serde_json::to_value(&pos).unwrap();
        assert_eq!(json, serde_json::json!({"Name": "mysql-bin.000042", "Pos": 1337}));
        let back: BinlogPosition = serde_json::from_value(json).unwrap();
        assert_eq!(back, pos);
    }

    #[test]
    fn default_is_zero() {
        let pos = BinlogPosition::default();
        assert!(pos.is_zero());
        assert!(pos < BinlogPosition::new("mysql-bin.000001", 4));
    }
}
