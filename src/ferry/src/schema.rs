// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use ghostferry_mysql_util::MySqlTableDesc;

/// A reference to a MySQL table. (schema_name, table_name)
///
/// Keys maps as a canonical pair rather than a concatenated string so that
/// tables like `a.b_c` and `a_b.c` cannot collide; the textual
/// `schema.table` form exists only at the JSON boundary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(pub String, pub String);

impl TableName {
    pub fn new(schema_name: &str, table_name: &str) -> Self {
        Self(schema_name.to_string(), table_name.to_string())
    }

    pub fn schema_name(&self) -> &str {
        &self.0
    }

    pub fn table_name(&self) -> &str {
        &self.1
    }

    /// The `schema.table` form used as a map key in state dumps.
    pub fn dotted(&self) -> String {
        format!("{}.{}", self.0, self.1)
    }

    pub(crate) fn from_dotted(s: &str) -> Result<Self, String> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(format!("invalid table key '{}', expected 'schema.table'", s)),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`.`{}`", self.0, self.1)
    }
}

impl From<&MySqlTableDesc> for TableName {
    fn from(desc: &MySqlTableDesc) -> Self {
        Self::new(&desc.schema_name, &desc.name)
    }
}

/// Remaps the identity of copied rows and binlog events onto the target.
/// Column values pass through untouched; only schema and table names are
/// rewritten.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRewrites {
    /// Source schema name -> target schema name.
    pub databases: BTreeMap<String, String>,
    /// Source table name -> target table name.
    pub tables: BTreeMap<String, String>,
}

impl TableRewrites {
    pub fn rewrite(&self, table: &TableName) -> TableName {
        let schema = self
            .databases
            .get(table.schema_name())
            .map(String::as_str)
            .unwrap_or(table.schema_name());
        let name = self
            .tables
            .get(table.table_name())
            .map(String::as_str)
            .unwrap_or(table.table_name());
        TableName::new(schema, name)
    }
}

/// Snapshot of the table metadata for all in-scope tables.
///
/// Loaded once at ferry startup (or restored from a resume state) and
/// immutable afterwards, so every component decodes rows against the same
/// schema for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSchemaCache {
    tables: BTreeMap<TableName, MySqlTableDesc>,
}

impl TableSchemaCache {
    pub fn from_descs(descs: Vec<MySqlTableDesc>) -> Self {
        let tables = descs
            .into_iter()
            .map(|desc| (TableName::from(&desc), desc))
            .collect();
        Self { tables }
    }

    pub fn get(&self, table: &TableName) -> Option<&MySqlTableDesc> {
        self.tables.get(table)
    }

    pub fn contains(&self, table: &TableName) -> bool {
        self.tables.contains_key(table)
    }

    /// Tables in deterministic (schema, name) order.
    pub fn table_names(&self) -> impl Iterator<Item = &TableName> {
        self.tables.keys()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl Serialize for TableSchemaCache {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(self.tables.iter().map(|(k, v)| (k.dotted(), v)))
    }
}

impl<'de> Deserialize<'de> for TableSchemaCache {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<String, MySqlTableDesc> = BTreeMap::deserialize(deserializer)?;
        let mut tables = BTreeMap::new();
        for (key, desc) in raw {
            let table = TableName::from_dotted(&key).map_err(D::Error::custom)?;
            tables.insert(table, desc);
        }
        Ok(Self { tables })
    }
}

/// Serde adapters for maps keyed by [`TableName`], rendering keys in the
/// `schema.table` form required by the state dump format.
pub(crate) mod dotted_pk_map {
    use std::collections::BTreeMap;

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TableName;

    pub fn serialize<S>(map: &BTreeMap<TableName, u64>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(map.iter().map(|(k, v)| (k.dotted(), v)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<TableName, u64>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<String, u64> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| Ok((TableName::from_dotted(&k).map_err(D::Error::custom)?, v)))
            .collect()
    }
}

/// Serde adapter for the completion set, rendered as a `schema.table` ->
/// bool object. Only `true` entries join the set on load.
pub(crate) mod dotted_table_set {
    use std::collections::{BTreeMap, BTreeSet};

    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TableName;

    pub fn serialize<S>(set: &BTreeSet<TableName>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_map(set.iter().map(|k| (k.dotted(), true)))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeSet<TableName>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: BTreeMap<String, bool> = BTreeMap::deserialize(deserializer)?;
        let mut set = BTreeSet::new();
        for (key, completed) in raw {
            if completed {
                set.insert(TableName::from_dotted(&key).map_err(D::Error::custom)?);
            }
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use ghostferry_mysql_util::MySqlColumnDesc;

    use super::*;

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
    fn dotted_round_trip() {
        let table = TableName::new("shop", "orders");
        assert_eq!(table.dotted(), "shop.orders");
        assert_eq!(TableName::from_dotted("shop.orders").unwrap(), table);
        assert!(TableName::from_dotted("no_dot").is_err());
        assert!(TableName::from_dotted(".orders").is_err());
    }

    #[test]
    fn display_quotes_identifiers() {
        assert_eq!(
            TableName::new("shop", "orders").to_string(),
            "`shop`.`orders`"
        );
    }

    #[test]
    fn canonical_keys_do_not_collide() {
        // Concatenation would conflate these two.
        let a = TableName::new("a", "b_c");
        let b = TableName::new("a_b", "c");
        assert_ne!(a, b);
        let mut map = BTreeMap::new();
        map.insert(a, 1);
        map.insert(b, 2);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn rewrites_remap_identity_only() {
        let mut rewrites = TableRewrites::default();
        rewrites
            .databases
            .insert("shop".to_string(), "shop_new".to_string());
        rewrites
            .tables
            .insert("orders".to_string(), "orders_v2".to_string());

        let rewritten = rewrites.rewrite(&TableName::new("shop", "orders"));
        assert_eq!(rewritten, TableName::new("shop_new", "orders_v2"));

        // Unmapped identities pass through.
        let untouched = rewrites.rewrite(&TableName::new("other", "things"));
        assert_eq!(untouched, TableName::new("other", "things"));
    }

    #[test]
    fn schema_cache_serde_uses_dotted_keys() {
        let cache = TableSchemaCache::from_descs(vec![desc("shop", "orders"), desc("shop", "users")]);
        let json = serde_json::to_value(&cache).unwrap();
        assert!(json.get("shop.orders").is_some());
        assert!(json.get("shop.users").is_some());
        let back: TableSchemaCache = serde_json::from_value(json).unwrap();
        assert_eq!(back, cache);
    }
}
