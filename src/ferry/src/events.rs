// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Decoded binlog row changes, and the DDL sniffing applied to query
//! events.
//!
//! Since the source is required to run row-based replication, QueryEvents
//! only appear for transaction control (`BEGIN`) and for DDL. Any DDL that
//! touches an in-scope table invalidates the schema snapshot the run was
//! started with and must halt the ferry, so the streamer parses query
//! events just far enough to find the tables they touch.

use mysql_async::Value;
use mysql_common::binlog::events::{RowsEventData, TableMapEvent};

use crate::error::TransientError;
use crate::position::BinlogPosition;
use crate::schema::TableName;

/// A single row change from the replication stream. Row images are in table
/// column order, values bit-exact as they appeared on the source.
#[derive(Debug, Clone)]
pub enum RowChange {
    Insert { after: Vec<Value> },
    Update { before: Vec<Value>, after: Vec<Value> },
    Delete { before: Vec<Value> },
}

#[derive(Debug, Clone)]
pub struct DmlEvent {
    /// Source identity, used to look up the table schema.
    pub table: TableName,
    /// Rewritten identity the change is applied under on the target.
    pub target_table: TableName,
    pub change: RowChange,
}

/// One committed source transaction's worth of in-scope changes. `events`
/// is empty for transactions that only touched filtered tables; those still
/// advance the coordinate.
#[derive(Debug)]
pub struct BinlogTx {
    pub events: Vec<DmlEvent>,
    pub end_position: BinlogPosition,
}

enum RowsKind {
    Insert,
    Update,
    Delete,
}

/// Decodes the row images of one RowsEvent into [`DmlEvent`]s. Each row of
/// an event is a pair of `before_row`, `after_row`, to accommodate updates
/// and deletes (which include a before image) and updates and inserts
/// (which include an after image).
pub(crate) fn decode_rows_event(
    data: &RowsEventData<'_>,
    table_map_event: &TableMapEvent<'_>,
    table: &TableName,
    target_table: &TableName,
) -> Result<Vec<DmlEvent>, TransientError> {
    let kind = match data {
        RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => RowsKind::Insert,
        RowsEventData::UpdateRowsEvent(_)
        | RowsEventData::UpdateRowsEventV1(_)
        | RowsEventData::PartialUpdateRowsEvent(_) => RowsKind::Update,
        RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
            RowsKind::Delete
        }
    };

    let mut events = vec![];
    for row in data.rows(table_map_event) {
        let (before, after) = row?;
        let before = before
            .map(|r| mysql_async::Row::try_from(r).map(|r| r.unwrap()))
            .transpose()?;
        let after = after
            .map(|r| mysql_async::Row::try_from(r).map(|r| r.unwrap()))
            .transpose()?;

        let change = match kind {
            RowsKind::Insert => RowChange::Insert {
                after: after.ok_or_else(|| missing_image(table, "after"))?,
            },
            RowsKind::Update => RowChange::Update {
                before: before.ok_or_else(|| missing_image(table, "before"))?,
                after: after.ok_or_else(|| missing_image(table, "after"))?,
            },
            RowsKind::Delete => RowChange::Delete {
                before: before.ok_or_else(|| missing_image(table, "before"))?,
            },
        };
        events.push(DmlEvent {
            table: table.clone(),
            target_table: target_table.clone(),
            change,
        });
    }
    Ok(events)
}

fn missing_image(table: &TableName, which: &str) -> TransientError {
    TransientError::Generic(anyhow::anyhow!(
        "rows event for {} is missing its {} image; is binlog_row_image=FULL?",
        table,
        which
    ))
}

/// Returns the table referenced in a SQL statement, qualifying it with the
/// current schema if the name is unqualified.
fn table_ident(name: &str, current_schema: &str) -> Option<TableName> {
    let stripped = name.replace('`', "");
    let stripped = stripped.trim_end_matches(|c| c == ';' || c == ',');
    let mut name_iter = stripped.split('.');
    match (name_iter.next(), name_iter.next(), name_iter.next()) {
        (Some(t_name), None, _) if !t_name.is_empty() => {
            Some(TableName::new(current_schema, t_name))
        }
        (Some(schema_name), Some(t_name), None) if !t_name.is_empty() => {
            Some(TableName::new(schema_name, t_name))
        }
        _ => None,
    }
}

/// Extracts the tables a DDL statement touches. Returns an empty list for
/// statements that are not schema changes (including `BEGIN`). MySQL does
/// not permit transactional DDL, so there is no need to track statement
/// position within a transaction here.
pub(crate) fn ddl_targets(query: &str, current_schema: &str) -> Vec<TableName> {
    let mut tokens = query.split_ascii_whitespace();
    let (first, second) = match (tokens.next(), tokens.next()) {
        (Some(first), Some(second)) => (first, second),
        _ => return vec![],
    };

    // Detect `ALTER TABLE <tbl>` statements
    if first.eq_ignore_ascii_case("alter") && second.eq_ignore_ascii_case("table") {
        return tokens
            .next()
            .and_then(|t| table_ident(t, current_schema))
            .into_iter()
            .collect();
    }

    // Detect `RENAME TABLE <a> TO <b>[, <c> TO <d>]` statements. Both sides
    // matter: renaming an in-scope table away and renaming another table
    // onto an in-scope name are equally fatal.
    if first.eq_ignore_ascii_case("rename") && second.eq_ignore_ascii_case("table") {
        return tokens
            .filter(|t| !t.eq_ignore_ascii_case("to"))
            .filter_map(|t| table_ident(t, current_schema))
            .collect();
    }

    // Detect `DROP TABLE [IF EXISTS] <tbl>[, <tbl>]` statements
    if first.eq_ignore_ascii_case("drop") && second.eq_ignore_ascii_case("table") {
        return tokens
            .filter(|t| {
                !t.eq_ignore_ascii_case("if")
                    && !t.eq_ignore_ascii_case("exists")
                    && !t.eq_ignore_ascii_case("cascade")
                    && !t.eq_ignore_ascii_case("restrict")
            })
            .filter_map(|t| table_ident(t, current_schema))
            .collect();
    }

    // Detect `TRUNCATE [TABLE] <tbl>` statements
    if first.eq_ignore_ascii_case("truncate") {
        let target = if second.eq_ignore_ascii_case("table") {
            tokens.next()
        } else {
            Some(second)
        };
        return target
            .and_then(|t| table_ident(t, current_schema))
            .into_iter()
            .collect();
    }

    vec![]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(schema: &str, table: &str) -> TableName {
        TableName::new(schema, table)
    }

    #[test]
    fn alter_table_with_and_without_schema() {
        assert_eq!(
            ddl_targets("ALTER TABLE orders ADD COLUMN x INT", "shop"),
            vec![t("shop", "orders")]
        );
        assert_eq!(
            ddl_targets("alter table `shop`.`orders` drop column x", "other"),
            vec![t("shop", "orders")]
        );
    }

    #[test]
    fn rename_table_reports_both_sides() {
        assert_eq!(
            ddl_targets("RENAME TABLE orders TO orders_old, pending TO orders", "shop"),
            vec![
                t("shop", "orders"),
                t("shop", "orders_old"),
                t("shop", "pending"),
                t("shop", "orders"),
            ]
        );
    }

    #[test]
    fn drop_table_handles_if_exists_and_lists() {
        assert_eq!(
            ddl_targets("DROP TABLE IF EXISTS a, shop.b", "db"),
            vec![t("db", "a"), t("shop", "b")]
        );
    }

    #[test]
    fn truncate_with_optional_table_keyword() {
        assert_eq!(
            ddl_targets("TRUNCATE orders", "shop"),
            vec![t("shop", "orders")]
        );
        assert_eq!(
            ddl_targets("TRUNCATE TABLE shop.orders", "other"),
            vec![t("shop", "orders")]
        );
    }

    #[test]
    fn non_ddl_statements_have_no_targets() {
        assert!(ddl_targets("BEGIN", "shop").is_empty());
        assert!(ddl_targets("COMMIT", "shop").is_empty());
        assert!(ddl_targets("FLUSH LOGS", "shop").is_empty());
        assert!(ddl_targets("", "shop").is_empty());
    }
}
