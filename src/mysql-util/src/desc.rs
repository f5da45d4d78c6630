// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use mysql_async::prelude::Queryable;
use serde::{Deserialize, Serialize};

use crate::MySqlError;

/// Data types MySQL will report for a column usable as a ghostferry
/// pagination key. All of them fit in a `u64` for the key ranges we page
/// over; signed keys are accepted but must not contain negative values.
const INTEGER_TYPES: &[&str] = &["tinyint", "smallint", "mediumint", "int", "bigint"];

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MySqlTableDesc {
    /// In MySQL the schema and database of a table are synonymous.
    pub schema_name: String,
    /// The name of the table.
    pub name: String,
    /// Columns for the table
    ///
    /// The index of each column is based on its `ordinal_position`
    /// reported by the information_schema.columns table, which defines
    /// the order of column values when received in a row.
    pub columns: Vec<MySqlColumnDesc>,
    /// Index into `columns` of the primary key column.
    pub pk_column: usize,
}

impl MySqlTableDesc {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.name)
    }

    pub fn pk_column_name(&self) -> &str {
        &self.columns[self.pk_column].name
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MySqlColumnDesc {
    /// The name of the column.
    pub name: String,
    /// The MySQL datatype of the column, as reported by
    /// information_schema.columns.DATA_TYPE.
    pub column_type: String,
    pub nullable: bool,
}

/// Fetch the descriptions of the requested `(schema, table)` pairs from
/// information_schema. Fails if any table is missing or has a primary key
/// that is not a single integer column.
pub async fn schema_info<Q>(
    conn: &mut Q,
    tables: &[(String, String)],
) -> Result<Vec<MySqlTableDesc>, MySqlError>
where
    Q: Queryable,
{
    let mut descs = Vec::with_capacity(tables.len());
    for (schema_name, table_name) in tables {
        let columns: Vec<(String, String, String, String)> = conn
            .exec(
                "SELECT column_name, data_type, is_nullable, column_key
                 FROM information_schema.columns
                 WHERE table_schema = ? AND table_name = ?
                 ORDER BY ordinal_position ASC",
                (schema_name.as_str(), table_name.as_str()),
            )
            .await?;

        if columns.is_empty() {
            return Err(MySqlError::MissingTable {
                qualified_table_name: format!("{}.{}", schema_name, table_name),
            });
        }

        let mut column_descs = Vec::with_capacity(columns.len());
        let mut pk_columns = vec![];
        for (index, (name, data_type, is_nullable, column_key)) in columns.into_iter().enumerate() {
            if column_key == "PRI" {
                pk_columns.push((index, data_type.clone()));
            }
            column_descs.push(MySqlColumnDesc {
                name,
                column_type: data_type,
                nullable: is_nullable == "YES",
            });
        }

        let desc = MySqlTableDesc {
            schema_name: schema_name.clone(),
            name: table_name.clone(),
            columns: column_descs,
            pk_column: validate_pk(schema_name, table_name, &pk_columns)?,
        };
        descs.push(desc);
    }
    Ok(descs)
}

fn validate_pk(
    schema_name: &str,
    table_name: &str,
    pk_columns: &[(usize, String)],
) -> Result<usize, MySqlError> {
    let qualified_table_name = format!("{}.{}", schema_name, table_name);
    match pk_columns {
        [] => Err(MySqlError::UnsupportedPrimaryKey {
            qualified_table_name,
            reason: "no primary key".to_string(),
        }),
        [(index, data_type)] => {
            if INTEGER_TYPES.contains(&data_type.as_str()) {
                Ok(*index)
            } else {
                Err(MySqlError::UnsupportedPrimaryKey {
                    qualified_table_name,
                    reason: format!("non-integer primary key of type '{}'", data_type),
                })
            }
        }
        _ => Err(MySqlError::UnsupportedPrimaryKey {
            qualified_table_name,
            reason: format!("composite primary key of {} columns", pk_columns.len()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(cols: &[(usize, &str)]) -> Vec<(usize, String)> {
        cols.iter().map(|(i, t)| (*i, t.to_string())).collect()
    }

    #[test]
    fn validate_pk_accepts_single_integer_column() {
        assert_eq!(validate_pk("db", "t", &pk(&[(2, "bigint")])).unwrap(), 2);
        assert_eq!(validate_pk("db", "t", &pk(&[(0, "int")])).unwrap(), 0);
    }

    #[test]
    fn validate_pk_rejects_missing_composite_and_non_integer() {
        assert!(matches!(
            validate_pk("db", "t", &pk(&[])),
            Err(MySqlError::UnsupportedPrimaryKey { .. })
        ));
        assert!(matches!(
            validate_pk("db", "t", &pk(&[(0, "int"), (1, "int")])),
            Err(MySqlError::UnsupportedPrimaryKey { .. })
        ));
        assert!(matches!(
            validate_pk("db", "t", &pk(&[(0, "varchar")])),
            Err(MySqlError::UnsupportedPrimaryKey { .. })
        ));
    }

    #[test]
    fn table_desc_serde_shape() {
        let desc = MySqlTableDesc {
            schema_name: "shop".to_string(),
            name: "orders".to_string(),
            columns: vec![
                MySqlColumnDesc {
                    name: "id".to_string(),
                    column_type: "bigint".to_string(),
                    nullable: false,
                },
                MySqlColumnDesc {
                    name: "note".to_string(),
                    column_type: "varchar".to_string(),
                    nullable: true,
                },
            ],
            pk_column: 0,
        };
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["SchemaName"], "shop");
        assert_eq!(json["Columns"][0]["Name"], "id");
        assert_eq!(json["Columns"][1]["Nullable"], true);
        assert_eq!(json["PkColumn"], 0);
        let back: MySqlTableDesc = serde_json::from_value(json).unwrap();
        assert_eq!(back, desc);
    }
}
