//! Rows, keys and table schemas
//!
//! Row payloads are JSON objects, the representation every source adapter
//! converts into. Identity is the [`PrimaryKey`]; equality is full payload
//! equality.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    /// Schema name (PostgreSQL) or database name (MySQL)
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `schema.table`.
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(Self::new(schema, table))
            }
            _ => Err(CdcError::config(format!(
                "table reference '{}' must be schema.table",
                qualified
            ))),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Canonical encoding of a row's key column values.
///
/// Single scalar keys encode as their plain text (`42`, `abc`); composite
/// keys encode as a JSON array so that `("a|b")` and `("a", "b")` differ.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrimaryKey(String);

impl PrimaryKey {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode key column values.
    pub fn from_values<'a>(values: impl IntoIterator<Item = &'a serde_json::Value>) -> Self {
        let values: Vec<&serde_json::Value> = values.into_iter().collect();
        match values.as_slice() {
            [serde_json::Value::String(s)] => Self(s.clone()),
            [single] => Self(single.to_string()),
            many => Self(
                serde_json::Value::Array(many.iter().map(|v| (*v).clone()).collect()).to_string(),
            ),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u64> for PrimaryKey {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for PrimaryKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Source type name as reported by the catalog (e.g. `bigint`)
    pub data_type: String,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable,
        }
    }
}

/// Table structure as seen by a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Columns in ordinal order
    pub columns: Vec<ColumnDef>,
    /// Primary key columns in key order
    pub key_columns: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>, key_columns: Vec<String>) -> Self {
        Self {
            columns,
            key_columns,
        }
    }

    /// Validate that key columns exist.
    pub fn validate(&self) -> Result<()> {
        if self.key_columns.is_empty() {
            return Err(CdcError::schema("table has no primary key"));
        }
        for key in &self.key_columns {
            if !self.columns.iter().any(|c| &c.name == key) {
                return Err(CdcError::schema(format!(
                    "key column '{}' is not a table column",
                    key
                )));
            }
        }
        Ok(())
    }

    /// Stable textual fingerprint, persisted in checkpoints.
    pub fn fingerprint(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                format!(
                    "{}:{}:{}",
                    c.name,
                    c.data_type.to_ascii_lowercase(),
                    if c.nullable { "null" } else { "not_null" }
                )
            })
            .collect();
        format!("{}|pk:{}", columns.join(","), self.key_columns.join(","))
    }

    /// Describe how `current` differs from `self`. Empty when equivalent.
    pub fn diff(&self, current: &TableSchema) -> Vec<String> {
        let mut changes = Vec::new();
        for old in &self.columns {
            match current.columns.iter().find(|c| c.name == old.name) {
                None => changes.push(format!("column {} dropped", old.name)),
                Some(new) if !new.data_type.eq_ignore_ascii_case(&old.data_type) => {
                    changes.push(format!(
                        "column {} type changed from {} to {}",
                        old.name, old.data_type, new.data_type
                    ))
                }
                Some(new) if new.nullable != old.nullable => changes.push(format!(
                    "column {} nullability changed to {}",
                    old.name,
                    if new.nullable { "NULL" } else { "NOT NULL" }
                )),
                Some(_) => {}
            }
        }
        for new in &current.columns {
            if !self.columns.iter().any(|c| c.name == new.name) {
                changes.push(format!("column {} added", new.name));
            }
        }
        if self.key_columns != current.key_columns {
            changes.push(format!(
                "primary key changed from ({}) to ({})",
                self.key_columns.join(", "),
                current.key_columns.join(", ")
            ));
        }
        changes
    }

    /// Extract the primary key from a row payload.
    pub fn key_of(&self, values: &serde_json::Value) -> Result<PrimaryKey> {
        let mut key_values = Vec::with_capacity(self.key_columns.len());
        for column in &self.key_columns {
            match values.get(column) {
                Some(v) if !v.is_null() => key_values.push(v),
                _ => {
                    return Err(CdcError::schema(format!(
                        "row is missing key column '{}'",
                        column
                    )))
                }
            }
        }
        Ok(PrimaryKey::from_values(key_values))
    }
}

/// A primary-key-identified row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub key: PrimaryKey,
    /// Column values as a JSON object
    pub values: serde_json::Value,
}

impl Row {
    pub fn new(key: impl Into<PrimaryKey>, values: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            values,
        }
    }

    /// Build a row, deriving its key from the schema.
    pub fn from_values(schema: &TableSchema, values: serde_json::Value) -> Result<Self> {
        let key = schema.key_of(&values)?;
        Ok(Self { key, values })
    }

    /// Get a column value.
    pub fn get(&self, column: &str) -> Option<&serde_json::Value> {
        self.values.get(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn many_inserts_schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnDef::new("pk", "bigint unsigned", false),
                ColumnDef::new("f2", "bigint", true),
            ],
            vec!["pk".to_string()],
        )
    }

    #[test]
    fn test_table_ref_parse() {
        let t = TableRef::parse("public.many_inserts").unwrap();
        assert_eq!(t, TableRef::new("public", "many_inserts"));
        assert_eq!(t.to_string(), "public.many_inserts");
        assert!(TableRef::parse("many_inserts").is_err());
        assert!(TableRef::parse(".t").is_err());
    }

    #[test]
    fn test_primary_key_encoding() {
        assert_eq!(PrimaryKey::from_values([&json!(42)]).as_str(), "42");
        assert_eq!(PrimaryKey::from_values([&json!("abc")]).as_str(), "abc");
        assert_eq!(
            PrimaryKey::from_values([&json!("a"), &json!(1)]).as_str(),
            r#"["a",1]"#
        );
        assert_ne!(
            PrimaryKey::from_values([&json!("a|b")]),
            PrimaryKey::from_values([&json!("a"), &json!("b")])
        );
        assert_eq!(PrimaryKey::from(7u64), PrimaryKey::from_values([&json!(7)]));
    }

    #[test]
    fn test_key_of() {
        let schema = many_inserts_schema();
        let row = Row::from_values(&schema, json!({"pk": 5, "f2": 10})).unwrap();
        assert_eq!(row.key, PrimaryKey::from(5u64));
        assert_eq!(row.get("f2"), Some(&json!(10)));

        assert!(schema.key_of(&json!({"f2": 1})).is_err());
        assert!(schema.key_of(&json!({"pk": null})).is_err());
    }

    #[test]
    fn test_schema_validate() {
        assert!(many_inserts_schema().validate().is_ok());
        let keyless = TableSchema::new(vec![ColumnDef::new("a", "int", true)], vec![]);
        assert!(keyless.validate().is_err());
        let bad_key = TableSchema::new(
            vec![ColumnDef::new("a", "int", true)],
            vec!["b".to_string()],
        );
        assert!(bad_key.validate().is_err());
    }

    #[test]
    fn test_fingerprint_and_diff() {
        let before = many_inserts_schema();
        assert!(before.diff(&before.clone()).is_empty());

        let mut after = before.clone();
        after.columns.retain(|c| c.name != "f2");
        after.columns.push(ColumnDef::new("f3", "text", true));

        assert_ne!(before.fingerprint(), after.fingerprint());
        let changes = before.diff(&after);
        assert_eq!(changes, vec!["column f2 dropped", "column f3 added"]);

        let mut retyped = before.clone();
        retyped.columns[1].data_type = "varchar(10)".to_string();
        assert_eq!(
            before.diff(&retyped),
            vec!["column f2 type changed from bigint to varchar(10)"]
        );
    }

    #[test]
    fn test_row_equality_is_full_payload() {
        let a = Row::new(1u64, json!({"pk": 1, "f2": 1}));
        let b = Row::new(1u64, json!({"pk": 1, "f2": 2}));
        assert_eq!(a.key, b.key);
        assert_ne!(a, b);
    }
}
