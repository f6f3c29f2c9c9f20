//! Change events
//!
//! A [`ChangeEvent`] is one committed row change read from the change log,
//! stamped with the [`LogPosition`] it was committed at. Events are totally
//! ordered by position.

use crate::common::{HighWaterMark, LogPosition, PrimaryKey, Row, TableRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOp::Insert => write!(f, "INSERT"),
            ChangeOp::Update => write!(f, "UPDATE"),
            ChangeOp::Delete => write!(f, "DELETE"),
        }
    }
}

/// A committed row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table the change belongs to
    pub table: TableRef,
    /// Operation type
    pub op: ChangeOp,
    /// Row image: the new row for insert/update, the deleted row for delete
    pub row: Row,
    /// Commit position
    pub position: LogPosition,
    /// Commit timestamp (Unix epoch millis)
    pub timestamp: i64,
}

impl ChangeEvent {
    fn new(table: TableRef, op: ChangeOp, row: Row, position: LogPosition) -> Self {
        Self {
            table,
            op,
            row,
            position,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create an INSERT event
    pub fn insert(table: TableRef, row: Row, position: LogPosition) -> Self {
        Self::new(table, ChangeOp::Insert, row, position)
    }

    /// Create an UPDATE event
    pub fn update(table: TableRef, row: Row, position: LogPosition) -> Self {
        Self::new(table, ChangeOp::Update, row, position)
    }

    /// Create a DELETE event
    pub fn delete(table: TableRef, row: Row, position: LogPosition) -> Self {
        Self::new(table, ChangeOp::Delete, row, position)
    }

    /// Override the commit timestamp.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Transaction mark of this event.
    pub fn mark(&self) -> HighWaterMark {
        self.position.mark
    }

    /// Primary key of the changed row.
    pub fn key(&self) -> &PrimaryKey {
        &self.row.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors() {
        let table = TableRef::new("public", "many_inserts");
        let pos = LogPosition::new(HighWaterMark::new(12), 3);
        let row = Row::new(1u64, json!({"pk": 1, "f2": 1}));

        let insert = ChangeEvent::insert(table.clone(), row.clone(), pos);
        assert_eq!(insert.op, ChangeOp::Insert);
        assert_eq!(insert.mark(), HighWaterMark::new(12));
        assert_eq!(insert.key(), &PrimaryKey::from(1u64));
        assert!(insert.timestamp > 0);

        let delete = ChangeEvent::delete(table, row, pos).with_timestamp(5);
        assert_eq!(delete.op, ChangeOp::Delete);
        assert_eq!(delete.timestamp, 5);
    }

    #[test]
    fn test_op_display_and_serde() {
        assert_eq!(ChangeOp::Update.to_string(), "UPDATE");
        assert_eq!(
            serde_json::to_string(&ChangeOp::Delete).unwrap(),
            "\"delete\""
        );
    }
}
