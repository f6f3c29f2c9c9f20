//! Change log positions
//!
//! A [`HighWaterMark`] identifies a committed transaction in the source's
//! change log (GTID sequence number, LSN). A [`LogPosition`] refines it with
//! the sequence of a row change inside that transaction, which gives every
//! [`ChangeEvent`](crate::common::ChangeEvent) a total order.

use crate::common::{CdcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Totally ordered token identifying a transaction in the change log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct HighWaterMark(u64);

impl HighWaterMark {
    /// Position before the first transaction.
    pub const ZERO: HighWaterMark = HighWaterMark(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The mark of the transaction committed right after this one.
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for HighWaterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for HighWaterMark {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Self)
            .map_err(|e| CdcError::config(format!("invalid high-water mark '{}': {}", s, e)))
    }
}

impl From<u64> for HighWaterMark {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Position of a single row change: transaction mark, then sequence.
///
/// Field order matters: the derived ordering compares `mark` first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct LogPosition {
    /// Transaction mark
    pub mark: HighWaterMark,
    /// Sequence of the change within the transaction (0-indexed)
    pub sequence: u32,
}

impl LogPosition {
    pub const fn new(mark: HighWaterMark, sequence: u32) -> Self {
        Self { mark, sequence }
    }

    /// First change of the transaction at `mark`.
    pub const fn start_of(mark: HighWaterMark) -> Self {
        Self { mark, sequence: 0 }
    }

    /// Covers every change of the transaction at `mark`.
    ///
    /// Snapshots are positioned here: the transaction that produced the
    /// snapshot mark is fully visible to the snapshot.
    pub const fn end_of(mark: HighWaterMark) -> Self {
        Self {
            mark,
            sequence: u32::MAX,
        }
    }

    /// Whether this position covers the whole transaction at its mark.
    pub const fn is_transaction_end(&self) -> bool {
        self.sequence == u32::MAX
    }

    /// First mark that still has unseen changes after this position.
    pub const fn next_needed_mark(&self) -> HighWaterMark {
        if self.is_transaction_end() {
            self.mark.next()
        } else {
            self.mark
        }
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_transaction_end() {
            write!(f, "{}.end", self.mark)
        } else {
            write!(f, "{}.{}", self.mark, self.sequence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_ordering_and_next() {
        let a = HighWaterMark::new(7);
        assert!(a < a.next());
        assert_eq!(a.next().value(), 8);
        assert_eq!(HighWaterMark::new(u64::MAX).next().value(), u64::MAX);
    }

    #[test]
    fn test_mark_parse() {
        assert_eq!(
            " 42 ".parse::<HighWaterMark>().unwrap(),
            HighWaterMark::new(42)
        );
        assert!("0/16B6C50".parse::<HighWaterMark>().is_err());
    }

    #[test]
    fn test_position_order_is_mark_then_sequence() {
        let m = HighWaterMark::new(5);
        assert!(LogPosition::new(m, 3) < LogPosition::new(m, 4));
        assert!(LogPosition::end_of(m) < LogPosition::start_of(m.next()));
        assert!(LogPosition::new(m, 1000) < LogPosition::end_of(m));
    }

    #[test]
    fn test_next_needed_mark() {
        let m = HighWaterMark::new(9);
        assert_eq!(LogPosition::end_of(m).next_needed_mark(), m.next());
        assert_eq!(LogPosition::new(m, 2).next_needed_mark(), m);
    }

    #[test]
    fn test_position_display() {
        let m = HighWaterMark::new(3);
        assert_eq!(LogPosition::new(m, 2).to_string(), "3.2");
        assert_eq!(LogPosition::end_of(m).to_string(), "3.end");
    }
}
