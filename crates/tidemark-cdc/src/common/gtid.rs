//! GTID set parsing
//!
//! MySQL reports `@@gtid_executed` and `@@gtid_purged` as GTID sets:
//!
//! ```text
//! 3E11FA47-71CA-11E1-9E33-C80AA9429562:1-5:7,
//! 4F22AB58-82DB-22F2-0F44-D91BB0530673:1-3
//! ```
//!
//! A set maps to a [`HighWaterMark`] only when its history is a single
//! server's contiguous interval `1-N`; anything else has no total order
//! and cannot anchor a snapshot.

use crate::common::{CdcError, HighWaterMark, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Parsed GTID set: source UUID to sorted, merged `[start, end]` intervals.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GtidSet {
    intervals: BTreeMap<String, Vec<(u64, u64)>>,
}

impl GtidSet {
    /// Parse a GTID set string. Whitespace and newlines are ignored.
    pub fn parse(s: &str) -> Result<Self> {
        let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let mut set = GtidSet::default();
        if compact.is_empty() {
            return Ok(set);
        }

        for member in compact.split(',') {
            let mut parts = member.split(':');
            let uuid = parts
                .next()
                .filter(|u| !u.is_empty())
                .ok_or_else(|| CdcError::replication(format!("invalid GTID set '{}'", s)))?
                .to_ascii_lowercase();

            let ranges = set.intervals.entry(uuid).or_default();
            let mut saw_range = false;
            for range in parts {
                saw_range = true;
                let (start, end) = match range.split_once('-') {
                    Some((a, b)) => (parse_gno(a, s)?, parse_gno(b, s)?),
                    None => {
                        let n = parse_gno(range, s)?;
                        (n, n)
                    }
                };
                if start == 0 || end < start {
                    return Err(CdcError::replication(format!(
                        "invalid GTID interval '{}' in '{}'",
                        range, s
                    )));
                }
                ranges.push((start, end));
            }
            if !saw_range {
                return Err(CdcError::replication(format!(
                    "GTID set member '{}' has no intervals",
                    member
                )));
            }
        }

        for ranges in set.intervals.values_mut() {
            ranges.sort_unstable();
            let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
            for &(start, end) in ranges.iter() {
                match merged.last_mut() {
                    Some(last) if start <= last.1.saturating_add(1) => last.1 = last.1.max(end),
                    _ => merged.push((start, end)),
                }
            }
            *ranges = merged;
        }

        Ok(set)
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Number of source servers contributing to the set.
    pub fn source_count(&self) -> usize {
        self.intervals.len()
    }

    /// Whether `uuid:gno` is contained in the set.
    pub fn contains(&self, uuid: &str, gno: u64) -> bool {
        self.intervals
            .get(&uuid.to_ascii_lowercase())
            .map(|ranges| ranges.iter().any(|&(a, b)| a <= gno && gno <= b))
            .unwrap_or(false)
    }

    /// Convert to a totally ordered mark.
    ///
    /// Fails with `IsolationViolation` when the set spans several servers or
    /// has holes, because no single position then describes it.
    pub fn to_mark(&self) -> Result<HighWaterMark> {
        if self.intervals.is_empty() {
            return Ok(HighWaterMark::ZERO);
        }
        if self.intervals.len() > 1 {
            return Err(CdcError::isolation_violation(format!(
                "GTID set {} spans {} source servers; no total order over its history",
                self,
                self.intervals.len()
            )));
        }
        let ranges = self.intervals.values().next().map(Vec::as_slice).unwrap_or(&[]);
        match ranges {
            [(1, end)] => Ok(HighWaterMark::new(*end)),
            _ => Err(CdcError::isolation_violation(format!(
                "GTID set {} is not a contiguous history starting at 1",
                self
            ))),
        }
    }
}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (uuid, ranges) in &self.intervals {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}", uuid)?;
            for (start, end) in ranges {
                if start == end {
                    write!(f, ":{}", start)?;
                } else {
                    write!(f, ":{}-{}", start, end)?;
                }
            }
        }
        Ok(())
    }
}

fn parse_gno(value: &str, whole: &str) -> Result<u64> {
    value.parse::<u64>().map_err(|_| {
        CdcError::replication(format!(
            "invalid transaction number '{}' in GTID set '{}'",
            value, whole
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "3E11FA47-71CA-11E1-9E33-C80AA9429562";
    const UUID_B: &str = "4F22AB58-82DB-22F2-0F44-D91BB0530673";

    #[test]
    fn test_parse_single_interval() {
        let set = GtidSet::parse(&format!("{}:1-1100001", UUID_A)).unwrap();
        assert_eq!(set.source_count(), 1);
        assert_eq!(set.to_mark().unwrap(), HighWaterMark::new(1_100_001));
        assert!(set.contains(UUID_A, 500));
        assert!(!set.contains(UUID_A, 1_100_002));
    }

    #[test]
    fn test_empty_set_is_zero_mark() {
        let set = GtidSet::parse("  ").unwrap();
        assert!(set.is_empty());
        assert_eq!(set.to_mark().unwrap(), HighWaterMark::ZERO);
    }

    #[test]
    fn test_adjacent_intervals_merge() {
        let set = GtidSet::parse(&format!("{}:1-5:6-9:10", UUID_A)).unwrap();
        assert_eq!(set.to_mark().unwrap(), HighWaterMark::new(10));
        assert_eq!(set.to_string(), format!("{}:1-10", UUID_A.to_lowercase()));
    }

    #[test]
    fn test_multiline_output_from_server() {
        let raw = format!("{}:1-3,\n{}:1-7", UUID_A, UUID_B);
        let set = GtidSet::parse(&raw).unwrap();
        assert_eq!(set.source_count(), 2);
        assert!(matches!(
            set.to_mark(),
            Err(CdcError::IsolationViolation(_))
        ));
    }

    #[test]
    fn test_holes_have_no_mark() {
        let set = GtidSet::parse(&format!("{}:1-5:7-9", UUID_A)).unwrap();
        assert!(matches!(
            set.to_mark(),
            Err(CdcError::IsolationViolation(_))
        ));
    }

    #[test]
    fn test_invalid_sets() {
        assert!(GtidSet::parse(UUID_A).is_err());
        assert!(GtidSet::parse(&format!("{}:5-2", UUID_A)).is_err());
        assert!(GtidSet::parse(&format!("{}:0", UUID_A)).is_err());
        assert!(GtidSet::parse(&format!("{}:abc", UUID_A)).is_err());
        assert!(GtidSet::parse(":1-5").is_err());
    }
}
