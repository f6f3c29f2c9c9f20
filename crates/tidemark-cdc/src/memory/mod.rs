//! In-memory source
//!
//! A transactional table store that implements both [`SnapshotSource`] and
//! [`ChangeLog`], plus the insert workloads the scenario tests drive it with.
//!
//! [`SnapshotSource`]: crate::common::SnapshotSource
//! [`ChangeLog`]: crate::common::ChangeLog

mod source;
mod workload;

pub use source::MemorySource;
pub use workload::{make_inserts, many_inserts_schema, InsertWorkload};
