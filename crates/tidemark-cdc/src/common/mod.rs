//! # Common CDC Types and Traits
//!
//! Source-agnostic pieces of the snapshot-consistency protocol:
//!
//! - [`SnapshotReader`] - Point-in-time table read plus its [`HighWaterMark`]
//! - [`LogTailer`] - Change stream strictly after a mark, with retries
//! - [`MergeCoordinator`] - Deduplicating materialized view keyed by primary key
//! - [`ConsistencyOracle`] - Convergence checks against a known final state
//! - [`Connector`] - Snapshot, tail and merge tasks for one table
//! - [`CheckpointStore`] - Registration state that survives restarts
//! - [`CdcMetrics`] - Counters exported through the `metrics` facade
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Common Module                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SnapshotSource ←─── MemorySource, MySqlSnapshotSource      │
//! │  ChangeLog      ←─── MemorySource                           │
//! │  SnapshotReader ←─── SnapshotSet + snapshot_mark            │
//! │  LogTailer      ←─── ChangeEvent stream after the mark      │
//! │  Merge          ←─── Last-writer-wins per key, tombstones   │
//! │  Oracle         ←─── Poll until the view holds the count    │
//! │  Connector      ←─── Task wiring, cancellation              │
//! │  Checkpoint     ←─── Schema fingerprint, applied position   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod checkpoint;
mod config;
mod connector;
mod error;
mod event;
pub mod gtid;
mod merge;
mod metrics;
mod oracle;
mod position;
mod resilience;
mod row;
mod snapshot;
mod tailer;

pub use checkpoint::{
    CheckpointStore, ConnectorPhase, FileCheckpointStore, MemoryCheckpointStore,
    SharedCheckpointStore, TableCheckpoint,
};
pub use config::{ConnectorConfig, OracleSettings, SourceSettings};
pub use connector::{Connector, ConnectorHandle};
pub use error::{CdcError, ErrorCategory, Result};
pub use event::{ChangeEvent, ChangeOp};
pub use gtid::GtidSet;
pub use merge::{
    ApplyOutcome, MergeCoordinator, MergeHandle, MergeInput, MergeStats, MergeTask, ViewSummary,
    WeakMergeHandle,
};
pub use metrics::{CdcMetrics, MetricsSnapshot, SharedMetrics};
pub use oracle::{
    ConsistencyOracle, ConvergenceReport, ExpectedState, OracleConfig, OracleConfigBuilder,
    VerificationReport, ViewProbe,
};
pub use position::{HighWaterMark, LogPosition};
pub use resilience::ExponentialBackoff;
pub use row::{ColumnDef, PrimaryKey, Row, TableRef, TableSchema};
pub use snapshot::{
    SnapshotConfig, SnapshotConfigBuilder, SnapshotReader, SnapshotSet, SnapshotSource,
};
pub use tailer::{
    check_retention, ChangeLog, ChangeStream, LogTailer, TailConfig, TailConfigBuilder,
};
