//! # tidemark-cdc - Snapshot-consistent Change Data Capture
//!
//! Initial table snapshot plus change-log tailing, merged into a view that
//! never loses or double-counts a row, however writes interleave with the
//! snapshot.
//!
//! ## Features
//!
//! - `mysql` - MySQL snapshot source (`LOCK TABLES` + consistent snapshot + GTID mark)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐                 ┌──────────────────┐
//! │  SnapshotSource  │                 │    ChangeLog     │
//! └────────┬─────────┘                 └────────┬─────────┘
//!          │ SnapshotSet @ mark M               │ events > M
//!          ▼                                    ▼
//! ┌──────────────────┐    mark M       ┌──────────────────┐
//! │  SnapshotReader  │ ──────────────► │    LogTailer     │
//! └────────┬─────────┘                 └────────┬─────────┘
//!          │                                    │
//!          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                   MergeCoordinator                       │
//! │     PrimaryKey → (Row | tombstone, last LogPosition)     │
//! └──────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//!                     ConsistencyOracle
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use tidemark_cdc::memory::{make_inserts, many_inserts_schema, MemorySource};
//! use tidemark_cdc::{
//!     ConsistencyOracle, Connector, ExpectedState, MemoryCheckpointStore, OracleConfig, TableRef,
//! };
//!
//! let source = MemorySource::new();
//! let table = TableRef::new("public", "many_inserts");
//! source.create_table(table.clone(), many_inserts_schema())?;
//! make_inserts(1, 1_000).run(&source, &table)?;
//!
//! let connector = Connector::new(
//!     Arc::new(source.clone()),
//!     Arc::new(source.clone()),
//!     Arc::new(MemoryCheckpointStore::new()),
//! );
//! let handle = connector.start(&table).await?;
//!
//! let oracle = ConsistencyOracle::new(OracleConfig::default());
//! oracle
//!     .await_convergence(handle.merge(), &ExpectedState::count(1_000))
//!     .await?;
//! handle.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Public API Organization
//!
//! ### Tier 1: Core Types (crate root)
//! The protocol pieces - `SnapshotReader`, `LogTailer`, `MergeCoordinator`,
//! `ConsistencyOracle` - and the data they exchange.
//!
//! ### Tier 2: Operation (crate root)
//! Running a table end to end - `Connector`, checkpoints, configuration.
//!
//! ### Tier 3: Advanced Types (`common` module)
//! Builders, stats, the task form of the merge, backoff and GTID parsing.

pub mod common;

// =============================================================================
// TIER 1: Core Types
// =============================================================================

pub use common::{
    // Error handling
    CdcError,
    ErrorCategory,
    Result,
    // Positions
    HighWaterMark,
    LogPosition,
    // Data
    ChangeEvent,
    ChangeOp,
    ColumnDef,
    PrimaryKey,
    Row,
    SnapshotSet,
    TableRef,
    TableSchema,
    // Snapshot Reader
    SnapshotConfig,
    SnapshotReader,
    SnapshotSource,
    // Log Tailer
    ChangeLog,
    ChangeStream,
    LogTailer,
    TailConfig,
    // Merge Coordinator
    ApplyOutcome,
    MergeCoordinator,
    MergeHandle,
    // Consistency Oracle
    ConsistencyOracle,
    ExpectedState,
    OracleConfig,
    ViewProbe,
};

// =============================================================================
// TIER 2: Operation
// =============================================================================

pub use common::{Connector, ConnectorConfig, ConnectorHandle};
pub use common::{
    CheckpointStore, ConnectorPhase, FileCheckpointStore, MemoryCheckpointStore, TableCheckpoint,
};

// =============================================================================
// TIER 3: Advanced Types - Available via `common::` module
// =============================================================================
// Not re-exported at crate root:
//
// Merge internals:
//   - common::MergeTask, MergeInput, MergeStats, ViewSummary
//
// Reporting:
//   - common::ConvergenceReport, VerificationReport
//   - common::CdcMetrics, MetricsSnapshot
//
// Builders:
//   - common::SnapshotConfigBuilder, TailConfigBuilder, OracleConfigBuilder
//
// Plumbing:
//   - common::ExponentialBackoff
//   - common::check_retention
//   - common::GtidSet

pub mod memory;

// MySQL - feature-gated
#[cfg(feature = "mysql")]
pub mod mysql;
