//! # Snapshot Reader
//!
//! Point-in-time read of a source table together with the high-water mark
//! of that read.
//!
//! ## Consistency
//!
//! The snapshot and its mark must be captured atomically: a row committed
//! after the mark must not be visible in the snapshot, and a row committed
//! at or before the mark must be. Otherwise rows written concurrently with
//! the snapshot are counted twice (visible in the snapshot and replayed from
//! the log) or lost (invisible to both). Sources that cannot guarantee this
//! fail with [`CdcError::IsolationViolation`] instead of degrading silently.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tidemark_cdc::common::{SnapshotConfig, SnapshotReader, TableRef};
//!
//! let reader = SnapshotReader::new(source, SnapshotConfig::default());
//! let (snapshot, mark) = reader
//!     .begin_snapshot(&TableRef::new("public", "many_inserts"))
//!     .await?;
//! println!("{} rows at mark {}", snapshot.len(), mark);
//! ```

use crate::common::{
    CdcError, CdcMetrics, HighWaterMark, LogPosition, PrimaryKey, Result, Row, TableRef,
    TableSchema,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Immutable set of rows captured at a single mark.
#[derive(Debug, Clone)]
pub struct SnapshotSet {
    table: TableRef,
    schema: TableSchema,
    snapshot_mark: HighWaterMark,
    rows: BTreeMap<PrimaryKey, Row>,
    captured_at: i64,
}

impl SnapshotSet {
    /// Build a snapshot set. Duplicate primary keys are rejected.
    pub fn new(
        table: TableRef,
        schema: TableSchema,
        snapshot_mark: HighWaterMark,
        rows: impl IntoIterator<Item = Row>,
    ) -> Result<Self> {
        let mut by_key = BTreeMap::new();
        for row in rows {
            let key = row.key.clone();
            if by_key.insert(key.clone(), row).is_some() {
                return Err(CdcError::schema(format!(
                    "snapshot of {} contains primary key {} twice",
                    table, key
                )));
            }
        }
        Ok(Self {
            table,
            schema,
            snapshot_mark,
            rows: by_key,
            captured_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Schema observed inside the snapshot transaction.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn snapshot_mark(&self) -> HighWaterMark {
        self.snapshot_mark
    }

    /// Position covered by the snapshot: the whole transaction at its mark.
    pub fn position(&self) -> LogPosition {
        LogPosition::end_of(self.snapshot_mark)
    }

    /// Capture time (Unix epoch millis).
    pub fn captured_at(&self) -> i64 {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<&Row> {
        self.rows.get(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    /// Consume the set, yielding rows in key order.
    pub fn into_rows(self) -> impl Iterator<Item = Row> {
        self.rows.into_values()
    }
}

/// Source side of a snapshot.
///
/// Implementations open a read-only transaction with snapshot isolation
/// (repeatable read or stronger), capture the log mark atomically with the
/// transaction start, read the table schema and rows, and close it.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Source type name used in logs and metrics (e.g. "mysql").
    fn source_type(&self) -> &'static str;

    /// Read `table` and its mark in one snapshot transaction.
    ///
    /// Fails with `SourceUnavailable` when the source cannot be reached and
    /// `IsolationViolation` when atomicity cannot be guaranteed.
    async fn read_snapshot(&self, table: &TableRef) -> Result<SnapshotSet>;

    /// Current schema of `table`, read outside any snapshot.
    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema>;
}

/// Configuration for snapshots.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Upper bound for the whole snapshot transaction
    pub timeout: Duration,
    /// Re-derive every row's key from the schema and compare
    pub verify_keys: bool,
    /// Guardrail: refuse snapshots larger than this many rows
    pub max_rows: Option<u64>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            verify_keys: true,
            max_rows: None,
        }
    }
}

impl SnapshotConfig {
    pub fn builder() -> SnapshotConfigBuilder {
        SnapshotConfigBuilder::default()
    }
}

/// Builder for SnapshotConfig.
#[derive(Default)]
pub struct SnapshotConfigBuilder {
    config: SnapshotConfig,
}

impl SnapshotConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn verify_keys(mut self, enabled: bool) -> Self {
        self.config.verify_keys = enabled;
        self
    }

    pub fn max_rows(mut self, max: u64) -> Self {
        self.config.max_rows = Some(max);
        self
    }

    pub fn build(self) -> SnapshotConfig {
        self.config
    }
}

/// Takes consistent snapshots through a [`SnapshotSource`].
pub struct SnapshotReader<S: SnapshotSource + ?Sized> {
    source: Arc<S>,
    config: SnapshotConfig,
    metrics: Option<Arc<CdcMetrics>>,
}

impl<S: SnapshotSource + ?Sized> SnapshotReader<S> {
    pub fn new(source: Arc<S>, config: SnapshotConfig) -> Self {
        Self {
            source,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<CdcMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Snapshot `table`, returning the set and its mark.
    ///
    /// Isolation and availability failures are returned as-is; this method
    /// never retries.
    pub async fn begin_snapshot(&self, table: &TableRef) -> Result<(SnapshotSet, HighWaterMark)> {
        info!(
            table = %table,
            source = self.source.source_type(),
            "Starting snapshot"
        );
        let started = Instant::now();

        let read = self.source.read_snapshot(table);
        let result = match tokio::time::timeout(self.config.timeout, read).await {
            Ok(result) => result.and_then(|set| self.check(table, set)),
            Err(_) => Err(CdcError::source_unavailable(format!(
                "snapshot of {} did not complete within {:?}",
                table, self.config.timeout
            ))),
        };

        match result {
            Ok(set) => {
                let mark = set.snapshot_mark();
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot(set.len() as u64, started.elapsed());
                }
                info!(
                    table = %table,
                    rows = set.len(),
                    mark = %mark,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Snapshot complete"
                );
                Ok((set, mark))
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot_failed();
                    metrics.record_error(e.category());
                }
                warn!(table = %table, error = %e, "Snapshot failed");
                Err(e)
            }
        }
    }

    fn check(&self, table: &TableRef, set: SnapshotSet) -> Result<SnapshotSet> {
        if set.table() != table {
            return Err(CdcError::invalid_state(format!(
                "requested snapshot of {} but source returned {}",
                table,
                set.table()
            )));
        }
        set.schema().validate()?;

        if let Some(max) = self.config.max_rows {
            if set.len() as u64 > max {
                return Err(CdcError::config(format!(
                    "snapshot of {} has {} rows, above the configured maximum {}",
                    table,
                    set.len(),
                    max
                )));
            }
        }

        if self.config.verify_keys {
            for row in set.rows() {
                let derived = set.schema().key_of(&row.values)?;
                if derived != row.key {
                    return Err(CdcError::schema(format!(
                        "row keyed {} in {} carries key values {}",
                        row.key, table, derived
                    )));
                }
            }
            debug!(table = %table, rows = set.len(), "Snapshot keys verified");
        }
        Ok(set)
    }
}
