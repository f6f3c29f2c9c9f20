//! # CDC Metrics
//!
//! Counters for snapshot, tail and merge activity.
//!
//! Every update goes both to in-process atomic counters (readable through
//! [`CdcMetrics::snapshot`]) and to the `metrics` crate facade, so any
//! installed exporter (Prometheus, StatsD) picks them up.

use crate::common::ErrorCategory;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Per-table CDC metrics collector.
#[derive(Debug)]
pub struct CdcMetrics {
    /// Source type (memory, mysql)
    source_type: String,
    /// Qualified table name
    table: String,

    snapshots_completed: AtomicU64,
    snapshots_failed: AtomicU64,
    snapshot_rows: AtomicU64,

    events_delivered: AtomicU64,
    events_replayed: AtomicU64,
    tail_retries: AtomicU64,

    events_applied: AtomicU64,
    events_stale: AtomicU64,

    errors_total: AtomicU64,
    view_rows: AtomicU64,
}

impl CdcMetrics {
    /// Create a new metrics collector.
    pub fn new(source_type: &str, table: &str) -> Self {
        Self {
            source_type: source_type.to_string(),
            table: table.to_string(),
            snapshots_completed: AtomicU64::new(0),
            snapshots_failed: AtomicU64::new(0),
            snapshot_rows: AtomicU64::new(0),
            events_delivered: AtomicU64::new(0),
            events_replayed: AtomicU64::new(0),
            tail_retries: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_stale: AtomicU64::new(0),
            errors_total: AtomicU64::new(0),
            view_rows: AtomicU64::new(0),
        }
    }

    /// Record a completed snapshot.
    pub fn record_snapshot(&self, rows: u64, duration: Duration) {
        self.snapshots_completed.fetch_add(1, Ordering::Relaxed);
        self.snapshot_rows.fetch_add(rows, Ordering::Relaxed);

        metrics::counter!(
            "tidemark_cdc_snapshot_rows_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .increment(rows);
        metrics::histogram!(
            "tidemark_cdc_snapshot_duration_seconds",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed snapshot.
    pub fn record_snapshot_failed(&self) {
        self.snapshots_failed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tidemark_cdc_snapshots_failed_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .increment(1);
    }

    /// Record an event handed out by the log tailer.
    #[inline]
    pub fn record_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tidemark_cdc_events_delivered_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .increment(1);
    }

    /// Record an event the tailer dropped as already delivered.
    #[inline]
    pub fn record_replayed(&self) {
        self.events_replayed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tidemark_cdc_events_replayed_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .increment(1);
    }

    /// Record a tail resubscription after a transient error.
    pub fn record_tail_retry(&self) {
        self.tail_retries.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "tidemark_cdc_tail_retries_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone()
        )
        .increment(1);
    }

    /// Record a merge outcome.
    #[inline]
    pub fn record_merge(&self, applied: bool) {
        if applied {
            self.events_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.events_stale.fetch_add(1, Ordering::Relaxed);
        }
        metrics::counter!(
            "tidemark_cdc_merge_events_total",
            "table" => self.table.clone(),
            "outcome" => if applied { "applied" } else { "stale" }
        )
        .increment(1);
    }

    /// Set the current materialized row count.
    pub fn set_view_rows(&self, rows: u64) {
        self.view_rows.store(rows, Ordering::Relaxed);
        metrics::gauge!(
            "tidemark_cdc_view_rows",
            "table" => self.table.clone()
        )
        .set(rows as f64);
    }

    /// Record an error.
    pub fn record_error(&self, category: ErrorCategory) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
        let category = match category {
            ErrorCategory::Source => "source",
            ErrorCategory::Replication => "replication",
            ErrorCategory::Schema => "schema",
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::Network => "network",
            ErrorCategory::Serialization => "serialization",
            ErrorCategory::Verification => "verification",
            ErrorCategory::Other => "other",
        };
        metrics::counter!(
            "tidemark_cdc_errors_total",
            "source" => self.source_type.clone(),
            "table" => self.table.clone(),
            "category" => category
        )
        .increment(1);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            snapshots_completed: self.snapshots_completed.load(Ordering::Relaxed),
            snapshots_failed: self.snapshots_failed.load(Ordering::Relaxed),
            snapshot_rows: self.snapshot_rows.load(Ordering::Relaxed),
            events_delivered: self.events_delivered.load(Ordering::Relaxed),
            events_replayed: self.events_replayed.load(Ordering::Relaxed),
            tail_retries: self.tail_retries.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_stale: self.events_stale.load(Ordering::Relaxed),
            errors_total: self.errors_total.load(Ordering::Relaxed),
            view_rows: self.view_rows.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`CdcMetrics`] counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub snapshots_completed: u64,
    pub snapshots_failed: u64,
    pub snapshot_rows: u64,
    pub events_delivered: u64,
    pub events_replayed: u64,
    pub tail_retries: u64,
    pub events_applied: u64,
    pub events_stale: u64,
    pub errors_total: u64,
    pub view_rows: u64,
}

/// Shared metrics handle.
pub type SharedMetrics = Arc<CdcMetrics>;
