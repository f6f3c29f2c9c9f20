//! # Merge Coordinator
//!
//! Folds a [`SnapshotSet`] and the change events that follow it into one
//! materialized view keyed by primary key.
//!
//! ## Algorithm
//!
//! Every key carries the position of the last change applied to it:
//!
//! ```text
//! state: PrimaryKey -> (Option<Row>, last_position)
//!
//! event E at position p on key k:
//!   p <= floor                          -> stale (covered by the snapshot)
//!   k known and last_position(k) >= p   -> stale (already applied)
//!   otherwise                           -> insert/update store the row,
//!                                          delete leaves a tombstone,
//!                                          last_position(k) = p
//! ```
//!
//! Snapshot rows enter at the snapshot position `(snapshot_mark, end)`,
//! which is also the initial floor. Replaying an event never changes the
//! view, and each key keeps the change with the highest position, so the
//! final view does not depend on the order events arrive in.
//!
//! ## Ownership
//!
//! [`MergeCoordinator`] is plain single-owner state. [`MergeTask`] runs it on
//! its own tokio task fed by one `mpsc` channel; [`MergeHandle`] feeds that
//! channel and answers queries over `oneshot` replies. The current row count
//! is published on a `watch` channel so pollers never queue behind events.

use crate::common::{
    CdcError, ChangeEvent, ChangeOp, HighWaterMark, LogPosition, PrimaryKey, Result, Row,
    SharedMetrics, SnapshotSet, TableRef,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event changed the view
    Applied,
    /// The event was at or below the snapshot position or the key's last
    /// applied position and was discarded
    Stale,
}

/// Merge counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub snapshot_rows: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub stale: u64,
}

impl MergeStats {
    /// Events that changed the view.
    pub fn applied(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Cheap summary of the view, published after every change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewSummary {
    /// Live rows (tombstones excluded)
    pub row_count: u64,
    /// Mark of the loaded snapshot, if any
    pub snapshot_mark: Option<HighWaterMark>,
    /// Highest position applied so far (the snapshot position right after
    /// loading)
    pub applied_through: Option<LogPosition>,
    /// Deleted keys still tracked
    pub tombstones: u64,
}

#[derive(Debug, Clone)]
struct KeyState {
    row: Option<Row>,
    last_position: LogPosition,
}

/// Single-owner materialized view for one table.
pub struct MergeCoordinator {
    table: TableRef,
    state: BTreeMap<PrimaryKey, KeyState>,
    /// Events at or below this position are discarded for every key
    floor: Option<LogPosition>,
    snapshot_mark: Option<HighWaterMark>,
    applied_through: Option<LogPosition>,
    live_rows: u64,
    tombstones: u64,
    stats: MergeStats,
    summary_tx: watch::Sender<ViewSummary>,
    metrics: Option<SharedMetrics>,
}

impl MergeCoordinator {
    pub fn new(table: TableRef) -> Self {
        let (summary_tx, _) = watch::channel(ViewSummary::default());
        Self {
            table,
            state: BTreeMap::new(),
            floor: None,
            snapshot_mark: None,
            applied_through: None,
            live_rows: 0,
            tombstones: 0,
            stats: MergeStats::default(),
            summary_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Load the snapshot. Allowed once until [`reset`](Self::reset).
    pub fn load_snapshot(&mut self, snapshot: SnapshotSet) -> Result<()> {
        if self.snapshot_mark.is_some() {
            return Err(CdcError::invalid_state(format!(
                "snapshot for {} already loaded; reset before loading another",
                self.table
            )));
        }
        if snapshot.table() != &self.table {
            return Err(CdcError::invalid_state(format!(
                "snapshot of {} offered to the merge of {}",
                snapshot.table(),
                self.table
            )));
        }

        let mark = snapshot.snapshot_mark();
        let position = snapshot.position();
        let rows = snapshot.len() as u64;
        for row in snapshot.into_rows() {
            self.state.insert(
                row.key.clone(),
                KeyState {
                    row: Some(row),
                    last_position: position,
                },
            );
        }

        self.floor = Some(position);
        self.snapshot_mark = Some(mark);
        self.applied_through = Some(position);
        self.live_rows = rows;
        self.stats.snapshot_rows = rows;
        self.publish();

        info!(table = %self.table, rows, mark = %mark, "Snapshot loaded into view");
        Ok(())
    }

    /// Apply one change event.
    pub fn apply(&mut self, event: ChangeEvent) -> Result<ApplyOutcome> {
        let Some(floor) = self.floor else {
            return Err(CdcError::invalid_state(format!(
                "change at {} for {} arrived before the snapshot",
                event.position, self.table
            )));
        };
        if event.table != self.table {
            return Err(CdcError::invalid_state(format!(
                "change for {} offered to the merge of {}",
                event.table, self.table
            )));
        }

        let position = event.position;
        let stale = position <= floor
            || self
                .state
                .get(event.key())
                .is_some_and(|s| s.last_position >= position);
        if stale {
            self.stats.stale += 1;
            if let Some(m) = &self.metrics {
                m.record_merge(false);
            }
            return Ok(ApplyOutcome::Stale);
        }

        let ChangeEvent { op, row, .. } = event;
        let key = row.key.clone();
        let new_row = match op {
            ChangeOp::Insert => {
                self.stats.inserts += 1;
                Some(row)
            }
            ChangeOp::Update => {
                self.stats.updates += 1;
                Some(row)
            }
            ChangeOp::Delete => {
                self.stats.deletes += 1;
                None
            }
        };

        let was_live = match self.state.get(&key) {
            Some(previous) => {
                if previous.row.is_none() {
                    self.tombstones -= 1;
                }
                previous.row.is_some()
            }
            None => false,
        };
        match (was_live, new_row.is_some()) {
            (false, true) => self.live_rows += 1,
            (true, false) => self.live_rows -= 1,
            _ => {}
        }
        if new_row.is_none() {
            self.tombstones += 1;
        }
        self.state.insert(
            key,
            KeyState {
                row: new_row,
                last_position: position,
            },
        );

        if self.applied_through.map_or(true, |through| through < position) {
            self.applied_through = Some(position);
        }
        if let Some(m) = &self.metrics {
            m.record_merge(true);
        }
        self.publish();
        Ok(ApplyOutcome::Applied)
    }

    /// Drop tombstones and raise the global floor to `applied_through`.
    ///
    /// Only valid once every event up to `applied_through` has been
    /// delivered, which holds for the strictly increasing tail stream.
    pub fn prune_tombstones(&mut self) -> usize {
        let Some(through) = self.applied_through else {
            return 0;
        };
        let before = self.state.len();
        self.state.retain(|_, s| s.row.is_some());
        let pruned = before - self.state.len();
        self.tombstones = 0;
        self.floor = Some(through);
        self.publish();
        debug!(table = %self.table, pruned, floor = %through, "Pruned tombstones");
        pruned
    }

    /// Discard all state so a new snapshot can be loaded.
    pub fn reset(&mut self) {
        warn!(table = %self.table, "Resetting materialized view");
        self.state.clear();
        self.floor = None;
        self.snapshot_mark = None;
        self.applied_through = None;
        self.live_rows = 0;
        self.tombstones = 0;
        self.stats = MergeStats::default();
        self.publish();
    }

    /// Number of live rows in the view.
    pub fn row_count(&self) -> u64 {
        self.live_rows
    }

    pub fn get(&self, key: &PrimaryKey) -> Option<&Row> {
        self.state.get(key).and_then(|s| s.row.as_ref())
    }

    /// Live rows in key order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.state.values().filter_map(|s| s.row.as_ref())
    }

    pub fn snapshot_mark(&self) -> Option<HighWaterMark> {
        self.snapshot_mark
    }

    pub fn applied_through(&self) -> Option<LogPosition> {
        self.applied_through
    }

    pub fn stats(&self) -> &MergeStats {
        &self.stats
    }

    pub fn summary(&self) -> ViewSummary {
        ViewSummary {
            row_count: self.live_rows,
            snapshot_mark: self.snapshot_mark,
            applied_through: self.applied_through,
            tombstones: self.tombstones,
        }
    }

    /// Receiver that observes every published [`ViewSummary`].
    pub fn subscribe(&self) -> watch::Receiver<ViewSummary> {
        self.summary_tx.subscribe()
    }

    fn publish(&self) {
        self.summary_tx.send_replace(self.summary());
        if let Some(m) = &self.metrics {
            m.set_view_rows(self.live_rows);
        }
    }
}

/// Input accepted by a [`MergeTask`].
#[derive(Debug)]
pub enum MergeInput {
    Snapshot(SnapshotSet),
    Event(ChangeEvent),
}

enum MergeMessage {
    Input(MergeInput),
    Get(PrimaryKey, oneshot::Sender<Option<Row>>),
    Rows(oneshot::Sender<Vec<Row>>),
    Stats(oneshot::Sender<MergeStats>),
    PruneTombstones(oneshot::Sender<usize>),
}

/// Runs a [`MergeCoordinator`] as the sole owner of the view.
pub struct MergeTask {
    coordinator: MergeCoordinator,
    rx: mpsc::Receiver<MergeMessage>,
    cancel: CancellationToken,
}

impl MergeTask {
    /// Create the task and its handle. `capacity` bounds queued messages.
    pub fn new(coordinator: MergeCoordinator, capacity: usize) -> (Self, MergeHandle) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = MergeHandle {
            tx,
            summary: coordinator.subscribe(),
        };
        let task = Self {
            coordinator,
            rx,
            cancel: CancellationToken::new(),
        };
        (task, handle)
    }

    /// Stop when `token` is cancelled instead of waiting for all handles to
    /// drop.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Process messages until cancelled or every handle is dropped.
    ///
    /// An input the coordinator rejects stops the task with that error.
    /// On a clean stop the coordinator is returned with the final view.
    pub async fn run(mut self) -> Result<MergeCoordinator> {
        loop {
            let message = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                message = self.rx.recv() => message,
            };
            let Some(message) = message else {
                break;
            };

            match message {
                MergeMessage::Input(MergeInput::Snapshot(set)) => {
                    self.coordinator.load_snapshot(set)?;
                }
                MergeMessage::Input(MergeInput::Event(event)) => {
                    self.coordinator.apply(event)?;
                }
                MergeMessage::Get(key, reply) => {
                    let _ = reply.send(self.coordinator.get(&key).cloned());
                }
                MergeMessage::Rows(reply) => {
                    let _ = reply.send(self.coordinator.rows().cloned().collect());
                }
                MergeMessage::Stats(reply) => {
                    let _ = reply.send(self.coordinator.stats().clone());
                }
                MergeMessage::PruneTombstones(reply) => {
                    let _ = reply.send(self.coordinator.prune_tombstones());
                }
            }
        }

        debug!(
            table = %self.coordinator.table(),
            rows = self.coordinator.row_count(),
            "Merge task stopped"
        );
        Ok(self.coordinator)
    }
}

/// Cloneable handle to a running [`MergeTask`].
#[derive(Clone)]
pub struct MergeHandle {
    tx: mpsc::Sender<MergeMessage>,
    summary: watch::Receiver<ViewSummary>,
}

impl MergeHandle {
    async fn send(&self, message: MergeMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| CdcError::invalid_state("merge task has stopped"))
    }

    async fn request<T>(
        &self,
        message: impl FnOnce(oneshot::Sender<T>) -> MergeMessage,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(message(reply_tx)).await?;
        reply_rx
            .await
            .map_err(|_| CdcError::invalid_state("merge task has stopped"))
    }

    pub async fn load_snapshot(&self, snapshot: SnapshotSet) -> Result<()> {
        self.send(MergeMessage::Input(MergeInput::Snapshot(snapshot)))
            .await
    }

    pub async fn apply(&self, event: ChangeEvent) -> Result<()> {
        self.send(MergeMessage::Input(MergeInput::Event(event))).await
    }

    pub async fn submit(&self, input: MergeInput) -> Result<()> {
        self.send(MergeMessage::Input(input)).await
    }

    /// Live row count as of the last processed message.
    pub fn row_count(&self) -> u64 {
        self.summary.borrow().row_count
    }

    pub fn summary(&self) -> ViewSummary {
        self.summary.borrow().clone()
    }

    /// Receiver for summary changes.
    pub fn watch(&self) -> watch::Receiver<ViewSummary> {
        self.summary.clone()
    }

    pub async fn get(&self, key: PrimaryKey) -> Result<Option<Row>> {
        self.request(|reply| MergeMessage::Get(key, reply)).await
    }

    /// All live rows in key order.
    pub async fn rows(&self) -> Result<Vec<Row>> {
        self.request(MergeMessage::Rows).await
    }

    pub async fn stats(&self) -> Result<MergeStats> {
        self.request(MergeMessage::Stats).await
    }

    pub async fn prune_tombstones(&self) -> Result<usize> {
        self.request(MergeMessage::PruneTombstones).await
    }

    /// Handle that does not keep the merge task running.
    pub fn downgrade(&self) -> WeakMergeHandle {
        WeakMergeHandle {
            tx: self.tx.downgrade(),
            summary: self.summary.clone(),
        }
    }
}

/// Non-owning [`MergeHandle`]; the task stops once every strong handle is
/// dropped.
#[derive(Clone)]
pub struct WeakMergeHandle {
    tx: mpsc::WeakSender<MergeMessage>,
    summary: watch::Receiver<ViewSummary>,
}

impl WeakMergeHandle {
    /// `None` once the merge task no longer accepts input.
    pub fn upgrade(&self) -> Option<MergeHandle> {
        self.tx.upgrade().map(|tx| MergeHandle {
            tx,
            summary: self.summary.clone(),
        })
    }

    pub fn summary(&self) -> ViewSummary {
        self.summary.borrow().clone()
    }
}
