//! # Connector
//!
//! Per-table pipeline that runs the snapshot, the log tail and the merge as
//! three tokio tasks.
//!
//! ```text
//!  snapshot task ──SnapshotSet──┐
//!        │                      ▼
//!        └─snapshot_mark─▶ tail task ──ChangeEvent──▶ merge task (owns the view)
//!          (oneshot)                    (mpsc)              │
//!                                                           ▼ watch
//!                                                     checkpoint task
//! ```
//!
//! The snapshot set is queued on the merge channel before the mark is handed
//! to the tail task, so the merge always sees the snapshot first. The only
//! datum the snapshot and tail tasks share is the mark.
//!
//! On start the table's checkpoint is consulted. If the table was registered
//! before, its current schema must still match the registered one; otherwise
//! start fails with `SchemaChanged`. A table stopped by a gap or a schema
//! change stays failed until its checkpoint is deleted.

use crate::common::{
    CdcError, CdcMetrics, ChangeLog, CheckpointStore, ConnectorConfig, ConnectorPhase,
    HighWaterMark, LogTailer, MergeCoordinator, MergeHandle, MergeTask, Result,
    SharedCheckpointStore, SharedMetrics, SnapshotConfig, SnapshotReader, SnapshotSource,
    TableCheckpoint, TableRef, TailConfig, ViewSummary, WeakMergeHandle,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Starts per-table pipelines against one source.
pub struct Connector {
    snapshots: Arc<dyn SnapshotSource>,
    log: Arc<dyn ChangeLog>,
    checkpoints: SharedCheckpointStore,
    snapshot_config: SnapshotConfig,
    tail_config: TailConfig,
    merge_capacity: usize,
    checkpoint_interval: Duration,
}

impl Connector {
    pub fn new(
        snapshots: Arc<dyn SnapshotSource>,
        log: Arc<dyn ChangeLog>,
        checkpoints: SharedCheckpointStore,
    ) -> Self {
        Self {
            snapshots,
            log,
            checkpoints,
            snapshot_config: SnapshotConfig::default(),
            tail_config: TailConfig::default(),
            merge_capacity: 10_000,
            checkpoint_interval: Duration::from_secs(1),
        }
    }

    /// Connector with every setting taken from `config`. Checkpoints are
    /// files under `checkpoint_dir`, or kept in memory when it is unset.
    pub async fn from_config(
        snapshots: Arc<dyn SnapshotSource>,
        log: Arc<dyn ChangeLog>,
        config: &ConnectorConfig,
    ) -> Result<Self> {
        config.check()?;
        let checkpoints = config.checkpoint_store().await?;
        Ok(Self::new(snapshots, log, checkpoints).with_config(config))
    }

    /// Apply snapshot, tail, merge and checkpoint settings.
    pub fn with_config(mut self, config: &ConnectorConfig) -> Self {
        self.snapshot_config = config.snapshot_config();
        self.tail_config = config.tail_config();
        self.merge_capacity = config.merge_channel_capacity;
        self.checkpoint_interval = config.checkpoint_interval();
        self
    }

    pub fn with_snapshot_config(mut self, config: SnapshotConfig) -> Self {
        self.snapshot_config = config;
        self
    }

    pub fn with_tail_config(mut self, config: TailConfig) -> Self {
        self.tail_config = config;
        self
    }

    pub fn with_merge_capacity(mut self, capacity: usize) -> Self {
        self.merge_capacity = capacity;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn checkpoints(&self) -> &SharedCheckpointStore {
        &self.checkpoints
    }

    /// Start a pipeline per table. If any table fails to start, the
    /// pipelines already started are shut down.
    pub async fn start_all(&self, tables: &[TableRef]) -> Result<Vec<ConnectorHandle>> {
        let mut handles = Vec::with_capacity(tables.len());
        for table in tables {
            match self.start(table).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        if let Err(stop_err) = handle.shutdown().await {
                            warn!(error = %stop_err, "Failed to stop pipeline after start error");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Register `table` and start its pipeline.
    ///
    /// Fails before spawning anything when the table's schema changed since
    /// it was registered, or when it was left failed by an earlier run.
    pub async fn start(&self, table: &TableRef) -> Result<ConnectorHandle> {
        let source_type = self.snapshots.source_type();
        let schema = self.snapshots.describe_table(table).await?;
        schema.validate()?;

        if let Some(previous) = self.checkpoints.load(table).await? {
            if previous.phase == ConnectorPhase::Failed {
                return Err(CdcError::invalid_state(format!(
                    "{} stopped on a fatal error ({}); delete its checkpoint to resnapshot",
                    table,
                    previous.error.as_deref().unwrap_or("unknown")
                )));
            }
            if let Err(e) = previous.check_schema(&schema) {
                error!(table = %table, error = %e, "Schema changed since registration");
                self.checkpoints.save(&previous.failed(&e)).await?;
                return Err(e);
            }
            info!(
                table = %table,
                phase = ?previous.phase,
                "Restarting registered table with a fresh snapshot"
            );
        }

        let registered = TableCheckpoint::registered(table.clone(), source_type, schema);
        self.checkpoints.save(&registered).await?;

        let metrics: SharedMetrics = Arc::new(CdcMetrics::new(source_type, &table.to_string()));
        let cancel = CancellationToken::new();

        let coordinator = MergeCoordinator::new(table.clone()).with_metrics(metrics.clone());
        let (merge_task, merge) = MergeTask::new(coordinator, self.merge_capacity);
        let merge_task = tokio::spawn(merge_task.with_cancellation(cancel.clone()).run());

        let (mark_tx, mark_rx) = oneshot::channel();

        let reader = SnapshotReader::new(self.snapshots.clone(), self.snapshot_config.clone())
            .with_metrics(metrics.clone());
        let snapshot_task = tokio::spawn(run_snapshot(
            reader,
            table.clone(),
            registered.clone(),
            self.checkpoints.clone(),
            merge.clone(),
            mark_tx,
            cancel.clone(),
        ));

        let tailer = LogTailer::new(self.log.clone(), self.tail_config.clone())
            .with_metrics(metrics.clone());
        let tail_task = tokio::spawn(run_tail(
            tailer,
            table.clone(),
            mark_rx,
            merge.clone(),
            cancel.clone(),
        ));

        let checkpoint_task = tokio::spawn(run_checkpointer(
            registered.clone(),
            self.checkpoints.clone(),
            merge.downgrade(),
            self.checkpoint_interval,
            cancel.clone(),
        ));

        info!(table = %table, source = source_type, "Connector started");

        Ok(ConnectorHandle {
            table: table.clone(),
            registered,
            checkpoints: self.checkpoints.clone(),
            merge,
            metrics,
            cancel,
            snapshot_task,
            tail_task,
            merge_task,
            checkpoint_task,
        })
    }
}

async fn run_snapshot(
    reader: SnapshotReader<dyn SnapshotSource>,
    table: TableRef,
    registered: TableCheckpoint,
    checkpoints: SharedCheckpointStore,
    merge: MergeHandle,
    mark_tx: oneshot::Sender<HighWaterMark>,
    cancel: CancellationToken,
) -> Result<()> {
    let (snapshot, mark) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = reader.begin_snapshot(&table) => result?,
    };

    // Schema altered between registration and the snapshot transaction.
    registered.check_schema(snapshot.schema())?;

    merge.load_snapshot(snapshot).await?;
    checkpoints.save(&registered.streaming(mark)).await?;

    if mark_tx.send(mark).is_err() {
        debug!(table = %table, "Tail task gone before snapshot handoff");
    }
    Ok(())
}

async fn run_tail(
    tailer: LogTailer<dyn ChangeLog>,
    table: TableRef,
    mark_rx: oneshot::Receiver<HighWaterMark>,
    merge: MergeHandle,
    cancel: CancellationToken,
) -> Result<()> {
    let mark = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        mark = mark_rx => match mark {
            Ok(mark) => mark,
            // The snapshot task failed and reports its own error.
            Err(_) => return Ok(()),
        },
    };

    let mut stream = tailer.tail(&table, mark).await?;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(event)) => merge.apply(event).await?,
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    debug!(table = %table, "Tail task stopped");
    Ok(())
}

fn progress_checkpoint(
    registered: &TableCheckpoint,
    summary: &ViewSummary,
) -> Option<TableCheckpoint> {
    let mark = summary.snapshot_mark?;
    let mut checkpoint = registered.clone().streaming(mark);
    if let Some(through) = summary.applied_through {
        checkpoint = checkpoint.applied(through);
    }
    Some(checkpoint)
}

/// Periodically persists progress and prunes tombstones.
///
/// Pruning raises the merge floor to the last applied position, which holds
/// because the tail delivers positions in strictly increasing order.
async fn run_checkpointer(
    registered: TableCheckpoint,
    checkpoints: SharedCheckpointStore,
    merge: WeakMergeHandle,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_saved = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if merge.summary().tombstones > 0 {
            if let Some(handle) = merge.upgrade() {
                match handle.prune_tombstones().await {
                    Ok(pruned) => debug!(table = %registered.table, pruned, "Pruned tombstones"),
                    Err(e) => {
                        debug!(table = %registered.table, error = %e, "Skipped tombstone pruning")
                    }
                }
            }
        }

        let current = merge.summary();
        if current.applied_through == last_saved {
            continue;
        }
        let Some(checkpoint) = progress_checkpoint(&registered, &current) else {
            continue;
        };
        match checkpoints.save(&checkpoint).await {
            Ok(()) => last_saved = current.applied_through,
            Err(e) => warn!(table = %registered.table, error = %e, "Failed to save checkpoint"),
        }
    }
}

fn join_error(task: &str, e: tokio::task::JoinError) -> CdcError {
    CdcError::other(format!("{} task failed: {}", task, e))
}

/// Running pipeline for one table.
pub struct ConnectorHandle {
    table: TableRef,
    registered: TableCheckpoint,
    checkpoints: SharedCheckpointStore,
    merge: MergeHandle,
    metrics: SharedMetrics,
    cancel: CancellationToken,
    snapshot_task: JoinHandle<Result<()>>,
    tail_task: JoinHandle<Result<()>>,
    merge_task: JoinHandle<Result<MergeCoordinator>>,
    checkpoint_task: JoinHandle<()>,
}

impl ConnectorHandle {
    pub fn table(&self) -> &TableRef {
        &self.table
    }

    /// Query handle for the materialized view.
    pub fn merge(&self) -> &MergeHandle {
        &self.merge
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    /// Wait for the pipeline to finish and return the final view.
    ///
    /// The tail runs until the change log closes, so this returns on a fatal
    /// error or once the source shuts down. Events already queued are merged
    /// before the view is returned.
    pub async fn wait(self) -> Result<MergeCoordinator> {
        let Self {
            table,
            registered,
            checkpoints,
            merge,
            metrics,
            cancel,
            snapshot_task,
            tail_task,
            merge_task,
            checkpoint_task,
        } = self;
        drop(merge);

        let snapshot_result = snapshot_task
            .await
            .map_err(|e| join_error("snapshot", e))
            .and_then(|r| r);
        let tail_result = match &snapshot_result {
            Ok(()) => tail_task
                .await
                .map_err(|e| join_error("tail", e))
                .and_then(|r| r),
            Err(_) => {
                cancel.cancel();
                let _ = tail_task.await;
                Ok(())
            }
        };

        if snapshot_result.is_err() || tail_result.is_err() {
            cancel.cancel();
        }
        // Every merge handle is gone now, so the merge task drains and ends.
        let merge_result = merge_task
            .await
            .map_err(|e| join_error("merge", e))
            .and_then(|r| r);
        cancel.cancel();
        let _ = checkpoint_task.await;

        // A rejected input stops the merge task, which the tail only sees
        // as a closed channel: report the merge's own error first.
        let outcome = match (snapshot_result, tail_result, merge_result) {
            (Err(e), _, _) => Err(e),
            (_, _, Err(e)) => Err(e),
            (_, Err(e), _) => Err(e),
            (Ok(()), Ok(()), Ok(coordinator)) => Ok(coordinator),
        };

        match outcome {
            Ok(coordinator) => {
                if let Some(cp) = progress_checkpoint(&registered, &coordinator.summary()) {
                    checkpoints.save(&cp).await?;
                }
                info!(
                    table = %table,
                    rows = coordinator.row_count(),
                    "Connector finished"
                );
                Ok(coordinator)
            }
            Err(e) => {
                metrics.record_error(e.category());
                error!(table = %table, error = %e, "Connector failed");
                if e.requires_resnapshot() {
                    if let Err(save_err) = checkpoints.save(&registered.failed(&e)).await {
                        warn!(table = %table, error = %save_err, "Failed to record failure");
                    }
                }
                Err(e)
            }
        }
    }

    /// Cancel every task and wait for them to stop.
    pub async fn shutdown(self) -> Result<()> {
        info!(table = %self.table, "Shutting down connector");
        self.cancel.cancel();

        let summary = self.merge.summary();
        drop(self.merge);

        for (name, task) in [("snapshot", self.snapshot_task), ("tail", self.tail_task)] {
            match task.await {
                Ok(Err(e)) => debug!(
                    table = %self.table,
                    task = name,
                    error = %e,
                    "Task ended with error during shutdown"
                ),
                Err(e) => return Err(join_error(name, e)),
                Ok(Ok(())) => {}
            }
        }
        if let Err(e) = self.merge_task.await {
            return Err(join_error("merge", e));
        }
        let _ = self.checkpoint_task.await;

        if let Some(cp) = progress_checkpoint(&self.registered, &summary) {
            self.checkpoints.save(&cp).await?;
        }
        Ok(())
    }
}
