//! In-process source with snapshot isolation and a retained change log.
//!
//! Every committed transaction gets the next [`HighWaterMark`]; its row
//! changes are numbered from 0 inside it. Table contents are copy-on-write,
//! so a snapshot pins the table version current at its mark in O(1) while
//! writers keep committing.

use crate::common::{
    CdcError, ChangeEvent, ChangeLog, ChangeOp, ChangeStream, HighWaterMark, LogPosition,
    PrimaryKey, Result, Row, SnapshotSet, SnapshotSource, TableRef, TableSchema,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Log entries read per lock acquisition by a subscription.
const SCAN_BATCH: usize = 1024;

#[derive(Debug, Clone)]
enum LogEntry {
    Change(ChangeEvent),
    SchemaChange {
        table: TableRef,
        position: LogPosition,
        detail: String,
    },
}

impl LogEntry {
    fn position(&self) -> LogPosition {
        match self {
            LogEntry::Change(event) => event.position,
            LogEntry::SchemaChange { position, .. } => *position,
        }
    }

    fn table(&self) -> &TableRef {
        match self {
            LogEntry::Change(event) => &event.table,
            LogEntry::SchemaChange { table, .. } => table,
        }
    }
}

struct TableState {
    schema: TableSchema,
    rows: Arc<BTreeMap<PrimaryKey, Row>>,
}

struct State {
    tables: HashMap<TableRef, TableState>,
    log: VecDeque<LogEntry>,
    last_mark: HighWaterMark,
    purged_through: HighWaterMark,
    /// Position of the newest purged entry, per table
    last_purged: HashMap<TableRef, LogPosition>,
    available: bool,
    snapshot_isolation: bool,
    /// Snapshot reads wait while set
    snapshots_paused: bool,
    closed: bool,
    /// Each new subscription pops one: fail after this many events
    pending_disconnects: VecDeque<usize>,
}

impl State {
    /// Whether an entry of `table` past `after` was purged.
    fn is_gap(&self, table: &TableRef, after: LogPosition) -> bool {
        self.last_purged
            .get(table)
            .is_some_and(|purged| *purged > after)
    }

    fn gap_error(&self, after: LogPosition) -> CdcError {
        CdcError::LogGap {
            requested: after.mark,
            purged_through: self.purged_through,
        }
    }

    fn table(&self, table: &TableRef) -> Result<&TableState> {
        self.tables
            .get(table)
            .ok_or_else(|| CdcError::schema(format!("table {} does not exist", table)))
    }
}

struct Shared {
    state: Mutex<State>,
    /// Bumped on every commit, purge and state change to wake subscriptions
    version: watch::Sender<u64>,
}

impl Shared {
    fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// In-memory database with a change log.
#[derive(Clone)]
pub struct MemorySource {
    shared: Arc<Shared>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    tables: HashMap::new(),
                    log: VecDeque::new(),
                    last_mark: HighWaterMark::ZERO,
                    purged_through: HighWaterMark::ZERO,
                    last_purged: HashMap::new(),
                    available: true,
                    snapshot_isolation: true,
                    snapshots_paused: false,
                    closed: false,
                    pending_disconnects: VecDeque::new(),
                }),
                version,
            }),
        }
    }

    pub fn create_table(&self, table: TableRef, schema: TableSchema) -> Result<()> {
        schema.validate()?;
        let mut state = self.shared.state.lock();
        if state.tables.contains_key(&table) {
            return Err(CdcError::schema(format!("table {} already exists", table)));
        }
        info!(table = %table, columns = schema.columns.len(), "Created table");
        state.tables.insert(
            table,
            TableState {
                schema,
                rows: Arc::new(BTreeMap::new()),
            },
        );
        Ok(())
    }

    /// Commit one transaction of row changes and return its mark.
    ///
    /// All changes are validated before any is applied: an insert of an
    /// existing key, or an update/delete of a missing one, aborts the whole
    /// transaction.
    pub fn commit(
        &self,
        table: &TableRef,
        ops: impl IntoIterator<Item = (ChangeOp, serde_json::Value)>,
    ) -> Result<HighWaterMark> {
        let mark = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CdcError::ConnectionClosed);
            }
            let table_state = state.table(table)?;

            let mut changes = Vec::new();
            let mut overlay: HashMap<PrimaryKey, bool> = HashMap::new();
            for (op, values) in ops {
                let row = Row::from_values(&table_state.schema, values)?;
                let exists = overlay
                    .get(&row.key)
                    .copied()
                    .unwrap_or_else(|| table_state.rows.contains_key(&row.key));
                match (op, exists) {
                    (ChangeOp::Insert, true) => {
                        return Err(CdcError::invalid_state(format!(
                            "duplicate primary key {} in {}",
                            row.key, table
                        )))
                    }
                    (ChangeOp::Update | ChangeOp::Delete, false) => {
                        return Err(CdcError::invalid_state(format!(
                            "no row with primary key {} in {}",
                            row.key, table
                        )))
                    }
                    _ => {}
                }
                overlay.insert(row.key.clone(), op != ChangeOp::Delete);
                changes.push((op, row));
            }
            if changes.is_empty() {
                return Err(CdcError::invalid_state("empty transaction"));
            }

            let mark = state.last_mark.next();
            state.last_mark = mark;
            let now = chrono::Utc::now().timestamp_millis();

            let mut entries = Vec::with_capacity(changes.len());
            if let Some(table_state) = state.tables.get_mut(table) {
                let rows = Arc::make_mut(&mut table_state.rows);
                for (seq, (op, row)) in changes.into_iter().enumerate() {
                    let position = LogPosition::new(mark, seq as u32);
                    match op {
                        ChangeOp::Insert | ChangeOp::Update => {
                            rows.insert(row.key.clone(), row.clone());
                        }
                        ChangeOp::Delete => {
                            rows.remove(&row.key);
                        }
                    }
                    let event = match op {
                        ChangeOp::Insert => ChangeEvent::insert(table.clone(), row, position),
                        ChangeOp::Update => ChangeEvent::update(table.clone(), row, position),
                        ChangeOp::Delete => ChangeEvent::delete(table.clone(), row, position),
                    };
                    entries.push(LogEntry::Change(event.with_timestamp(now)));
                }
            }
            state.log.extend(entries);
            mark
        };
        self.shared.notify();
        Ok(mark)
    }

    /// Insert rows in one transaction.
    pub fn insert(
        &self,
        table: &TableRef,
        rows: impl IntoIterator<Item = serde_json::Value>,
    ) -> Result<HighWaterMark> {
        self.commit(table, rows.into_iter().map(|v| (ChangeOp::Insert, v)))
    }

    /// Update rows in one transaction.
    pub fn update(
        &self,
        table: &TableRef,
        rows: impl IntoIterator<Item = serde_json::Value>,
    ) -> Result<HighWaterMark> {
        self.commit(table, rows.into_iter().map(|v| (ChangeOp::Update, v)))
    }

    /// Delete rows in one transaction. Each value must carry the key columns.
    pub fn delete(
        &self,
        table: &TableRef,
        rows: impl IntoIterator<Item = serde_json::Value>,
    ) -> Result<HighWaterMark> {
        self.commit(table, rows.into_iter().map(|v| (ChangeOp::Delete, v)))
    }

    /// Change a table's schema. Dropped columns are removed from stored rows.
    ///
    /// The change is committed to the log as its own transaction; a
    /// subscription reaching it fails with `SchemaChanged`.
    pub fn alter_table(&self, table: &TableRef, schema: TableSchema) -> Result<HighWaterMark> {
        schema.validate()?;
        let mark = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(CdcError::ConnectionClosed);
            }
            let previous = state.table(table)?.schema.clone();
            if previous.key_columns != schema.key_columns {
                return Err(CdcError::schema("primary key columns cannot be altered"));
            }
            let detail = previous.diff(&schema).join("; ");

            let mark = state.last_mark.next();
            state.last_mark = mark;
            if let Some(table_state) = state.tables.get_mut(table) {
                let keep: Vec<String> = schema.columns.iter().map(|c| c.name.clone()).collect();
                for row in Arc::make_mut(&mut table_state.rows).values_mut() {
                    if let Some(object) = row.values.as_object_mut() {
                        object.retain(|column, _| keep.contains(column));
                    }
                }
                table_state.schema = schema;
            }
            state.log.push_back(LogEntry::SchemaChange {
                table: table.clone(),
                position: LogPosition::start_of(mark),
                detail: detail.clone(),
            });
            info!(table = %table, mark = %mark, change = %detail, "Altered table");
            mark
        };
        self.shared.notify();
        Ok(mark)
    }

    /// Drop every log entry at or below `mark` (clamped to the last commit).
    pub fn purge_through(&self, mark: HighWaterMark) {
        {
            let mut state = self.shared.state.lock();
            let mark = mark.min(state.last_mark);
            let mut purged = 0usize;
            while state
                .log
                .front()
                .is_some_and(|entry| entry.position().mark <= mark)
            {
                if let Some(entry) = state.log.pop_front() {
                    state
                        .last_purged
                        .insert(entry.table().clone(), entry.position());
                    purged += 1;
                }
            }
            if mark > state.purged_through {
                state.purged_through = mark;
            }
            debug!(through = %mark, entries = purged, "Purged change log");
        }
        self.shared.notify();
    }

    /// Make the source unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.shared.state.lock().available = available;
        self.shared.notify();
    }

    /// Disable snapshot isolation: snapshots then fail with
    /// `IsolationViolation` instead of reading an unpinned table.
    pub fn set_snapshot_isolation(&self, enabled: bool) {
        self.shared.state.lock().snapshot_isolation = enabled;
    }

    /// Hold snapshot reads before they pin a table version, until resumed.
    pub fn set_snapshots_paused(&self, paused: bool) {
        self.shared.state.lock().snapshots_paused = paused;
        self.shared.notify();
    }

    /// The next subscription fails with `ConnectionClosed` after delivering
    /// `after_events` events.
    pub fn inject_disconnect(&self, after_events: usize) {
        self.shared
            .state
            .lock()
            .pending_disconnects
            .push_back(after_events);
    }

    /// Stop accepting writes. Subscriptions drain the log and end.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.notify();
        info!("Memory source closed");
    }

    pub fn current_mark(&self) -> HighWaterMark {
        self.shared.state.lock().last_mark
    }

    pub fn row_count(&self, table: &TableRef) -> Result<usize> {
        Ok(self.shared.state.lock().table(table)?.rows.len())
    }

    /// Current rows of `table` in key order.
    pub fn rows(&self, table: &TableRef) -> Result<Vec<Row>> {
        let rows = self.shared.state.lock().table(table)?.rows.clone();
        Ok(rows.values().cloned().collect())
    }

    /// Retained log entries.
    pub fn log_len(&self) -> usize {
        self.shared.state.lock().log.len()
    }
}

#[async_trait]
impl SnapshotSource for MemorySource {
    fn source_type(&self) -> &'static str {
        "memory"
    }

    async fn read_snapshot(&self, table: &TableRef) -> Result<SnapshotSet> {
        let mut version = self.shared.version.subscribe();
        loop {
            let paused = self.shared.state.lock().snapshots_paused;
            if !paused || version.changed().await.is_err() {
                break;
            }
        }

        let (schema, rows, mark) = {
            let state = self.shared.state.lock();
            if !state.available {
                return Err(CdcError::source_unavailable("memory source is unavailable"));
            }
            if !state.snapshot_isolation {
                return Err(CdcError::isolation_violation(
                    "source cannot pin a table version to a log mark",
                ));
            }
            let table_state = state.table(table)?;
            (
                table_state.schema.clone(),
                table_state.rows.clone(),
                state.last_mark,
            )
        };
        // Rows are copied outside the lock; writers fork the table instead.
        tokio::task::yield_now().await;
        SnapshotSet::new(table.clone(), schema, mark, rows.values().cloned())
    }

    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema> {
        let state = self.shared.state.lock();
        if !state.available {
            return Err(CdcError::source_unavailable("memory source is unavailable"));
        }
        Ok(state.table(table)?.schema.clone())
    }
}

#[async_trait]
impl ChangeLog for MemorySource {
    fn source_type(&self) -> &'static str {
        "memory"
    }

    async fn purged_through(&self) -> Result<HighWaterMark> {
        let state = self.shared.state.lock();
        if !state.available {
            return Err(CdcError::ConnectionClosed);
        }
        Ok(state.purged_through)
    }

    async fn subscribe(&self, table: &TableRef, after: LogPosition) -> Result<ChangeStream> {
        let disconnect_after = {
            let mut state = self.shared.state.lock();
            if !state.available {
                return Err(CdcError::ConnectionClosed);
            }
            state.table(table)?;
            if state.is_gap(table, after) {
                return Err(state.gap_error(after));
            }
            state.pending_disconnects.pop_front()
        };

        let shared = self.shared.clone();
        let table = table.clone();
        let mut version = shared.version.subscribe();

        let stream = async_stream::stream! {
            // Last delivered change of this table
            let mut cursor = after;
            // Last log entry examined, of any table
            let mut scanned = after;
            let mut delivered = 0usize;

            loop {
                version.borrow_and_update();
                let scan = {
                    let state = shared.state.lock();
                    if !state.available {
                        Err(CdcError::ConnectionClosed)
                    } else if state.is_gap(&table, cursor) {
                        Err(state.gap_error(cursor))
                    } else {
                        let start = state.log.partition_point(|e| e.position() <= scanned);
                        let window = state.log.range(start..).take(SCAN_BATCH);
                        let mut last = None;
                        let mut batch = Vec::new();
                        for entry in window {
                            last = Some(entry.position());
                            if entry.table() == &table {
                                batch.push(entry.clone());
                            }
                        }
                        Ok((batch, last, state.closed))
                    }
                };

                let (batch, last, closed) = match scan {
                    Ok(scan) => scan,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                let Some(last) = last else {
                    if closed || version.changed().await.is_err() {
                        break;
                    }
                    continue;
                };

                let mut failed = false;
                for entry in batch {
                    if disconnect_after.is_some_and(|n| delivered >= n) {
                        yield Err(CdcError::ConnectionClosed);
                        failed = true;
                        break;
                    }
                    match entry {
                        LogEntry::Change(event) => {
                            cursor = event.position;
                            delivered += 1;
                            yield Ok(event);
                        }
                        LogEntry::SchemaChange { table, detail, .. } => {
                            yield Err(CdcError::schema_changed(table.to_string(), detail));
                            failed = true;
                            break;
                        }
                    }
                }
                if failed {
                    break;
                }
                scanned = last;
            }
        };

        Ok(Box::pin(stream))
    }
}
