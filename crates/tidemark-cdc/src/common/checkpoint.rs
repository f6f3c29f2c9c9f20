//! # Checkpoint Store
//!
//! Per-table registration state that survives a connector restart.
//!
//! A checkpoint records the schema observed when the table was registered,
//! the snapshot mark once the snapshot is loaded, and the last applied log
//! position. On restart the connector compares the recorded schema with the
//! current one, so a schema change made while the connector was down (or
//! mid-snapshot) is detected rather than silently used.
//!
//! ## Usage
//!
//! ```ignore
//! use tidemark_cdc::common::{CheckpointStore, FileCheckpointStore};
//!
//! let store = FileCheckpointStore::new("/var/lib/tidemark/checkpoints").await?;
//! if let Some(cp) = store.load(&table).await? {
//!     println!("{} was in phase {:?}", table, cp.phase);
//! }
//! ```

use crate::common::{CdcError, HighWaterMark, LogPosition, Result, TableRef, TableSchema};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Lifecycle phase of a registered table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorPhase {
    /// Registered, snapshot not yet loaded into the view
    Snapshotting,
    /// Snapshot loaded, tailing the change log
    Streaming,
    /// Stopped on a fatal error; needs a fresh snapshot
    Failed,
}

/// Persisted state of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableCheckpoint {
    pub table: TableRef,
    pub source_type: String,
    pub phase: ConnectorPhase,
    /// Schema observed at registration
    pub schema: TableSchema,
    pub schema_fingerprint: String,
    pub snapshot_mark: Option<HighWaterMark>,
    pub applied_through: Option<LogPosition>,
    /// Fatal error that moved the table to `Failed`
    pub error: Option<String>,
    /// Last update (Unix epoch millis)
    pub updated_at: i64,
}

impl TableCheckpoint {
    /// Checkpoint written when a table is registered.
    pub fn registered(table: TableRef, source_type: &str, schema: TableSchema) -> Self {
        Self {
            table,
            source_type: source_type.to_string(),
            phase: ConnectorPhase::Snapshotting,
            schema_fingerprint: schema.fingerprint(),
            schema,
            snapshot_mark: None,
            applied_through: None,
            error: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Move to `Streaming` at `mark`.
    pub fn streaming(mut self, mark: HighWaterMark) -> Self {
        self.phase = ConnectorPhase::Streaming;
        self.snapshot_mark = Some(mark);
        self.applied_through = Some(LogPosition::end_of(mark));
        self.touch()
    }

    /// Record progress.
    pub fn applied(mut self, through: LogPosition) -> Self {
        self.applied_through = Some(through);
        self.touch()
    }

    /// Move to `Failed`.
    pub fn failed(mut self, error: &CdcError) -> Self {
        self.phase = ConnectorPhase::Failed;
        self.error = Some(error.to_string());
        self.touch()
    }

    fn touch(mut self) -> Self {
        self.updated_at = chrono::Utc::now().timestamp_millis();
        self
    }

    /// Fail with `SchemaChanged` when `current` differs from the recorded schema.
    pub fn check_schema(&self, current: &TableSchema) -> Result<()> {
        if current.fingerprint() == self.schema_fingerprint {
            return Ok(());
        }
        let mut changes = self.schema.diff(current);
        if changes.is_empty() {
            changes.push("schema fingerprint changed".to_string());
        }
        Err(CdcError::schema_changed(
            self.table.to_string(),
            changes.join("; "),
        ))
    }
}

/// Storage for table checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, table: &TableRef) -> Result<Option<TableCheckpoint>>;
    async fn save(&self, checkpoint: &TableCheckpoint) -> Result<()>;
    async fn delete(&self, table: &TableRef) -> Result<()>;
    async fn list(&self) -> Result<Vec<TableRef>>;
}

/// Shared checkpoint store.
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;

/// In-memory checkpoint store (for testing or when persistence isn't needed).
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: RwLock<HashMap<TableRef, TableCheckpoint>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, table: &TableRef) -> Result<Option<TableCheckpoint>> {
        Ok(self.checkpoints.read().await.get(table).cloned())
    }

    async fn save(&self, checkpoint: &TableCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.table.clone(), checkpoint.clone());
        Ok(())
    }

    async fn delete(&self, table: &TableRef) -> Result<()> {
        self.checkpoints.write().await.remove(table);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<TableRef>> {
        let mut tables: Vec<TableRef> = self.checkpoints.read().await.keys().cloned().collect();
        tables.sort();
        Ok(tables)
    }
}

/// One JSON file per table, replaced atomically on every save.
pub struct FileCheckpointStore {
    base_dir: PathBuf,
    fsync: bool,
}

impl FileCheckpointStore {
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        Self::with_options(base_dir, true).await
    }

    pub async fn with_options(base_dir: impl AsRef<Path>, fsync: bool) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir, fsync })
    }

    fn file_path(&self, table: &TableRef) -> Result<PathBuf> {
        let name = table.to_string();
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            return Err(CdcError::config(format!(
                "table {} cannot be used as a checkpoint file name",
                name
            )));
        }
        Ok(self.base_dir.join(format!("{}.json", name)))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, table: &TableRef) -> Result<Option<TableCheckpoint>> {
        let path = self.file_path(table)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, checkpoint: &TableCheckpoint) -> Result<()> {
        let path = self.file_path(&checkpoint.table)?;
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(checkpoint)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        fs::rename(&temp_path, &path).await?;

        debug!(
            table = %checkpoint.table,
            phase = ?checkpoint.phase,
            "Saved checkpoint"
        );
        Ok(())
    }

    async fn delete(&self, table: &TableRef) -> Result<()> {
        let path = self.file_path(table)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(table = %table, "Deleted checkpoint");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<TableRef>> {
        let mut entries = fs::read_dir(&self.base_dir).await?;
        let mut tables = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.extension().is_some_and(|e| e == "json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match TableRef::parse(stem) {
                Ok(table) => tables.push(table),
                Err(e) => warn!(file = %path.display(), error = %e, "Ignoring checkpoint file"),
            }
        }
        tables.sort();
        Ok(tables)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ColumnDef;
    use tempfile::tempdir;

    fn table() -> TableRef {
        TableRef::new("public", "schema_change_restart")
    }

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnDef::new("f1", "int", false),
                ColumnDef::new("f2", "int", true),
            ],
            vec!["f1".to_string()],
        )
    }

    #[test]
    fn test_checkpoint_transitions() {
        let cp = TableCheckpoint::registered(table(), "memory", schema());
        assert_eq!(cp.phase, ConnectorPhase::Snapshotting);
        assert_eq!(cp.snapshot_mark, None);

        let cp = cp.streaming(HighWaterMark::new(9));
        assert_eq!(cp.phase, ConnectorPhase::Streaming);
        assert_eq!(cp.applied_through, Some(LogPosition::end_of(HighWaterMark::new(9))));

        let through = LogPosition::new(HighWaterMark::new(12), 3);
        let cp = cp.applied(through);
        assert_eq!(cp.applied_through, Some(through));

        let cp = cp.failed(&CdcError::ConnectionClosed);
        assert_eq!(cp.phase, ConnectorPhase::Failed);
        assert_eq!(cp.error.as_deref(), Some("Connection closed"));
    }

    #[test]
    fn test_check_schema_detects_drop() {
        let cp = TableCheckpoint::registered(table(), "memory", schema());
        assert!(cp.check_schema(&schema()).is_ok());

        let mut altered = schema();
        altered.columns.retain(|c| c.name != "f2");
        match cp.check_schema(&altered) {
            Err(CdcError::SchemaChanged { table, detail }) => {
                assert_eq!(table, "public.schema_change_restart");
                assert!(detail.contains("column f2 dropped"));
            }
            other => panic!("expected SchemaChanged, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_checkpoint_store() {
        let store = MemoryCheckpointStore::new();
        let cp = TableCheckpoint::registered(table(), "memory", schema());

        store.save(&cp).await.unwrap();
        assert_eq!(store.load(&table()).await.unwrap(), Some(cp));
        assert_eq!(store.list().await.unwrap(), vec![table()]);

        store.delete(&table()).await.unwrap();
        assert_eq!(store.load(&table()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_checkpoint_store_survives_restart() {
        let dir = tempdir().unwrap();
        let cp = TableCheckpoint::registered(table(), "memory", schema())
            .streaming(HighWaterMark::new(77));
        {
            let store = FileCheckpointStore::new(dir.path()).await.unwrap();
            store.save(&cp).await.unwrap();
        }

        let store = FileCheckpointStore::new(dir.path()).await.unwrap();
        assert_eq!(store.load(&table()).await.unwrap(), Some(cp));
        assert_eq!(store.list().await.unwrap(), vec![table()]);
        assert!(!dir
            .path()
            .join("public.schema_change_restart.json.tmp")
            .exists());

        store.delete(&table()).await.unwrap();
        store.delete(&table()).await.unwrap();
        assert_eq!(store.load(&table()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_file_checkpoint_store_rejects_path_names() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::with_options(dir.path(), false)
            .await
            .unwrap();
        let bad = TableRef::new("../etc", "passwd");
        let cp = TableCheckpoint::registered(bad.clone(), "memory", schema());
        assert!(store.save(&cp).await.is_err());
        assert!(store.load(&bad).await.is_err());
    }
}
