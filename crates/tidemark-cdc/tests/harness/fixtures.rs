//! Memory-backed fixtures.

use std::sync::Arc;
use std::time::Duration;
use tidemark_cdc::common::{SharedCheckpointStore, TailConfig};
use tidemark_cdc::memory::{many_inserts_schema, InsertWorkload, MemorySource};
use tidemark_cdc::{Connector, HighWaterMark, MemoryCheckpointStore, TableRef};
use tokio::task::JoinHandle;

/// Table used by the insert scenarios.
pub const MANY_INSERTS: (&str, &str) = ("public", "many_inserts");

/// A memory source holding the `many_inserts` table.
pub struct MemoryTable {
    pub source: MemorySource,
    pub table: TableRef,
}

impl MemoryTable {
    pub fn new() -> Self {
        let source = MemorySource::new();
        let table = TableRef::new(MANY_INSERTS.0, MANY_INSERTS.1);
        source
            .create_table(table.clone(), many_inserts_schema())
            .expect("create many_inserts");
        Self { source, table }
    }

    /// Commit `workload` before anything reads the table.
    pub fn preload(&self, workload: &InsertWorkload) -> HighWaterMark {
        workload
            .run(&self.source, &self.table)
            .expect("initial load")
    }

    /// Run `workload` on a background task, interleaved with the test.
    pub fn spawn_writer(
        &self,
        workload: InsertWorkload,
    ) -> JoinHandle<tidemark_cdc::Result<HighWaterMark>> {
        let source = self.source.clone();
        let table = self.table.clone();
        tokio::spawn(async move { workload.run_interleaved(&source, &table).await })
    }

    /// Connector over this source with quick retries and checkpoints.
    pub fn connector(&self, checkpoints: SharedCheckpointStore) -> Connector {
        Connector::new(
            Arc::new(self.source.clone()),
            Arc::new(self.source.clone()),
            checkpoints,
        )
        .with_tail_config(
            TailConfig::builder()
                .max_retries(5)
                .retry_initial(Duration::from_millis(5))
                .retry_max(Duration::from_millis(50))
                .build(),
        )
        .with_checkpoint_interval(Duration::from_millis(20))
    }

    pub fn memory_connector(&self) -> (Connector, Arc<MemoryCheckpointStore>) {
        let store = Arc::new(MemoryCheckpointStore::new());
        (self.connector(store.clone()), store)
    }
}

impl Default for MemoryTable {
    fn default() -> Self {
        Self::new()
    }
}
