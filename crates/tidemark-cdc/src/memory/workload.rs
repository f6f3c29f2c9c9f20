//! Insert workloads for the `many_inserts` table.
//!
//! A workload is `txns` transactions of `txn_size` inserts each. Primary
//! keys are assigned consecutively like an auto-increment column and `f2`
//! counts from 1 inside every transaction.

use super::MemorySource;
use crate::common::{ColumnDef, HighWaterMark, Result, TableRef, TableSchema};
use serde_json::{json, Value};
use tracing::debug;

/// Schema of the `many_inserts` table: `(pk BIGINT PRIMARY KEY, f2 BIGINT)`.
pub fn many_inserts_schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnDef::new("pk", "bigint", false),
            ColumnDef::new("f2", "bigint", true),
        ],
        vec!["pk".to_string()],
    )
}

/// Build a workload of `txns` transactions with `txn_size` rows each.
pub fn make_inserts(txns: u64, txn_size: u64) -> InsertWorkload {
    InsertWorkload {
        txns,
        txn_size,
        first_pk: 1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertWorkload {
    txns: u64,
    txn_size: u64,
    first_pk: u64,
}

impl InsertWorkload {
    /// Continue key assignment at `pk`.
    pub fn starting_at(mut self, pk: u64) -> Self {
        self.first_pk = pk;
        self
    }

    /// Rows inserted by the whole workload.
    pub fn records(&self) -> u64 {
        self.txns * self.txn_size
    }

    pub fn txns(&self) -> u64 {
        self.txns
    }

    pub fn txn_size(&self) -> u64 {
        self.txn_size
    }

    /// First key not used by this workload.
    pub fn next_pk(&self) -> u64 {
        self.first_pk + self.records()
    }

    /// The workload that follows this one without key collisions.
    pub fn then(&self, txns: u64, txn_size: u64) -> InsertWorkload {
        make_inserts(txns, txn_size).starting_at(self.next_pk())
    }

    /// Row values of each transaction, generated lazily.
    pub fn transactions(&self) -> impl Iterator<Item = Vec<Value>> {
        let InsertWorkload {
            txns,
            txn_size,
            first_pk,
        } = *self;
        (0..txns).map(move |txn| {
            let base = first_pk + txn * txn_size;
            (0..txn_size)
                .map(|i| json!({ "pk": base + i, "f2": i + 1 }))
                .collect()
        })
    }

    /// Commit every transaction and return the mark of the last one.
    pub fn run(&self, source: &MemorySource, table: &TableRef) -> Result<HighWaterMark> {
        let mut last = source.current_mark();
        for rows in self.transactions() {
            last = source.insert(table, rows)?;
        }
        debug!(table = %table, records = self.records(), through = %last, "Workload committed");
        Ok(last)
    }

    /// Like [`run`](Self::run), yielding to the runtime between
    /// transactions so that readers interleave with the writer.
    pub async fn run_interleaved(
        &self,
        source: &MemorySource,
        table: &TableRef,
    ) -> Result<HighWaterMark> {
        let mut last = source.current_mark();
        for rows in self.transactions() {
            last = source.insert(table, rows)?;
            tokio::task::yield_now().await;
        }
        debug!(table = %table, records = self.records(), through = %last, "Workload committed");
        Ok(last)
    }
}
