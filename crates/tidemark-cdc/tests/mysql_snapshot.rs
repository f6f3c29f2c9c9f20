//! MySQL snapshot source tests
//!
//! Run with: cargo test -p tidemark-cdc --features mysql --test mysql_snapshot -- --ignored --test-threads=1 --nocapture
//!
//! Requirements: Docker must be running for testcontainers.

#![cfg(feature = "mysql")]

mod harness;

use harness::init_test_logging;
use harness::mysql::MySqlTestContainer;
use mysql_async::prelude::Queryable;
use serial_test::serial;
use std::sync::Arc;
use tidemark_cdc::mysql::MySqlSnapshotSource;
use tidemark_cdc::{HighWaterMark, SnapshotConfig, SnapshotReader, SnapshotSource, TableRef};

async fn many_inserts_container() -> anyhow::Result<MySqlTestContainer> {
    let container = MySqlTestContainer::start().await?;
    container
        .execute_batch(&[
            "DROP DATABASE IF EXISTS public",
            "CREATE DATABASE public",
            "CREATE TABLE public.many_inserts (pk SERIAL PRIMARY KEY, f2 BIGINT)",
        ])
        .await?;
    Ok(container)
}

#[tokio::test]
#[serial]
#[ignore = "Requires Docker - run explicitly with --ignored"]
async fn test_snapshot_reads_table_at_gtid_mark() -> anyhow::Result<()> {
    init_test_logging();
    let container = many_inserts_container().await?;

    let source = MySqlSnapshotSource::connect(&container.url("public")).await?;
    let mut conn = source.pool().get_conn().await?;
    conn.query_drop("INSERT INTO many_inserts (f2) VALUES (1), (2), (3)")
        .await?;
    drop(conn);

    let table = TableRef::new("public", "many_inserts");
    let schema = source.describe_table(&table).await?;
    assert_eq!(schema.key_columns, vec!["pk".to_string()]);
    assert_eq!(schema.columns.len(), 2);

    let reader = SnapshotReader::new(Arc::new(source), SnapshotConfig::default());
    let (snapshot, mark) = reader.begin_snapshot(&table).await?;
    assert_eq!(snapshot.len(), 3);
    assert!(mark > HighWaterMark::ZERO);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
#[ignore = "Requires Docker - run explicitly with --ignored"]
async fn test_snapshot_during_concurrent_inserts() -> anyhow::Result<()> {
    init_test_logging();
    let container = many_inserts_container().await?;

    let source = Arc::new(MySqlSnapshotSource::connect(&container.url("public")).await?);
    let mut conn = source.pool().get_conn().await?;
    conn.query_drop("INSERT INTO many_inserts (f2) SELECT 1 FROM DUAL").await?;
    for _ in 0..12 {
        conn.query_drop("INSERT INTO many_inserts (f2) SELECT f2 FROM many_inserts")
            .await?;
    }
    let initial: Option<u64> = conn.query_first("SELECT COUNT(*) FROM many_inserts").await?;
    drop(conn);

    // 100 single-statement transactions of 10 rows each.
    let pool = source.pool().clone();
    let writer = tokio::spawn(async move {
        let mut conn = pool.get_conn().await?;
        for i in 0..100 {
            conn.query_drop(format!(
                "INSERT INTO many_inserts (f2) VALUES {}",
                (0..10).map(|j| format!("({})", i * 10 + j)).collect::<Vec<_>>().join(", ")
            ))
            .await?;
        }
        Ok::<_, mysql_async::Error>(())
    });

    let reader = SnapshotReader::new(source.clone(), SnapshotConfig::default());
    let table = TableRef::new("public", "many_inserts");
    let (snapshot, mark) = reader.begin_snapshot(&table).await?;
    writer.await??;

    // Writer transactions are seen whole or not at all.
    let initial = initial.unwrap_or_default();
    let seen = snapshot.len() as u64;
    assert!(seen >= initial);
    assert_eq!((seen - initial) % 10, 0);
    assert!((seen - initial) / 10 <= 100);
    assert!(mark > HighWaterMark::ZERO);
    Ok(())
}
