//! MySQL Snapshot Source
//!
//! Reads a table inside a `REPEATABLE READ` transaction opened with
//! `WITH CONSISTENT SNAPSHOT` and stamps it with the `@@gtid_executed` set
//! captured in that same transaction.
//!
//! Starting the transaction and reading the GTID set are two statements, so
//! a write committed between them would be counted twice. A second
//! connection holds `LOCK TABLES ... READ` on the table for that window and
//! releases it as soon as the mark is captured; the row scan itself runs
//! without the lock.

use crate::common::{
    CdcError, ColumnDef, ConnectorConfig, GtidSet, HighWaterMark, Result, Row, SnapshotSet,
    SnapshotSource, SourceSettings, TableRef, TableSchema,
};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Pool, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Default `lock_wait_timeout` for the side connection, in seconds.
pub const DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 10;

/// MySQL implementation of [`SnapshotSource`].
pub struct MySqlSnapshotSource {
    pool: Arc<Pool>,
    lock_wait_timeout_secs: u64,
}

impl MySqlSnapshotSource {
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            lock_wait_timeout_secs: DEFAULT_LOCK_WAIT_TIMEOUT_SECS,
        }
    }

    /// Connect and check that the server answers queries.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = Pool::from_url(url)
            .map_err(|e| CdcError::config(format!("invalid MySQL URL: {}", e)))?;

        let mut conn = get_conn(&pool).await?;
        let _: Option<u8> = conn
            .query_first("SELECT 1")
            .await
            .map_err(|e| CdcError::source_unavailable(format!("MySQL query failed: {}", e)))?;
        drop(conn);

        info!("MySQL snapshot source connected");
        Ok(Self::new(Arc::new(pool)))
    }

    /// Connect to the source a connector configuration names.
    pub async fn from_config(config: &ConnectorConfig) -> Result<Self> {
        match &config.source {
            SourceSettings::Mysql {
                url,
                lock_wait_timeout_secs,
            } => Ok(Self::connect(url)
                .await?
                .with_lock_wait_timeout(*lock_wait_timeout_secs)),
            other => Err(CdcError::config(format!(
                "connector is configured for a {:?} source, not MySQL",
                other
            ))),
        }
    }

    /// Bound how long the side connection waits for its table lock.
    pub fn with_lock_wait_timeout(mut self, secs: u64) -> Self {
        self.lock_wait_timeout_secs = secs.max(1);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Open the snapshot transaction on `conn` and return its mark.
    ///
    /// The table lock is released on every path out of this function.
    async fn open_snapshot(&self, conn: &mut Conn, table: &TableRef) -> Result<HighWaterMark> {
        let mut lock_conn = get_conn(&self.pool).await?;
        lock_conn
            .query_drop(format!(
                "SET SESSION lock_wait_timeout = {}",
                self.lock_wait_timeout_secs
            ))
            .await
            .map_err(|e| CdcError::mysql(e.to_string()))?;
        lock_conn
            .query_drop(format!("LOCK TABLES {} READ", quote(table)))
            .await
            .map_err(|e| {
                CdcError::source_unavailable(format!("cannot lock {}: {}", table, e))
            })?;

        let opened = start_transaction(conn).await;

        if let Err(e) = lock_conn.query_drop("UNLOCK TABLES").await {
            warn!(table = %table, error = %e, "Failed to release snapshot lock");
        }
        opened
    }

    async fn read_rows(
        &self,
        conn: &mut Conn,
        table: &TableRef,
        schema: &TableSchema,
    ) -> Result<Vec<Row>> {
        let columns = schema
            .columns
            .iter()
            .map(|c| format!("`{}`", c.name.replace('`', "``")))
            .collect::<Vec<_>>()
            .join(", ");

        let rows: Vec<mysql_async::Row> = conn
            .query(format!("SELECT {} FROM {}", columns, quote(table)))
            .await
            .map_err(|e| CdcError::mysql(format!("snapshot read of {} failed: {}", table, e)))?;

        rows.into_iter()
            .map(|row| {
                let mut values = serde_json::Map::with_capacity(schema.columns.len());
                for (idx, column) in schema.columns.iter().enumerate() {
                    values.insert(
                        column.name.clone(),
                        column_value(row.as_ref(idx), &column.data_type),
                    );
                }
                Row::from_values(schema, serde_json::Value::Object(values))
            })
            .collect()
    }
}

#[async_trait]
impl SnapshotSource for MySqlSnapshotSource {
    fn source_type(&self) -> &'static str {
        "mysql"
    }

    async fn read_snapshot(&self, table: &TableRef) -> Result<SnapshotSet> {
        let started = Instant::now();
        let mut conn = get_conn(&self.pool).await?;

        let mark = self.open_snapshot(&mut conn, table).await?;
        debug!(table = %table, mark = %mark, "Snapshot transaction opened");

        let result = async {
            let schema = load_schema(&mut conn, table).await?;
            let rows = self.read_rows(&mut conn, table, &schema).await?;
            SnapshotSet::new(table.clone(), schema, mark, rows)
        }
        .await;

        if let Err(e) = conn.query_drop("COMMIT").await {
            warn!(table = %table, error = %e, "Failed to end snapshot transaction");
        }

        let snapshot = result?;
        info!(
            table = %table,
            rows = snapshot.len(),
            mark = %mark,
            duration_ms = started.elapsed().as_millis() as u64,
            "MySQL snapshot read"
        );
        Ok(snapshot)
    }

    async fn describe_table(&self, table: &TableRef) -> Result<TableSchema> {
        let mut conn = get_conn(&self.pool).await?;
        load_schema(&mut conn, table).await
    }
}

async fn get_conn(pool: &Pool) -> Result<Conn> {
    pool.get_conn()
        .await
        .map_err(|e| CdcError::source_unavailable(format!("MySQL connection failed: {}", e)))
}

async fn start_transaction(conn: &mut Conn) -> Result<HighWaterMark> {
    conn.query_drop("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .await
        .map_err(|e| CdcError::isolation_violation(format!("cannot set isolation: {}", e)))?;
    conn.query_drop("START TRANSACTION WITH CONSISTENT SNAPSHOT, READ ONLY")
        .await
        .map_err(|e| {
            CdcError::isolation_violation(format!("cannot start consistent snapshot: {}", e))
        })?;

    let isolation: Option<String> = conn
        .query_first("SELECT @@transaction_isolation")
        .await
        .map_err(|e| CdcError::mysql(e.to_string()))?;
    if isolation.as_deref() != Some("REPEATABLE-READ") {
        return Err(CdcError::isolation_violation(format!(
            "snapshot transaction runs at {:?}",
            isolation
        )));
    }

    let executed: Option<String> = conn
        .query_first("SELECT @@gtid_executed")
        .await
        .map_err(|e| CdcError::mysql(e.to_string()))?;
    let executed = executed.unwrap_or_default();
    if executed.trim().is_empty() {
        return Err(CdcError::isolation_violation(
            "gtid_executed is empty; GTID mode must be enabled",
        ));
    }
    GtidSet::parse(&executed)?.to_mark()
}

async fn load_schema(conn: &mut Conn, table: &TableRef) -> Result<TableSchema> {
    let columns: Vec<(String, String, String)> = conn
        .exec(
            r"SELECT COLUMN_NAME, DATA_TYPE, IS_NULLABLE
              FROM INFORMATION_SCHEMA.COLUMNS
              WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
              ORDER BY ORDINAL_POSITION",
            (table.schema.as_str(), table.table.as_str()),
        )
        .await
        .map_err(|e| CdcError::mysql(format!("failed to read columns of {}: {}", table, e)))?;

    if columns.is_empty() {
        return Err(CdcError::schema(format!("table {} does not exist", table)));
    }

    let key_columns: Vec<String> = conn
        .exec(
            r"SELECT COLUMN_NAME
              FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE
              WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY'
              ORDER BY ORDINAL_POSITION",
            (table.schema.as_str(), table.table.as_str()),
        )
        .await
        .map_err(|e| CdcError::mysql(format!("failed to read key of {}: {}", table, e)))?;

    let schema = TableSchema::new(
        columns
            .into_iter()
            .map(|(name, data_type, nullable)| ColumnDef::new(name, data_type, nullable == "YES"))
            .collect(),
        key_columns,
    );
    schema.validate()?;
    Ok(schema)
}

fn quote(table: &TableRef) -> String {
    format!(
        "`{}`.`{}`",
        table.schema.replace('`', "``"),
        table.table.replace('`', "``")
    )
}

/// Integer column types whose text-protocol values become JSON numbers.
fn is_integer_type(data_type: &str) -> bool {
    matches!(
        data_type.to_ascii_lowercase().as_str(),
        "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year"
    )
}

fn column_value(value: Option<&Value>, data_type: &str) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        None | Some(Value::NULL) => Json::Null,
        Some(Value::Int(n)) => Json::from(*n),
        Some(Value::UInt(n)) => Json::from(*n),
        Some(Value::Float(n)) => serde_json::Number::from_f64(f64::from(*n))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Some(Value::Double(n)) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Some(Value::Bytes(bytes)) => match std::str::from_utf8(bytes) {
            // Text protocol: integers arrive as their decimal text.
            Ok(text) if is_integer_type(data_type) => text
                .parse::<i64>()
                .map(Json::from)
                .or_else(|_| text.parse::<u64>().map(Json::from))
                .unwrap_or_else(|_| Json::String(text.to_string())),
            Ok(text) => Json::String(text.to_string()),
            Err(_) => Json::Array(bytes.iter().map(|b| Json::from(*b)).collect()),
        },
        Some(Value::Date(year, month, day, hour, min, sec, micro)) => Json::String(format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}",
            year, month, day, hour, min, sec, micro
        )),
        Some(Value::Time(neg, days, hours, mins, secs, micro)) => {
            let sign = if *neg { "-" } else { "" };
            Json::String(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign,
                days * 24 + u32::from(*hours),
                mins,
                secs,
                micro
            ))
        }
    }
}
