//! MySQL container for the snapshot source tests.

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::mysql::Mysql;
use tracing::{debug, info};

pub struct MySqlTestContainer {
    #[allow(dead_code)]
    container: ContainerAsync<Mysql>,
    host: String,
    port: u16,
}

impl MySqlTestContainer {
    /// Start MySQL with GTIDs enabled.
    pub async fn start() -> Result<Self> {
        info!("Starting MySQL test container...");

        let container = Mysql::default()
            .with_env_var("MYSQL_ROOT_PASSWORD", "rootpassword")
            .with_cmd(vec![
                "--server-id=1",
                "--log-bin=mysql-bin",
                "--binlog-format=ROW",
                "--gtid_mode=ON",
                "--enforce-gtid-consistency=ON",
                "--default-authentication-plugin=mysql_native_password",
            ])
            .start()
            .await
            .context("Failed to start MySQL container")?;

        let host = container.get_host().await?.to_string();
        let port = container.get_host_port_ipv4(3306).await?;
        info!("MySQL container started at {}:{}", host, port);

        let this = Self {
            container,
            host,
            port,
        };
        this.wait_ready().await?;
        Ok(this)
    }

    async fn wait_ready(&self) -> Result<()> {
        let started = std::time::Instant::now();
        loop {
            let pool = mysql_async::Pool::new(self.url("mysql").as_str());
            let attempt = async {
                let mut conn = pool.get_conn().await?;
                conn.query_drop("SELECT 1").await
            }
            .await;
            let _ = pool.disconnect().await;
            match attempt {
                Ok(()) => return Ok(()),
                Err(e) if started.elapsed() < Duration::from_secs(60) => {
                    debug!("MySQL not ready yet: {}", e);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e).context("MySQL did not become ready"),
            }
        }
    }

    pub fn url(&self, database: &str) -> String {
        format!(
            "mysql://root:rootpassword@{}:{}/{}",
            self.host, self.port, database
        )
    }

    /// Run statements in order on one connection.
    pub async fn execute_batch(&self, statements: &[&str]) -> Result<()> {
        let pool = mysql_async::Pool::new(self.url("mysql").as_str());
        let mut conn = pool.get_conn().await?;
        for statement in statements {
            conn.query_drop(*statement)
                .await
                .with_context(|| format!("failed: {}", statement))?;
        }
        drop(conn);
        pool.disconnect().await?;
        Ok(())
    }
}
