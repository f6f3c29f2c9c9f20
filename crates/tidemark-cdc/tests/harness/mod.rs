//! Test harness for tidemark-cdc integration tests
//!
//! Features:
//! - In-memory `many_inserts` table with a background insert workload
//! - Connector wiring with fast checkpoint and retry settings
//! - View assertions against the source's final contents
//! - MySQL container lifecycle (feature `mysql`)

#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;
#[cfg(feature = "mysql")]
pub mod mysql;

pub use assertions::{assert_view_matches_source, fast_oracle};
pub use fixtures::{MemoryTable, MANY_INSERTS};

use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("tidemark_cdc=debug".parse().unwrap())
                    .add_directive("testcontainers=info".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}
