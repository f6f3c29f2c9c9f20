//! # Consistency Oracle
//!
//! Verification-side check that a materialized view converges to a known
//! final state.
//!
//! The expected state is computed from the workload (initial rows plus rows
//! inserted concurrently with the snapshot). The oracle polls the observed
//! view until the count reaches the expected value and holds it for a number
//! of consecutive polls. Intermediate over- or under-counts are tolerated;
//! failing to converge within the bound is [`CdcError::ConsistencyTimeout`].

use crate::common::{CdcError, MergeHandle, PrimaryKey, Result, Row};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Read access to a materialized view.
#[async_trait]
pub trait ViewProbe: Send + Sync {
    /// Current number of rows in the view.
    async fn observed_count(&self) -> Result<u64>;

    /// Current rows of the view.
    async fn observed_rows(&self) -> Result<Vec<Row>>;
}

#[async_trait]
impl ViewProbe for MergeHandle {
    async fn observed_count(&self) -> Result<u64> {
        Ok(self.row_count())
    }

    async fn observed_rows(&self) -> Result<Vec<Row>> {
        self.rows().await
    }
}

/// Final state the view must converge to.
#[derive(Debug, Clone, Default)]
pub struct ExpectedState {
    pub row_count: u64,
    /// Exact rows, when the test knows them
    pub rows: Option<BTreeMap<PrimaryKey, Row>>,
}

impl ExpectedState {
    /// Expect `row_count` rows, content unchecked.
    pub fn count(row_count: u64) -> Self {
        Self {
            row_count,
            rows: None,
        }
    }

    /// Initial rows plus `txns` transactions of `txn_size` inserts each.
    pub fn from_workload(initial_rows: u64, txns: u64, txn_size: u64) -> Self {
        Self::count(initial_rows + txns * txn_size)
    }

    /// Expect exactly these rows.
    pub fn rows(rows: impl IntoIterator<Item = Row>) -> Self {
        let rows: BTreeMap<PrimaryKey, Row> =
            rows.into_iter().map(|r| (r.key.clone(), r)).collect();
        Self {
            row_count: rows.len() as u64,
            rows: Some(rows),
        }
    }
}

/// Polling bounds for the oracle.
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
    /// Consecutive polls that must observe the expected count
    pub stable_polls: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            stable_polls: 3,
        }
    }
}

impl OracleConfig {
    pub fn builder() -> OracleConfigBuilder {
        OracleConfigBuilder::default()
    }
}

/// Builder for OracleConfig.
#[derive(Default)]
pub struct OracleConfigBuilder {
    config: OracleConfig,
}

impl OracleConfigBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn stable_polls(mut self, polls: u32) -> Self {
        self.config.stable_polls = polls.max(1);
        self
    }

    pub fn build(self) -> OracleConfig {
        self.config
    }
}

/// Outcome of a successful convergence wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConvergenceReport {
    pub expected: u64,
    pub observed: u64,
    pub polls: u32,
    pub elapsed: Duration,
}

/// Row-level comparison of a converged view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    pub checked: u64,
    /// Expected keys absent from the view
    pub missing: Vec<PrimaryKey>,
    /// Keys in the view that were not expected
    pub unexpected: Vec<PrimaryKey>,
    /// Keys present on both sides with different payloads
    pub mismatched: Vec<PrimaryKey>,
}

impl VerificationReport {
    pub fn is_exact(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

/// Polls a [`ViewProbe`] until it converges.
#[derive(Debug, Clone, Default)]
pub struct ConsistencyOracle {
    config: OracleConfig,
}

impl ConsistencyOracle {
    pub fn new(config: OracleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Wait until the view holds `expected.row_count` rows.
    pub async fn await_convergence<P: ViewProbe + ?Sized>(
        &self,
        probe: &P,
        expected: &ExpectedState,
    ) -> Result<ConvergenceReport> {
        let started = Instant::now();
        let mut polls = 0u32;
        let mut stable = 0u32;
        let mut last_logged = None;

        loop {
            let observed = probe.observed_count().await?;
            polls += 1;

            if observed == expected.row_count {
                stable += 1;
                if stable >= self.config.stable_polls {
                    let report = ConvergenceReport {
                        expected: expected.row_count,
                        observed,
                        polls,
                        elapsed: started.elapsed(),
                    };
                    info!(
                        expected = report.expected,
                        polls = report.polls,
                        elapsed_ms = report.elapsed.as_millis() as u64,
                        "View converged"
                    );
                    return Ok(report);
                }
            } else {
                stable = 0;
                if last_logged != Some(observed) {
                    debug!(expected = expected.row_count, observed, "Waiting for convergence");
                    last_logged = Some(observed);
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                warn!(
                    expected = expected.row_count,
                    observed,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "View did not converge"
                );
                return Err(CdcError::ConsistencyTimeout {
                    expected: expected.row_count,
                    observed,
                    elapsed,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Compare the view's rows with the expected rows.
    pub async fn verify_rows<P: ViewProbe + ?Sized>(
        &self,
        probe: &P,
        expected: &ExpectedState,
    ) -> Result<VerificationReport> {
        let Some(expected_rows) = &expected.rows else {
            return Err(CdcError::config(
                "row verification needs an expected state built from rows",
            ));
        };

        let observed = probe.observed_rows().await?;
        let mut report = VerificationReport {
            checked: observed.len() as u64,
            ..Default::default()
        };
        let mut seen = BTreeMap::new();
        for row in &observed {
            seen.insert(&row.key, row);
            match expected_rows.get(&row.key) {
                None => report.unexpected.push(row.key.clone()),
                Some(want) if want != row => report.mismatched.push(row.key.clone()),
                Some(_) => {}
            }
        }
        report.missing = expected_rows
            .keys()
            .filter(|k| !seen.contains_key(k))
            .cloned()
            .collect();

        if !report.is_exact() {
            warn!(
                missing = report.missing.len(),
                unexpected = report.unexpected.len(),
                mismatched = report.mismatched.len(),
                "View content differs from expected rows"
            );
        }
        Ok(report)
    }

    /// Wait for convergence, then compare rows if they are known.
    pub async fn verify<P: ViewProbe + ?Sized>(
        &self,
        probe: &P,
        expected: &ExpectedState,
    ) -> Result<(ConvergenceReport, Option<VerificationReport>)> {
        let convergence = self.await_convergence(probe, expected).await?;
        let rows = match expected.rows {
            Some(_) => Some(self.verify_rows(probe, expected).await?),
            None => None,
        };
        Ok((convergence, rows))
    }
}
