//! View assertions.

use pretty_assertions::assert_eq;
use std::time::Duration;
use tidemark_cdc::common::VerificationReport;
use tidemark_cdc::memory::MemorySource;
use tidemark_cdc::{ConsistencyOracle, ExpectedState, MergeHandle, OracleConfig, TableRef};

/// Oracle polling every 20ms for up to `timeout`.
pub fn fast_oracle(timeout: Duration) -> ConsistencyOracle {
    ConsistencyOracle::new(
        OracleConfig::builder()
            .timeout(timeout)
            .poll_interval(Duration::from_millis(20))
            .stable_polls(3)
            .build(),
    )
}

/// Compare the view row by row with the source's current table.
pub async fn assert_view_matches_source(
    merge: &MergeHandle,
    source: &MemorySource,
    table: &TableRef,
) -> VerificationReport {
    let expected = ExpectedState::rows(source.rows(table).expect("source rows"));
    let report = fast_oracle(Duration::from_secs(30))
        .verify_rows(merge, &expected)
        .await
        .expect("verify rows");

    assert_eq!(report.missing, Vec::new(), "rows missing from the view");
    assert_eq!(report.unexpected, Vec::new(), "rows the source does not have");
    assert_eq!(report.mismatched, Vec::new(), "rows with stale content");
    report
}
