//! # Log Tailer
//!
//! Streams committed changes for one table starting strictly after a
//! position, typically the snapshot's high-water mark.
//!
//! The delivered stream is strictly increasing in [`LogPosition`]:
//!
//! - events at or before the start position are never emitted, so nothing
//!   the snapshot already contains is counted twice;
//! - transient subscription failures resubscribe from the last delivered
//!   position after an exponential backoff, so nothing is skipped;
//! - a purged start position fails with [`CdcError::LogGap`]. The tailer
//!   never jumps forward to the oldest retained position.

use crate::common::{
    CdcError, ChangeEvent, ExponentialBackoff, HighWaterMark, LogPosition, Result, SharedMetrics,
    TableRef,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Boxed stream of change events.
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Subscribable change log of a source.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Source type name used in logs and metrics.
    fn source_type(&self) -> &'static str;

    /// Highest transaction mark no longer retained. `ZERO` when nothing has
    /// been purged.
    async fn purged_through(&self) -> Result<HighWaterMark>;

    /// Subscribe to changes of `table` committed strictly after `after`.
    ///
    /// Fails with `LogGap` when any of those changes has been purged. The
    /// stream waits for new commits and ends only when the source shuts
    /// down. Dropping it releases the subscription.
    async fn subscribe(&self, table: &TableRef, after: LogPosition) -> Result<ChangeStream>;
}

/// Fail with `LogGap` when changes after `after` are no longer retained.
///
/// Works at transaction granularity: a purge that reaches the transaction
/// of a mid-transaction position counts as a gap.
pub async fn check_retention<L: ChangeLog + ?Sized>(log: &L, after: LogPosition) -> Result<()> {
    let purged_through = log.purged_through().await?;
    if purged_through > HighWaterMark::ZERO && after.next_needed_mark() <= purged_through {
        return Err(CdcError::LogGap {
            requested: after.mark,
            purged_through,
        });
    }
    Ok(())
}

/// Configuration for the log tailer.
#[derive(Debug, Clone)]
pub struct TailConfig {
    /// Resubscription attempts allowed between two delivered events
    pub max_retries: u32,
    /// First retry delay
    pub retry_initial: Duration,
    /// Retry delay cap
    pub retry_max: Duration,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_secs(30),
        }
    }
}

impl TailConfig {
    pub fn builder() -> TailConfigBuilder {
        TailConfigBuilder::default()
    }
}

/// Builder for TailConfig.
#[derive(Default)]
pub struct TailConfigBuilder {
    config: TailConfig,
}

impl TailConfigBuilder {
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_initial(mut self, delay: Duration) -> Self {
        self.config.retry_initial = delay;
        self
    }

    pub fn retry_max(mut self, delay: Duration) -> Self {
        self.config.retry_max = delay;
        self
    }

    pub fn build(self) -> TailConfig {
        self.config
    }
}

/// Tails a [`ChangeLog`] from a known position.
pub struct LogTailer<L: ChangeLog + ?Sized> {
    log: Arc<L>,
    config: TailConfig,
    metrics: Option<SharedMetrics>,
}

impl<L: ChangeLog + ?Sized + 'static> LogTailer<L> {
    pub fn new(log: Arc<L>, config: TailConfig) -> Self {
        Self {
            log,
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Tail every change committed after the transaction at `from_mark`.
    pub async fn tail(&self, table: &TableRef, from_mark: HighWaterMark) -> Result<ChangeStream> {
        self.tail_from_position(table, LogPosition::end_of(from_mark))
            .await
    }

    /// Tail every change after `after`, which may sit inside a transaction.
    ///
    /// Retention is checked and the first subscription opened before this
    /// returns, so a `LogGap` surfaces here rather than on the stream.
    pub async fn tail_from_position(
        &self,
        table: &TableRef,
        after: LogPosition,
    ) -> Result<ChangeStream> {
        check_retention(self.log.as_ref(), after).await?;
        let first = self.log.subscribe(table, after).await?;

        info!(
            table = %table,
            source = self.log.source_type(),
            after = %after,
            "Tailing change log"
        );

        let log = self.log.clone();
        let table = table.clone();
        let metrics = self.metrics.clone();
        let max_retries = self.config.max_retries;
        let mut backoff = ExponentialBackoff::new(self.config.retry_initial, self.config.retry_max);

        let stream = async_stream::stream! {
            let mut inner: Option<ChangeStream> = Some(first);
            let mut last = after;
            let mut retries = 0u32;

            loop {
                if inner.is_none() {
                    match log.subscribe(&table, last).await {
                        Ok(s) => {
                            debug!(table = %table, after = %last, "Resubscribed to change log");
                            inner = Some(s);
                        }
                        Err(e) if e.is_retriable() && retries < max_retries => {
                            retries += 1;
                            let delay = backoff.next_backoff();
                            warn!(
                                table = %table,
                                error = %e,
                                attempt = retries,
                                ?delay,
                                "Resubscribe failed, retrying"
                            );
                            if let Some(m) = &metrics {
                                m.record_tail_retry();
                            }
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(e) => {
                            error!(table = %table, error = %e, "Change log tail failed");
                            yield Err(e);
                            break;
                        }
                    }
                }
                let Some(current) = inner.as_mut() else {
                    continue;
                };

                let next = current.next().await;
                match next {
                    Some(Ok(event)) => {
                        if event.position <= last {
                            debug!(
                                table = %table,
                                position = %event.position,
                                "Dropping replayed change"
                            );
                            if let Some(m) = &metrics {
                                m.record_replayed();
                            }
                            continue;
                        }
                        last = event.position;
                        retries = 0;
                        backoff.reset();
                        if let Some(m) = &metrics {
                            m.record_delivered();
                        }
                        yield Ok(event);
                    }
                    Some(Err(e)) if e.is_retriable() && retries < max_retries => {
                        retries += 1;
                        inner = None;
                        let delay = backoff.next_backoff();
                        warn!(
                            table = %table,
                            error = %e,
                            attempt = retries,
                            after = %last,
                            ?delay,
                            "Transient change log error, resubscribing"
                        );
                        if let Some(m) = &metrics {
                            m.record_tail_retry();
                        }
                        tokio::time::sleep(delay).await;
                    }
                    Some(Err(e)) => {
                        error!(table = %table, error = %e, after = %last, "Change log tail failed");
                        if let Some(m) = &metrics {
                            m.record_error(e.category());
                        }
                        yield Err(e);
                        break;
                    }
                    None => {
                        info!(table = %table, after = %last, "Change log closed");
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{CdcMetrics, Row};
    use serde_json::json;
    use std::sync::Mutex;

    fn table() -> TableRef {
        TableRef::new("public", "t")
    }

    fn event(mark: u64, seq: u32, pk: u64) -> ChangeEvent {
        ChangeEvent::insert(
            table(),
            Row::new(pk, json!({"pk": pk})),
            LogPosition::new(HighWaterMark::new(mark), seq),
        )
    }

    /// Finite log with scripted misbehaviour.
    #[derive(Default)]
    struct ScriptedLog {
        events: Vec<ChangeEvent>,
        purged_through: u64,
        /// Fail each of the first N subscriptions after this many events
        fail_after: Option<usize>,
        failures_left: Mutex<u32>,
        /// Ignore `after` and replay the whole log
        replay_all: bool,
        subscriptions: Mutex<Vec<LogPosition>>,
    }

    #[async_trait]
    impl ChangeLog for ScriptedLog {
        fn source_type(&self) -> &'static str {
            "scripted"
        }

        async fn purged_through(&self) -> Result<HighWaterMark> {
            Ok(HighWaterMark::new(self.purged_through))
        }

        async fn subscribe(&self, _table: &TableRef, after: LogPosition) -> Result<ChangeStream> {
            self.subscriptions.lock().unwrap().push(after);
            let mut items: Vec<Result<ChangeEvent>> = self
                .events
                .iter()
                .filter(|e| self.replay_all || e.position > after)
                .cloned()
                .map(Ok)
                .collect();
            let mut failures = self.failures_left.lock().unwrap();
            if let Some(n) = self.fail_after {
                if *failures > 0 && n < items.len() {
                    *failures -= 1;
                    items.truncate(n);
                    items.push(Err(CdcError::ConnectionClosed));
                }
            }
            Ok(Box::pin(futures::stream::iter(items)))
        }
    }

    async fn collect(stream: ChangeStream) -> Vec<Result<ChangeEvent>> {
        stream.collect().await
    }

    fn fast_retries() -> TailConfig {
        TailConfig::builder()
            .retry_initial(Duration::from_millis(1))
            .retry_max(Duration::from_millis(5))
            .build()
    }

    #[tokio::test]
    async fn test_tail_starts_strictly_after_mark() {
        let log = ScriptedLog {
            events: vec![event(3, 0, 1), event(4, 0, 2), event(4, 1, 3), event(5, 0, 4)],
            ..Default::default()
        };
        let tailer = LogTailer::new(Arc::new(log), TailConfig::default());

        let events = collect(tailer.tail(&table(), HighWaterMark::new(4)).await.unwrap()).await;
        let marks: Vec<u64> = events
            .iter()
            .map(|e| e.as_ref().unwrap().mark().value())
            .collect();
        assert_eq!(marks, vec![5]);
    }

    #[tokio::test]
    async fn test_tail_from_position_resumes_mid_transaction() {
        let log = ScriptedLog {
            events: vec![event(4, 0, 1), event(4, 1, 2), event(4, 2, 3)],
            ..Default::default()
        };
        let tailer = LogTailer::new(Arc::new(log), TailConfig::default());

        let after = LogPosition::new(HighWaterMark::new(4), 0);
        let events = collect(tailer.tail_from_position(&table(), after).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().position.sequence, 1);
    }

    #[tokio::test]
    async fn test_replayed_events_are_dropped() {
        let metrics = Arc::new(CdcMetrics::new("scripted", "public.t"));
        let log = ScriptedLog {
            events: vec![event(1, 0, 1), event(2, 0, 2), event(3, 0, 3)],
            replay_all: true,
            ..Default::default()
        };
        let tailer =
            LogTailer::new(Arc::new(log), TailConfig::default()).with_metrics(metrics.clone());

        let events = collect(tailer.tail(&table(), HighWaterMark::new(2)).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().mark(), HighWaterMark::new(3));
        assert_eq!(metrics.snapshot().events_replayed, 2);
        assert_eq!(metrics.snapshot().events_delivered, 1);
    }

    #[tokio::test]
    async fn test_purged_start_is_log_gap() {
        let log = ScriptedLog {
            events: vec![event(50, 0, 1)],
            purged_through: 42,
            ..Default::default()
        };
        let tailer = LogTailer::new(Arc::new(log), TailConfig::default());

        match tailer.tail(&table(), HighWaterMark::new(10)).await {
            Err(CdcError::LogGap {
                requested,
                purged_through,
            }) => {
                assert_eq!(requested, HighWaterMark::new(10));
                assert_eq!(purged_through, HighWaterMark::new(42));
            }
            other => panic!("expected LogGap, got {:?}", other.map(|_| ())),
        }

        // The transaction right after the purge point is still retained.
        assert!(tailer.tail(&table(), HighWaterMark::new(42)).await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_error_resubscribes_from_last_delivered() {
        let log = Arc::new(ScriptedLog {
            events: (1..=6).map(|m| event(m, 0, m)).collect(),
            fail_after: Some(2),
            failures_left: Mutex::new(1),
            ..Default::default()
        });
        let tailer = LogTailer::new(log.clone(), fast_retries());

        let events = collect(tailer.tail(&table(), HighWaterMark::ZERO).await.unwrap()).await;
        let marks: Vec<u64> = events
            .iter()
            .map(|e| e.as_ref().unwrap().mark().value())
            .collect();
        assert_eq!(marks, vec![1, 2, 3, 4, 5, 6]);

        let subs = log.subscriptions.lock().unwrap().clone();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[1], LogPosition::new(HighWaterMark::new(2), 0));
    }

    #[tokio::test]
    async fn test_retries_exhausted_surfaces_error() {
        let log = ScriptedLog {
            events: (1..=3).map(|m| event(m, 0, m)).collect(),
            fail_after: Some(0),
            failures_left: Mutex::new(100),
            ..Default::default()
        };
        let config = TailConfig::builder()
            .max_retries(2)
            .retry_initial(Duration::from_millis(1))
            .build();
        let tailer = LogTailer::new(Arc::new(log), config);

        let events = collect(tailer.tail(&table(), HighWaterMark::ZERO).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(CdcError::ConnectionClosed)));
    }
}
