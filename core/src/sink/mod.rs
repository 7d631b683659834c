pub mod cassandra;
pub mod memory;

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ProcessingConfig;
use crate::errors::WriteError;
use crate::model::{Batch, SaleRow};

/// The destination column store.
///
/// `bulk_upsert` must be idempotent per row key: writing the same rows again leaves the
/// store unchanged.
#[trait_variant::make(Send)]
pub trait SaleSink: Send + Sync + 'static {
    async fn bulk_upsert(&self, rows: &[SaleRow]) -> Result<(), WriteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            initial_backoff: Duration::from_millis(config.retry_delay_ms),
            max_backoff: Duration::from_millis(config.max_retry_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, doubling from the initial backoff.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Writes batches to a [`SaleSink`], retrying transient failures with exponential backoff.
pub struct SinkWriter<K> {
    sink: K,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl<K: SaleSink> SinkWriter<K> {
    pub fn new(sink: K, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            sink,
            policy,
            cancel,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Writes all rows of `batch` and returns the number of attempts it took.
    ///
    /// An attempt in progress is never abandoned. Shutdown is only honoured while backing
    /// off, and the batch then counts as not written.
    pub async fn write(&self, batch: &Batch) -> Result<u32, WriteError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut last_error = None;
        for attempt in 1..=self.policy.max_attempts {
            match self.sink.bulk_upsert(&batch.rows).await {
                Ok(()) => {
                    debug!(
                        partition = batch.partition,
                        start_offset = batch.start_offset,
                        end_offset = batch.end_offset,
                        rows = batch.len(),
                        attempt,
                        "Wrote batch"
                    );
                    return Ok(attempt);
                }
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt < self.policy.max_attempts {
                        let delay = self.policy.backoff(attempt);
                        warn!(
                            partition = batch.partition,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Transient sink failure, retrying: {}",
                            e
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                return Err(WriteError::Interrupted { attempts: attempt });
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(WriteError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last_error: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemorySink;
    use super::*;
    use chrono::{TimeZone, Utc};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
        }
    }

    fn batch() -> Batch {
        let row = SaleRow {
            customer_id: "C1".into(),
            order_id: "O1".into(),
            purchased_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            product: "Widget".into(),
            quantity: 2,
            unit_price: 10.0,
            line_total: 20.0,
            payment_method: "Cartão".into(),
        };
        Batch {
            partition: 0,
            start_offset: 100,
            end_offset: 150,
            rows: vec![row],
        }
    }

    fn transient() -> WriteError {
        WriteError::Transient {
            reason: "connection reset".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy(10);
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let sink = MemorySink::default();
        sink.fail_next(transient());
        sink.fail_next(transient());
        let writer = SinkWriter::new(sink.clone(), policy(3), CancellationToken::new());

        assert_eq!(writer.write(&batch()).await.unwrap(), 3);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.write_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let sink = MemorySink::default();
        for _ in 0..3 {
            sink.fail_next(transient());
        }
        let writer = SinkWriter::new(sink.clone(), policy(3), CancellationToken::new());

        let err = writer.write(&batch()).await.unwrap_err();
        assert!(matches!(err, WriteError::RetriesExhausted { attempts: 3, .. }));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let sink = MemorySink::default();
        sink.fail_next(WriteError::Rejected {
            reason: "invalid".into(),
        });
        let writer = SinkWriter::new(sink.clone(), policy(5), CancellationToken::new());

        assert!(matches!(
            writer.write(&batch()).await,
            Err(WriteError::Rejected { .. })
        ));
        assert_eq!(sink.write_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_backoff() {
        let sink = MemorySink::default();
        sink.fail_next(transient());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let writer = SinkWriter::new(sink.clone(), policy(5), cancel);

        assert!(matches!(
            writer.write(&batch()).await,
            Err(WriteError::Interrupted { attempts: 1 })
        ));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_skips_sink() {
        let sink = MemorySink::default();
        let writer = SinkWriter::new(sink.clone(), policy(3), CancellationToken::new());
        let mut empty = batch();
        empty.rows.clear();

        assert_eq!(writer.write(&empty).await.unwrap(), 0);
        assert_eq!(sink.write_calls(), 0);
    }
}
