use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Pipeline counters shared by all partition workers.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    records_polled: AtomicU64,
    bytes_polled: AtomicU64,
    orders_decoded: AtomicU64,
    orders_filtered: AtomicU64,
    records_dead_lettered: AtomicU64,
    rows_written: AtomicU64,
    write_retries: AtomicU64,
    batches_committed: AtomicU64,
    failed_cycles: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub records_polled: u64,
    pub bytes_polled: u64,
    pub orders_decoded: u64,
    pub orders_filtered: u64,
    pub records_dead_lettered: u64,
    pub rows_written: u64,
    pub write_retries: u64,
    pub batches_committed: u64,
    pub failed_cycles: u64,
}

impl IngestMetrics {
    pub fn record_poll(&self, records: usize, bytes: usize) {
        self.records_polled
            .fetch_add(records as u64, Ordering::Relaxed);
        self.bytes_polled.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_transform(&self, decoded: usize, filtered: usize, dead_lettered: usize) {
        self.orders_decoded
            .fetch_add(decoded as u64, Ordering::Relaxed);
        self.orders_filtered
            .fetch_add(filtered as u64, Ordering::Relaxed);
        self.records_dead_lettered
            .fetch_add(dead_lettered as u64, Ordering::Relaxed);
    }

    pub fn record_write(&self, rows: usize, attempts: u32) {
        self.rows_written.fetch_add(rows as u64, Ordering::Relaxed);
        self.write_retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.batches_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_polled: self.records_polled.load(Ordering::Relaxed),
            bytes_polled: self.bytes_polled.load(Ordering::Relaxed),
            orders_decoded: self.orders_decoded.load(Ordering::Relaxed),
            orders_filtered: self.orders_filtered.load(Ordering::Relaxed),
            records_dead_lettered: self.records_dead_lettered.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            write_retries: self.write_retries.load(Ordering::Relaxed),
            batches_committed: self.batches_committed.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accumulates() {
        let metrics = IngestMetrics::default();
        metrics.record_poll(10, 2048);
        metrics.record_transform(8, 1, 2);
        metrics.record_write(14, 3);
        metrics.record_write(0, 0);
        metrics.record_commit();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.records_polled, 10);
        assert_eq!(snapshot.bytes_polled, 2048);
        assert_eq!(snapshot.orders_filtered, 1);
        assert_eq!(snapshot.records_dead_lettered, 2);
        assert_eq!(snapshot.rows_written, 14);
        assert_eq!(snapshot.write_retries, 2);
        assert_eq!(snapshot.batches_committed, 1);
        assert_eq!(snapshot.failed_cycles, 0);
    }
}
