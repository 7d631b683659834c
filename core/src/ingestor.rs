use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointManager, CheckpointStore};
use crate::config::{ProcessingConfig, StartingOffsets};
use crate::dead_letter::DeadLetterSink;
use crate::errors::{IngestionError, Result, WriteError};
use crate::model::{Offset, PartitionId};
use crate::sink::{RetryPolicy, SaleSink, SinkWriter};
use crate::source::LogSource;
use crate::telemetry::{IngestMetrics, MetricsSnapshot};
use crate::transform::transform;

/// Pause after an empty pull when pulls run back to back.
const IDLE_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub trigger_interval: Option<Duration>,
    pub max_consecutive_failures: Option<u32>,
    pub starting_offsets: StartingOffsets,
    pub metrics_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(processing: &ProcessingConfig, starting_offsets: StartingOffsets) -> Self {
        Self {
            batch_size: processing.batch_size,
            trigger_interval: processing
                .trigger_interval()
                .map(|period| period.max(Duration::from_millis(1))),
            max_consecutive_failures: processing.max_consecutive_failures,
            starting_offsets,
            metrics_interval: Duration::from_millis(processing.metrics_interval_ms.max(1)),
        }
    }
}

/// Where a partition worker is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Pulling,
    Transforming,
    Writing,
    Committing,
    /// The last cycle failed; the same offsets are pulled again on the next trigger.
    Failed,
    /// Too many failures in a row. Needs an operator.
    Paused,
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PartitionState::Idle => "idle",
            PartitionState::Pulling => "pulling",
            PartitionState::Transforming => "transforming",
            PartitionState::Writing => "writing",
            PartitionState::Committing => "committing",
            PartitionState::Failed => "failed",
            PartitionState::Paused => "paused",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing new to read.
    Idle,
    Committed {
        start_offset: Offset,
        end_offset: Offset,
        rows: usize,
    },
    /// Shutdown arrived before anything was written.
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunReport {
    pub stalled: Vec<PartitionId>,
    pub metrics: MetricsSnapshot,
}

/// The ingestor orchestrates the data flow from source -> sink, one worker per partition.
pub struct Ingestor<S, K, C, D> {
    source: Arc<S>,
    writer: Arc<SinkWriter<K>>,
    checkpoints: Arc<CheckpointManager<C>>,
    dead_letter: Arc<D>,
    metrics: Arc<IngestMetrics>,
    settings: WorkerSettings,
    cancel: CancellationToken,
}

impl<S, K, C, D> Ingestor<S, K, C, D>
where
    S: LogSource,
    K: SaleSink,
    C: CheckpointStore,
    D: DeadLetterSink,
{
    pub fn new(
        source: S,
        sink: K,
        checkpoint_store: C,
        dead_letter: D,
        settings: WorkerSettings,
        retry_policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source: Arc::new(source),
            writer: Arc::new(SinkWriter::new(sink, retry_policy, cancel.clone())),
            checkpoints: Arc::new(CheckpointManager::new(checkpoint_store)),
            dead_letter: Arc::new(dead_letter),
            metrics: Arc::new(IngestMetrics::default()),
            settings,
            cancel,
        }
    }

    /// Creates the worker for one partition.
    pub fn worker(&self, partition: PartitionId) -> PartitionWorker<S, K, C, D> {
        PartitionWorker {
            partition,
            source: Arc::clone(&self.source),
            writer: Arc::clone(&self.writer),
            checkpoints: Arc::clone(&self.checkpoints),
            dead_letter: Arc::clone(&self.dead_letter),
            metrics: Arc::clone(&self.metrics),
            settings: self.settings,
            cancel: self.cancel.clone(),
            state: PartitionState::Idle,
            consecutive_failures: 0,
            in_flight: None,
            next_offset: None,
        }
    }

    /// Runs one worker per source partition until shutdown or until every partition is
    /// paused.
    pub async fn run(&self) -> Result<RunReport> {
        let partitions = self.source.partitions().await?;
        info!(partitions = ?partitions, "Starting partition workers");

        let mut workers = JoinSet::new();
        for partition in partitions {
            let worker = self.worker(partition);
            workers.spawn(async move { (partition, worker.run().await) });
        }

        let mut report = RunReport::default();
        let mut metrics_tick = tokio::time::interval(self.settings.metrics_interval);
        metrics_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        metrics_tick.tick().await;

        loop {
            tokio::select! {
                joined = workers.join_next() => {
                    let Some(joined) = joined else { break };
                    match joined {
                        Ok((_, Ok(()))) => {}
                        Ok((partition, Err(IngestionError::PartitionStalled { .. }))) => {
                            report.stalled.push(partition);
                        }
                        Ok((partition, Err(e))) => {
                            error!(partition, "Partition worker stopped: {}", e);
                            report.stalled.push(partition);
                        }
                        Err(e) => {
                            error!("Partition worker panicked: {}", e);
                            return Err(IngestionError::Generic(anyhow::anyhow!(e)));
                        }
                    }
                }
                _ = metrics_tick.tick() => {
                    info!(metrics = ?self.metrics.snapshot(), "Ingestion progress");
                }
            }
        }

        report.stalled.sort_unstable();
        report.metrics = self.metrics.snapshot();
        info!(metrics = ?report.metrics, stalled = ?report.stalled, "Ingestor stopped");
        Ok(report)
    }

    /// Asks every worker to stop after its current write and commit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn checkpoints(&self) -> &CheckpointManager<C> {
        &self.checkpoints
    }
}

/// Drives one partition through pull, transform, write and commit, one batch at a time.
pub struct PartitionWorker<S, K, C, D> {
    partition: PartitionId,
    source: Arc<S>,
    writer: Arc<SinkWriter<K>>,
    checkpoints: Arc<CheckpointManager<C>>,
    dead_letter: Arc<D>,
    metrics: Arc<IngestMetrics>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    state: PartitionState,
    consecutive_failures: u32,
    /// Offset range of the batch being processed, as far as it is known.
    in_flight: Option<(Offset, Offset)>,
    /// Start of the last pull, used until a checkpoint exists.
    next_offset: Option<Offset>,
}

impl<S, K, C, D> PartitionWorker<S, K, C, D>
where
    S: LogSource,
    K: SaleSink,
    C: CheckpointStore,
    D: DeadLetterSink,
{
    pub fn state(&self) -> PartitionState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Loops over [`PartitionWorker::run_once`] on every trigger until shutdown.
    ///
    /// Returns [`IngestionError::PartitionStalled`] once the consecutive failure limit is hit.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = self.settings.trigger_interval.map(|period| {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        info!(partition = self.partition, "Partition worker started");

        loop {
            if let Some(ticker) = ticker.as_mut() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            } else if self.cancel.is_cancelled() {
                break;
            }

            let pause = match self.run_once().await {
                Ok(CycleOutcome::Cancelled) => break,
                Ok(CycleOutcome::Idle) => IDLE_BACKOFF,
                Ok(CycleOutcome::Committed { .. }) => Duration::ZERO,
                Err(e) => {
                    let exhausted = self
                        .settings
                        .max_consecutive_failures
                        .is_some_and(|limit| self.consecutive_failures >= limit);
                    if exhausted || !e.is_retryable() {
                        return Err(self.pause());
                    }
                    Duration::from_millis(e.get_retry_delay_ms())
                }
            };

            // a fixed trigger already spaces cycles out
            if ticker.is_none() && !pause.is_zero() {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        self.state = PartitionState::Idle;
        info!(partition = self.partition, "Partition worker stopped");
        Ok(())
    }

    fn pause(&mut self) -> IngestionError {
        self.state = PartitionState::Paused;
        let (start_offset, end_offset) = self
            .in_flight
            .or(self.next_offset.map(|offset| (offset, offset)))
            .unwrap_or_default();
        error!(
            partition = self.partition,
            start_offset,
            end_offset,
            failures = self.consecutive_failures,
            "ALERT: partition paused after repeated failures, manual intervention required"
        );
        IngestionError::PartitionStalled {
            partition: self.partition,
            offset: start_offset,
            failures: self.consecutive_failures,
        }
    }

    /// Runs a single pull-transform-write-commit cycle.
    ///
    /// The checkpoint only moves after the sink accepted the batch. On any error the
    /// worker is left `Failed` and the next cycle pulls the same offsets again.
    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        match self.cycle().await {
            Ok(outcome) => {
                self.state = PartitionState::Idle;
                self.consecutive_failures = 0;
                self.in_flight = None;
                Ok(outcome)
            }
            Err(IngestionError::Write(WriteError::Interrupted { attempts })) => {
                self.state = PartitionState::Idle;
                info!(
                    partition = self.partition,
                    attempts, "Write interrupted by shutdown, batch left uncommitted"
                );
                Ok(CycleOutcome::Cancelled)
            }
            Err(e) => {
                self.state = PartitionState::Failed;
                self.consecutive_failures += 1;
                self.metrics.record_failure();
                let (start_offset, end_offset) = self.in_flight.unwrap_or_default();
                warn!(
                    partition = self.partition,
                    start_offset,
                    end_offset,
                    failures = self.consecutive_failures,
                    "Cycle failed, checkpoint not advanced: {}",
                    e
                );
                Err(e)
            }
        }
    }

    async fn cycle(&mut self) -> Result<CycleOutcome> {
        self.state = PartitionState::Pulling;
        self.in_flight = None;
        // the starting policy is resolved once, so records arriving before the first
        // commit are not skipped by a moving high watermark
        let start_offset = match self.next_offset {
            Some(fallback) => self
                .checkpoints
                .store()
                .get(self.partition)
                .await?
                .unwrap_or(fallback),
            None => {
                self.checkpoints
                    .load_or_resolve(&*self.source, self.partition, self.settings.starting_offsets)
                    .await?
            }
        };
        self.next_offset = Some(start_offset);
        self.in_flight = Some((start_offset, start_offset));

        let records = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(CycleOutcome::Cancelled),
            records = self.source.poll(self.partition, start_offset, self.settings.batch_size) => records?,
        };
        if records.is_empty() {
            return Ok(CycleOutcome::Idle);
        }
        let bytes = records.iter().map(|r| r.payload.len()).sum();
        self.metrics.record_poll(records.len(), bytes);

        self.state = PartitionState::Transforming;
        let output = transform(self.partition, start_offset, &records);
        let batch = output.batch;
        self.in_flight = Some((batch.start_offset, batch.end_offset));
        for rejected in &output.rejected {
            debug!(
                partition = self.partition,
                offset = rejected.offset,
                "Dead-lettering record: {}",
                rejected.error
            );
            self.dead_letter
                .append(
                    self.partition,
                    rejected.offset,
                    &rejected.payload,
                    &rejected.error.to_string(),
                )
                .await?;
        }
        self.metrics.record_transform(
            output.orders_decoded,
            output.orders_filtered,
            output.rejected.len(),
        );

        self.state = PartitionState::Writing;
        let attempts = self.writer.write(&batch).await?;
        self.metrics.record_write(batch.len(), attempts);

        self.state = PartitionState::Committing;
        self.checkpoints
            .commit(self.partition, batch.end_offset)
            .await?;
        self.metrics.record_commit();

        debug!(
            partition = self.partition,
            start_offset = batch.start_offset,
            end_offset = batch.end_offset,
            rows = batch.len(),
            rejected = output.rejected.len(),
            "Committed batch"
        );
        Ok(CycleOutcome::Committed {
            start_offset: batch.start_offset,
            end_offset: batch.end_offset,
            rows: batch.len(),
        })
    }
}
