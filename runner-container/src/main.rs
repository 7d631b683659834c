use anyhow::{Context, Result, bail};
use ingest_core::checkpoint::FileCheckpointStore;
use ingest_core::config::{DeadLetterConfig, StreamConfig, load_config};
use ingest_core::dead_letter::{AnyDeadLetter, FileDeadLetter, KafkaDeadLetter};
use ingest_core::ingestor::{Ingestor, WorkerSettings};
use ingest_core::sink::RetryPolicy;
use ingest_core::sink::cassandra::CassandraSink;
use ingest_core::source::kafka::KafkaSource;
use ingest_core::telemetry::init_tracing;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Entry point for running the long-lived ingestion job on container hosts.
///
/// What it does at a high-level:
///     Load config (`--config <path>`, or YAML in `INGEST_CONFIG`).
///     For every stream, run one worker per topic partition until a shutdown signal:
///         - pull a batch of orders from the kafka partition
///         - flatten them into sale rows and upsert them into cassandra
///         - commit the partition checkpoint
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = config_path_from_args(std::env::args().skip(1))?;
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load ingestion config")?;

    let cancel = CancellationToken::new();
    let shutdown_token = cancel.clone();
    let shutdown_handle = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_token.cancel();
    });

    let mut streams = JoinSet::new();
    for stream in config.streams {
        let cancel = cancel.clone();
        streams.spawn(async move {
            let name = stream.name.clone();
            (name, run_stream(stream, cancel).await)
        });
    }

    let mut stalled = 0usize;
    while let Some(joined) = streams.join_next().await {
        match joined.context("Stream task panicked")? {
            (name, Ok(count)) => {
                stalled += count;
                info!(stream = %name, "Stream stopped");
            }
            (name, Err(e)) => {
                error!(stream = %name, "Stream failed: {:?}", e);
                cancel.cancel();
                stalled += 1;
            }
        }
    }

    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    if stalled > 0 {
        bail!("{stalled} partition(s) or stream(s) stopped on errors");
    }
    info!("Gracefully exiting");
    Ok(())
}

/// Runs one configured stream and returns how many of its partitions were paused.
async fn run_stream(stream: StreamConfig, cancel: CancellationToken) -> Result<usize> {
    let kafka = &stream.source.options;
    let source = KafkaSource::subscribe(kafka, stream.processing.batch_timeout())
        .await
        .with_context(|| format!("Failed to subscribe to topic {}", kafka.topic))?;
    source
        .health_check()
        .await
        .context("Kafka health check failed")?;

    let sink = CassandraSink::connect(&stream.sink.options)
        .await
        .context("Failed to connect to Cassandra")?;

    let checkpoints = FileCheckpointStore::open(&stream.checkpoint.path, &kafka.topic)
        .await
        .with_context(|| {
            format!(
                "Failed to open checkpoint dir {}",
                stream.checkpoint.path.display()
            )
        })?;

    let dead_letter = match stream.dead_letter_or_default() {
        DeadLetterConfig::Kafka { topic } => AnyDeadLetter::Kafka(
            KafkaDeadLetter::new(kafka, &topic).context("Failed to create dead-letter producer")?,
        ),
        DeadLetterConfig::File { path } => AnyDeadLetter::File(
            FileDeadLetter::open(&path)
                .await
                .context("Failed to open dead-letter file")?,
        ),
    };

    let ingestor = Ingestor::new(
        source,
        sink,
        checkpoints,
        dead_letter,
        WorkerSettings::from_config(&stream.processing, kafka.starting_offsets),
        RetryPolicy::from_config(&stream.processing),
        cancel,
    );
    info!(stream = %stream.name, topic = %kafka.topic, "Starting stream");

    let report = ingestor.run().await?;
    if !report.stalled.is_empty() {
        warn!(
            stream = %stream.name,
            partitions = ?report.stalled,
            "Partitions paused, restart after fixing the cause"
        );
    }
    Ok(report.stalled.len())
}

fn config_path_from_args(mut args: impl Iterator<Item = String>) -> Result<Option<String>> {
    let mut config_path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?);
            }
            other if !other.starts_with('-') && config_path.is_none() => {
                config_path = Some(other.to_string());
            }
            other => bail!("Unknown argument: {other}"),
        }
    }
    Ok(config_path)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C signal");
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> impl Iterator<Item = String> {
        values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_config_path_from_args() {
        assert_eq!(config_path_from_args(args(&[])).unwrap(), None);
        assert_eq!(
            config_path_from_args(args(&["--config", "ingest.yaml"])).unwrap(),
            Some("ingest.yaml".to_string())
        );
        assert_eq!(
            config_path_from_args(args(&["ingest.yaml"])).unwrap(),
            Some("ingest.yaml".to_string())
        );
        assert!(config_path_from_args(args(&["--config"])).is_err());
        assert!(config_path_from_args(args(&["--verbose"])).is_err());
    }
}
