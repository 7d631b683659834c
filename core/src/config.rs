use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    pub version: u32,
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    pub sink: SinkConfig,
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub dead_letter: Option<DeadLetterConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub source_type: String,
    pub options: KafkaOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub topic: String,
    pub client_id: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub session_timeout_ms: Option<u32>,
    /// Where to start a partition that has no checkpoint yet.
    #[serde(default)]
    pub starting_offsets: StartingOffsets,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartingOffsets {
    #[default]
    Earliest,
    Latest,
    Explicit(i64),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub target_type: String,
    pub options: CassandraOptions,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CassandraOptions {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub table: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default)]
    pub consistency: WriteConsistency,
    #[serde(default = "default_max_batch_rows")]
    pub max_batch_rows: usize,
    #[serde(default = "default_write_concurrency")]
    pub write_concurrency: usize,
    #[serde(default)]
    pub create_schema: bool,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

fn default_max_batch_rows() -> usize {
    100
}

fn default_write_concurrency() -> usize {
    8
}

fn default_replication_factor() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteConsistency {
    One,
    Quorum,
    #[default]
    LocalQuorum,
    All,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CheckpointConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeadLetterConfig {
    Kafka { topic: String },
    File { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound on records pulled per micro-batch.
    pub batch_size: usize,
    /// Upper bound on the time spent collecting one micro-batch.
    pub batch_timeout_ms: u64,
    /// Fixed trigger interval; pulls run back to back when unset.
    pub trigger_interval_ms: Option<u64>,
    /// Sink write attempts per batch before the cycle fails.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    /// Failed cycles in a row after which a partition is paused.
    pub max_consecutive_failures: Option<u32>,
    pub metrics_interval_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_timeout_ms: 5000,
            trigger_interval_ms: None,
            max_retries: 3,
            retry_delay_ms: 500,
            max_retry_delay_ms: 10_000,
            max_consecutive_failures: Some(10),
            metrics_interval_ms: 60_000,
        }
    }
}

impl ProcessingConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn trigger_interval(&self) -> Option<Duration> {
        self.trigger_interval_ms.map(Duration::from_millis)
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<IngestConfig> {
    let config = match config_path {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

impl IngestConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            origin: path.to_string(),
            error: Box::new(e),
        })?;
        Self::from_yaml(&content, path)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let config_str = std::env::var("INGEST_CONFIG").map_err(|_| ConfigError::MissingField {
            field: "INGEST_CONFIG environment variable".to_string(),
        })?;
        Self::from_yaml(&config_str, "INGEST_CONFIG")
    }

    fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::LoadFailed {
            origin: origin.to_string(),
            error: Box::new(e),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(invalid("At least one stream must be configured"));
        }

        for stream in &self.streams {
            if stream.source.source_type != "kafka" {
                return Err(invalid(format!(
                    "Stream {}: unsupported source type {}",
                    stream.name, stream.source.source_type
                )));
            }
            if stream.sink.target_type != "cassandra" {
                return Err(invalid(format!(
                    "Stream {}: unsupported sink type {}",
                    stream.name, stream.sink.target_type
                )));
            }

            let source = &stream.source.options;
            if source.bootstrap_servers.is_empty() {
                return Err(invalid("Kafka bootstrap servers cannot be empty"));
            }
            if source.topic.is_empty() {
                return Err(invalid("Kafka topic cannot be empty"));
            }
            if let StartingOffsets::Explicit(offset) = source.starting_offsets {
                if offset < 0 {
                    return Err(invalid("Explicit starting offset cannot be negative"));
                }
            }

            let sink = &stream.sink.options;
            if sink.hosts.is_empty() {
                return Err(invalid("At least one Cassandra host is required"));
            }
            if !is_cql_identifier(&sink.keyspace) {
                return Err(invalid(format!("Invalid keyspace name: {:?}", sink.keyspace)));
            }
            if !is_cql_identifier(&sink.table) {
                return Err(invalid(format!("Invalid table name: {:?}", sink.table)));
            }
            if sink.max_batch_rows == 0 || sink.write_concurrency == 0 {
                return Err(invalid(
                    "max_batch_rows and write_concurrency must be positive",
                ));
            }

            let processing = &stream.processing;
            if processing.batch_size == 0 {
                return Err(invalid("Batch size must be positive"));
            }
            if processing.batch_timeout_ms == 0 {
                return Err(invalid("batch_timeout_ms must be positive"));
            }
            if processing.trigger_interval_ms == Some(0) {
                return Err(invalid("trigger_interval_ms must be positive when set"));
            }
            if processing.max_retries == 0 {
                return Err(invalid("max_retries must allow at least one attempt"));
            }
            if processing.retry_delay_ms > processing.max_retry_delay_ms {
                return Err(invalid("retry_delay_ms cannot exceed max_retry_delay_ms"));
            }
            if processing.max_consecutive_failures == Some(0) {
                return Err(invalid("max_consecutive_failures must be positive when set"));
            }

            if let Some(DeadLetterConfig::Kafka { topic }) = &stream.dead_letter {
                if topic == &source.topic {
                    return Err(invalid("Dead-letter topic must differ from the source topic"));
                }
            }
        }
        Ok(())
    }

    pub fn get_first_stream(&self) -> Option<&StreamConfig> {
        self.streams.first()
    }
}

impl StreamConfig {
    /// Dead-letter destination, defaulting to a JSON-lines file next to the checkpoints.
    pub fn dead_letter_or_default(&self) -> DeadLetterConfig {
        self.dead_letter.clone().unwrap_or_else(|| DeadLetterConfig::File {
            path: self.checkpoint.path.join("dead_letter.jsonl"),
        })
    }
}

/// Keyspace and table names end up inside CQL text, so only plain identifiers pass.
fn is_cql_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 48
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.into(),
    }
}
