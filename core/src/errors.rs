use thiserror::Error;

use crate::model::{Offset, PartitionId};

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Data source error: {0}")]
    Source(#[from] SourceError),

    #[error("Sink write error: {0}")]
    Write(#[from] WriteError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] DeadLetterError),

    #[error("Partition {partition} paused after {failures} consecutive failures at offset {offset}")]
    PartitionStalled {
        partition: PartitionId,
        offset: Offset,
        failures: u32,
    },

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to connect or communicate with the source: {source}")]
    Connection {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("A transient error occurred, the operation can be retried: {source}")]
    Transient {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Partition {0} is not assigned to this source")]
    UnknownPartition(PartitionId),

    #[error("Unrecoverable error from the source: {0}")]
    Unrecoverable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A single record could not be turned into an order. Never aborts a batch.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("Empty payload")]
    EmptyPayload,

    #[error("Payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("Malformed order payload: {reason}")]
    Malformed { reason: String },

    #[error("Invalid timestamp {value:?}")]
    InvalidTimestamp { value: String },

    #[error("Item {index} has invalid {field}: {reason}")]
    InvalidItem {
        index: usize,
        field: &'static str,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Transient sink failure: {reason}")]
    Transient { reason: String },

    #[error("Sink rejected the write: {reason}")]
    Rejected { reason: String },

    #[error("Sink write gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("Sink write interrupted by shutdown after {attempts} attempts")]
    Interrupted { attempts: u32 },

    #[error("Failed to connect to the sink: {reason}")]
    Connection { reason: String },
}

impl WriteError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WriteError::Transient { .. } | WriteError::Connection { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("Failed to read checkpoint for partition {partition}: {reason}")]
    Read {
        partition: PartitionId,
        reason: String,
    },

    #[error("Failed to persist checkpoint for partition {partition}: {reason}")]
    Persist {
        partition: PartitionId,
        reason: String,
    },

    #[error("Corrupt checkpoint for partition {partition}: {reason}")]
    Corrupt {
        partition: PartitionId,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("Failed to append record {partition}@{offset} to dead-letter sink: {reason}")]
    Append {
        partition: PartitionId,
        offset: Offset,
        reason: String,
    },

    #[error("Failed to open dead-letter sink: {reason}")]
    Open { reason: String },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("Failed to load configuration from {origin}: {error}")]
    LoadFailed {
        origin: String,
        #[source]
        error: Box<dyn std::error::Error + Send + Sync>,
    },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Failed to consume messages: {reason}")]
    Consumption { reason: String },

    #[error("Failed to seek partition {partition} to offset {offset}: {reason}")]
    Seek {
        partition: PartitionId,
        offset: Offset,
        reason: String,
    },

    #[error("Failed to fetch watermarks for partition {partition}: {reason}")]
    Watermarks {
        partition: PartitionId,
        reason: String,
    },

    #[error("Consumer health check failed: {reason}")]
    HealthCheck { reason: String },
}

pub type Result<T> = std::result::Result<T, IngestionError>;

impl IngestionError {
    /// Whether another cycle can succeed without an operator changing something.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestionError::Source(SourceError::Unrecoverable(_)) => false,
            IngestionError::Source(SourceError::UnknownPartition(_)) => false,
            IngestionError::PartitionStalled { .. } => false,
            IngestionError::Generic(_) => false,
            _ => true,
        }
    }

    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            IngestionError::Source(_) => 1000,
            IngestionError::Write(_) => 2000,
            _ => 5000,
        }
    }
}
