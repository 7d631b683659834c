use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use crate::config::KafkaOptions;
use crate::errors::{DeadLetterError, KafkaError};
use crate::model::{Offset, PartitionId};
use crate::source::kafka::base_config;

/// Side channel for records that could not be decoded.
#[trait_variant::make(Send)]
pub trait DeadLetterSink: Send + Sync + 'static {
    async fn append(
        &self,
        partition: PartitionId,
        offset: Offset,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), DeadLetterError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub partition: PartitionId,
    pub offset: Offset,
    pub payload: String,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Produces rejected records to a dead-letter topic, keeping the original payload bytes.
pub struct KafkaDeadLetter {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetter {
    pub fn new(options: &KafkaOptions, topic: &str) -> Result<Self, DeadLetterError> {
        let producer: FutureProducer = base_config(options)
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| DeadLetterError::Open {
                reason: KafkaError::ProducerCreation {
                    reason: e.to_string(),
                }
                .to_string(),
            })?;
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

impl DeadLetterSink for KafkaDeadLetter {
    async fn append(
        &self,
        partition: PartitionId,
        offset: Offset,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        let partition_value = partition.to_string();
        let offset_value = offset.to_string();
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "x-error-reason",
                value: Some(reason),
            })
            .insert(Header {
                key: "x-source-partition",
                value: Some(partition_value.as_str()),
            })
            .insert(Header {
                key: "x-source-offset",
                value: Some(offset_value.as_str()),
            });
        let key = format!("{partition}-{offset}");
        let record = FutureRecord::to(&self.topic)
            .payload(raw)
            .key(key.as_str())
            .headers(headers);

        self.producer
            .send(record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| DeadLetterError::Append {
                partition,
                offset,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Appends rejected records as JSON lines.
#[derive(Debug)]
pub struct FileDeadLetter {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileDeadLetter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeadLetterError::Open {
                    reason: e.to_string(),
                })?;
        }
        Ok(Self {
            path,
            lock: tokio::sync::Mutex::new(()),
        })
    }
}

impl DeadLetterSink for FileDeadLetter {
    async fn append(
        &self,
        partition: PartitionId,
        offset: Offset,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        let append_error = |reason: String| DeadLetterError::Append {
            partition,
            offset,
            reason,
        };
        let entry = DeadLetterEntry {
            partition,
            offset,
            payload: String::from_utf8_lossy(raw).into_owned(),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        };
        let mut line = serde_json::to_vec(&entry).map_err(|e| append_error(e.to_string()))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| append_error(e.to_string()))?;
        file.write_all(&line)
            .await
            .map_err(|e| append_error(e.to_string()))?;
        file.sync_data()
            .await
            .map_err(|e| append_error(e.to_string()))?;
        Ok(())
    }
}

/// In-process dead-letter sink. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryDeadLetter {
    entries: Arc<Mutex<Vec<DeadLetterEntry>>>,
}

impl MemoryDeadLetter {
    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl DeadLetterSink for MemoryDeadLetter {
    async fn append(
        &self,
        partition: PartitionId,
        offset: Offset,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(DeadLetterEntry {
                partition,
                offset,
                payload: String::from_utf8_lossy(raw).into_owned(),
                reason: reason.to_string(),
                failed_at: Utc::now(),
            });
        Ok(())
    }
}

/// Runtime choice between the configured dead-letter destinations.
pub enum AnyDeadLetter {
    Kafka(KafkaDeadLetter),
    File(FileDeadLetter),
}

impl DeadLetterSink for AnyDeadLetter {
    async fn append(
        &self,
        partition: PartitionId,
        offset: Offset,
        raw: &[u8],
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        match self {
            AnyDeadLetter::Kafka(sink) => sink.append(partition, offset, raw, reason).await,
            AnyDeadLetter::File(sink) => sink.append(partition, offset, raw, reason).await,
        }
    }
}
