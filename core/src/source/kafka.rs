use rdkafka::consumer::{BaseConsumer, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset as KafkaOffset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};

use crate::config::KafkaOptions;
use crate::errors::{KafkaError, SourceError};
use crate::model::{Offset, PartitionId, SourceRecord};
use crate::source::LogSource;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads a Kafka topic partition by partition at caller-chosen offsets.
///
/// Every partition gets its own manually assigned consumer, so there is no group
/// rebalancing and Kafka's committed offsets are never used.
pub struct KafkaSource {
    topic: String,
    consumers: HashMap<PartitionId, PartitionConsumer>,
    batch_timeout: Duration,
}

struct PartitionConsumer {
    consumer: Arc<StreamConsumer>,
    /// Offset the consumer will deliver next, if it is assigned.
    position: Mutex<Option<Offset>>,
}

impl KafkaSource {
    /// Discovers the partitions of the configured topic and prepares a consumer for each.
    pub async fn subscribe(
        options: &KafkaOptions,
        batch_timeout: Duration,
    ) -> Result<Self, SourceError> {
        let topic = options.topic.clone();
        let probe: BaseConsumer = client_config(options)
            .create()
            .map_err(|e| connection(KafkaError::ConsumerCreation {
                reason: e.to_string(),
            }))?;

        let partitions = {
            let topic = topic.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<PartitionId>, KafkaError> {
                let metadata = probe
                    .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                    .map_err(|e| KafkaError::Subscription {
                        topic: topic.clone(),
                        reason: e.to_string(),
                    })?;
                let topic_metadata =
                    metadata
                        .topics()
                        .first()
                        .ok_or_else(|| KafkaError::Subscription {
                            topic: topic.clone(),
                            reason: "topic not found".to_string(),
                        })?;
                Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
            })
            .await
            .map_err(|e| SourceError::Unrecoverable(Box::new(e)))?
            .map_err(connection)?
        };

        if partitions.is_empty() {
            return Err(connection(KafkaError::Subscription {
                topic,
                reason: "topic has no partitions".to_string(),
            }));
        }

        let mut consumers = HashMap::with_capacity(partitions.len());
        for partition in &partitions {
            let consumer: StreamConsumer =
                client_config(options)
                    .create()
                    .map_err(|e| connection(KafkaError::ConsumerCreation {
                        reason: e.to_string(),
                    }))?;
            consumers.insert(
                *partition,
                PartitionConsumer {
                    consumer: Arc::new(consumer),
                    position: Mutex::new(None),
                },
            );
        }

        info!(
            topic = %topic,
            partitions = partitions.len(),
            "Subscribed to Kafka topic"
        );
        Ok(Self {
            topic,
            consumers,
            batch_timeout,
        })
    }

    fn partition(&self, partition: PartitionId) -> Result<&PartitionConsumer, SourceError> {
        self.consumers
            .get(&partition)
            .ok_or(SourceError::UnknownPartition(partition))
    }

    fn seek(
        &self,
        consumer: &StreamConsumer,
        partition: PartitionId,
        offset: Offset,
    ) -> Result<(), KafkaError> {
        let seek_error = |reason: String| KafkaError::Seek {
            partition,
            offset,
            reason,
        };
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.topic, partition, KafkaOffset::Offset(offset))
            .map_err(|e| seek_error(e.to_string()))?;
        consumer.assign(&tpl).map_err(|e| seek_error(e.to_string()))?;
        debug!(partition, offset, "Assigned partition");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), SourceError> {
        let Some(partition) = self.consumers.values().next() else {
            return Err(connection(KafkaError::HealthCheck {
                reason: "no partitions assigned".to_string(),
            }));
        };
        let consumer = Arc::clone(&partition.consumer);
        let topic = self.topic.clone();
        let partitions = tokio::task::spawn_blocking(move || -> Result<usize, KafkaError> {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| KafkaError::HealthCheck {
                    reason: e.to_string(),
                })?;
            let Some(topic_metadata) = metadata.topics().first() else {
                return Err(KafkaError::HealthCheck {
                    reason: format!("topic {topic} not found"),
                });
            };
            Ok(topic_metadata.partitions().len())
        })
        .await
        .map_err(|e| SourceError::Unrecoverable(Box::new(e)))?
        .map_err(connection)?;

        info!(
            "Health check passed for topic {} with {} partitions",
            self.topic, partitions
        );
        Ok(())
    }
}

impl LogSource for KafkaSource {
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError> {
        let mut partitions: Vec<PartitionId> = self.consumers.keys().copied().collect();
        partitions.sort_unstable();
        Ok(partitions)
    }

    async fn poll(
        &self,
        partition: PartitionId,
        from_offset: Offset,
        max_records: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        let handle = self.partition(partition)?;
        let mut position = handle.position.lock().await;

        // a failed batch is re-requested from its start, which the consumer has already passed
        if *position != Some(from_offset) {
            self.seek(&handle.consumer, partition, from_offset)
                .map_err(connection)?;
        }
        // unknown until the read completes; a poll dropped midway forces a re-seek
        *position = None;

        let deadline = Instant::now() + self.batch_timeout;
        let mut records = Vec::new();
        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, handle.consumer.recv()).await {
                Ok(Ok(message)) => {
                    if message.partition() != partition || message.offset() < from_offset {
                        continue;
                    }
                    records.push(SourceRecord {
                        offset: message.offset(),
                        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                    });
                }
                Ok(Err(e)) => {
                    warn!(partition, "Error receiving message: {}", e);
                    if records.is_empty() {
                        return Err(SourceError::Transient {
                            source: Box::new(KafkaError::Consumption {
                                reason: e.to_string(),
                            }),
                        });
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        *position = Some(records.last().map_or(from_offset, |last| last.offset + 1));
        if !records.is_empty() {
            debug!(
                partition,
                from_offset,
                records = records.len(),
                "Consumed batch"
            );
        }
        Ok(records)
    }

    async fn offset_bounds(&self, partition: PartitionId) -> Result<(Offset, Offset), SourceError> {
        let consumer = Arc::clone(&self.partition(partition)?.consumer);
        let topic = self.topic.clone();
        tokio::task::spawn_blocking(move || {
            consumer
                .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                .map_err(|e| KafkaError::Watermarks {
                    partition,
                    reason: e.to_string(),
                })
        })
        .await
        .map_err(|e| SourceError::Unrecoverable(Box::new(e)))?
        .map_err(connection)
    }
}

fn connection(err: KafkaError) -> SourceError {
    SourceError::Connection {
        source: Box::new(err),
    }
}

/// Connection and security settings shared by consumers and producers.
pub(crate) fn base_config(options: &KafkaOptions) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &options.bootstrap_servers)
        .set("client.id", client_id(options));

    if let Some(security_protocol) = &options.security_protocol {
        client_config.set("security.protocol", security_protocol);
    }

    if let Some(sasl_mechanisms) = &options.sasl_mechanisms {
        client_config.set("sasl.mechanisms", sasl_mechanisms);
    }

    if let Some(sasl_username) = &options.sasl_username {
        client_config.set("sasl.username", sasl_username);
    }

    if let Some(sasl_password) = &options.sasl_password {
        client_config.set("sasl.password", sasl_password);
    }

    if let Some(ssl_ca_location) = &options.ssl_ca_location {
        client_config.set("ssl.ca.location", ssl_ca_location);
    }

    client_config
}

pub(crate) fn client_config(options: &KafkaOptions) -> ClientConfig {
    let mut client_config = base_config(options);
    client_config
        // required by librdkafka even though offsets are never committed to the group
        .set("group.id", format!("{}-{}", client_id(options), options.topic))
        .set("enable.partition.eof", "false")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        // an offset lost to retention resumes at the oldest retained record
        .set("auto.offset.reset", "earliest")
        .set(
            "session.timeout.ms",
            options.session_timeout_ms.unwrap_or(6000).to_string(),
        );
    client_config
}

fn client_id(options: &KafkaOptions) -> String {
    options
        .client_id
        .clone()
        .unwrap_or_else(|| "sales-ingest".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StartingOffsets;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    fn options(topic: &str) -> KafkaOptions {
        KafkaOptions {
            bootstrap_servers: KAFKA_BOOTSTRAP_SERVERS.to_string(),
            topic: topic.to_string(),
            client_id: Some("sales-ingest-test".to_string()),
            security_protocol: None,
            sasl_mechanisms: None,
            sasl_username: None,
            sasl_password: None,
            ssl_ca_location: None,
            session_timeout_ms: Some(6000),
            starting_offsets: StartingOffsets::Earliest,
        }
    }

    async fn produce_messages(topic: &str, count: usize) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");

        for i in 0..count {
            let payload = format!("message-{}", i);
            producer
                .send(
                    FutureRecord::to(topic)
                        .payload(&payload)
                        .key("k")
                        .partition(0),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }
    }

    #[test]
    fn test_client_config_never_commits() {
        let config = client_config(&options("vendas"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("group.id"), Some("sales-ingest-test-vendas"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_poll_and_rewind() {
        let topic = format!("sales-ingest-test-{}", chrono::Utc::now().timestamp_millis());
        produce_messages(&topic, 10).await;

        let source = KafkaSource::subscribe(&options(&topic), Duration::from_secs(5))
            .await
            .expect("Failed to subscribe");
        source.health_check().await.expect("Health check should pass");

        let (low, high) = source.offset_bounds(0).await.unwrap();
        assert_eq!(high - low, 10);

        let first = source.poll(0, low, 4).await.unwrap();
        assert_eq!(first.len(), 4);
        assert_eq!(first[0].payload, b"message-0".to_vec());

        // continuing where the last batch ended does not rewind
        let second = source.poll(0, low + 4, 4).await.unwrap();
        assert_eq!(second[0].offset, low + 4);

        // requesting an earlier offset re-reads it
        let replay = source.poll(0, low + 4, 4).await.unwrap();
        assert_eq!(replay, second);
    }
}
