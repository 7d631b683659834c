use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::errors::SourceError;
use crate::model::{Offset, PartitionId, SourceRecord};
use crate::source::LogSource;

#[derive(Debug, Default)]
struct PartitionLog {
    /// Offset of `records[0]`.
    low: Offset,
    records: Vec<Vec<u8>>,
}

/// In-process log used for embedding and tests.
///
/// Cloning shares the same partitions, so a test can keep appending while a worker reads.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    partitions: Arc<Mutex<BTreeMap<PartitionId, PartitionLog>>>,
    polls: Arc<Mutex<Vec<(PartitionId, Offset)>>>,
}

impl MemorySource {
    pub fn new(partition_count: i32) -> Self {
        let partitions = (0..partition_count)
            .map(|p| (p, PartitionLog::default()))
            .collect();
        Self {
            partitions: Arc::new(Mutex::new(partitions)),
            polls: Arc::default(),
        }
    }

    /// Appends a record and returns its offset.
    pub fn append(&self, partition: PartitionId, payload: impl Into<Vec<u8>>) -> Offset {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let log = partitions.entry(partition).or_default();
        log.records.push(payload.into());
        log.low + log.records.len() as Offset - 1
    }

    /// Moves the low watermark of an empty partition, as retention would.
    pub fn truncate_before(&self, partition: PartitionId, offset: Offset) {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let log = partitions.entry(partition).or_default();
        let drop = (offset - log.low).clamp(0, log.records.len() as Offset) as usize;
        log.records.drain(..drop);
        log.low = offset.max(log.low);
    }

    /// Every `(partition, from_offset)` requested so far, in call order.
    pub fn poll_history(&self) -> Vec<(PartitionId, Offset)> {
        self.polls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl LogSource for MemorySource {
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError> {
        let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        Ok(partitions.keys().copied().collect())
    }

    async fn poll(
        &self,
        partition: PartitionId,
        from_offset: Offset,
        max_records: usize,
    ) -> Result<Vec<SourceRecord>, SourceError> {
        self.polls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((partition, from_offset));

        let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let log = partitions
            .get(&partition)
            .ok_or(SourceError::UnknownPartition(partition))?;

        let start = from_offset.max(log.low);
        let skip = (start - log.low) as usize;
        Ok(log
            .records
            .iter()
            .enumerate()
            .skip(skip)
            .take(max_records)
            .map(|(i, payload)| SourceRecord {
                offset: log.low + i as Offset,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn offset_bounds(&self, partition: PartitionId) -> Result<(Offset, Offset), SourceError> {
        let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let log = partitions
            .get(&partition)
            .ok_or(SourceError::UnknownPartition(partition))?;
        Ok((log.low, log.low + log.records.len() as Offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_poll_from_offset() {
        let source = MemorySource::new(2);
        for i in 0..10 {
            assert_eq!(source.append(1, vec![i]), i as Offset);
        }

        let records = source.poll(1, 4, 3).await.unwrap();
        let offsets: Vec<Offset> = records.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, [4, 5, 6]);
        assert_eq!(records[0].payload, vec![4]);

        assert!(source.poll(0, 0, 10).await.unwrap().is_empty());
        assert!(source.poll(1, 10, 10).await.unwrap().is_empty());
        assert!(matches!(
            source.poll(7, 0, 1).await,
            Err(SourceError::UnknownPartition(7))
        ));
        assert_eq!(source.poll_history(), vec![(1, 4), (0, 0), (1, 10), (7, 0)]);
    }
}
