pub mod kafka;
pub mod memory;

use crate::config::StartingOffsets;
use crate::errors::SourceError;
use crate::model::{Offset, PartitionId, SourceRecord};

/// A partitioned, offset-addressable log such as a Kafka topic.
///
/// Implementations never track consumption on their own; the caller always says where to
/// read from, and progress lives in the checkpoint store.
#[trait_variant::make(Send)]
pub trait LogSource: Send + Sync + 'static {
    /// Partitions of the subscribed topic.
    async fn partitions(&self) -> Result<Vec<PartitionId>, SourceError>;

    /// Reads up to `max_records` records of `partition`, beginning at `from_offset`.
    ///
    /// An empty result means nothing new arrived before the source's poll timeout.
    async fn poll(
        &self,
        partition: PartitionId,
        from_offset: Offset,
        max_records: usize,
    ) -> Result<Vec<SourceRecord>, SourceError>;

    /// Low and high watermark of `partition`, the high one being the next offset to be written.
    async fn offset_bounds(&self, partition: PartitionId) -> Result<(Offset, Offset), SourceError>;
}

/// Resolves the first offset to read for a partition without a checkpoint.
pub async fn resolve_starting_offset<S: LogSource>(
    source: &S,
    partition: PartitionId,
    policy: StartingOffsets,
) -> Result<Offset, SourceError> {
    match policy {
        StartingOffsets::Explicit(offset) => Ok(offset),
        StartingOffsets::Earliest => Ok(source.offset_bounds(partition).await?.0),
        StartingOffsets::Latest => Ok(source.offset_bounds(partition).await?.1),
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemorySource;
    use super::*;

    #[tokio::test]
    async fn test_resolve_starting_offset() {
        let source = MemorySource::new(1);
        source.truncate_before(0, 2);
        for i in 0..5 {
            source.append(0, format!("r{i}").into_bytes());
        }

        assert_eq!(
            resolve_starting_offset(&source, 0, StartingOffsets::Earliest)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            resolve_starting_offset(&source, 0, StartingOffsets::Latest)
                .await
                .unwrap(),
            7
        );
        assert_eq!(
            resolve_starting_offset(&source, 0, StartingOffsets::Explicit(3))
                .await
                .unwrap(),
            3
        );
    }
}
