pub mod checkpoint;
pub mod config;
pub mod dead_letter;
pub mod errors;
pub mod ingestor;
pub mod model;
pub mod sink;
pub mod source;
pub mod telemetry;
pub mod transform;

pub use config::IngestConfig;
pub use errors::{IngestionError, Result};
pub use ingestor::{CycleOutcome, Ingestor, PartitionState, PartitionWorker, WorkerSettings};
pub use model::{Batch, LineItem, Order, SaleRow};
