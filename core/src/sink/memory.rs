use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::WriteError;
use crate::model::{RowKey, SaleRow};
use crate::sink::SaleSink;

/// Keyed in-process table with the same upsert semantics as the Cassandra table.
///
/// Clones share state. Failures queued with [`MemorySink::fail_next`] are returned by the
/// next writes, in order, without touching the table.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<BTreeMap<RowKey, SaleRow>>>,
    failures: Arc<Mutex<VecDeque<WriteError>>>,
    write_calls: Arc<AtomicUsize>,
}

impl MemorySink {
    pub fn fail_next(&self, error: WriteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    pub fn rows(&self) -> Vec<SaleRow> {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Relaxed)
    }
}

impl SaleSink for MemorySink {
    async fn bulk_upsert(&self, rows: &[SaleRow]) -> Result<(), WriteError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(error);
        }

        let mut table = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        for row in rows {
            table.insert(row.key(), row.clone());
        }
        Ok(())
    }
}
