use chrono::{DateTime, Utc};
use serde::Serialize;

/// Partition (or shard) of the source log.
pub type PartitionId = i32;

/// Position of a record inside one partition.
pub type Offset = i64;

/// An order event as it arrives on the source topic, after decoding.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub order_id: String,
    pub customer_doc: String,
    pub items: Vec<LineItem>,
    /// Orders without a sale timestamp never reach the sink.
    pub sold_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub product_name: String,
    pub quantity: i32,
    pub unit_price: f64,
}

/// One purchased product of one order, the unit written to the sink.
///
/// The row key is `(customer_id, order_id, product, purchased_at)`, so writing the
/// same row twice leaves a single row behind.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleRow {
    pub customer_id: String,
    pub order_id: String,
    pub purchased_at: DateTime<Utc>,
    pub product: String,
    pub quantity: i32,
    pub unit_price: f64,
    pub line_total: f64,
    pub payment_method: String,
}

impl SaleRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            customer_id: self.customer_id.clone(),
            order_id: self.order_id.clone(),
            product: self.product.clone(),
            purchased_at: self.purchased_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub customer_id: String,
    pub order_id: String,
    pub product: String,
    pub purchased_at: DateTime<Utc>,
}

/// A raw record pulled from the source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub offset: Offset,
    pub payload: Vec<u8>,
}

/// Rows produced from the half-open offset range `[start_offset, end_offset)` of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub partition: PartitionId,
    pub start_offset: Offset,
    pub end_offset: Offset,
    pub rows: Vec<SaleRow>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
