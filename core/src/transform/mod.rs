//! Decode → flatten → enrich → assemble, for one slice of one partition.
//!
//! Everything here is CPU-bound and synchronous; the partition worker calls it between
//! the pull and the sink write.

pub mod decode;
pub mod flatten;

use crate::errors::DecodeError;
use crate::model::{Batch, Offset, PartitionId, SaleRow, SourceRecord};

pub use decode::decode;
pub use flatten::{DEFAULT_PAYMENT_METHOD, enrich, flatten, is_sellable};

/// A record that failed decoding, bound for the dead-letter sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejected {
    pub offset: Offset,
    pub payload: Vec<u8>,
    pub error: DecodeError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub batch: Batch,
    pub rejected: Vec<Rejected>,
    pub orders_decoded: usize,
    pub orders_filtered: usize,
}

/// Groups the rows produced for one pulled slice into a [`Batch`].
pub fn assemble(
    partition: PartitionId,
    start_offset: Offset,
    end_offset: Offset,
    rows: impl IntoIterator<Item = SaleRow>,
) -> Batch {
    Batch {
        partition,
        start_offset,
        end_offset,
        rows: rows.into_iter().collect(),
    }
}

/// Turns the records pulled from `partition` starting at `start_offset` into a batch.
///
/// The batch covers `[start_offset, last record offset + 1)` even when every order in it
/// was dropped or rejected, since those offsets were consumed all the same.
pub fn transform(
    partition: PartitionId,
    start_offset: Offset,
    records: &[SourceRecord],
) -> TransformOutput {
    let end_offset = records
        .iter()
        .map(|record| record.offset + 1)
        .max()
        .unwrap_or(start_offset)
        .max(start_offset);

    let mut rejected = Vec::new();
    let mut orders = Vec::with_capacity(records.len());
    for record in records {
        match decode(&record.payload) {
            Ok(order) => orders.push(order),
            Err(error) => rejected.push(Rejected {
                offset: record.offset,
                payload: record.payload.clone(),
                error,
            }),
        }
    }

    let orders_decoded = orders.len();
    let orders_filtered = orders.iter().filter(|order| !is_sellable(order)).count();

    let rows = orders
        .iter()
        .filter(|order| is_sellable(order))
        .flat_map(flatten)
        .map(enrich);
    let batch = assemble(partition, start_offset, end_offset, rows);

    TransformOutput {
        batch,
        rejected,
        orders_decoded,
        orders_filtered,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(offset: Offset, payload: &str) -> SourceRecord {
        SourceRecord {
            offset,
            payload: payload.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_end_to_end_example() {
        let records = vec![record(
            7,
            r#"{"id_ordem":"O1","documento_cliente":"C1","produtos_comprados":[
                {"nome_produto":"Widget","quantidade":2,"preco_unitario":10.0},
                {"nome_produto":"Gadget","quantidade":1,"preco_unitario":5.0}],
                "data_hora_venda":"2024-05-10T09:00:00Z"}"#,
        )];
        let sold_at = Utc.with_ymd_and_hms(2024, 5, 10, 9, 0, 0).unwrap();

        let output = transform(3, 7, &records);
        assert_eq!(output.batch.partition, 3);
        assert_eq!(output.batch.start_offset, 7);
        assert_eq!(output.batch.end_offset, 8);
        assert_eq!(
            output.batch.rows,
            vec![
                SaleRow {
                    customer_id: "C1".into(),
                    order_id: "O1".into(),
                    purchased_at: sold_at,
                    product: "Widget".into(),
                    quantity: 2,
                    unit_price: 10.0,
                    line_total: 20.0,
                    payment_method: "Cartão".into(),
                },
                SaleRow {
                    customer_id: "C1".into(),
                    order_id: "O1".into(),
                    purchased_at: sold_at,
                    product: "Gadget".into(),
                    quantity: 1,
                    unit_price: 5.0,
                    line_total: 5.0,
                    payment_method: "Cartão".into(),
                },
            ]
        );
    }

    #[test]
    fn test_unsold_orders_do_not_affect_others() {
        let records = vec![
            record(
                10,
                r#"{"id_ordem":"A","documento_cliente":"C1","produtos_comprados":[{"nome_produto":"X","quantidade":1,"preco_unitario":1.0}],"data_hora_venda":null}"#,
            ),
            record(
                11,
                r#"{"id_ordem":"B","documento_cliente":"C2","produtos_comprados":[{"nome_produto":"Y","quantidade":4,"preco_unitario":0.5}],"data_hora_venda":"2024-01-01 00:00:00"}"#,
            ),
        ];

        let output = transform(0, 10, &records);
        assert_eq!(output.orders_decoded, 2);
        assert_eq!(output.orders_filtered, 1);
        assert_eq!(output.batch.len(), 1);
        assert_eq!(output.batch.rows[0].order_id, "B");
        assert_eq!(output.batch.rows[0].line_total, 2.0);
        assert_eq!(output.batch.end_offset, 12);
    }

    #[test]
    fn test_malformed_records_are_rejected_not_fatal() {
        let records = vec![
            record(20, "{broken"),
            record(
                21,
                r#"{"id_ordem":"B","documento_cliente":"C2","produtos_comprados":[{"nome_produto":"Y","quantidade":1,"preco_unitario":3.0}],"data_hora_venda":"2024-01-01T00:00:00Z"}"#,
            ),
        ];

        let output = transform(1, 20, &records);
        assert_eq!(output.rejected.len(), 1);
        assert_eq!(output.rejected[0].offset, 20);
        assert_eq!(output.rejected[0].payload, b"{broken".to_vec());
        assert_eq!(output.batch.len(), 1);
        assert_eq!(output.batch.end_offset, 22);
    }

    #[test]
    fn test_fully_filtered_slice_still_spans_offsets() {
        let records = vec![record(
            5,
            r#"{"id_ordem":"A","documento_cliente":"C1","produtos_comprados":[]}"#,
        )];
        let output = transform(0, 3, &records);
        assert!(output.batch.is_empty());
        assert_eq!(output.batch.start_offset, 3);
        assert_eq!(output.batch.end_offset, 6);
    }
}
