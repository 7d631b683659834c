use futures::stream::{self, TryStreamExt};
use scylla::batch::{Batch as CqlBatch, BatchType};
use scylla::frame::value::CqlTimestamp;
use scylla::prepared_statement::PreparedStatement;
use scylla::statement::Consistency;
use scylla::transport::errors::{DbError, QueryError};
use scylla::{Session, SessionBuilder};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::{CassandraOptions, WriteConsistency};
use crate::errors::WriteError;
use crate::model::SaleRow;
use crate::sink::SaleSink;

type RowValues = (String, String, CqlTimestamp, String, i32, f64, f64, String);

/// Upserts sale rows into a Cassandra (or ScyllaDB) table.
///
/// Rows are grouped by partition key into unlogged batches, which run concurrently over
/// the driver's connection pool.
pub struct CassandraSink {
    session: Session,
    insert: PreparedStatement,
    consistency: Consistency,
    max_batch_rows: usize,
    write_concurrency: usize,
}

impl CassandraSink {
    pub async fn connect(options: &CassandraOptions) -> Result<Self, WriteError> {
        let mut builder = SessionBuilder::new().known_nodes(&options.hosts);
        if let (Some(username), Some(password)) = (&options.username, &options.password) {
            builder = builder.user(username, password);
        }
        let session = builder.build().await.map_err(|e| WriteError::Connection {
            reason: e.to_string(),
        })?;

        if options.create_schema {
            session
                .query_unpaged(create_keyspace_cql(options), ())
                .await
                .map_err(classify)?;
            session
                .query_unpaged(create_table_cql(options), ())
                .await
                .map_err(classify)?;
            info!(
                keyspace = %options.keyspace,
                table = %options.table,
                "Ensured sink schema"
            );
        }

        let consistency = consistency(options.consistency);
        let mut insert = session
            .prepare(insert_cql(options))
            .await
            .map_err(classify)?;
        insert.set_consistency(consistency);

        info!(hosts = ?options.hosts, "Connected to Cassandra");
        Ok(Self {
            session,
            insert,
            consistency,
            max_batch_rows: options.max_batch_rows.max(1),
            write_concurrency: options.write_concurrency.max(1),
        })
    }

    async fn write_chunk(&self, rows: Vec<&SaleRow>) -> Result<(), WriteError> {
        let mut batch = CqlBatch::new(BatchType::Unlogged);
        batch.set_consistency(self.consistency);
        for _ in &rows {
            batch.append_statement(self.insert.clone());
        }
        let values: Vec<RowValues> = rows.iter().map(|row| row_values(row)).collect();

        self.session
            .batch(&batch, values)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

impl SaleSink for CassandraSink {
    async fn bulk_upsert(&self, rows: &[SaleRow]) -> Result<(), WriteError> {
        let chunks = partition_chunks(rows, self.max_batch_rows);
        debug!(rows = rows.len(), batches = chunks.len(), "Upserting rows");
        stream::iter(chunks.into_iter().map(Ok::<_, WriteError>))
            .try_for_each_concurrent(self.write_concurrency, |chunk| self.write_chunk(chunk))
            .await
    }
}

/// Splits rows into groups sharing a partition key, at most `max_rows` per group.
fn partition_chunks(rows: &[SaleRow], max_rows: usize) -> Vec<Vec<&SaleRow>> {
    let mut by_customer: BTreeMap<&str, Vec<&SaleRow>> = BTreeMap::new();
    for row in rows {
        by_customer.entry(&row.customer_id).or_default().push(row);
    }
    by_customer
        .into_values()
        .flat_map(|group| {
            group
                .chunks(max_rows.max(1))
                .map(<[&SaleRow]>::to_vec)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn row_values(row: &SaleRow) -> RowValues {
    (
        row.customer_id.clone(),
        row.order_id.clone(),
        CqlTimestamp(row.purchased_at.timestamp_millis()),
        row.product.clone(),
        row.quantity,
        row.unit_price,
        row.line_total,
        row.payment_method.clone(),
    )
}

fn consistency(level: WriteConsistency) -> Consistency {
    match level {
        WriteConsistency::One => Consistency::One,
        WriteConsistency::Quorum => Consistency::Quorum,
        WriteConsistency::LocalQuorum => Consistency::LocalQuorum,
        WriteConsistency::All => Consistency::All,
    }
}

/// Schema and statement errors will fail the same way on every attempt.
fn classify(err: QueryError) -> WriteError {
    let permanent = matches!(
        &err,
        QueryError::BadQuery(_)
            | QueryError::DbError(
                DbError::Invalid
                    | DbError::SyntaxError
                    | DbError::Unauthorized
                    | DbError::ConfigError
                    | DbError::AlreadyExists { .. },
                _
            )
    );
    if permanent {
        WriteError::Rejected {
            reason: err.to_string(),
        }
    } else {
        WriteError::Transient {
            reason: err.to_string(),
        }
    }
}

fn create_keyspace_cql(options: &CassandraOptions) -> String {
    format!(
        "CREATE KEYSPACE IF NOT EXISTS {} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
        options.keyspace, options.replication_factor
    )
}

fn create_table_cql(options: &CassandraOptions) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {}.{} (\
         customer_id text, order_id text, purchased_at timestamp, product text, \
         quantity int, unit_price double, line_total double, payment_method text, \
         PRIMARY KEY ((customer_id), purchased_at, product, order_id))",
        options.keyspace, options.table
    )
}

fn insert_cql(options: &CassandraOptions) -> String {
    format!(
        "INSERT INTO {}.{} (customer_id, order_id, purchased_at, product, quantity, \
         unit_price, line_total, payment_method) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        options.keyspace, options.table
    )
}
