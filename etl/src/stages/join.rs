use crate::models::columns::{LAT, LNG};
use crate::spatial::GEOHASH_COLUMN;
use crate::utils::arrow::utf8_column;
use arrow::array::{Array, ArrayRef, UInt32Array, UInt32Builder, new_null_array};
use arrow::compute::{concat_batches, take};
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use datafusion::catalog::streaming::StreamingTable;
use datafusion::error::DataFusionError;
use datafusion::execution::TaskContext;
use datafusion::physical_plan::stream::RecordBatchStreamAdapter;
use datafusion::physical_plan::streaming::PartitionStream;
use datafusion::physical_plan::{ExecutionPlan, ExecutionPlanProperties, SendableRecordBatchStream};
use datafusion::prelude::*;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct JoinReport {
    pub weather_rows: usize,
    pub output_rows: usize,
    pub matched_rows: usize,
    pub broadcast_rows: usize,
    pub broadcast_bytes: usize,
}

/// The restaurant side of the join, held once in memory and shared read-only by every weather
/// partition.
///
/// `payload` keeps the descriptive restaurant columns only; coordinates and the key itself are
/// already present on the weather side.
#[derive(Debug)]
pub struct BroadcastTable {
    payload: RecordBatch,
    index: HashMap<String, Vec<u32>>,
    size_bytes: usize,
}

impl BroadcastTable {
    pub fn try_new(schema: SchemaRef, batches: &[RecordBatch], max_bytes: usize) -> Result<Self> {
        let all = concat_batches(&schema, batches)?;
        let keys = utf8_column(&all, GEOHASH_COLUMN)?;

        let mut index: HashMap<String, Vec<u32>> = HashMap::new();
        for row in 0..keys.len() {
            if keys.is_null(row) {
                continue;
            }
            let row = u32::try_from(row).map_err(|_| Error::BroadcastTooLarge {
                size: all.num_rows(),
                limit: u32::MAX as usize,
            })?;
            index
                .entry(keys.value(row as usize).to_string())
                .or_default()
                .push(row);
        }

        let projection: Vec<usize> = schema
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, f)| ![LAT, LNG, GEOHASH_COLUMN].contains(&f.name().as_str()))
            .map(|(i, _)| i)
            .collect();
        let payload = all.project(&projection)?;

        let index_bytes: usize = index
            .iter()
            .map(|(k, rows)| k.len() + rows.len() * std::mem::size_of::<u32>())
            .sum();
        let size_bytes = payload.get_array_memory_size() + index_bytes;
        if size_bytes > max_bytes {
            return Err(Error::BroadcastTooLarge {
                size: size_bytes,
                limit: max_bytes,
            });
        }

        debug!(
            rows = payload.num_rows(),
            keys = index.len(),
            bytes = size_bytes,
            "Built broadcast table"
        );

        Ok(Self {
            payload,
            index,
            size_bytes,
        })
    }

    pub fn num_rows(&self) -> usize {
        self.payload.num_rows()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Weather columns followed by the restaurant payload, which becomes nullable since
    /// unmatched weather rows carry no restaurant.
    pub fn output_schema(&self, weather: &Schema) -> Result<SchemaRef> {
        let mut fields: Vec<Field> = weather.fields().iter().map(|f| f.as_ref().clone()).collect();

        for field in self.payload.schema().fields() {
            if weather.field_with_name(field.name()).is_ok() {
                return Err(Error::SchemaMismatch(format!(
                    "Restaurant column '{}' collides with a weather column",
                    field.name()
                )));
            }
            fields.push(field.as_ref().clone().with_nullable(true));
        }

        Ok(Arc::new(Schema::new(fields)))
    }

    /// Left-outer join of one weather batch. Returns the joined batch and the number of output
    /// rows that found a restaurant.
    pub fn join_batch(
        &self,
        batch: &RecordBatch,
        schema: &SchemaRef,
    ) -> Result<(RecordBatch, usize)> {
        let keys = utf8_column(batch, GEOHASH_COLUMN)?;
        let mut left = UInt32Builder::with_capacity(batch.num_rows());
        let mut right = UInt32Builder::with_capacity(batch.num_rows());
        let mut matched = 0;

        for row in 0..batch.num_rows() {
            let hits = if keys.is_null(row) {
                None
            } else {
                self.index.get(keys.value(row))
            };
            match hits {
                Some(rows) => {
                    for r in rows {
                        left.append_value(row as u32);
                        right.append_value(*r);
                    }
                    matched += rows.len();
                }
                None => {
                    left.append_value(row as u32);
                    right.append_null();
                }
            }
        }

        let left = left.finish();
        let right = right.finish();

        let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
        for column in batch.columns() {
            columns.push(take(column.as_ref(), &left, None)?);
        }
        for column in self.payload.columns() {
            columns.push(self.take_payload(column, &right)?);
        }

        Ok((RecordBatch::try_new(schema.clone(), columns)?, matched))
    }

    fn take_payload(&self, column: &ArrayRef, indices: &UInt32Array) -> Result<ArrayRef> {
        if indices.null_count() == indices.len() {
            return Ok(new_null_array(column.data_type(), indices.len()));
        }
        Ok(take(column.as_ref(), indices, None)?)
    }
}

/// Running totals of a broadcast join. The counters fill in as the joined frame is consumed.
#[derive(Debug, Default)]
pub struct JoinMetrics {
    weather_rows: AtomicUsize,
    output_rows: AtomicUsize,
    matched_rows: AtomicUsize,
    broadcast_rows: usize,
    broadcast_bytes: usize,
}

impl JoinMetrics {
    fn record(&self, weather_rows: usize, output_rows: usize, matched_rows: usize) {
        self.weather_rows.fetch_add(weather_rows, Ordering::Relaxed);
        self.output_rows.fetch_add(output_rows, Ordering::Relaxed);
        self.matched_rows.fetch_add(matched_rows, Ordering::Relaxed);
    }

    pub fn report(&self) -> JoinReport {
        JoinReport {
            weather_rows: self.weather_rows.load(Ordering::Relaxed),
            output_rows: self.output_rows.load(Ordering::Relaxed),
            matched_rows: self.matched_rows.load(Ordering::Relaxed),
            broadcast_rows: self.broadcast_rows,
            broadcast_bytes: self.broadcast_bytes,
        }
    }
}

/// One weather partition joined batch by batch against the shared table.
#[derive(Debug)]
struct JoinedPartition {
    input: Arc<dyn ExecutionPlan>,
    partition: usize,
    table: Arc<BroadcastTable>,
    schema: SchemaRef,
    metrics: Arc<JoinMetrics>,
}

impl PartitionStream for JoinedPartition {
    fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    fn execute(&self, ctx: Arc<TaskContext>) -> SendableRecordBatchStream {
        let table = Arc::clone(&self.table);
        let schema = self.schema.clone();
        let metrics = Arc::clone(&self.metrics);

        let joined = match self.input.execute(self.partition, ctx) {
            Ok(input) => input
                .map(move |batch| -> datafusion::error::Result<RecordBatch> {
                    let batch = batch?;
                    let (joined, matched) = table
                        .join_batch(&batch, &schema)
                        .map_err(|e| DataFusionError::External(Box::new(e)))?;
                    metrics.record(batch.num_rows(), joined.num_rows(), matched);
                    Ok(joined)
                })
                .boxed(),
            Err(e) => stream::once(async move { Err::<RecordBatch, _>(e) }).boxed(),
        };

        Box::pin(RecordBatchStreamAdapter::new(self.schema.clone(), joined))
    }
}

/// Joins every weather row to the restaurants sharing its geohash.
///
/// The returned frame is lazy: each weather partition is matched against the shared table only
/// when the consumer pulls from it, and the weather side is never shuffled. The metrics cover
/// what has been consumed so far.
pub async fn broadcast_join(
    ctx: &SessionContext,
    weather: DataFrame,
    table: Arc<BroadcastTable>,
) -> Result<(DataFrame, Arc<JoinMetrics>)> {
    let input = weather.create_physical_plan().await?;
    let output_schema = table.output_schema(&input.schema())?;
    let partitions = input.output_partitioning().partition_count();

    let metrics = Arc::new(JoinMetrics {
        broadcast_rows: table.num_rows(),
        broadcast_bytes: table.size_bytes(),
        ..Default::default()
    });

    info!(
        partitions,
        broadcast_rows = table.num_rows(),
        broadcast_bytes = table.size_bytes(),
        "Prepared broadcast join"
    );

    let streams: Vec<Arc<dyn PartitionStream>> = (0..partitions)
        .map(|partition| {
            Arc::new(JoinedPartition {
                input: Arc::clone(&input),
                partition,
                table: Arc::clone(&table),
                schema: output_schema.clone(),
                metrics: Arc::clone(&metrics),
            }) as Arc<dyn PartitionStream>
        })
        .collect();

    let joined = StreamingTable::try_new(output_schema, streams)?;
    Ok((ctx.read_table(Arc::new(joined))?, metrics))
}
