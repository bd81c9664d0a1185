use arrow::array::{Array, ArrayRef, AsArray, Float64Array, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Float64Type, Int64Type};
use arrow::record_batch::RecordBatch;
use common::Result;

/// Looks up `name` in the batch and casts it to `data_type` when it is stored differently
/// (e.g. `Utf8View` from Parquet, `Int32` year columns, integer coordinates from CSV inference).
pub fn column_as(batch: &RecordBatch, name: &str, data_type: &DataType) -> Result<ArrayRef> {
    let idx = batch.schema().index_of(name)?;
    let column = batch.column(idx);
    if column.data_type() == data_type {
        return Ok(column.clone());
    }
    Ok(cast(column, data_type)?)
}

pub fn utf8_column(batch: &RecordBatch, name: &str) -> Result<StringArray> {
    let array = column_as(batch, name, &DataType::Utf8)?;
    Ok(array.as_string::<i32>().clone())
}

pub fn i64_column(batch: &RecordBatch, name: &str) -> Result<Int64Array> {
    let array = column_as(batch, name, &DataType::Int64)?;
    Ok(array.as_primitive::<Int64Type>().clone())
}

pub fn f64_column(batch: &RecordBatch, name: &str) -> Result<Float64Array> {
    let array = column_as(batch, name, &DataType::Float64)?;
    Ok(array.as_primitive::<Float64Type>().clone())
}

pub fn row_count(batches: &[RecordBatch]) -> usize {
    batches.iter().map(|b| b.num_rows()).sum()
}

/// Nullable string cell as an owned value.
pub fn string_at(array: &StringArray, idx: usize) -> Option<String> {
    if array.is_null(idx) {
        None
    } else {
        Some(array.value(idx).to_string())
    }
}
