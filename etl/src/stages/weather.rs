use crate::models::columns::{LAT, LNG, MONTH, YEAR};
use crate::spatial::with_geohash;
use crate::utils::paths::dir_url;
use arrow::datatypes::DataType;
use common::{Error, Result};
use datafusion::prelude::*;
use std::path::Path;
use tracing::info;

/// Reads the extracted weather Parquet files. `partition_columns` names hive-style directory
/// levels (`year=2016/month=10/…`) whose values become integer columns.
pub async fn read_weather(
    ctx: &SessionContext,
    dir: &Path,
    partition_columns: &[String],
) -> Result<DataFrame> {
    let url = dir_url(dir)?;
    info!(path = %url, partitions = ?partition_columns, "Reading weather Parquet files");

    let options = ParquetReadOptions::default().table_partition_cols(
        partition_columns
            .iter()
            .map(|name| (name.clone(), DataType::Int32))
            .collect(),
    );
    Ok(ctx.read_parquet(url, options).await?)
}

/// Attaches the geohash of each weather row's own coordinates. Rows are neither filtered nor
/// deduplicated.
pub fn key_weather(weather: DataFrame) -> Result<DataFrame> {
    let names: Vec<String> = weather
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    for required in [LAT, LNG, YEAR, MONTH] {
        if !names.iter().any(|n| n == required) {
            return Err(Error::SchemaMismatch(format!(
                "Weather dataset is missing required column '{}'",
                required
            )));
        }
    }

    with_geohash(weather)
}
