//! Geohash keys used as the spatial bucket shared by restaurants and weather rows.
//!
//! Both sides of the join derive keys through the same function, so identical coordinates always
//! land in the same bucket and nearby points share a bucket at low precision.

use arrow::array::{Array, AsArray, StringArray};
use arrow::datatypes::{DataType, Float64Type};
use datafusion::common::{DataFusionError, ScalarValue};
use datafusion::dataframe::DataFrame;
use datafusion::execution::context::SessionContext;
use datafusion::logical_expr::{ColumnarValue, ScalarUDF, Volatility, cast, col, create_udf};
use geohash::Coord;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub const DEFAULT_PRECISION: usize = 4;
pub const MAX_PRECISION: usize = 12;
pub const GEOHASH_COLUMN: &str = "geohash";
pub const GEOHASH_UDF: &str = "geohash";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GeohashKey(String);

impl GeohashKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for GeohashKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a coordinate pair produced no key. In columnar form every variant becomes a null key.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeohashError {
    #[error("latitude or longitude is missing")]
    MissingCoordinate,

    #[error("coordinates out of range: lat={lat}, lng={lng}")]
    OutOfRange { lat: f64, lng: f64 },

    #[error("geohash encoding failed: {0}")]
    Encoding(String),
}

pub fn encode(
    lat: Option<f64>,
    lng: Option<f64>,
    precision: usize,
) -> Result<GeohashKey, GeohashError> {
    if !(1..=MAX_PRECISION).contains(&precision) {
        return Err(GeohashError::Encoding(format!(
            "unsupported precision {}",
            precision
        )));
    }

    let (lat, lng) = match (lat, lng) {
        (Some(lat), Some(lng)) => (lat, lng),
        _ => return Err(GeohashError::MissingCoordinate),
    };

    if !lat.is_finite()
        || !lng.is_finite()
        || !(-90.0..=90.0).contains(&lat)
        || !(-180.0..=180.0).contains(&lng)
    {
        return Err(GeohashError::OutOfRange { lat, lng });
    }

    geohash::encode(Coord { x: lng, y: lat }, precision)
        .map(GeohashKey)
        .map_err(|e| GeohashError::Encoding(e.to_string()))
}

/// `geohash(lat, lng)` as a DataFusion scalar function returning a nullable Utf8 key.
pub fn geohash_udf(precision: usize) -> ScalarUDF {
    create_udf(
        GEOHASH_UDF,
        vec![DataType::Float64, DataType::Float64],
        DataType::Utf8,
        Volatility::Immutable,
        Arc::new(move |args: &[ColumnarValue]| encode_columns(args, precision)),
    )
}

/// Registers `geohash` with the session. Both datasets are keyed through this one registration,
/// so restaurant and weather keys always share a precision.
pub fn register_geohash_udf(ctx: &SessionContext, precision: usize) {
    ctx.register_udf(geohash_udf(precision));
}

/// Adds the `geohash` column computed from the frame's own `lat`/`lng` columns.
pub fn with_geohash(df: DataFrame) -> common::Result<DataFrame> {
    let udf = df.registry().udf(GEOHASH_UDF)?;
    let key = udf.call(vec![
        cast(col("lat"), DataType::Float64),
        cast(col("lng"), DataType::Float64),
    ]);
    Ok(df.with_column(GEOHASH_COLUMN, key)?)
}

fn encode_columns(
    args: &[ColumnarValue],
    precision: usize,
) -> datafusion::error::Result<ColumnarValue> {
    if args.len() != 2 {
        return Err(DataFusionError::Internal(format!(
            "geohash expects 2 arguments, got {}",
            args.len()
        )));
    }
    let all_scalar = args.iter().all(|a| matches!(a, ColumnarValue::Scalar(_)));
    let arrays = ColumnarValue::values_to_arrays(args)?;

    let lat = arrays[0]
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| DataFusionError::Internal("geohash expects Float64 latitude".to_string()))?;
    let lng = arrays[1]
        .as_primitive_opt::<Float64Type>()
        .ok_or_else(|| DataFusionError::Internal("geohash expects Float64 longitude".to_string()))?;

    let keys: StringArray = lat
        .iter()
        .zip(lng.iter())
        .map(|(lat, lng)| encode(lat, lng, precision).ok().map(GeohashKey::into_string))
        .collect();

    if all_scalar && keys.len() == 1 {
        return Ok(ColumnarValue::Scalar(ScalarValue::try_from_array(&keys, 0)?));
    }
    Ok(ColumnarValue::Array(Arc::new(keys)))
}
