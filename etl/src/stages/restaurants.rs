use crate::geocoding::{CoordinateResolver, ResolutionReport};
use crate::models::columns::{
    CITY, COUNTRY, FRANCHISE_NAME, ID, LAT, LNG, RESOLVED_ID, RESOLVED_LAT, RESOLVED_LNG,
};
use crate::models::{Coordinates, PlaceQuery};
use crate::spatial::{GEOHASH_COLUMN, with_geohash};
use crate::utils::arrow::{i64_column, row_count, string_at, utf8_column};
use crate::utils::paths::dir_url;
use arrow::array::{Array, Float64Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use common::{Error, Result};
use datafusion::logical_expr::{Expr, JoinType, cast, col, ident, when};
use datafusion::prelude::*;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

const REQUIRED_COLUMNS: [&str; 6] = [ID, FRANCHISE_NAME, COUNTRY, CITY, LAT, LNG];

#[derive(Debug, Default, Clone)]
pub struct EnrichmentReport {
    pub rows: usize,
    pub missing_coordinates: usize,
    pub resolution: ResolutionReport,
    /// Records left without a geohash (no coordinates even after resolution).
    pub unkeyed: usize,
}

/// Restaurants with final coordinates and a geohash, held in memory for broadcasting.
pub struct EnrichedRestaurants {
    pub schema: SchemaRef,
    pub batches: Vec<RecordBatch>,
    pub report: EnrichmentReport,
}

pub async fn read_restaurants(ctx: &SessionContext, dir: &Path) -> Result<DataFrame> {
    let url = dir_url(dir)?;
    info!(path = %url, "Reading restaurant CSV files");
    let options = CsvReadOptions::new().has_header(true).file_extension(".csv");
    Ok(ctx.read_csv(url, options).await?)
}

pub struct RestaurantEnricher {
    ctx: SessionContext,
    resolver: Arc<CoordinateResolver>,
}

impl RestaurantEnricher {
    pub fn new(ctx: SessionContext, resolver: Arc<CoordinateResolver>) -> Self {
        Self { ctx, resolver }
    }

    /// Fills missing coordinates through the resolver and attaches a geohash to every record.
    ///
    /// Records that already have both coordinates never reach the resolver. No record is
    /// dropped: output row count equals input row count.
    pub async fn enrich(&self, restaurants: DataFrame) -> Result<EnrichedRestaurants> {
        let restaurants = normalize(restaurants)?;
        let column_order: Vec<String> = restaurants
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();

        let queries = self.missing_coordinates(&restaurants).await?;
        let missing = queries.len();
        info!(missing, "Restaurants without coordinates");

        let (resolved, resolution) = self.resolver.resolve_all(queries).await;
        let side_table = self.ctx.read_batch(resolved_batch(&resolved)?)?;

        // Resolved values win when present; everything else keeps its original coordinates.
        let merged = restaurants.join(side_table, JoinType::Left, &[ID], &[RESOLVED_ID], None)?;
        let projection = column_order
            .iter()
            .map(|name| match name.as_str() {
                LAT => coalesce_coordinate(RESOLVED_LAT, LAT),
                LNG => coalesce_coordinate(RESOLVED_LNG, LNG),
                _ => Ok(ident(name)),
            })
            .collect::<Result<Vec<Expr>>>()?;
        let merged = merged.select(projection)?;

        let keyed = with_geohash(merged)?;
        let schema = keyed.schema().inner().clone();
        let batches = keyed.collect().await?;

        let unkeyed = batches
            .iter()
            .filter_map(|b| b.column_by_name(GEOHASH_COLUMN))
            .map(|c| c.null_count())
            .sum();

        let report = EnrichmentReport {
            rows: row_count(&batches),
            missing_coordinates: missing,
            resolution,
            unkeyed,
        };
        info!(
            rows = report.rows,
            resolved = report.resolution.resolved,
            unkeyed = report.unkeyed,
            "Restaurant enrichment complete"
        );

        let schema = batches.first().map(|b| b.schema()).unwrap_or(schema);
        Ok(EnrichedRestaurants {
            schema,
            batches,
            report,
        })
    }

    async fn missing_coordinates(&self, restaurants: &DataFrame) -> Result<Vec<PlaceQuery>> {
        let batches = restaurants
            .clone()
            .filter(col(LAT).is_null().or(col(LNG).is_null()))?
            .select(vec![
                col(ID),
                cast(ident(FRANCHISE_NAME), DataType::Utf8).alias(FRANCHISE_NAME),
                cast(ident(COUNTRY), DataType::Utf8).alias(COUNTRY),
                cast(ident(CITY), DataType::Utf8).alias(CITY),
            ])?
            .collect()
            .await?;

        let mut queries = Vec::new();
        for batch in &batches {
            let ids = i64_column(batch, ID)?;
            let names = utf8_column(batch, FRANCHISE_NAME)?;
            let countries = utf8_column(batch, COUNTRY)?;
            let cities = utf8_column(batch, CITY)?;

            for row in 0..batch.num_rows() {
                if ids.is_null(row) {
                    warn!(row, "Skipping restaurant without id, its coordinates cannot be merged back");
                    continue;
                }
                queries.push(PlaceQuery::new(
                    ids.value(row),
                    &string_at(&names, row).unwrap_or_default(),
                    &string_at(&countries, row).unwrap_or_default(),
                    &string_at(&cities, row).unwrap_or_default(),
                ));
            }
        }
        Ok(queries)
    }
}

/// Checks the columns the stage relies on and fixes the types of id and coordinates.
fn normalize(restaurants: DataFrame) -> Result<DataFrame> {
    let names: Vec<String> = restaurants
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();

    for required in REQUIRED_COLUMNS {
        if !names.iter().any(|n| n == required) {
            return Err(Error::SchemaMismatch(format!(
                "Restaurant dataset is missing required column '{}'",
                required
            )));
        }
    }
    for reserved in [RESOLVED_ID, RESOLVED_LAT, RESOLVED_LNG, GEOHASH_COLUMN] {
        if names.iter().any(|n| n == reserved) {
            return Err(Error::SchemaMismatch(format!(
                "Restaurant dataset already contains reserved column '{}'",
                reserved
            )));
        }
    }

    let projection: Vec<Expr> = names
        .iter()
        .map(|name| match name.as_str() {
            ID => cast(col(ID), DataType::Int64).alias(ID),
            LAT => cast(col(LAT), DataType::Float64).alias(LAT),
            LNG => cast(col(LNG), DataType::Float64).alias(LNG),
            _ => ident(name),
        })
        .collect();

    Ok(restaurants.select(projection)?)
}

fn coalesce_coordinate(resolved: &str, original: &str) -> Result<Expr> {
    Ok(when(col(resolved).is_not_null(), col(resolved))
        .otherwise(col(original))?
        .alias(original))
}

/// Side table with one row per looked-up record; coordinates are null on no match.
fn resolved_batch(resolved: &HashMap<i64, Option<Coordinates>>) -> Result<RecordBatch> {
    let mut rows: Vec<(i64, Option<Coordinates>)> =
        resolved.iter().map(|(id, coords)| (*id, *coords)).collect();
    rows.sort_by_key(|(id, _)| *id);

    let schema = Schema::new(vec![
        Field::new(RESOLVED_ID, DataType::Int64, false),
        Field::new(RESOLVED_LAT, DataType::Float64, true),
        Field::new(RESOLVED_LNG, DataType::Float64, true),
    ]);

    let ids = Int64Array::from_iter_values(rows.iter().map(|(id, _)| *id));
    let lats: Float64Array = rows.iter().map(|(_, c)| c.map(|c| c.lat)).collect();
    let lngs: Float64Array = rows.iter().map(|(_, c)| c.map(|c| c.lng)).collect();

    Ok(RecordBatch::try_new(
        Arc::new(schema),
        vec![Arc::new(ids), Arc::new(lats), Arc::new(lngs)],
    )?)
}
