use crate::extract::{ExtractionReport, unzip_weather_archives};
use crate::geocoding::{
    CoordinateResolver, GeocodeCache, Geocoder, OpenCageGeocoder, ResolverOptions,
};
use crate::spatial::register_geohash_udf;
use crate::stages::{
    BroadcastTable, EnrichmentReport, JoinReport, PartitionedWriter, RestaurantEnricher,
    WriteReport, broadcast_join, key_weather, read_restaurants, read_weather,
};
use common::config::Settings;
use common::{Error, Result};
use datafusion::prelude::SessionContext;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub enrichment: EnrichmentReport,
    pub extraction: ExtractionReport,
    pub join: JoinReport,
    pub write: WriteReport,
}

pub struct EtlPipeline {
    settings: Settings,
    geocoder: Arc<dyn Geocoder>,
}

impl EtlPipeline {
    /// Pipeline backed by the configured OpenCage endpoint.
    pub fn new(settings: Settings) -> Result<Self> {
        let geocoder = Arc::new(OpenCageGeocoder::new(&settings.geocoder)?);
        Ok(Self::with_geocoder(settings, geocoder))
    }

    pub fn with_geocoder(settings: Settings, geocoder: Arc<dyn Geocoder>) -> Self {
        Self { settings, geocoder }
    }

    /// Enrich restaurants, extract and key weather, join on geohash, publish partitioned output.
    pub async fn run(&self) -> Result<PipelineReport> {
        self.settings.validate()?;
        let paths = &self.settings.paths;

        let ctx = SessionContext::new();
        register_geohash_udf(&ctx, self.settings.join.geohash_precision);

        info!(
            restaurants = %paths.restaurant_csv_dir.display(),
            archives = %paths.weather_archive_dir.display(),
            output = %paths.output_dir.display(),
            precision = self.settings.join.geohash_precision,
            "Starting ETL pipeline"
        );

        let cache = match &self.settings.geocoder.cache_path {
            Some(path) => GeocodeCache::load(path)?,
            None => GeocodeCache::in_memory(),
        };
        let resolver = Arc::new(CoordinateResolver::new(
            Arc::clone(&self.geocoder),
            Arc::new(cache),
            ResolverOptions::from(&self.settings.geocoder),
        ));

        let restaurants = read_restaurants(&ctx, &paths.restaurant_csv_dir).await?;
        let enriched = RestaurantEnricher::new(ctx.clone(), resolver)
            .enrich(restaurants)
            .await?;

        let archive_dir = paths.weather_archive_dir.clone();
        let extract_dir = paths.weather_extract_dir.clone();
        let extraction =
            tokio::task::spawn_blocking(move || unzip_weather_archives(&archive_dir, &extract_dir))
                .await
                .map_err(|e| Error::Other(format!("Extraction task failed: {}", e)))??;
        info!(
            archives = extraction.archives,
            skipped = extraction.skipped_archives.len(),
            files = extraction.files_extracted,
            "Weather extraction complete"
        );

        let weather = read_weather(
            &ctx,
            &paths.weather_extract_dir.join("weather"),
            &self.settings.weather.partition_columns,
        )
        .await?;
        let weather = key_weather(weather)?;

        let table = BroadcastTable::try_new(
            enriched.schema.clone(),
            &enriched.batches,
            self.settings.join.broadcast_max_bytes,
        )?;
        let (joined, join_metrics) = broadcast_join(&ctx, weather, Arc::new(table)).await?;

        let write = PartitionedWriter::new(&paths.output_dir, self.settings.output.target_partitions)
            .write(joined)
            .await?;
        let join = join_metrics.report();

        info!(
            restaurants = enriched.report.rows,
            weather_rows = join.weather_rows,
            output_rows = write.rows,
            partitions = write.partitions,
            "ETL pipeline finished"
        );

        Ok(PipelineReport {
            enrichment: enriched.report,
            extraction,
            join,
            write,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Coordinates, PlaceQuery};
    use crate::utils::arrow::{string_at, utf8_column};
    use crate::utils::paths::dir_url;
    use arrow::array::{Float64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use async_trait::async_trait;
    use common::config::PathsConfig;
    use datafusion::prelude::ParquetReadOptions;
    use parquet::arrow::ArrowWriter;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use zip::write::FileOptions;

    struct StubGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for StubGeocoder {
        async fn lookup(&self, query: &PlaceQuery) -> Result<Option<Coordinates>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.text() == "Savoria, US, Dillon" {
                return Ok(Some(Coordinates::new(39.63026, -106.04335)));
            }
            Ok(None)
        }
    }

    const RESTAURANTS: &str = "\
id,franchise_id,franchise_name,restaurant_franchise_id,country,city,lat,lng
1,10,Savoria,100,US,Dillon,,
2,20,Bistro,200,FR,Paris,48.8566,2.3522
3,30,Ghost Kitchen,300,US,Nowhere,,
";

    fn weather_parquet(lats: Vec<f64>, lngs: Vec<f64>, dates: Vec<&str>) -> Vec<u8> {
        let schema = Schema::new(vec![
            Field::new("lng", DataType::Float64, true),
            Field::new("lat", DataType::Float64, true),
            Field::new("avg_tmpr_c", DataType::Float64, true),
            Field::new("wthr_date", DataType::Utf8, true),
        ]);
        let temps = vec![18.5; lats.len()];
        let batch = RecordBatch::try_new(
            Arc::new(schema),
            vec![
                Arc::new(Float64Array::from(lngs)),
                Arc::new(Float64Array::from(lats)),
                Arc::new(Float64Array::from(temps)),
                Arc::new(StringArray::from(dates)),
            ],
        )
        .unwrap();

        let mut writer = ArrowWriter::try_new(Vec::new(), batch.schema(), None).unwrap();
        writer.write(&batch).unwrap();
        writer.into_inner().unwrap()
    }

    fn fixture(root: &Path) -> Settings {
        let paths = PathsConfig {
            restaurant_csv_dir: root.join("restaurant_csv"),
            weather_archive_dir: root.join("weather_zips"),
            weather_extract_dir: root.join("all"),
            output_dir: root.join("output"),
        };

        fs::create_dir_all(&paths.restaurant_csv_dir).unwrap();
        fs::write(paths.restaurant_csv_dir.join("part-0.csv"), RESTAURANTS).unwrap();

        fs::create_dir_all(&paths.weather_archive_dir).unwrap();
        let file = File::create(paths.weather_archive_dir.join("weather_1.zip")).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let entries = [
            (
                "weather/year=2016/month=10/day=1/part-0.parquet",
                weather_parquet(
                    vec![39.6, 48.85],
                    vec![-106.05, 2.35],
                    vec!["2016-10-01", "2016-10-01"],
                ),
            ),
            (
                "weather/year=2017/month=8/day=2/part-0.parquet",
                weather_parquet(vec![51.5], vec![-0.12], vec!["2017-08-02"]),
            ),
        ];
        for (name, bytes) in entries {
            zip.start_file(name, FileOptions::default()).unwrap();
            zip.write_all(&bytes).unwrap();
        }
        zip.finish().unwrap();

        let mut settings = Settings::with_paths(paths);
        settings.geocoder.requests_per_second = 1000.0;
        settings.geocoder.retry_base_delay_ms = 1;
        settings.geocoder.cache_path = Some(root.join("cache").join("geocode.json"));
        settings.output.target_partitions = 2;
        settings
    }

    async fn output_rows(dir: &Path) -> Vec<(String, String, String, Option<String>)> {
        let ctx = SessionContext::new();
        let options = ParquetReadOptions::default().table_partition_cols(vec![
            ("year".to_string(), DataType::Utf8),
            ("month".to_string(), DataType::Utf8),
        ]);
        let batches = ctx
            .read_parquet(dir_url(dir).unwrap(), options)
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        let mut rows = Vec::new();
        for batch in &batches {
            let years = utf8_column(batch, "year").unwrap();
            let months = utf8_column(batch, "month").unwrap();
            let keys = utf8_column(batch, "geohash").unwrap();
            let names = utf8_column(batch, "franchise_name").unwrap();
            for i in 0..batch.num_rows() {
                rows.push((
                    years.value(i).to_string(),
                    months.value(i).to_string(),
                    keys.value(i).to_string(),
                    string_at(&names, i),
                ));
            }
        }
        rows.sort();
        rows
    }

    #[tokio::test]
    async fn test_end_to_end_run() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fixture(dir.path());
        let geocoder = Arc::new(StubGeocoder {
            calls: AtomicUsize::new(0),
        });

        let pipeline = EtlPipeline::with_geocoder(settings, geocoder.clone());
        let report = pipeline.run().await.unwrap();

        assert_eq!(report.enrichment.rows, 3);
        assert_eq!(report.enrichment.missing_coordinates, 2);
        assert_eq!(report.enrichment.resolution.resolved, 1);
        assert_eq!(report.extraction.files_extracted, 2);
        assert_eq!(report.join.weather_rows, 3);
        assert_eq!(report.write.rows, 3);
        assert_eq!(report.write.partitions, 2);
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);

        let rows = output_rows(&dir.path().join("output")).await;
        assert_eq!(
            rows,
            vec![
                ("2016".into(), "10".into(), "9xh9".into(), Some("Savoria".into())),
                ("2016".into(), "10".into(), "u09t".into(), Some("Bistro".into())),
                ("2017".into(), "8".into(), "gcpu".into(), None),
            ]
        );
        assert!(dir.path().join("output").join("_SUCCESS").exists());
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent_and_uses_cache() {
        let dir = tempfile::tempdir().unwrap();
        let settings = fixture(dir.path());
        let geocoder = Arc::new(StubGeocoder {
            calls: AtomicUsize::new(0),
        });
        let pipeline = EtlPipeline::with_geocoder(settings, geocoder.clone());

        pipeline.run().await.unwrap();
        let first = output_rows(&dir.path().join("output")).await;
        let report = pipeline.run().await.unwrap();
        let second = output_rows(&dir.path().join("output")).await;

        assert_eq!(first, second);
        // both answers, the match and the confirmed miss, came from the cache
        assert_eq!(geocoder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(report.enrichment.resolution.cache_hits, 2);
    }

    #[tokio::test]
    async fn test_oversized_broadcast_aborts_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = fixture(dir.path());
        settings.join.broadcast_max_bytes = 1;
        let pipeline = EtlPipeline::with_geocoder(
            settings,
            Arc::new(StubGeocoder {
                calls: AtomicUsize::new(0),
            }),
        );

        let err = pipeline.run().await.unwrap_err();
        assert!(matches!(err, Error::BroadcastTooLarge { .. }));
        assert!(!dir.path().join("output").join("_SUCCESS").exists());
    }
}
