use config::{Config, ConfigError};
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub paths: PathsConfig,
    #[serde(default)]
    pub geocoder: GeocoderConfig,
    #[serde(default)]
    pub join: JoinConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub restaurant_csv_dir: PathBuf,
    pub weather_archive_dir: PathBuf,
    pub weather_extract_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocoderConfig {
    #[serde(default = "default_geocoder_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JoinConfig {
    #[serde(default = "default_geohash_precision")]
    pub geohash_precision: usize,
    #[serde(default = "default_broadcast_max_bytes")]
    pub broadcast_max_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WeatherConfig {
    /// Hive-style directory partitions of the extracted weather files, e.g. `year=2016/month=10`.
    #[serde(default = "default_weather_partitions")]
    pub partition_columns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_target_partitions")]
    pub target_partitions: usize,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            base_url: default_geocoder_url(),
            api_key: String::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            concurrency: default_concurrency(),
            requests_per_second: default_requests_per_second(),
            cache_path: None,
        }
    }
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            geohash_precision: default_geohash_precision(),
            broadcast_max_bytes: default_broadcast_max_bytes(),
        }
    }
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            partition_columns: default_weather_partitions(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            target_partitions: default_target_partitions(),
        }
    }
}

fn default_geocoder_url() -> String {
    "https://api.opencagedata.com/geocode/v1/json".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_concurrency() -> usize {
    4
}

fn default_requests_per_second() -> f64 {
    1.0
}

fn default_geohash_precision() -> usize {
    4
}

fn default_broadcast_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_weather_partitions() -> Vec<String> {
    vec!["year".to_string(), "month".to_string(), "day".to_string()]
}

fn default_target_partitions() -> usize {
    8
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = builder.build()?;

        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;

        debug!(
            restaurants = %settings.paths.restaurant_csv_dir.display(),
            output = %settings.paths.output_dir.display(),
            precision = settings.join.geohash_precision,
            "Loaded ETL settings"
        );

        Ok(settings)
    }

    /// Settings with every tunable at its default, for callers that only know the paths.
    pub fn with_paths(paths: PathsConfig) -> Self {
        Self {
            paths,
            geocoder: GeocoderConfig::default(),
            join: JoinConfig::default(),
            weather: WeatherConfig::default(),
            output: OutputConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=12).contains(&self.join.geohash_precision) {
            return Err(ConfigError::Message(format!(
                "join.geohash_precision must be between 1 and 12, got {}",
                self.join.geohash_precision
            )));
        }
        if self.geocoder.concurrency == 0 {
            return Err(ConfigError::Message(
                "geocoder.concurrency must be at least 1".to_string(),
            ));
        }
        if !(self.geocoder.requests_per_second > 0.0) {
            return Err(ConfigError::Message(format!(
                "geocoder.requests_per_second must be positive, got {}",
                self.geocoder.requests_per_second
            )));
        }
        if self.output.target_partitions == 0 {
            return Err(ConfigError::Message(
                "output.target_partitions must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
