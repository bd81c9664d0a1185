pub mod extract;
pub mod geocoding;
pub mod models;
pub mod pipeline;
pub mod spatial;
pub mod stages;
pub mod utils;

pub use pipeline::{EtlPipeline, PipelineReport};

use common::config::Settings;
use common::Result;
use tracing::info;

/// Loads settings from `config_path` (plus `APP_*` environment overrides) and runs the pipeline
/// once.
pub async fn run_etl_pipeline(config_path: &str) -> Result<PipelineReport> {
    let settings = Settings::new(config_path)?;
    info!(config = config_path, "Loaded ETL configuration");
    EtlPipeline::new(settings)?.run().await
}
