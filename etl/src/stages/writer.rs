use crate::models::columns::{MONTH, YEAR};
use crate::utils::arrow::i64_column;
use crate::utils::paths::{dir_url, partition_path, staging_dir};
use arrow::datatypes::DataType;
use chrono::{DateTime, Utc};
use common::{Error, Result};
use datafusion::dataframe::DataFrameWriteOptions;
use datafusion::logical_expr::{Expr, Partitioning, cast, col, ident};
use datafusion::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const SUCCESS_MARKER: &str = "_SUCCESS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub rows: usize,
    pub partitions: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SuccessMarker {
    pub rows: usize,
    pub partitions: usize,
    pub written_at: DateTime<Utc>,
}

/// Writes a frame as hive-style `year=Y/month=M` Parquet directories.
///
/// Output is staged in a sibling directory first; a partition only appears in `output_dir` once
/// its files are complete.
pub struct PartitionedWriter {
    output_dir: PathBuf,
    target_partitions: usize,
}

impl PartitionedWriter {
    pub fn new(output_dir: impl Into<PathBuf>, target_partitions: usize) -> Self {
        Self {
            output_dir: output_dir.into(),
            target_partitions: target_partitions.max(1),
        }
    }

    pub async fn write(&self, df: DataFrame) -> Result<WriteReport> {
        let names: Vec<String> = df
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        for required in [YEAR, MONTH] {
            if !names.iter().any(|n| n == required) {
                return Err(Error::SchemaMismatch(format!(
                    "Cannot partition output without column '{}'",
                    required
                )));
            }
        }

        fs::create_dir_all(&self.output_dir)?;
        let marker_path = self.output_dir.join(SUCCESS_MARKER);
        if marker_path.exists() {
            fs::remove_file(&marker_path)?;
        }

        let run_id = Utc::now().format("%Y%m%d%H%M%S%f").to_string();
        let staging = staging_dir(&self.output_dir, &run_id)?;
        fs::create_dir_all(&staging)?;

        let result = self.write_staged(df, &names, &staging).await;
        let report = match result {
            Ok(rows) => {
                let published = self.publish(&staging)?;
                self.remove_stale_partitions(&published)?;
                WriteReport {
                    rows,
                    partitions: published.len(),
                }
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(e);
            }
        };
        fs::remove_dir_all(&staging)?;

        let marker = SuccessMarker {
            rows: report.rows,
            partitions: report.partitions,
            written_at: Utc::now(),
        };
        fs::write(&marker_path, serde_json::to_vec_pretty(&marker)?)?;

        info!(
            output = %self.output_dir.display(),
            rows = report.rows,
            partitions = report.partitions,
            "Published partitioned output"
        );
        Ok(report)
    }

    async fn write_staged(&self, df: DataFrame, names: &[String], staging: &Path) -> Result<usize> {
        let repartitioned = df.repartition(Partitioning::Hash(
            vec![col(YEAR), col(MONTH)],
            self.target_partitions,
        ))?;

        // partition values are written as directory names
        let projection: Vec<Expr> = names
            .iter()
            .map(|name| {
                if name == YEAR || name == MONTH {
                    cast(ident(name), DataType::Utf8).alias(name)
                } else {
                    ident(name)
                }
            })
            .collect();
        let prepared = repartitioned.select(projection)?;

        let url = dir_url(staging)?;
        debug!(staging = %url, partitions = self.target_partitions, "Writing staged Parquet");
        let counts = prepared
            .write_parquet(
                &url,
                DataFrameWriteOptions::new()
                    .with_partition_by(vec![YEAR.to_string(), MONTH.to_string()]),
                None,
            )
            .await?;

        let mut rows = 0;
        for batch in &counts {
            let column = i64_column(batch, "count")?;
            rows += column.values().iter().sum::<i64>() as usize;
        }
        Ok(rows)
    }

    /// Moves every staged `year=Y/month=M` directory into the output, replacing the previous
    /// version of that partition. Returns the relative paths that were published.
    fn publish(&self, staging: &Path) -> Result<HashSet<PathBuf>> {
        let mut published = HashSet::new();

        for year_dir in sorted_subdirs(staging)? {
            let Some(year) = partition_value(&year_dir, YEAR) else {
                continue;
            };
            for month_dir in sorted_subdirs(&year_dir)? {
                let Some(month) = partition_value(&month_dir, MONTH) else {
                    continue;
                };

                let relative = partition_path(&year, &month);
                let target = self.output_dir.join(&relative);
                if target.exists() {
                    fs::remove_dir_all(&target)?;
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&month_dir, &target).map_err(|e| {
                    Error::Storage(format!(
                        "Failed to publish partition '{}': {}",
                        target.display(),
                        e
                    ))
                })?;
                debug!(partition = %target.display(), "Published partition");
                published.insert(relative);
            }
        }

        Ok(published)
    }

    /// Deletes partitions left by an earlier run that this run did not produce, so the output
    /// holds exactly the rows counted in the success marker.
    fn remove_stale_partitions(&self, published: &HashSet<PathBuf>) -> Result<()> {
        for year_dir in sorted_subdirs(&self.output_dir)? {
            let Some(year) = partition_value(&year_dir, YEAR) else {
                continue;
            };
            for month_dir in sorted_subdirs(&year_dir)? {
                let Some(month) = partition_value(&month_dir, MONTH) else {
                    continue;
                };
                if !published.contains(&partition_path(&year, &month)) {
                    fs::remove_dir_all(&month_dir)?;
                    info!(partition = %month_dir.display(), "Removed stale partition");
                }
            }
            if fs::read_dir(&year_dir)?.next().is_none() {
                fs::remove_dir(&year_dir)?;
            }
        }
        Ok(())
    }
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    Ok(dirs)
}

/// `year=2016` -> `2016` when the directory belongs to `column`.
fn partition_value(dir: &Path, column: &str) -> Option<String> {
    let name = dir.file_name()?.to_str()?;
    name.strip_prefix(column)?
        .strip_prefix('=')
        .map(|v| v.to_string())
}
