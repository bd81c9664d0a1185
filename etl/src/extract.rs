use common::Result;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::ZipArchive;

/// Only entries under this prefix are extracted from the weather archives.
pub const WEATHER_PREFIX: &str = "weather/";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ExtractionReport {
    pub archives: usize,
    pub skipped_archives: Vec<PathBuf>,
    pub files_extracted: usize,
}

/// Extracts the `weather/` tree of every `*.zip` in `archive_dir` into `destination`.
///
/// An archive that cannot be opened or read is skipped with a warning so the remaining
/// archives are still unpacked. A missing archive directory means there is nothing to extract.
pub fn unzip_weather_archives(archive_dir: &Path, destination: &Path) -> Result<ExtractionReport> {
    let mut report = ExtractionReport::default();

    if !archive_dir.exists() {
        warn!(dir = %archive_dir.display(), "Weather archive directory does not exist, nothing to extract");
        return Ok(report);
    }

    let mut archives: Vec<PathBuf> = fs::read_dir(archive_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false)
        })
        .collect();
    archives.sort();

    fs::create_dir_all(destination)?;

    for archive in archives {
        report.archives += 1;
        match extract_prefixed_entries(&archive, destination, WEATHER_PREFIX) {
            Ok(count) => {
                info!(archive = %archive.display(), files = count, "Extracted weather archive");
                report.files_extracted += count;
            }
            Err(e) => {
                warn!(archive = %archive.display(), error = %e, "Skipping malformed weather archive");
                report.skipped_archives.push(archive);
            }
        }
    }

    Ok(report)
}

fn extract_prefixed_entries(zip_path: &Path, out_dir: &Path, prefix: &str) -> Result<usize> {
    let file = File::open(zip_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut extracted = 0;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if !entry.name().starts_with(prefix) {
            continue;
        }
        let Some(name) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            warn!(entry = entry.name(), "Skipping archive entry with unsafe path");
            continue;
        };

        let target = out_dir.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&target)?;
            io::copy(&mut entry, &mut outfile)?;
            extracted += 1;
        }
    }

    Ok(extracted)
}
