use common::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Table URL for a local directory. The trailing slash makes DataFusion list the directory
/// instead of treating it as a single file.
pub fn dir_url(dir: &Path) -> Result<String> {
    let absolute = fs::canonicalize(dir).map_err(|e| {
        Error::InvalidInput(format!("Cannot access directory '{}': {}", dir.display(), e))
    })?;
    if !absolute.is_dir() {
        return Err(Error::InvalidInput(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }
    let path = absolute.to_string_lossy();
    Ok(format!("{}/", path.trim_end_matches('/')))
}

/// Relative directory of one output partition, e.g. `year=2017/month=8`.
pub fn partition_path(year: &str, month: &str) -> PathBuf {
    PathBuf::from(format!("year={}", year)).join(format!("month={}", month))
}

/// Sibling directory used to stage a write before it is published into `output_dir`.
pub fn staging_dir(output_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let name = output_dir.file_name().ok_or_else(|| {
        Error::InvalidInput(format!(
            "Output path '{}' has no directory name",
            output_dir.display()
        ))
    })?;
    let parent = output_dir.parent().unwrap_or_else(|| Path::new(""));
    Ok(parent.join(format!(".{}.staging-{}", name.to_string_lossy(), run_id)))
}
