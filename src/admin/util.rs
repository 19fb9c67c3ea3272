use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::{MaintError, Result};
use crate::store::copy_dir;

/// `YYYYmmddHHMMSS` in UTC.
pub(crate) fn timestamp_suffix(now: OffsetDateTime) -> Result<String> {
    let format = format_description!("[year][month][day][hour][minute][second]");
    now.format(&format)
        .map_err(|err| MaintError::Message(format!("failed to format timestamp: {err}")))
}

/// Sibling of `dir` named `<dir name>_<tag>_<timestamp>`, made unique with a
/// numeric suffix when the name is taken.
pub(crate) fn sibling_path(dir: &Path, tag: &str, now: OffsetDateTime) -> Result<PathBuf> {
    let name = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| MaintError::Message(format!("invalid directory name {}", dir.display())))?;
    let stamp = timestamp_suffix(now)?;
    let base = format!("{name}_{tag}_{stamp}");
    let mut candidate = dir.with_file_name(&base);
    let mut n = 1;
    while candidate.exists() {
        candidate = dir.with_file_name(format!("{base}_{n}"));
        n += 1;
    }
    Ok(candidate)
}

pub(crate) fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Moves a directory, copying it when a rename is not possible (for example
/// across filesystems).
pub(crate) fn move_dir(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(err) => {
            debug!(
                src = %src.display(),
                dst = %dst.display(),
                error = %err,
                "maint.fs.rename_fallback_copy"
            );
            if let Err(copy_err) = copy_dir(src, dst) {
                if let Err(cleanup_err) = remove_dir_if_exists(dst) {
                    warn!(
                        path = %dst.display(),
                        error = %cleanup_err,
                        "maint.fs.partial_copy_left_behind"
                    );
                }
                return Err(copy_err);
            }
            fs::remove_dir_all(src)?;
            Ok(())
        }
    }
}
