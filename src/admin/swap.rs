use std::fs;
use std::path::{Path, PathBuf};

use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::admin::util::{move_dir, remove_dir_if_exists, sibling_path};
use crate::error::{MaintError, Result};

/// A staged segment directory that has replaced the live one. The previous
/// directory, if there was one, is held aside until [`finish`] or
/// [`restore`].
///
/// [`finish`]: SwappedSegment::finish
/// [`restore`]: SwappedSegment::restore
pub(crate) struct SwappedSegment {
    pub(crate) live: PathBuf,
    pub(crate) aside: Option<PathBuf>,
}

impl SwappedSegment {
    /// Puts the previous directory back, or removes the new one when the
    /// segment had none.
    pub(crate) fn restore(self) -> Result<()> {
        remove_dir_if_exists(&self.live)?;
        if let Some(aside) = &self.aside {
            fs::rename(aside, &self.live)?;
        }
        info!(path = %self.live.display(), "maint.swap.restored");
        Ok(())
    }

    /// Keeps the previous directory as a backup or deletes it.
    pub(crate) fn finish(self, backup: bool) -> Option<PathBuf> {
        let aside = self.aside?;
        if backup {
            return Some(aside);
        }
        if let Err(err) = fs::remove_dir_all(&aside) {
            warn!(
                path = %aside.display(),
                error = %err,
                "maint.swap.retired_left_behind"
            );
        }
        None
    }
}

/// Restores every swapped segment, newest first. Failures are logged and the
/// first one is returned.
pub(crate) fn restore_all(swapped: Vec<SwappedSegment>) -> Result<()> {
    let mut first = None;
    for segment in swapped.into_iter().rev() {
        let live = segment.live.clone();
        if let Err(err) = segment.restore() {
            warn!(path = %live.display(), error = %err, "maint.swap.restore_failed");
            first.get_or_insert(err);
        }
    }
    first.map_or(Ok(()), Err)
}

/// Swaps `swapped` back out after `cause` and returns `cause`. A failed
/// restore is logged with the cause attached.
pub(crate) fn roll_back(swapped: Vec<SwappedSegment>, cause: MaintError) -> MaintError {
    if let Err(restore_err) = restore_all(swapped) {
        error!(
            error = %restore_err,
            cause = %cause,
            "maint.swap.roll_back_incomplete"
        );
    }
    cause
}

/// Moves `staged` next to `live`, moves `live` aside when it exists, then
/// moves the staged copy into place. On failure `live` is left as it was.
pub(crate) fn swap_in_staged(staged: &Path, live: &Path, backup: bool) -> Result<SwappedSegment> {
    let now = OffsetDateTime::now_utc();
    let incoming = sibling_path(live, "incoming", now)?;
    move_dir(staged, &incoming)?;
    let aside = if live.exists() {
        let aside = sibling_path(live, if backup { "backup" } else { "retired" }, now)?;
        if let Err(err) = fs::rename(live, &aside) {
            discard_incoming(&incoming);
            return Err(err.into());
        }
        Some(aside)
    } else {
        None
    };
    info!(
        live = %live.display(),
        incoming = %incoming.display(),
        aside = aside.as_ref().map(|p| p.display().to_string()),
        "maint.swap.begin"
    );
    if let Err(err) = fs::rename(&incoming, live) {
        if let Some(aside) = &aside {
            if let Err(restore_err) = fs::rename(aside, live) {
                warn!(
                    aside = %aside.display(),
                    error = %restore_err,
                    "maint.swap.restore_failed"
                );
            }
        }
        discard_incoming(&incoming);
        return Err(err.into());
    }
    info!(live = %live.display(), "maint.swap.complete");
    Ok(SwappedSegment {
        live: live.to_path_buf(),
        aside,
    })
}

fn discard_incoming(incoming: &Path) {
    if let Err(err) = remove_dir_if_exists(incoming) {
        warn!(
            path = %incoming.display(),
            error = %err,
            "maint.swap.incoming_left_behind"
        );
    }
}
