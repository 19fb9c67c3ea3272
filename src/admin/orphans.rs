use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::info;

use crate::catalog::{Catalog, CatalogRead};
use crate::error::Result;
use crate::store::{dir_size, Store};

/// A directory holding an index header that no vector segment owns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OrphanDir {
    /// Directory name.
    pub name: String,
    /// Full path.
    pub path: PathBuf,
    /// Bytes used.
    pub size_bytes: u64,
}

/// Outcome of [`clean_orphans`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", content = "dirs", rename_all = "snake_case")]
pub enum OrphanOutcome {
    /// No orphan directory exists.
    NothingToDo,
    /// Listed only.
    DryRun(Vec<OrphanDir>),
    /// Declined at the confirmation prompt.
    Cancelled(Vec<OrphanDir>),
    /// Deleted.
    Removed(Vec<OrphanDir>),
}

pub(crate) fn orphans_in(reader: &impl CatalogRead, store: &Store) -> Result<Vec<OrphanDir>> {
    let active: HashSet<String> = reader.vector_segment_ids()?.into_iter().collect();
    let mut out = Vec::new();
    for name in store.segment_dir_candidates()? {
        if active.contains(&name) {
            continue;
        }
        let path = store.segment_dir(&name);
        out.push(OrphanDir {
            size_bytes: dir_size(&path)?,
            name,
            path,
        });
    }
    Ok(out)
}

/// Lists directories under the root that hold an index header but are not
/// the id of any vector segment. Rebuild backups qualify.
pub fn find_orphans(store: &Store) -> Result<Vec<OrphanDir>> {
    let catalog = Catalog::open_read_only(store)?;
    orphans_in(&catalog, store)
}

/// Deletes orphan segment directories while holding the catalog lock.
pub fn clean_orphans(
    store: &Store,
    dry_run: bool,
    confirm: impl FnOnce(&[OrphanDir]) -> bool,
) -> Result<OrphanOutcome> {
    let mut catalog = Catalog::open(store)?;
    let tx = catalog.begin_exclusive()?;
    let orphans = orphans_in(&tx, store)?;
    if orphans.is_empty() {
        return Ok(OrphanOutcome::NothingToDo);
    }
    if dry_run {
        return Ok(OrphanOutcome::DryRun(orphans));
    }
    if !confirm(&orphans) {
        info!(count = orphans.len(), "maint.orphans.cancelled");
        return Ok(OrphanOutcome::Cancelled(orphans));
    }
    for orphan in &orphans {
        info!(path = %orphan.path.display(), bytes = orphan.size_bytes, "maint.orphans.remove");
        fs::remove_dir_all(&orphan.path)?;
    }
    tx.commit()?;
    Ok(OrphanOutcome::Removed(orphans))
}
