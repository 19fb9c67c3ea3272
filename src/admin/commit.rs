use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::admin::inspect::SegmentState;
use crate::admin::options::MaintOptions;
use crate::admin::swap::{roll_back, swap_in_staged};
use crate::catalog::{Catalog, CatalogRead, ExclusiveTx, WalOperation, WalRow};
use crate::error::{MaintError, Result};
use crate::index::{IndexParams, OpenMode, VectorIndex};
use crate::sidecar::{SidecarDialect, SidecarMetadata};
use crate::store::{copy_dir, Store, SIDECAR_FILE};

/// Options for [`commit_wal`].
#[derive(Clone, Debug, Default)]
pub struct CommitOptions {
    /// Collection names or ids to leave untouched.
    pub exclude: Vec<String>,
}

/// What happened to one segment.
#[derive(Clone, Debug, Default, Serialize)]
pub struct SegmentCommit {
    /// Collection name.
    pub collection: String,
    /// Vector segment id.
    pub segment_id: String,
    /// Rows above the watermark that were examined.
    pub rows: u64,
    /// Records inserted.
    pub added: u64,
    /// Records replaced in place.
    pub updated: u64,
    /// Records tombstoned.
    pub deleted: u64,
    /// Rows that had no effect.
    pub ignored: u64,
    /// Watermark before the commit.
    pub watermark_before: Option<i64>,
    /// Watermark after the commit.
    pub watermark_after: Option<i64>,
    /// Live elements after the commit.
    pub live_elements: u64,
    /// Rows purged because automatic purging is on.
    pub purged: u64,
    /// Why the segment was left alone, if it was.
    pub skipped: Option<String>,
}

/// Result of [`commit_wal`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct CommitReport {
    /// One entry per examined segment.
    pub segments: Vec<SegmentCommit>,
    /// Collections skipped by request.
    pub excluded: Vec<String>,
}

/// Applies pending WAL rows to every vector segment and records the new
/// watermark, all under one exclusive transaction.
///
/// Rows are replayed from the segment's current watermark. Replaying a row
/// that is already reflected is harmless: an `ADD` of a known id and a
/// `DELETE` of an unknown one are ignored.
///
/// Each segment is replayed into a copy staged under the store root. The
/// copies are swapped in only once every segment has replayed, and are
/// swapped back out if the catalog commit fails, so an error leaves both the
/// catalog and every segment directory as they were.
pub fn commit_wal(store: &Store, opts: &MaintOptions, commit: &CommitOptions) -> Result<CommitReport> {
    let mut catalog = Catalog::open(store)?;
    let mut tx = catalog.begin_exclusive()?;
    let purge = tx.retention_config()?.automatically_purge;
    let staging = tempfile::Builder::new()
        .prefix(".vecmaint-commit-")
        .tempdir_in(store.root())?;
    let mut report = CommitReport::default();
    let mut staged = Vec::new();
    for (segment, collection) in tx.vector_segments()? {
        if commit
            .exclude
            .iter()
            .any(|e| e == &collection.name || e == &collection.id)
        {
            report.excluded.push(collection.name.clone());
            continue;
        }
        let state = SegmentState::for_segment(&tx, store, opts, collection, segment)?;
        let (entry, replayed) = commit_segment(&mut tx, opts, &state, staging.path(), purge)?;
        if let Some(dir) = replayed {
            staged.push((dir, state.segment_dir.clone()));
        }
        info!(
            collection = %entry.collection,
            added = entry.added,
            updated = entry.updated,
            deleted = entry.deleted,
            watermark = entry.watermark_after,
            "maint.wal_commit.segment"
        );
        report.segments.push(entry);
    }

    let mut swapped = Vec::with_capacity(staged.len());
    for (dir, live) in &staged {
        match swap_in_staged(dir, live, false) {
            Ok(segment) => swapped.push(segment),
            Err(err) => return Err(roll_back(swapped, err)),
        }
    }
    if let Err(err) = tx.commit() {
        warn!(error = %err, "maint.wal_commit.commit_failed");
        return Err(roll_back(swapped, err));
    }
    for segment in swapped {
        segment.finish(false);
    }
    Ok(report)
}

/// Replays one segment's pending rows into a staged copy of its directory
/// and returns the copy, or `None` when the live directory stays as it is.
fn commit_segment(
    tx: &mut ExclusiveTx<'_>,
    opts: &MaintOptions,
    state: &SegmentState,
    staging: &Path,
    purge: bool,
) -> Result<(SegmentCommit, Option<PathBuf>)> {
    let mut entry = SegmentCommit {
        collection: state.collection.name.clone(),
        segment_id: state.segment.id.clone(),
        ..SegmentCommit::default()
    };
    match (state.sidecar.is_some(), state.header.is_some()) {
        (false, true) => {
            entry.skipped = Some("index files exist without a side-car".to_string());
            warn!(segment = %state.segment.id, "maint.wal_commit.no_sidecar");
            return Ok((entry, None));
        }
        (true, false) => {
            entry.skipped = Some("side-car exists without index files".to_string());
            warn!(segment = %state.segment.id, "maint.wal_commit.no_index");
            return Ok((entry, None));
        }
        _ => {}
    }
    let watermark = state
        .watermark()
        .map(|(w, _)| w)
        .or(state.catalog_watermark);
    entry.watermark_before = watermark;
    let rows = tx.wal_rows(Some(&state.topic), watermark)?;
    entry.rows = rows.len() as u64;
    let Some(last_seq_id) = rows.last().map(|r| r.seq_id) else {
        entry.watermark_after = watermark;
        entry.live_elements = state.sidecar.as_ref().map(|s| s.live_count()).unwrap_or(0);
        return Ok((entry, None));
    };

    let dim = match state
        .dimensionality()
        .or_else(|| rows.iter().find_map(|r| r.decode_vector()).map(|v| v.len() as u32))
    {
        Some(dim) => dim,
        None => {
            entry.skipped = Some("vector dimensionality is unknown".to_string());
            return Ok((entry, None));
        }
    };
    let staged = staging.join(&state.segment.id);
    if state.segment_dir.is_dir() {
        copy_dir(&state.segment_dir, &staged)?;
    } else {
        fs::create_dir_all(&staged)?;
    }
    let mut sidecar = state
        .sidecar
        .clone()
        .unwrap_or_else(|| SidecarMetadata::new(Some(dim)));
    let mut index = if state.header.is_some() {
        state.open_source(opts, &staged, OpenMode::ReadWrite)?
    } else {
        let params = IndexParams::from_config(&state.resolved.config, dim);
        opts.driver
            .open(&staged, OpenMode::Create, &params, rows.len() as u64)?
    };

    let resize_factor = state.resolved.config.resize_factor;
    for row in &rows {
        apply_row(index.as_mut(), &mut sidecar, row, dim, resize_factor, &mut entry)?;
    }
    index.close()?;

    sidecar.dimensionality = Some(dim);
    sidecar.dialect = SidecarDialect::Watermarked {
        max_seq_id: last_seq_id,
    };
    sidecar.store(&staged.join(SIDECAR_FILE))?;
    tx.set_max_seq_id(&state.segment.id, last_seq_id)?;
    if purge {
        entry.purged = tx.delete_wal_below(&state.topic, last_seq_id)?;
    }
    entry.watermark_after = Some(last_seq_id);
    entry.live_elements = sidecar.live_count();
    Ok((entry, Some(staged)))
}

fn apply_row(
    index: &mut dyn VectorIndex,
    sidecar: &mut SidecarMetadata,
    row: &WalRow,
    dim: u32,
    resize_factor: f64,
    entry: &mut SegmentCommit,
) -> Result<()> {
    let existing = sidecar.id_to_label.get(&row.id).copied();
    let vector = row.decode_vector().filter(|v| v.len() == dim as usize);
    match (row.operation, existing, vector) {
        (WalOperation::Delete, Some(label), _) => {
            index.mark_deleted(label)?;
            sidecar.remove(&row.id);
            entry.deleted += 1;
        }
        (WalOperation::Update | WalOperation::Upsert, Some(label), Some(vector)) => {
            index.insert(&[vector], &[label])?;
            sidecar.insert(&row.id, label, row.seq_id);
            entry.updated += 1;
        }
        (WalOperation::Add | WalOperation::Upsert, None, Some(vector)) => {
            let label = sidecar.total_elements_added + 1;
            ensure_capacity(index, resize_factor)?;
            index.insert(&[vector], &[label])?;
            sidecar.insert(&row.id, label, row.seq_id);
            sidecar.total_elements_added = label;
            entry.added += 1;
        }
        (WalOperation::Update, Some(_), None) => {
            sidecar.id_to_seq_id.insert(row.id.clone(), row.seq_id);
            entry.ignored += 1;
        }
        (op, _, vector) => {
            if vector.is_none() && matches!(op, WalOperation::Add | WalOperation::Upsert) {
                warn!(seq_id = row.seq_id, id = %row.id, "maint.wal_commit.bad_vector");
            }
            entry.ignored += 1;
        }
    }
    Ok(())
}

fn ensure_capacity(index: &mut dyn VectorIndex, resize_factor: f64) -> Result<()> {
    let allocated = index.allocated_count();
    let capacity = index.max_elements();
    if allocated < capacity {
        return Ok(());
    }
    if !resize_factor.is_finite() || resize_factor < 1.0 {
        return Err(MaintError::InvalidConfig(format!(
            "hnsw:resize_factor {resize_factor} cannot grow the index"
        )));
    }
    let grown = (capacity as f64 * resize_factor).ceil() as u64;
    index.resize(grown.max(allocated + 1))
}
