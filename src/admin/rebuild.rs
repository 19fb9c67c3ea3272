use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::admin::inspect::{CollectionReport, SegmentState};
use crate::admin::options::{staging_root, CollectionRef, MaintOptions};
use crate::admin::swap::{roll_back, swap_in_staged};
use crate::catalog::{Catalog, ExclusiveTx};
use crate::config::{ConfigChange, ConfigOverrides, IndexConfig};
use crate::error::{MaintError, Result};
use crate::index::{IndexParams, OpenMode};
use crate::store::{copy_dir, dir_size, Store};

/// Free space the staging filesystem needs, in tenths of the source size.
const PREFLIGHT_TENTHS: u64 = 11;

/// Request for [`rebuild`].
#[derive(Clone, Debug, PartialEq)]
pub struct RebuildRequest {
    /// Target collection.
    pub collection: CollectionRef,
    /// Requested configuration values.
    pub overrides: ConfigOverrides,
    /// Keep the replaced directory as `<segment>_backup_<timestamp>`.
    pub backup: bool,
    /// Directory the staging copy is created in; the system temp dir when
    /// unset.
    pub staging_root: Option<PathBuf>,
    /// Positions copied per batch; the resolved `hnsw:batch_size` when unset.
    pub batch_size: Option<usize>,
}

impl RebuildRequest {
    /// Rebuild of `collection` with backup and no overrides.
    pub fn new(collection: CollectionRef) -> Self {
        Self {
            collection,
            overrides: ConfigOverrides::default(),
            backup: true,
            staging_root: None,
            batch_size: None,
        }
    }
}

/// What a rebuild is about to do, shown before confirmation.
#[derive(Clone, Debug, Serialize)]
pub struct RebuildPlan {
    /// Collection name.
    pub collection: String,
    /// Vector segment id.
    pub segment_id: String,
    /// Live segment directory.
    pub segment_path: PathBuf,
    /// Configuration rows that will be written.
    pub changes: Vec<ConfigChange>,
    /// Whether index files are rebuilt (false for a configuration-only change
    /// on a segment that has never been flushed).
    pub rebuild_index: bool,
    /// Live elements copied into the new index.
    pub live_elements: u64,
    /// Bytes in the source directory.
    pub source_size_bytes: u64,
    /// Free bytes the preflight requires.
    pub required_bytes: u64,
    /// Free bytes reported on the staging filesystem.
    pub available_bytes: u64,
    /// Staging directory parent.
    pub staging_root: PathBuf,
    /// Positions copied per batch.
    pub batch_size: usize,
    /// Whether the old directory is kept.
    pub backup: bool,
    /// State before the rebuild.
    pub before: CollectionReport,
}

/// Result of a completed rebuild.
#[derive(Clone, Debug, Serialize)]
pub struct RebuildReport {
    /// The executed plan.
    pub plan: RebuildPlan,
    /// Vectors copied into the new index.
    pub copied_vectors: u64,
    /// Where the old directory was kept.
    pub backup_path: Option<PathBuf>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// Verbose inspection after the swap.
    pub after: CollectionReport,
}

/// Outcome of [`rebuild`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum RebuildOutcome {
    /// No side-car and no effective override.
    NothingToDo(CollectionReport),
    /// Declined at the confirmation prompt. Nothing was changed.
    Cancelled(RebuildPlan),
    /// Rebuilt and swapped in.
    Rebuilt(Box<RebuildReport>),
}

/// Rebuilds a collection's vector segment from its live elements, optionally
/// under new structural parameters, and swaps it in place of the old one.
///
/// The exclusive catalog lock is held throughout. Any failure before the
/// commit leaves both the catalog and the live segment directory as they
/// were; the staging copy is discarded with its temporary directory.
///
/// # Errors
///
/// `NotFound`, `InsufficientSpace`, `IndexOpenFailure`, `IndexCorrupt`,
/// `InvalidConfig`, `Catalog` or `Io`.
pub fn rebuild(
    store: &Store,
    opts: &MaintOptions,
    request: &RebuildRequest,
    confirm: impl FnOnce(&RebuildPlan) -> bool,
) -> Result<RebuildOutcome> {
    let start = Instant::now();
    let mut catalog = Catalog::open(store)?;
    let mut tx = catalog.begin_exclusive()?;
    let state = SegmentState::load(&tx, store, opts, &request.collection)?;
    let before = state.report(&tx, opts, false)?;
    let (target_config, changes) = request.overrides.apply(&state.resolved.config)?;

    let rebuild_index =
        state.sidecar.is_some() || (state.header.is_some() && !changes.is_empty());
    if !rebuild_index && changes.is_empty() {
        info!(segment = %state.segment.id, "maint.rebuild.nothing_to_do");
        return Ok(RebuildOutcome::NothingToDo(before));
    }

    let batch_size = request.batch_size.unwrap_or(target_config.batch_size);
    if batch_size == 0 {
        return Err(MaintError::InvalidConfig(
            "rebuild batch size must be >= 1".to_string(),
        ));
    }
    let root = staging_root(request.staging_root.as_deref());
    let mut plan = RebuildPlan {
        collection: state.collection.name.clone(),
        segment_id: state.segment.id.clone(),
        segment_path: state.segment_dir.clone(),
        changes,
        rebuild_index,
        live_elements: 0,
        source_size_bytes: 0,
        required_bytes: 0,
        available_bytes: 0,
        staging_root: root.clone(),
        batch_size,
        backup: request.backup,
        before,
    };
    let mut positions = Vec::new();
    if rebuild_index {
        plan.source_size_bytes = dir_size(&state.segment_dir)?;
        plan.required_bytes = (plan.source_size_bytes * PREFLIGHT_TENTHS).div_ceil(10);
        plan.available_bytes = opts.space.available_bytes(&root)?;
        if plan.available_bytes < plan.required_bytes {
            warn!(
                path = %root.display(),
                required = plan.required_bytes,
                available = plan.available_bytes,
                "maint.rebuild.preflight_failed"
            );
            return Err(MaintError::InsufficientSpace {
                path: root,
                required: plan.required_bytes,
                available: plan.available_bytes,
            });
        }
        positions = state.live_positions(opts)?;
        plan.live_elements = positions.len() as u64;
    }

    if !confirm(&plan) {
        info!(segment = %plan.segment_id, "maint.rebuild.cancelled");
        return Ok(RebuildOutcome::Cancelled(plan));
    }

    let mut copied_vectors = 0;
    let mut backup_path = None;
    if rebuild_index {
        let staging = tempfile::Builder::new()
            .prefix("vecmaint-rebuild-")
            .tempdir_in(&root)?;
        let staged = staging.path().join(&plan.segment_id);
        copy_dir(&state.segment_dir, &staged)?;
        info!(
            segment = %plan.segment_id,
            staged = %staged.display(),
            "maint.rebuild.staged"
        );
        copied_vectors = fill_target(&state, opts, &target_config, &staged, &positions, batch_size)?;

        let swapped = swap_in_staged(&staged, &state.segment_dir, request.backup)?;
        if let Err(err) = write_changes(&mut tx, &plan).and_then(|()| tx.commit()) {
            warn!(segment = %plan.segment_id, error = %err, "maint.rebuild.commit_failed");
            return Err(roll_back(vec![swapped], err));
        }
        backup_path = swapped.finish(request.backup);
    } else {
        write_changes(&mut tx, &plan)?;
        tx.commit()?;
    }

    let after = SegmentState::load(&catalog, store, opts, &request.collection)?
        .report(&catalog, opts, true)?;
    let report = RebuildReport {
        plan,
        copied_vectors,
        backup_path,
        duration_ms: start.elapsed().as_secs_f64() * 1_000.0,
        after,
    };
    info!(
        segment = %report.plan.segment_id,
        copied = report.copied_vectors,
        changes = report.plan.changes.len(),
        backup = report.backup_path.as_ref().map(|p| p.display().to_string()),
        duration_ms = report.duration_ms,
        "maint.rebuild.completed"
    );
    Ok(RebuildOutcome::Rebuilt(Box::new(report)))
}

fn write_changes(tx: &mut ExclusiveTx<'_>, plan: &RebuildPlan) -> Result<()> {
    for change in &plan.changes {
        tx.upsert_segment_config(&plan.segment_id, change.key.metadata_key(), &change.new)?;
    }
    Ok(())
}

/// Creates the target index in `staged` and copies every live position into
/// it from the live source, then checks the target holds exactly them.
fn fill_target(
    state: &SegmentState,
    opts: &MaintOptions,
    target_config: &IndexConfig,
    staged: &Path,
    positions: &[u64],
    batch_size: usize,
) -> Result<u64> {
    let dim = state.source_params()?.dim;
    let params = IndexParams::from_config(target_config, dim);
    let mut target = opts
        .driver
        .open(staged, OpenMode::Create, &params, positions.len() as u64)?;
    let source = state.open_source(opts, &state.segment_dir, OpenMode::ReadOnly)?;
    let mut copied = 0u64;
    for batch in positions.chunks(batch_size) {
        let vectors = source.fetch(batch)?;
        target.insert(&vectors, batch)?;
        copied += batch.len() as u64;
    }
    let landed = target.live_positions();
    if landed != positions {
        return Err(MaintError::index_corrupt(
            staged,
            format!(
                "rebuilt index holds {} live positions, expected {}",
                landed.len(),
                positions.len()
            ),
        ));
    }
    target.close()?;
    source.close()?;
    Ok(copied)
}
