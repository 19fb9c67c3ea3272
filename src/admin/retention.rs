use serde::Serialize;
use tracing::{debug, info};

use crate::admin::inspect::{SegmentState, WatermarkSource};
use crate::admin::options::{MaintOptions, DEFAULT_BATCH_SIZE};
use crate::catalog::{Catalog, CatalogRead};
use crate::error::{MaintError, Result};
use crate::store::Store;

/// Options for [`clean_wal`].
#[derive(Clone, Debug)]
pub struct CleanOptions {
    /// Collection names or ids to leave untouched.
    pub exclude: Vec<String>,
    /// Sequence ids per delete statement on the live-positions path.
    pub batch_size: usize,
}

impl Default for CleanOptions {
    fn default() -> Self {
        Self {
            exclude: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// How the deletable rows of a collection were determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionStrategy {
    /// Rows below the watermark recorded by the side-car.
    DurableWatermark,
    /// Rows below the watermark recovered from the catalog for a legacy
    /// side-car.
    RecoveredWatermark,
    /// No watermark known: rows whose sequence id equals a live index
    /// position. This cannot tell a never-inserted row from one inserted and
    /// already purged.
    LivePositions,
}

/// Retention decision for one collection.
#[derive(Clone, Debug, Serialize)]
pub struct RetentionEntry {
    /// Collection name.
    pub collection: String,
    /// Collection id.
    pub collection_id: String,
    /// Vector segment id.
    pub segment_id: String,
    /// WAL topic.
    pub topic: String,
    /// Strategy in use.
    pub strategy: RetentionStrategy,
    /// Watermark, for the watermark strategies.
    pub watermark: Option<i64>,
    /// WAL rows of the topic before cleaning.
    pub wal_entries: u64,
    /// Rows that qualify for deletion.
    pub qualifying: u64,
    /// Rows actually deleted.
    pub deleted: u64,
    #[serde(skip)]
    live_positions: Vec<i64>,
}

/// Rows to delete across the store.
#[derive(Clone, Debug, Serialize)]
pub struct RetentionPlan {
    /// One entry per non-excluded collection with a vector segment.
    pub entries: Vec<RetentionEntry>,
    /// Collections skipped by request.
    pub excluded: Vec<String>,
    /// Sum of `qualifying`.
    pub total_qualifying: u64,
}

/// Result of an executed cleanup.
#[derive(Clone, Debug, Serialize)]
pub struct CleanReport {
    /// The executed plan with per-collection deletions filled in.
    pub plan: RetentionPlan,
    /// Rows deleted in total.
    pub rows_deleted: u64,
    /// Store size before.
    pub size_before: u64,
    /// Store size after the space reclamation pass.
    pub size_after: u64,
}

/// Outcome of [`clean_wal`].
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "outcome", content = "report", rename_all = "snake_case")]
pub enum CleanOutcome {
    /// No row qualifies; no transaction was opened.
    NothingToDo(RetentionPlan),
    /// Declined at the confirmation prompt.
    Cancelled(RetentionPlan),
    /// Rows deleted and space reclaimed.
    Cleaned(CleanReport),
}

/// Computes which WAL rows can be deleted, without taking the lock.
pub fn plan_wal_cleanup(store: &Store, opts: &MaintOptions, clean: &CleanOptions) -> Result<RetentionPlan> {
    let catalog = Catalog::open_read_only(store)?;
    plan_with(&catalog, store, opts, clean)
}

fn plan_with(
    reader: &impl CatalogRead,
    store: &Store,
    opts: &MaintOptions,
    clean: &CleanOptions,
) -> Result<RetentionPlan> {
    let mut entries = Vec::new();
    let mut excluded = Vec::new();
    for (segment, collection) in reader.vector_segments()? {
        if clean
            .exclude
            .iter()
            .any(|e| e == &collection.name || e == &collection.id)
        {
            debug!(collection = %collection.name, "maint.wal_clean.excluded");
            excluded.push(collection.name.clone());
            continue;
        }
        let state = SegmentState::for_segment(reader, store, opts, collection, segment)?;
        let wal_entries = reader.wal_count(&state.topic)?;
        let (strategy, watermark, live_positions, qualifying) = match state.watermark() {
            Some((w, source)) => {
                let strategy = match source {
                    WatermarkSource::Sidecar => RetentionStrategy::DurableWatermark,
                    WatermarkSource::Catalog => RetentionStrategy::RecoveredWatermark,
                };
                (strategy, Some(w), Vec::new(), reader.wal_count_below(&state.topic, w)?)
            }
            None => {
                let positions: Vec<i64> = state
                    .index_live_positions(opts)?
                    .into_iter()
                    .filter_map(|p| i64::try_from(p).ok())
                    .collect();
                let qualifying = reader.wal_count_in(&state.topic, &positions)?;
                (RetentionStrategy::LivePositions, None, positions, qualifying)
            }
        };
        entries.push(RetentionEntry {
            collection: state.collection.name.clone(),
            collection_id: state.collection.id.clone(),
            segment_id: state.segment.id.clone(),
            topic: state.topic.clone(),
            strategy,
            watermark,
            wal_entries,
            qualifying,
            deleted: 0,
            live_positions,
        });
    }
    let total_qualifying = entries.iter().map(|e| e.qualifying).sum();
    Ok(RetentionPlan {
        entries,
        excluded,
        total_qualifying,
    })
}

/// Deletes WAL rows already incorporated into each collection's index, then
/// reclaims the freed space.
///
/// All deletes run in one exclusive transaction. When nothing qualifies no
/// transaction is opened. Excluded collections are not examined at all.
pub fn clean_wal(
    store: &Store,
    opts: &MaintOptions,
    clean: &CleanOptions,
    confirm: impl FnOnce(&RetentionPlan) -> bool,
) -> Result<CleanOutcome> {
    if clean.batch_size == 0 {
        return Err(MaintError::InvalidConfig(
            "WAL cleanup batch size must be >= 1".to_string(),
        ));
    }
    let size_before = store.size_bytes()?;
    let mut plan = plan_wal_cleanup(store, opts, clean)?;
    if plan.total_qualifying == 0 {
        info!(collections = plan.entries.len(), "maint.wal_clean.nothing_to_do");
        return Ok(CleanOutcome::NothingToDo(plan));
    }
    if !confirm(&plan) {
        info!("maint.wal_clean.cancelled");
        return Ok(CleanOutcome::Cancelled(plan));
    }

    let mut catalog = Catalog::open(store)?;
    let mut tx = catalog.begin_exclusive()?;
    let mut rows_deleted = 0;
    for entry in &mut plan.entries {
        if entry.qualifying == 0 {
            continue;
        }
        entry.deleted = match (entry.strategy, entry.watermark) {
            (RetentionStrategy::LivePositions, _) | (_, None) => {
                tx.delete_wal_in(&entry.topic, &entry.live_positions, clean.batch_size)?
            }
            (_, Some(w)) => tx.delete_wal_below(&entry.topic, w)?,
        };
        rows_deleted += entry.deleted;
        info!(
            collection = %entry.collection,
            strategy = ?entry.strategy,
            deleted = entry.deleted,
            "maint.wal_clean.collection"
        );
    }
    tx.commit()?;
    catalog.vacuum()?;
    let size_after = store.size_bytes()?;
    info!(rows_deleted, size_before, size_after, "maint.wal_clean.completed");
    Ok(CleanOutcome::Cleaned(CleanReport {
        plan,
        rows_deleted,
        size_before,
        size_after,
    }))
}
