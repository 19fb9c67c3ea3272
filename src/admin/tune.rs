use serde::Serialize;
use tracing::info;

use crate::admin::inspect::SegmentState;
use crate::admin::options::{CollectionRef, MaintOptions};
use crate::catalog::Catalog;
use crate::config::{ConfigChange, ConfigOverrides, RuntimeOverrides};
use crate::error::Result;
use crate::store::Store;

/// Request for [`tune`].
#[derive(Clone, Debug, PartialEq)]
pub struct TuneRequest {
    /// Target collection.
    pub collection: CollectionRef,
    /// Requested runtime values.
    pub overrides: RuntimeOverrides,
}

/// Outcome of [`tune`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "changes", rename_all = "snake_case")]
pub enum TuneOutcome {
    /// Every requested value already matches.
    Unchanged,
    /// Declined at the confirmation prompt.
    Cancelled(Vec<ConfigChange>),
    /// One segment row written per change.
    Applied(Vec<ConfigChange>),
}

/// Changes runtime-mutable parameters of a collection's vector segment
/// without rebuilding it. Only catalog rows are written.
pub fn tune(
    store: &Store,
    opts: &MaintOptions,
    request: &TuneRequest,
    confirm: impl FnOnce(&[ConfigChange]) -> bool,
) -> Result<TuneOutcome> {
    let mut catalog = Catalog::open(store)?;
    let mut tx = catalog.begin_exclusive()?;
    let state = SegmentState::load(&tx, store, opts, &request.collection)?;
    let overrides: ConfigOverrides = request.overrides.clone().into();
    let (_, changes) = overrides.apply(&state.resolved.config)?;
    if changes.is_empty() {
        info!(segment = %state.segment.id, "maint.tune.unchanged");
        return Ok(TuneOutcome::Unchanged);
    }
    if !confirm(&changes) {
        info!(segment = %state.segment.id, "maint.tune.cancelled");
        return Ok(TuneOutcome::Cancelled(changes));
    }
    for change in &changes {
        tx.upsert_segment_config(&state.segment.id, change.key.metadata_key(), &change.new)?;
    }
    tx.commit()?;
    info!(
        segment = %state.segment.id,
        changes = changes.len(),
        "maint.tune.applied"
    );
    Ok(TuneOutcome::Applied(changes))
}
