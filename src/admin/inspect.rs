use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::admin::options::{CollectionRef, MaintOptions};
use crate::admin::orphans::{orphans_in, OrphanDir};
use crate::catalog::{Catalog, CatalogRead, CollectionRow, RetentionConfig, SegmentRow};
use crate::config::{ConfigKey, ConfigSource, ConfigValue, ResolvedConfig};
use crate::error::{MaintError, Result};
use crate::index::{IndexHeader, IndexParams, OpenMode, VectorIndex};
use crate::sidecar::{fragmentation, SidecarDialect, SidecarMetadata};
use crate::store::{dir_size, Store, INDEX_HEADER_FILE};

/// Options for [`inspect_collection`].
#[derive(Clone, Debug, Default)]
pub struct InspectOptions {
    /// Open the index to measure allocation and orphan positions.
    pub verbose: bool,
}

/// One resolved configuration key.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigEntry {
    /// Segment metadata key.
    pub key: String,
    /// Effective value.
    pub value: ConfigValue,
    /// Where the value came from.
    pub source: ConfigSource,
    /// Whether the value can change without a rebuild.
    pub runtime_mutable: bool,
}

/// Where a durable watermark was read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkSource {
    /// Recorded by the side-car itself.
    Sidecar,
    /// Recovered from the catalog's `max_seq_id` record.
    Catalog,
}

/// Figures measured by opening the index.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexStats {
    /// Positions ever allocated.
    pub allocated: u64,
    /// Live positions.
    pub live: u64,
    /// Capacity recorded in the header.
    pub max_elements: u64,
    /// Live in the index but unknown to the side-car.
    pub orphan_positions: Vec<u64>,
    /// Known to the side-car but not live in the index.
    pub missing_positions: Vec<u64>,
}

/// Consolidated view of one collection.
#[derive(Clone, Debug, Serialize)]
pub struct CollectionReport {
    /// Collection id.
    pub collection_id: String,
    /// Collection name.
    pub name: String,
    /// Tenant id.
    pub tenant: String,
    /// Database name.
    pub database: String,
    /// Vector dimensionality, when known.
    pub dimensionality: Option<u32>,
    /// Vector segment id.
    pub segment_id: String,
    /// Metadata segment id.
    pub metadata_segment_id: Option<String>,
    /// Vector segment directory.
    pub segment_path: PathBuf,
    /// Resolved configuration, one entry per key.
    pub config: Vec<ConfigEntry>,
    /// Whether the side-car file exists.
    pub has_metadata: bool,
    /// Side-car format, when present.
    pub sidecar_dialect: Option<SidecarDialect>,
    /// Live elements according to the side-car.
    pub live_elements: u64,
    /// Elements ever added according to the side-car.
    pub total_elements_added: u64,
    /// Durable watermark, when one is known.
    pub watermark: Option<i64>,
    /// Origin of `watermark`.
    pub watermark_source: Option<WatermarkSource>,
    /// `max_seq_id` record of the segment in the catalog.
    pub catalog_max_seq_id: Option<i64>,
    /// WAL rows of the collection's topic.
    pub wal_entries: u64,
    /// WAL rows above the watermark.
    pub wal_gap: Option<u64>,
    /// Bytes used by the segment directory.
    pub disk_size_bytes: u64,
    /// Fraction of allocated positions that are no longer live.
    pub fragmentation: f64,
    /// Whether `fragmentation` was estimated from the side-car alone. The
    /// estimate divides by every label ever assigned, so it does not drop
    /// after a rebuild; only the verbose measurement does.
    pub fragmentation_estimated: bool,
    /// Measured index figures (verbose only).
    pub index: Option<IndexStats>,
}

/// Catalog and on-disk state of one vector segment, resolved once and shared
/// by every operation that touches the segment.
#[derive(Clone, Debug)]
pub(crate) struct SegmentState {
    pub collection: CollectionRow,
    pub segment: SegmentRow,
    pub metadata_segment_id: Option<String>,
    pub resolved: ResolvedConfig,
    pub topic: String,
    pub segment_dir: PathBuf,
    pub sidecar: Option<SidecarMetadata>,
    pub catalog_watermark: Option<i64>,
    pub header: Option<IndexHeader>,
}

impl SegmentState {
    /// Resolves a named collection. Both of its segments must exist.
    pub fn load(
        reader: &impl CatalogRead,
        store: &Store,
        opts: &MaintOptions,
        target: &CollectionRef,
    ) -> Result<Self> {
        let collection = reader.find_collection(&target.name, &target.database)?;
        let segments = reader.collection_segments(&collection)?;
        let mut state = Self::for_segment(reader, store, opts, collection, segments.vector)?;
        state.metadata_segment_id = Some(segments.metadata.id);
        Ok(state)
    }

    /// Resolves one vector segment of a known collection.
    pub fn for_segment(
        reader: &impl CatalogRead,
        store: &Store,
        opts: &MaintOptions,
        collection: CollectionRow,
        segment: SegmentRow,
    ) -> Result<Self> {
        let rows = reader.segment_config_rows(&segment.id)?;
        let resolved = ResolvedConfig::resolve(&rows, collection.config_json.as_deref())?;
        let segment_dir = store.segment_dir(&segment.id);
        let sidecar = SidecarMetadata::load(&store.sidecar_path(&segment.id))?;
        let catalog_watermark = reader.max_seq_id(&segment.id)?;
        let header = if segment_dir.join(INDEX_HEADER_FILE).is_file() {
            Some(opts.driver.describe(&segment_dir)?)
        } else {
            None
        };
        debug!(
            segment = %segment.id,
            has_sidecar = sidecar.is_some(),
            has_index = header.is_some(),
            "maint.inspect.segment_resolved"
        );
        Ok(Self {
            topic: opts.topics.topic(&collection.id),
            collection,
            segment,
            metadata_segment_id: None,
            resolved,
            segment_dir,
            sidecar,
            catalog_watermark,
            header,
        })
    }

    /// The watermark below which WAL rows are incorporated, if the side-car
    /// lets us know one.
    pub fn watermark(&self) -> Option<(i64, WatermarkSource)> {
        let sidecar = self.sidecar.as_ref()?;
        match sidecar.dialect.durable_watermark() {
            Some(w) => Some((w, WatermarkSource::Sidecar)),
            None => self
                .catalog_watermark
                .map(|w| (w, WatermarkSource::Catalog)),
        }
    }

    pub fn dimensionality(&self) -> Option<u32> {
        self.collection
            .dimension
            .or_else(|| self.sidecar.as_ref().and_then(|s| s.dimensionality))
            .or_else(|| self.header.as_ref().map(|h| h.dim))
    }

    /// Capacity large enough for every position the segment ever allocated.
    pub fn full_capacity(&self) -> u64 {
        let total = self
            .sidecar
            .as_ref()
            .map(|s| s.total_elements_added)
            .unwrap_or(0);
        let watermark = self
            .watermark()
            .map(|(w, _)| w.max(0) as u64)
            .unwrap_or(0);
        let (allocated, max_elements) = self
            .header
            .as_ref()
            .map(|h| (h.allocated, h.max_elements))
            .unwrap_or((0, 0));
        total.max(watermark).max(allocated).max(max_elements)
    }

    /// Parameters the existing index was built with.
    pub fn source_params(&self) -> Result<IndexParams> {
        let dim = self.dimensionality().ok_or_else(|| {
            MaintError::index_open(&self.segment_dir, "vector dimensionality is unknown")
        })?;
        let mut params = IndexParams::from_config(&self.resolved.config, dim);
        if let Some(header) = &self.header {
            params.metric = header.metric;
            params.m = header.m as usize;
            params.ef_construction = header.ef_construction as usize;
        }
        Ok(params)
    }

    /// Opens the existing index in `dir` (the live directory or a copy of it).
    pub fn open_source(
        &self,
        opts: &MaintOptions,
        dir: &Path,
        mode: OpenMode,
    ) -> Result<Box<dyn VectorIndex>> {
        let params = self.source_params()?;
        opts.driver.open(dir, mode, &params, self.full_capacity())
    }

    /// Live positions: the side-car map when present, else the index's own.
    pub fn live_positions(&self, opts: &MaintOptions) -> Result<Vec<u64>> {
        match &self.sidecar {
            Some(sidecar) => Ok(sidecar.live_positions()),
            None => self.index_live_positions(opts),
        }
    }

    /// Live positions read from the index itself; empty when the segment has
    /// no index files yet.
    pub fn index_live_positions(&self, opts: &MaintOptions) -> Result<Vec<u64>> {
        if self.header.is_none() {
            return Ok(Vec::new());
        }
        let index = self.open_source(opts, &self.segment_dir, OpenMode::ReadOnly)?;
        Ok(index.live_positions())
    }

    pub fn report(
        &self,
        reader: &impl CatalogRead,
        opts: &MaintOptions,
        verbose: bool,
    ) -> Result<CollectionReport> {
        let config = ConfigKey::ALL
            .iter()
            .map(|key| ConfigEntry {
                key: key.metadata_key().to_string(),
                value: self.resolved.config.value(*key),
                source: self.resolved.source(*key),
                runtime_mutable: key.is_runtime_mutable(),
            })
            .collect();
        let watermark = self.watermark();
        let wal_entries = reader.wal_count(&self.topic)?;
        let wal_gap = match watermark {
            Some((w, _)) => Some(reader.wal_count_above(&self.topic, w)?),
            None => None,
        };
        let (live_elements, total_elements_added, mut frag) = match &self.sidecar {
            Some(s) => (s.live_count(), s.total_elements_added, s.estimated_fragmentation()),
            None => (0, 0, 0.0),
        };
        let mut estimated = true;
        let mut index_stats = None;
        if verbose && self.header.is_some() {
            let index = self.open_source(opts, &self.segment_dir, OpenMode::ReadOnly)?;
            let live: BTreeSet<u64> = index.live_positions().into_iter().collect();
            let (orphan_positions, missing_positions) = match &self.sidecar {
                Some(s) => {
                    let known: BTreeSet<u64> = s.label_to_id.keys().copied().collect();
                    (
                        live.difference(&known).copied().collect(),
                        known.difference(&live).copied().collect(),
                    )
                }
                None => (Vec::new(), Vec::new()),
            };
            if self.sidecar.is_some() {
                frag = fragmentation(index.allocated_count(), index.live_count());
                estimated = false;
            }
            index_stats = Some(IndexStats {
                allocated: index.allocated_count(),
                live: index.live_count(),
                max_elements: self.header.as_ref().map(|h| h.max_elements).unwrap_or(0),
                orphan_positions,
                missing_positions,
            });
        }
        Ok(CollectionReport {
            collection_id: self.collection.id.clone(),
            name: self.collection.name.clone(),
            tenant: self.collection.tenant.clone(),
            database: self.collection.database.clone(),
            dimensionality: self.dimensionality(),
            segment_id: self.segment.id.clone(),
            metadata_segment_id: self.metadata_segment_id.clone(),
            segment_path: self.segment_dir.clone(),
            config,
            has_metadata: self.sidecar.is_some(),
            sidecar_dialect: self.sidecar.as_ref().map(|s| s.dialect),
            live_elements,
            total_elements_added,
            watermark: watermark.map(|(w, _)| w),
            watermark_source: watermark.map(|(_, s)| s),
            catalog_max_seq_id: self.catalog_watermark,
            wal_entries,
            wal_gap,
            disk_size_bytes: dir_size(&self.segment_dir)?,
            fragmentation: frag,
            fragmentation_estimated: estimated,
            index: index_stats,
        })
    }
}

/// Inspects one collection.
///
/// # Errors
///
/// `NotFound` when the name does not resolve to exactly one collection or
/// when its vector or metadata segment row is missing.
pub fn inspect_collection(
    store: &Store,
    opts: &MaintOptions,
    target: &CollectionRef,
    inspect: &InspectOptions,
) -> Result<CollectionReport> {
    let catalog = Catalog::open_read_only(store)?;
    let state = SegmentState::load(&catalog, store, opts, target)?;
    let report = state.report(&catalog, opts, inspect.verbose)?;
    info!(
        collection = %report.name,
        segment = %report.segment_id,
        live = report.live_elements,
        fragmentation = report.fragmentation,
        estimated = report.fragmentation_estimated,
        "maint.inspect.completed"
    );
    Ok(report)
}

/// Options for [`store_info`].
#[derive(Clone, Debug, Default)]
pub struct StoreInfoOptions {
    /// Collection names to leave out.
    pub skip: Vec<String>,
    /// Inspect every collection verbosely.
    pub verbose: bool,
    /// Replace filesystem paths with `redacted`.
    pub privacy: bool,
}

/// A collection that could not be inspected.
#[derive(Clone, Debug, Serialize)]
pub struct CollectionFailure {
    /// Collection name.
    pub name: String,
    /// Error message.
    pub error: String,
}

/// Store-wide report.
#[derive(Clone, Debug, Serialize)]
pub struct StoreReport {
    /// Bytes used by the catalog file.
    pub catalog_size_bytes: u64,
    /// Bytes used by the whole store.
    pub store_size_bytes: u64,
    /// Collections in the catalog.
    pub collection_count: usize,
    /// Inspected collections.
    pub collections: Vec<CollectionReport>,
    /// Collections that failed inspection.
    pub failures: Vec<CollectionFailure>,
    /// Skipped collection names.
    pub skipped: Vec<String>,
    /// Segment directories no vector segment owns.
    pub orphan_dirs: Vec<OrphanDir>,
    /// Total WAL rows.
    pub wal_total: u64,
    /// Retention configuration.
    pub retention: RetentionConfig,
}

/// Reports on every collection of the store plus store-level figures.
pub fn store_info(store: &Store, opts: &MaintOptions, info: &StoreInfoOptions) -> Result<StoreReport> {
    let catalog = Catalog::open_read_only(store)?;
    let all = catalog.collections()?;
    let mut collections = Vec::new();
    let mut failures = Vec::new();
    let mut skipped = Vec::new();
    for collection in &all {
        if info.skip.iter().any(|s| s == &collection.name) {
            skipped.push(collection.name.clone());
            continue;
        }
        let target = CollectionRef::new(&collection.name).in_database(&collection.database);
        let result = SegmentState::load(&catalog, store, opts, &target)
            .and_then(|state| state.report(&catalog, opts, info.verbose));
        match result {
            Ok(mut report) => {
                if info.privacy {
                    report.segment_path = PathBuf::from("redacted");
                }
                collections.push(report);
            }
            Err(err) => failures.push(CollectionFailure {
                name: collection.name.clone(),
                error: err.to_string(),
            }),
        }
    }
    let mut orphan_dirs = orphans_in(&catalog, store)?;
    if info.privacy {
        for orphan in &mut orphan_dirs {
            orphan.path = PathBuf::from("redacted");
        }
    }
    let report = StoreReport {
        catalog_size_bytes: store.catalog_size_bytes()?,
        store_size_bytes: store.size_bytes()?,
        collection_count: all.len(),
        collections,
        failures,
        skipped,
        orphan_dirs,
        wal_total: catalog.wal_total()?,
        retention: catalog.retention_config()?,
    };
    info!(
        collections = report.collection_count,
        failures = report.failures.len(),
        orphans = report.orphan_dirs.len(),
        "maint.info.completed"
    );
    Ok(report)
}
