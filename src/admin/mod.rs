#![forbid(unsafe_code)]

//! Store maintenance operations.
//!
//! Every mutating operation takes the catalog's exclusive lock for its whole
//! duration and either completes or leaves the store as it found it.

mod commit;
mod inspect;
mod options;
mod orphans;
mod rebuild;
mod retention;
mod swap;
mod tune;
mod util;
mod wal;

/// Read-only reports on a single collection or the whole store.
pub use inspect::{
    inspect_collection, store_info, CollectionFailure, CollectionReport, ConfigEntry, IndexStats,
    InspectOptions, StoreInfoOptions, StoreReport, WatermarkSource,
};

/// Options shared by every operation.
pub use options::{
    CollectionRef, FixedSpace, MaintOptions, SpaceProbe, SystemSpace, TopicScheme,
    DEFAULT_BATCH_SIZE,
};

/// Segment rebuild with atomic directory swap.
///
/// Copies live vectors into a fresh index in a staging area and swaps it in
/// place of the live segment directory, optionally keeping a backup.
pub use rebuild::{rebuild, RebuildOutcome, RebuildPlan, RebuildReport, RebuildRequest};

/// Runtime-mutable parameter changes that only touch catalog rows.
pub use tune::{tune, TuneOutcome, TuneRequest};

/// WAL retention: deletes rows already incorporated into an index.
pub use retention::{
    clean_wal, plan_wal_cleanup, CleanOptions, CleanOutcome, CleanReport, RetentionEntry,
    RetentionPlan, RetentionStrategy,
};

/// WAL inspection, purge configuration and export.
pub use wal::{configure_purge, export_wal, wal_info, PurgeMode, PurgeOutcome, TopicInfo, WalInfo};

/// Replays pending WAL rows into vector segments.
pub use commit::{commit_wal, CommitOptions, CommitReport, SegmentCommit};

/// Segment directories with no catalog counterpart.
pub use orphans::{clean_orphans, find_orphans, OrphanDir, OrphanOutcome};
