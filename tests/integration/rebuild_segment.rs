#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;
use vecmaint::admin::{
    inspect_collection, rebuild, CollectionRef, FixedSpace, InspectOptions, MaintOptions,
    RebuildOutcome, RebuildReport, RebuildRequest,
};
use vecmaint::catalog::{Catalog, CatalogRead};
use vecmaint::config::{ConfigOverrides, IndexConfig, Metric};
use vecmaint::index::{
    stored_graph, HnswDriver, IndexDriver, IndexHeader, IndexParams, OpenMode, VectorIndex,
};
use vecmaint::sidecar::SidecarMetadata;
use vecmaint::testkit::{FixtureCollection, FixtureSidecar, StoreBuilder};
use vecmaint::{MaintError, Result, Store};

struct Fixture {
    _dir: TempDir,
    staging: PathBuf,
    store: Store,
    docs: FixtureCollection,
}

fn fixture(records: usize, deleted: usize) -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let staging = dir.path().join("staging");
    fs::create_dir(&staging).expect("staging");
    let mut b = StoreBuilder::new(dir.path().join("store")).expect("builder");
    let docs = b.collection("docs", 4).expect("collection");
    b.committed(&docs, records, deleted, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let store = b.store().expect("store");
    Fixture {
        _dir: dir,
        staging,
        store,
        docs,
    }
}

fn plenty() -> MaintOptions {
    MaintOptions::default().with_space(Arc::new(FixedSpace(u64::MAX)))
}

fn request(fx: &Fixture) -> RebuildRequest {
    RebuildRequest {
        staging_root: Some(fx.staging.clone()),
        ..RebuildRequest::new(CollectionRef::new("docs"))
    }
}

fn rebuilt(outcome: RebuildOutcome) -> RebuildReport {
    match outcome {
        RebuildOutcome::Rebuilt(report) => *report,
        other => panic!("expected a rebuild, got {other:?}"),
    }
}

fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut out = BTreeMap::new();
    for entry in fs::read_dir(dir).expect("ls") {
        let entry = entry.expect("entry");
        if entry.file_type().expect("type").is_file() {
            out.insert(
                entry.file_name().to_string_lossy().into_owned(),
                fs::read(entry.path()).expect("read"),
            );
        }
    }
    out
}

fn segment_rows(store: &Store, segment_id: &str) -> Vec<(String, String)> {
    let catalog = Catalog::open_read_only(store).expect("catalog");
    let mut rows: Vec<(String, String)> = catalog
        .segment_config_rows(segment_id)
        .expect("rows")
        .into_iter()
        .map(|(k, v)| (k, v.to_string()))
        .collect();
    rows.sort();
    rows
}

fn sidecar(store: &Store, segment_id: &str) -> SidecarMetadata {
    SidecarMetadata::load(&store.sidecar_path(segment_id))
        .expect("load")
        .expect("side-car")
}

fn store_entries(store: &Store) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(store.root())
        .expect("ls")
        .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn fragmented_segment_compacts_and_stays_usable() {
    let fx = fixture(10_000, 5_000);
    let opts = plenty();
    let target = CollectionRef::new("docs");
    let before = inspect_collection(&fx.store, &opts, &target, &InspectOptions { verbose: true })
        .expect("before");
    assert!(before.fragmentation > 0.0);
    let ids_before = sidecar(&fx.store, &fx.docs.segment_id).id_to_label;

    let report = rebuilt(rebuild(&fx.store, &opts, &request(&fx), |_| true).expect("rebuild"));
    assert_eq!(report.copied_vectors, 5_000);
    assert_eq!(report.after.fragmentation, 0.0);
    assert!(!report.after.fragmentation_estimated);
    assert_eq!(report.after.live_elements, 5_000);
    let index = report.after.index.as_ref().expect("index stats");
    assert_eq!(index.allocated, 5_000);
    assert!(index.orphan_positions.is_empty());
    assert!(index.missing_positions.is_empty());
    assert_eq!(sidecar(&fx.store, &fx.docs.segment_id).id_to_label, ids_before);
    assert_eq!(fs::read_dir(&fx.staging).expect("ls").count(), 0);

    let dir = fx.store.segment_dir(&fx.docs.segment_id);
    let params = IndexParams::from_config(&IndexConfig::default(), 4);
    let mut index = HnswDriver
        .open(&dir, OpenMode::ReadWrite, &params, 10_001)
        .expect("reopen");
    let query = index.fetch(&[10_000]).expect("fetch").remove(0);
    index.insert(&[vec![0.5; 4]], &[10_001]).expect("insert");
    let hits = index.search(&query, 3).expect("search");
    assert_eq!(hits.first().map(|(p, _)| *p), Some(10_000));
    index.close().expect("close");
}

#[test]
fn rebuild_twice_changes_no_rows_and_keeps_live_set() {
    let fx = fixture(30, 12);
    let opts = plenty();
    let rows_before = segment_rows(&fx.store, &fx.docs.segment_id);
    let ids_before = sidecar(&fx.store, &fx.docs.segment_id).id_to_label;

    for _ in 0..2 {
        let report =
            rebuilt(rebuild(&fx.store, &opts, &request(&fx), |_| true).expect("rebuild"));
        assert!(report.plan.changes.is_empty());
        assert_eq!(report.after.fragmentation, 0.0);
    }
    assert_eq!(segment_rows(&fx.store, &fx.docs.segment_id), rows_before);
    assert_eq!(sidecar(&fx.store, &fx.docs.segment_id).id_to_label, ids_before);
}

#[test]
fn structural_overrides_are_written_and_carried_by_the_header() {
    let fx = fixture(20, 5);
    let seg_dir = fx.store.segment_dir(&fx.docs.segment_id);
    let before = stored_graph(&seg_dir).expect("read").expect("graph");
    assert_eq!(before.points, 15);
    assert_eq!(before.max_connections, 16);
    let mut req = request(&fx);
    req.overrides = ConfigOverrides {
        space: Some(Metric::Cosine),
        m: Some(32),
        ..ConfigOverrides::default()
    };
    let report = rebuilt(rebuild(&fx.store, &plenty(), &req, |_| true).expect("rebuild"));
    assert_eq!(report.plan.changes.len(), 2);
    assert!(report.plan.changes.iter().all(|c| c.requires_rebuild()));

    let rows = segment_rows(&fx.store, &fx.docs.segment_id);
    assert!(rows.contains(&("hnsw:space".to_string(), "cosine".to_string())));
    assert!(rows.contains(&("hnsw:M".to_string(), "32".to_string())));
    let header: IndexHeader = HnswDriver.describe(&seg_dir).expect("header");
    assert_eq!(header.metric, Metric::Cosine);
    assert_eq!(header.m, 32);
    assert_eq!(header.allocated, 15);
    assert_eq!(header.max_elements, 15);
    let graph = stored_graph(&seg_dir).expect("read").expect("graph");
    assert_eq!(graph.points, 15);
    assert_eq!(graph.max_connections, 32);
}

#[test]
fn backup_is_kept_next_to_the_segment() {
    let fx = fixture(10, 4);
    let old = snapshot(&fx.store.segment_dir(&fx.docs.segment_id));
    let report = rebuilt(rebuild(&fx.store, &plenty(), &request(&fx), |_| true).expect("rebuild"));
    let backup = report.backup_path.expect("backup path");
    assert!(backup.is_dir());
    assert_eq!(backup.parent(), Some(fx.store.root()));
    let name = backup.file_name().and_then(|n| n.to_str()).expect("name");
    assert!(name.starts_with(&format!("{}_backup_", fx.docs.segment_id)));
    assert_eq!(snapshot(&backup), old);
}

#[test]
fn without_backup_only_the_new_segment_remains() {
    let fx = fixture(10, 4);
    let entries_before = store_entries(&fx.store);
    let mut req = request(&fx);
    req.backup = false;
    let report = rebuilt(rebuild(&fx.store, &plenty(), &req, |_| true).expect("rebuild"));
    assert_eq!(report.backup_path, None);
    assert_eq!(store_entries(&fx.store), entries_before);
}

#[test]
fn declined_confirmation_changes_nothing() {
    let fx = fixture(10, 4);
    let dir = fx.store.segment_dir(&fx.docs.segment_id);
    let files = snapshot(&dir);
    let rows = segment_rows(&fx.store, &fx.docs.segment_id);
    let entries = store_entries(&fx.store);
    let mut req = request(&fx);
    req.overrides.m = Some(48);

    let outcome = rebuild(&fx.store, &plenty(), &req, |plan| {
        assert_eq!(plan.live_elements, 6);
        assert_eq!(plan.changes.len(), 1);
        false
    })
    .expect("rebuild");
    assert!(matches!(outcome, RebuildOutcome::Cancelled(_)));
    assert_eq!(snapshot(&dir), files);
    assert_eq!(segment_rows(&fx.store, &fx.docs.segment_id), rows);
    assert_eq!(store_entries(&fx.store), entries);
}

#[test]
fn insufficient_space_aborts_before_any_change() {
    let fx = fixture(10, 4);
    let dir = fx.store.segment_dir(&fx.docs.segment_id);
    let files = snapshot(&dir);
    let rows = segment_rows(&fx.store, &fx.docs.segment_id);
    let opts = MaintOptions::default().with_space(Arc::new(FixedSpace(16)));
    let mut req = request(&fx);
    req.overrides.search_ef = Some(99);

    let mut asked = false;
    let err = rebuild(&fx.store, &opts, &req, |_| {
        asked = true;
        true
    })
    .expect_err("preflight");
    assert!(err.is_retryable());
    match err {
        MaintError::InsufficientSpace {
            required,
            available,
            ..
        } => {
            assert_eq!(available, 16);
            assert!(required > 16);
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(!asked);
    assert_eq!(snapshot(&dir), files);
    assert_eq!(segment_rows(&fx.store, &fx.docs.segment_id), rows);
    assert_eq!(fs::read_dir(&fx.staging).expect("ls").count(), 0);
}

#[test]
fn empty_collection_without_overrides_is_nothing_to_do() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let empty = b.collection("empty", 8).expect("collection");
    let store = b.store().expect("store");
    let outcome = rebuild(
        &store,
        &plenty(),
        &RebuildRequest::new(CollectionRef::new("empty")),
        |_| panic!("nothing to confirm"),
    )
    .expect("rebuild");
    match outcome {
        RebuildOutcome::NothingToDo(report) => {
            assert!(!report.has_metadata);
            assert_eq!(report.fragmentation, 0.0);
            assert!(report.fragmentation_estimated);
        }
        other => panic!("expected nothing to do, got {other:?}"),
    }
    assert!(!store.segment_dir(&empty.segment_id).exists());
}

#[test]
fn unflushed_segment_takes_configuration_rows_only() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let fresh = b.collection("fresh", 8).expect("collection");
    let store = b.store().expect("store");
    let mut req = RebuildRequest::new(CollectionRef::new("fresh"));
    req.overrides.search_ef = Some(42);
    let report = rebuilt(rebuild(&store, &plenty(), &req, |plan| !plan.rebuild_index).expect("rebuild"));
    assert!(!report.plan.rebuild_index);
    assert_eq!(report.copied_vectors, 0);
    assert_eq!(report.backup_path, None);
    assert_eq!(
        segment_rows(&store, &fresh.segment_id),
        vec![("hnsw:search_ef".to_string(), "42".to_string())]
    );
}

#[test]
fn zero_batch_size_is_rejected() {
    let fx = fixture(4, 0);
    let mut req = request(&fx);
    req.batch_size = Some(0);
    let err = rebuild(&fx.store, &plenty(), &req, |_| true).expect_err("batch");
    assert!(matches!(err, MaintError::InvalidConfig(_)));
}

/// Delegates to the shipped driver but refuses to create new indexes.
struct NoCreateDriver;

impl IndexDriver for NoCreateDriver {
    fn open(
        &self,
        dir: &Path,
        mode: OpenMode,
        params: &IndexParams,
        max_elements: u64,
    ) -> Result<Box<dyn VectorIndex>> {
        if mode == OpenMode::Create {
            return Err(MaintError::IndexOpenFailure {
                path: dir.to_path_buf(),
                reason: "injected failure".to_string(),
            });
        }
        HnswDriver.open(dir, mode, params, max_elements)
    }

    fn describe(&self, dir: &Path) -> Result<IndexHeader> {
        HnswDriver.describe(dir)
    }
}

#[test]
fn driver_failure_rolls_back_rows_and_directories() {
    let fx = fixture(12, 3);
    let dir = fx.store.segment_dir(&fx.docs.segment_id);
    let files = snapshot(&dir);
    let entries = store_entries(&fx.store);
    let rows = segment_rows(&fx.store, &fx.docs.segment_id);
    let opts = plenty().with_driver(Arc::new(NoCreateDriver));
    let mut req = request(&fx);
    req.overrides.construction_ef = Some(250);

    let err = rebuild(&fx.store, &opts, &req, |_| true).expect_err("injected");
    assert!(matches!(err, MaintError::IndexOpenFailure { .. }));
    assert_eq!(snapshot(&dir), files);
    assert_eq!(store_entries(&fx.store), entries);
    assert_eq!(segment_rows(&fx.store, &fx.docs.segment_id), rows);
    assert_eq!(fs::read_dir(&fx.staging).expect("ls").count(), 0);

    // The lock was released: a plain rebuild now succeeds.
    let report = rebuilt(rebuild(&fx.store, &plenty(), &request(&fx), |_| true).expect("retry"));
    assert_eq!(report.copied_vectors, 9);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn any_batch_size_copies_every_live_vector(
        batch in 1usize..40,
        records in 1usize..60,
        deleted_pct in 0usize..100,
    ) {
        let deleted = records * deleted_pct / 100;
        let fx = fixture(records, deleted);
        let ids_before = sidecar(&fx.store, &fx.docs.segment_id).id_to_label;
        let mut req = request(&fx);
        req.batch_size = Some(batch);
        req.backup = false;
        let report = rebuilt(rebuild(&fx.store, &plenty(), &req, |_| true).expect("rebuild"));
        prop_assert_eq!(report.copied_vectors, (records - deleted) as u64);
        prop_assert_eq!(report.after.fragmentation, 0.0);
        prop_assert_eq!(sidecar(&fx.store, &fx.docs.segment_id).id_to_label, ids_before);
    }
}
