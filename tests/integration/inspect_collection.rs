#![allow(missing_docs)]

use std::fs;

use tempfile::TempDir;
use vecmaint::admin::{
    inspect_collection, store_info, CollectionRef, InspectOptions, MaintOptions, StoreInfoOptions,
    WatermarkSource,
};
use vecmaint::config::{ConfigKey, ConfigSource, ConfigValue, Metric};
use vecmaint::sidecar::SidecarDialect;
use vecmaint::testkit::{FixtureSidecar, StoreBuilder};
use vecmaint::MaintError;

fn builder() -> (TempDir, StoreBuilder) {
    let dir = TempDir::new().expect("tempdir");
    let builder = StoreBuilder::new(dir.path().join("store")).expect("builder");
    (dir, builder)
}

#[test]
fn empty_collection_without_sidecar_reports_estimated_zero() {
    let (_dir, mut b) = builder();
    b.collection("empty", 8).expect("collection");
    let store = b.store().expect("store");

    let report = inspect_collection(
        &store,
        &MaintOptions::default(),
        &CollectionRef::new("empty"),
        &InspectOptions { verbose: true },
    )
    .expect("inspect");
    assert!(!report.has_metadata);
    assert_eq!(report.fragmentation, 0.0);
    assert!(report.fragmentation_estimated);
    assert_eq!(report.live_elements, 0);
    assert_eq!(report.watermark, None);
    assert_eq!(report.wal_gap, None);
    assert!(report.index.is_none());
    assert_eq!(report.disk_size_bytes, 0);
    assert_eq!(report.dimensionality, Some(8));
}

#[test]
fn index_without_sidecar_keeps_the_estimated_zero() {
    let (_dir, mut b) = builder();
    let raw = b.collection("raw", 4).expect("collection");
    b.indexed_by_seq_id(&raw, 6).expect("index");
    let store = b.store().expect("store");

    let report = inspect_collection(
        &store,
        &MaintOptions::default(),
        &CollectionRef::new("raw"),
        &InspectOptions { verbose: true },
    )
    .expect("inspect");
    assert!(!report.has_metadata);
    assert_eq!(report.live_elements, 0);
    assert_eq!(report.fragmentation, 0.0);
    assert!(report.fragmentation_estimated);
    let index = report.index.expect("index stats");
    assert_eq!(index.live, 6);
    assert_eq!(index.allocated, 6);
    assert!(index.orphan_positions.is_empty());
}

#[test]
fn deletions_show_fragmentation_estimated_and_measured() {
    let (_dir, mut b) = builder();
    let docs = b.collection("docs", 4).expect("collection");
    b.committed(&docs, 40, 10, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let store = b.store().expect("store");
    let opts = MaintOptions::default();
    let target = CollectionRef::new("docs");

    let quick = inspect_collection(&store, &opts, &target, &InspectOptions::default())
        .expect("inspect");
    assert!(quick.has_metadata);
    assert_eq!(quick.live_elements, 30);
    assert_eq!(quick.total_elements_added, 40);
    assert!(quick.fragmentation_estimated);
    assert!((quick.fragmentation - 0.25).abs() < 1e-9);
    assert_eq!(quick.watermark, Some(50));
    assert_eq!(quick.watermark_source, Some(WatermarkSource::Sidecar));
    assert_eq!(quick.wal_entries, 50);
    assert_eq!(quick.wal_gap, Some(0));
    assert!(quick.disk_size_bytes > 0);

    let measured =
        inspect_collection(&store, &opts, &target, &InspectOptions { verbose: true })
            .expect("inspect verbose");
    assert!(!measured.fragmentation_estimated);
    assert!((measured.fragmentation - 0.25).abs() < 1e-9);
    let index = measured.index.expect("index stats");
    assert_eq!(index.allocated, 40);
    assert_eq!(index.live, 30);
    assert!(index.orphan_positions.is_empty());
    assert!(index.missing_positions.is_empty());
}

#[test]
fn legacy_sidecar_recovers_watermark_from_catalog() {
    let (_dir, mut b) = builder();
    let docs = b.collection("docs", 4).expect("collection");
    let seg = b
        .committed(&docs, 5, 0, FixtureSidecar::Legacy, true)
        .expect("segment");
    b.pending(&docs, "late", 3).expect("pending");
    let store = b.store().expect("store");

    let report = inspect_collection(
        &store,
        &MaintOptions::default(),
        &CollectionRef::new("docs"),
        &InspectOptions::default(),
    )
    .expect("inspect");
    assert_eq!(report.sidecar_dialect, Some(SidecarDialect::Legacy));
    assert_eq!(report.watermark, Some(seg.watermark));
    assert_eq!(report.watermark_source, Some(WatermarkSource::Catalog));
    assert_eq!(report.catalog_max_seq_id, Some(seg.watermark));
    assert_eq!(report.wal_gap, Some(3));
}

#[test]
fn configuration_resolves_segment_then_collection_then_default() {
    let (_dir, mut b) = builder();
    let docs = b.collection("docs", 4).expect("collection");
    b.segment_config(&docs, ConfigKey::SearchEf, ConfigValue::Int(64))
        .expect("row");
    b.collection_config(
        &docs,
        r#"{"hnsw_configuration":{"space":"cosine","ef_search":12,"M":24}}"#,
    )
    .expect("json");
    let store = b.store().expect("store");

    let report = inspect_collection(
        &store,
        &MaintOptions::default(),
        &CollectionRef::new("docs"),
        &InspectOptions::default(),
    )
    .expect("inspect");
    let entry = |key: ConfigKey| {
        report
            .config
            .iter()
            .find(|e| e.key == key.metadata_key())
            .cloned()
            .expect("config entry")
    };
    assert_eq!(entry(ConfigKey::SearchEf).value, ConfigValue::Int(64));
    assert_eq!(entry(ConfigKey::SearchEf).source, ConfigSource::Segment);
    assert!(entry(ConfigKey::SearchEf).runtime_mutable);
    assert_eq!(
        entry(ConfigKey::Space).value,
        ConfigValue::Str(Metric::Cosine.as_str().to_string())
    );
    assert_eq!(entry(ConfigKey::Space).source, ConfigSource::Collection);
    assert!(!entry(ConfigKey::Space).runtime_mutable);
    assert_eq!(entry(ConfigKey::M).value, ConfigValue::Int(24));
    assert_eq!(entry(ConfigKey::ConstructionEf).source, ConfigSource::Default);
}

#[test]
fn unknown_collection_and_missing_metadata_segment_are_not_found() {
    let (_dir, mut b) = builder();
    b.collection("docs", 4).expect("collection");
    let other = b.database("analytics").expect("database");
    b.collection_in(&other, "events", 4).expect("collection");
    let store = b.store().expect("store");
    let opts = MaintOptions::default();

    let err = inspect_collection(
        &store,
        &opts,
        &CollectionRef::new("events"),
        &InspectOptions::default(),
    )
    .expect_err("wrong database");
    assert!(matches!(err, MaintError::NotFound(_)));

    let found = inspect_collection(
        &store,
        &opts,
        &CollectionRef::new("events").in_database("analytics"),
        &InspectOptions::default(),
    )
    .expect("qualified");
    assert_eq!(found.database, "analytics");
}

#[test]
fn corrupt_sidecar_is_reported_per_collection() {
    let (_dir, mut b) = builder();
    let good = b.collection("good", 4).expect("collection");
    b.committed(&good, 3, 0, FixtureSidecar::Watermarked, false)
        .expect("segment");
    let bad = b.collection("bad", 4).expect("collection");
    b.committed(&bad, 3, 0, FixtureSidecar::Watermarked, false)
        .expect("segment");
    let store = b.store().expect("store");
    fs::write(store.sidecar_path(&bad.segment_id), b"VSCM\x09garbage").expect("corrupt");

    let err = inspect_collection(
        &store,
        &MaintOptions::default(),
        &CollectionRef::new("bad"),
        &InspectOptions::default(),
    )
    .expect_err("corrupt");
    assert!(matches!(err, MaintError::SidecarCorrupt { .. }));

    let report = store_info(&store, &MaintOptions::default(), &StoreInfoOptions::default())
        .expect("store info");
    assert_eq!(report.collection_count, 2);
    assert_eq!(report.collections.len(), 1);
    assert_eq!(report.collections[0].name, "good");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].name, "bad");
}

#[test]
fn store_info_skips_redacts_and_lists_orphans() {
    let (_dir, mut b) = builder();
    let docs = b.collection("docs", 4).expect("collection");
    b.committed(&docs, 6, 2, FixtureSidecar::Watermarked, true)
        .expect("segment");
    b.collection("scratch", 4).expect("collection");
    b.stray_segment_dir("deadbeef-0000").expect("stray");
    b.automatically_purge(true).expect("purge");
    let store = b.store().expect("store");

    let info = StoreInfoOptions {
        skip: vec!["scratch".to_string()],
        verbose: true,
        privacy: true,
    };
    let report = store_info(&store, &MaintOptions::default(), &info).expect("store info");
    assert_eq!(report.skipped, vec!["scratch".to_string()]);
    assert_eq!(report.collections.len(), 1);
    assert_eq!(report.collections[0].segment_path.to_str(), Some("redacted"));
    assert!(report.collections[0].index.is_some());
    assert_eq!(report.orphan_dirs.len(), 1);
    assert_eq!(report.orphan_dirs[0].name, "deadbeef-0000");
    assert_eq!(report.orphan_dirs[0].path.to_str(), Some("redacted"));
    assert_eq!(report.wal_total, 8);
    assert!(report.retention.automatically_purge);
    assert!(report.catalog_size_bytes > 0);
    assert!(report.store_size_bytes >= report.catalog_size_bytes);
}
