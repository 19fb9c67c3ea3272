#![allow(missing_docs)]

use proptest::prelude::*;
use tempfile::TempDir;
use vecmaint::admin::{
    clean_wal, plan_wal_cleanup, CleanOptions, CleanOutcome, CleanReport, MaintOptions,
    RetentionStrategy,
};
use vecmaint::catalog::{Catalog, CatalogRead, WalRow};
use vecmaint::testkit::{FixtureCollection, FixtureSidecar, StoreBuilder};
use vecmaint::{MaintError, Store};

fn topic_rows(store: &Store, collection: &FixtureCollection) -> Vec<i64> {
    Catalog::open_read_only(store)
        .expect("catalog")
        .wal_rows(Some(&collection.topic), None)
        .expect("rows")
        .into_iter()
        .map(|row: WalRow| row.seq_id)
        .collect()
}

fn cleaned(outcome: CleanOutcome) -> CleanReport {
    match outcome {
        CleanOutcome::Cleaned(report) => report,
        other => panic!("expected a cleanup, got {other:?}"),
    }
}

#[test]
fn watermark_strategies_keep_every_row_above_the_watermark() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let durable = b.collection("durable", 4).expect("collection");
    let durable_seg = b
        .committed(&durable, 12, 4, FixtureSidecar::Watermarked, false)
        .expect("segment");
    let durable_pending = b.pending(&durable, "late", 3).expect("pending");
    let legacy = b.collection("legacy", 4).expect("collection");
    let legacy_seg = b
        .committed(&legacy, 6, 1, FixtureSidecar::Legacy, true)
        .expect("segment");
    let legacy_pending = b.pending(&legacy, "late", 2).expect("pending");
    let store = b.store().expect("store");
    let opts = MaintOptions::default();

    let plan = plan_wal_cleanup(&store, &opts, &CleanOptions::default()).expect("plan");
    let strategy = |name: &str| {
        plan.entries
            .iter()
            .find(|e| e.collection == name)
            .map(|e| (e.strategy, e.watermark))
            .expect("entry")
    };
    assert_eq!(
        strategy("durable"),
        (RetentionStrategy::DurableWatermark, Some(durable_seg.watermark))
    );
    assert_eq!(
        strategy("legacy"),
        (RetentionStrategy::RecoveredWatermark, Some(legacy_seg.watermark))
    );

    let report = cleaned(clean_wal(&store, &opts, &CleanOptions::default(), |_| true).expect("clean"));
    assert_eq!(report.rows_deleted, 15 + 6);

    let mut expected = vec![durable_seg.watermark];
    expected.extend(&durable_pending);
    assert_eq!(topic_rows(&store, &durable), expected);
    let mut expected = vec![legacy_seg.watermark];
    expected.extend(&legacy_pending);
    assert_eq!(topic_rows(&store, &legacy), expected);
}

#[test]
fn live_positions_strategy_deletes_only_indexed_rows() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let raw = b.collection("raw", 4).expect("collection");
    let indexed = b.indexed_by_seq_id(&raw, 9).expect("index");
    let pending = b.pending(&raw, "late", 4).expect("pending");
    let store = b.store().expect("store");
    let opts = MaintOptions::default();

    let clean = CleanOptions {
        batch_size: 2,
        ..CleanOptions::default()
    };
    let plan = plan_wal_cleanup(&store, &opts, &clean).expect("plan");
    assert_eq!(plan.entries[0].strategy, RetentionStrategy::LivePositions);
    assert_eq!(plan.entries[0].watermark, None);
    assert_eq!(plan.entries[0].qualifying, indexed.len() as u64);

    let report = cleaned(clean_wal(&store, &opts, &clean, |_| true).expect("clean"));
    assert_eq!(report.rows_deleted, 9);
    assert_eq!(topic_rows(&store, &raw), pending);
}

#[test]
fn excluded_collections_are_not_touched() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let keep = b.collection("keep", 4).expect("collection");
    b.committed(&keep, 8, 0, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let scratch = b.collection("scratch", 4).expect("collection");
    b.committed(&scratch, 8, 0, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let store = b.store().expect("store");
    let kept_before = topic_rows(&store, &keep);

    let clean = CleanOptions {
        exclude: vec![keep.id.clone()],
        ..CleanOptions::default()
    };
    let report = cleaned(clean_wal(&store, &MaintOptions::default(), &clean, |plan| {
        assert_eq!(plan.excluded, vec!["keep".to_string()]);
        assert_eq!(plan.entries.len(), 1);
        true
    })
    .expect("clean"));
    assert_eq!(report.rows_deleted, 7);
    assert_eq!(topic_rows(&store, &keep), kept_before);
    assert_eq!(topic_rows(&store, &scratch).len(), 1);
}

#[test]
fn nothing_qualifying_skips_the_transaction_and_the_prompt() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let fresh = b.collection("fresh", 4).expect("collection");
    b.pending(&fresh, "new", 5).expect("pending");
    let store = b.store().expect("store");
    let size = store.size_bytes().expect("size");

    let outcome = clean_wal(&store, &MaintOptions::default(), &CleanOptions::default(), |_| {
        panic!("nothing to confirm")
    })
    .expect("clean");
    match outcome {
        CleanOutcome::NothingToDo(plan) => {
            assert_eq!(plan.total_qualifying, 0);
            assert_eq!(plan.entries[0].strategy, RetentionStrategy::LivePositions);
        }
        other => panic!("expected nothing to do, got {other:?}"),
    }
    assert_eq!(topic_rows(&store, &fresh).len(), 5);
    assert_eq!(store.size_bytes().expect("size"), size);
}

#[test]
fn declined_cleanup_keeps_every_row() {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let docs = b.collection("docs", 4).expect("collection");
    b.committed(&docs, 5, 2, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let store = b.store().expect("store");
    let rows = topic_rows(&store, &docs);
    let outcome = clean_wal(&store, &MaintOptions::default(), &CleanOptions::default(), |plan| {
        assert_eq!(plan.total_qualifying, 6);
        false
    })
    .expect("clean");
    assert!(matches!(outcome, CleanOutcome::Cancelled(_)));
    assert_eq!(topic_rows(&store, &docs), rows);
}

#[test]
fn zero_batch_size_is_invalid() {
    let dir = TempDir::new().expect("tempdir");
    let b = StoreBuilder::new(dir.path()).expect("builder");
    let store = b.store().expect("store");
    let clean = CleanOptions {
        batch_size: 0,
        ..CleanOptions::default()
    };
    let err = clean_wal(&store, &MaintOptions::default(), &clean, |_| true).expect_err("batch");
    assert!(matches!(err, MaintError::InvalidConfig(_)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn batch_size_does_not_change_what_is_deleted(
        batch in 1usize..12,
        indexed in 1usize..30,
        pending in 0usize..6,
    ) {
        let dir = TempDir::new().expect("tempdir");
        let mut b = StoreBuilder::new(dir.path()).expect("builder");
        let raw = b.collection("raw", 2).expect("collection");
        b.indexed_by_seq_id(&raw, indexed).expect("index");
        let left = b.pending(&raw, "late", pending).expect("pending");
        let store = b.store().expect("store");
        let clean = CleanOptions { batch_size: batch, ..CleanOptions::default() };
        let report = cleaned(clean_wal(&store, &MaintOptions::default(), &clean, |_| true).expect("clean"));
        prop_assert_eq!(report.rows_deleted, indexed as u64);
        prop_assert_eq!(topic_rows(&store, &raw), left);
    }
}
