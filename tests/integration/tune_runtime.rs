#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;

use tempfile::TempDir;
use vecmaint::admin::{tune, CollectionRef, MaintOptions, TuneOutcome, TuneRequest};
use vecmaint::catalog::{Catalog, CatalogRead};
use vecmaint::config::{ConfigKey, ConfigValue, RuntimeOverrides};
use vecmaint::store::{dir_size, INDEX_HEADER_FILE};
use vecmaint::testkit::{FixtureCollection, FixtureSidecar, StoreBuilder};
use vecmaint::{MaintError, Store};

fn setup() -> (TempDir, Store, FixtureCollection) {
    let dir = TempDir::new().expect("tempdir");
    let mut b = StoreBuilder::new(dir.path()).expect("builder");
    let docs = b.collection("docs", 4).expect("collection");
    b.committed(&docs, 25, 5, FixtureSidecar::Watermarked, true)
        .expect("segment");
    let store = b.store().expect("store");
    (dir, store, docs)
}

fn rows(store: &Store, segment_id: &str) -> HashMap<String, ConfigValue> {
    Catalog::open_read_only(store)
        .expect("catalog")
        .segment_config_rows(segment_id)
        .expect("rows")
}

fn request(overrides: RuntimeOverrides) -> TuneRequest {
    TuneRequest {
        collection: CollectionRef::new("docs"),
        overrides,
    }
}

#[test]
fn search_ef_change_writes_one_row_and_leaves_files_alone() {
    let (_dir, store, docs) = setup();
    let seg_dir = store.segment_dir(&docs.segment_id);
    let size = dir_size(&seg_dir).expect("size");
    let header = fs::read(seg_dir.join(INDEX_HEADER_FILE)).expect("header");

    let outcome = tune(
        &store,
        &MaintOptions::default(),
        &request(RuntimeOverrides {
            search_ef: Some(50),
            ..RuntimeOverrides::default()
        }),
        |changes| {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].key, ConfigKey::SearchEf);
            true
        },
    )
    .expect("tune");
    let TuneOutcome::Applied(changes) = outcome else {
        panic!("expected applied, got {outcome:?}");
    };
    assert_eq!(changes[0].new, ConfigValue::Int(50));

    let written = rows(&store, &docs.segment_id);
    assert_eq!(written.len(), 1);
    assert_eq!(written.get("hnsw:search_ef"), Some(&ConfigValue::Int(50)));
    assert_eq!(dir_size(&seg_dir).expect("size"), size);
    assert_eq!(fs::read(seg_dir.join(INDEX_HEADER_FILE)).expect("header"), header);
}

#[test]
fn several_keys_are_written_together() {
    let (_dir, store, docs) = setup();
    let outcome = tune(
        &store,
        &MaintOptions::default(),
        &request(RuntimeOverrides {
            num_threads: Some(3),
            resize_factor: Some(1.5),
            batch_size: Some(20),
            sync_threshold: Some(400),
            ..RuntimeOverrides::default()
        }),
        |_| true,
    )
    .expect("tune");
    assert!(matches!(outcome, TuneOutcome::Applied(ref c) if c.len() >= 3));
    let written = rows(&store, &docs.segment_id);
    assert_eq!(written.get("hnsw:resize_factor"), Some(&ConfigValue::Float(1.5)));
    assert_eq!(written.get("hnsw:batch_size"), Some(&ConfigValue::Int(20)));
    assert_eq!(written.get("hnsw:sync_threshold"), Some(&ConfigValue::Int(400)));
}

#[test]
fn matching_values_are_unchanged_and_skip_the_prompt() {
    let (_dir, store, docs) = setup();
    let opts = MaintOptions::default();
    let req = request(RuntimeOverrides {
        search_ef: Some(77),
        ..RuntimeOverrides::default()
    });
    tune(&store, &opts, &req, |_| true).expect("first");
    let outcome = tune(&store, &opts, &req, |_| panic!("nothing to confirm")).expect("second");
    assert_eq!(outcome, TuneOutcome::Unchanged);
    assert_eq!(rows(&store, &docs.segment_id).len(), 1);
}

#[test]
fn declined_prompt_writes_nothing() {
    let (_dir, store, docs) = setup();
    let outcome = tune(
        &store,
        &MaintOptions::default(),
        &request(RuntimeOverrides {
            search_ef: Some(5),
            ..RuntimeOverrides::default()
        }),
        |_| false,
    )
    .expect("tune");
    assert!(matches!(outcome, TuneOutcome::Cancelled(ref c) if c.len() == 1));
    assert!(rows(&store, &docs.segment_id).is_empty());
}

#[test]
fn out_of_range_values_are_rejected_before_any_write() {
    let (_dir, store, docs) = setup();
    let opts = MaintOptions::default();
    let bad = [
        RuntimeOverrides {
            search_ef: Some(0),
            ..RuntimeOverrides::default()
        },
        RuntimeOverrides {
            resize_factor: Some(0.5),
            ..RuntimeOverrides::default()
        },
        RuntimeOverrides {
            batch_size: Some(500),
            sync_threshold: Some(100),
            ..RuntimeOverrides::default()
        },
    ];
    for overrides in bad {
        let err = tune(&store, &opts, &request(overrides), |_| true).expect_err("invalid");
        assert!(matches!(err, MaintError::InvalidConfig(_)), "{err}");
    }
    assert!(rows(&store, &docs.segment_id).is_empty());
}

#[test]
fn unknown_collection_is_not_found() {
    let (_dir, store, _docs) = setup();
    let err = tune(
        &store,
        &MaintOptions::default(),
        &TuneRequest {
            collection: CollectionRef::new("missing"),
            overrides: RuntimeOverrides {
                search_ef: Some(9),
                ..RuntimeOverrides::default()
            },
        },
        |_| true,
    )
    .expect_err("missing");
    assert!(matches!(err, MaintError::NotFound(_)));
}
