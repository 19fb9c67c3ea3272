#![allow(missing_docs)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;
use vecmaint::catalog::{Catalog, CatalogRead};
use vecmaint::store::INDEX_HEADER_FILE;
use vecmaint::testkit::{FixtureCollection, FixtureSidecar, StoreBuilder};
use vecmaint::Store;

struct Fixture {
    dir: TempDir,
    docs: FixtureCollection,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let mut b = StoreBuilder::new(dir.path().join("store")).expect("builder");
        let docs = b.collection("docs", 4).expect("collection");
        b.committed(&docs, 20, 5, FixtureSidecar::Watermarked, true)
            .expect("segment");
        b.pending(&docs, "late", 2).expect("pending");
        Self { dir, docs }
    }

    fn store_path(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    fn store(&self) -> Store {
        Store::open(self.store_path()).expect("store")
    }

    fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("vecmaint");
        cmd.env("VECMAINT_CONFIG", self.dir.path().join("missing-cli.toml"))
            .env_remove("RUST_LOG")
            .arg("--theme")
            .arg("plain");
        cmd
    }
}

fn json_stdout(output: &[u8]) -> Value {
    serde_json::from_slice(output).expect("json stdout")
}

fn search_ef_row(store: &Store, segment_id: &str) -> Option<String> {
    Catalog::open_read_only(store)
        .expect("catalog")
        .segment_config_rows(segment_id)
        .expect("rows")
        .get("hnsw:search_ef")
        .map(ToString::to_string)
}

#[test]
fn info_reports_collections_as_json() {
    let fx = Fixture::new();
    let out = fx
        .cmd()
        .args(["--format", "json", "info"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let report = json_stdout(&out);
    assert_eq!(report["collection_count"], 1);
    assert_eq!(report["wal_total"], 27);
    assert_eq!(report["collections"][0]["name"], "docs");
    assert_eq!(report["collections"][0]["live_elements"], 15);
    assert_eq!(report["collections"][0]["wal_gap"], 2);
}

#[test]
fn collection_info_prints_text_sections() {
    let fx = Fixture::new();
    let out = fx
        .cmd()
        .args(["collection", "info", "-c", "docs", "--verbose"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("Collection docs"));
    assert!(text.contains(&fx.docs.segment_id));
    assert!(text.contains("fragmentation: 25.00%"));
    assert!(text.contains("hnsw:search_ef = 10 (Default, runtime)"));
}

#[test]
fn quick_info_flags_the_estimate_after_a_rebuild() {
    let fx = Fixture::new();
    let staging = fx.dir.path().join("staging");
    fs::create_dir(&staging).expect("staging");
    fx.cmd()
        .args(["collection", "rebuild", "-c", "docs", "-y", "--staging-dir"])
        .arg(&staging)
        .arg(fx.store_path())
        .assert()
        .success();
    let out = fx
        .cmd()
        .args(["collection", "info", "-c", "docs"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("fragmentation: 25.00% (estimated)"));
    assert!(text.contains("use --verbose to measure"));
}

#[test]
fn collection_config_with_yes_writes_the_row() {
    let fx = Fixture::new();
    let out = fx
        .cmd()
        .args(["--format", "json", "collection", "config", "-c", "docs"])
        .args(["--search-ef", "50", "-y"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let outcome = json_stdout(&out);
    assert_eq!(outcome["outcome"], "applied");
    assert_eq!(outcome["changes"][0]["key"], "search_ef");
    assert_eq!(
        search_ef_row(&fx.store(), &fx.docs.segment_id).as_deref(),
        Some("50")
    );
}

#[test]
fn declined_prompt_exits_cleanly_without_changes() {
    let fx = Fixture::new();
    fx.cmd()
        .args(["collection", "config", "-c", "docs", "--search-ef", "50"])
        .arg(fx.store_path())
        .write_stdin("n\n")
        .assert()
        .success();
    assert_eq!(search_ef_row(&fx.store(), &fx.docs.segment_id), None);
}

#[test]
fn missing_store_fails_with_an_error_message() {
    let fx = Fixture::new();
    let assert = fx
        .cmd()
        .args(["info"])
        .arg(fx.dir.path().join("nowhere"))
        .assert()
        .failure()
        .code(1);
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).expect("utf8");
    assert!(stderr.starts_with("error:"));
}

#[test]
fn unknown_collection_fails() {
    let fx = Fixture::new();
    fx.cmd()
        .args(["collection", "info", "-c", "ghost"])
        .arg(fx.store_path())
        .assert()
        .failure()
        .code(1);
}

#[test]
fn wal_export_writes_json_lines_to_a_file() {
    let fx = Fixture::new();
    let target = fx.dir.path().join("wal.jsonl");
    fx.cmd()
        .args(["--format", "json", "wal", "export", "-o"])
        .arg(&target)
        .arg(fx.store_path())
        .assert()
        .success();
    let contents = fs::read_to_string(&target).expect("export");
    let lines: Vec<Value> = contents
        .lines()
        .map(|l| serde_json::from_str(l).expect("json line"))
        .collect();
    assert_eq!(lines.len(), 27);
    assert_eq!(lines[0]["operation_name"], "ADD");
    assert_eq!(lines[20]["operation_name"], "DELETE");
}

#[test]
fn wal_clean_and_db_clean_dry_run() {
    let fx = Fixture::new();
    let out = fx
        .cmd()
        .args(["--format", "json", "wal", "clean", "-y"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let outcome = json_stdout(&out);
    assert_eq!(outcome["outcome"], "cleaned");
    assert_eq!(outcome["report"]["rows_deleted"], 24);

    fs::create_dir(fx.store_path().join("leftover")).expect("mkdir");
    fs::write(fx.store_path().join("leftover").join(INDEX_HEADER_FILE), b"x").expect("header");
    let out = fx
        .cmd()
        .args(["--format", "json", "db", "clean", "--dry-run"])
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let outcome = json_stdout(&out);
    assert_eq!(outcome["outcome"], "dry_run");
    assert_eq!(outcome["dirs"][0]["name"], "leftover");
    assert!(fx.store_path().join("leftover").is_dir());
}

#[test]
fn rebuild_with_yes_compacts_the_segment() {
    let fx = Fixture::new();
    let staging = fx.dir.path().join("staging");
    fs::create_dir(&staging).expect("staging");
    let out = fx
        .cmd()
        .args(["--format", "json", "collection", "rebuild", "-c", "docs", "-y"])
        .arg("--no-backup")
        .arg("--staging-dir")
        .arg(&staging)
        .arg(fx.store_path())
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let outcome = json_stdout(&out);
    assert_eq!(outcome["outcome"], "rebuilt");
    assert_eq!(outcome["report"]["copied_vectors"], 15);
    assert_eq!(outcome["report"]["after"]["fragmentation"], 0.0);
}
