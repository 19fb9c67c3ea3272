//! Builders for synthetic stores.
//!
//! Used by the test suites and handy for reproducing field reports: a store is
//! laid out exactly like the host application leaves it, with catalog rows,
//! WAL rows and segment directories written through the same code paths the
//! maintenance operations read.

use std::fs;
use std::path::{Path, PathBuf};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rusqlite::params;
use serde_json::json;

use crate::admin::TopicScheme;
use crate::catalog::{
    encode_seq_id, encode_vector, Catalog, CatalogRead, WalOperation, DEFAULT_DATABASE,
    DEFAULT_TENANT, ENCODING_FLOAT32, SCOPE_METADATA, SCOPE_VECTOR, TYPE_HNSW_PERSISTED,
    TYPE_SQLITE_METADATA,
};
use crate::config::{ConfigKey, ConfigValue, ResolvedConfig};
use crate::error::{MaintError, Result};
use crate::index::{HnswDriver, IndexDriver, IndexParams, OpenMode};
use crate::sidecar::{SidecarDialect, SidecarMetadata};
use crate::store::{Store, CATALOG_FILE, INDEX_HEADER_FILE};

const DEFAULT_DATABASE_ID: &str = "00000000-0000-0000-0000-000000000000";

/// Which side-car a committed fixture segment carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixtureSidecar {
    /// Current format, recording the durable watermark.
    Watermarked,
    /// Older format without a watermark.
    Legacy,
    /// No side-car at all.
    Absent,
}

/// Catalog handles of a fixture collection.
#[derive(Clone, Debug)]
pub struct FixtureCollection {
    /// Collection id.
    pub id: String,
    /// Collection name.
    pub name: String,
    /// Vector segment id.
    pub segment_id: String,
    /// Metadata segment id.
    pub metadata_segment_id: String,
    /// WAL topic.
    pub topic: String,
    /// Vector dimensionality.
    pub dim: u32,
}

/// What [`StoreBuilder::committed`] wrote.
#[derive(Clone, Debug, Default)]
pub struct CommittedSegment {
    /// Ids still live, in insertion order.
    pub live_ids: Vec<String>,
    /// Ids added then deleted.
    pub deleted_ids: Vec<String>,
    /// Sequence id of the last WAL row incorporated.
    pub watermark: i64,
}

/// Lays out a store root one piece at a time.
pub struct StoreBuilder {
    root: PathBuf,
    catalog: Catalog,
    topics: TopicScheme,
    rng: ChaCha8Rng,
    collections: u32,
}

impl StoreBuilder {
    /// Creates the catalog with the default tenant and database under `root`.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let catalog = Catalog::create(&root.join(CATALOG_FILE))?;
        // Fixture stores are disposable; skip the per-row fsync.
        catalog
            .conn()
            .execute_batch("PRAGMA synchronous = OFF; PRAGMA journal_mode = MEMORY;")?;
        catalog.conn().execute(
            "INSERT OR IGNORE INTO tenants (id) VALUES (?1)",
            params![DEFAULT_TENANT],
        )?;
        catalog.conn().execute(
            "INSERT OR IGNORE INTO databases (id, name, tenant_id) VALUES (?1, ?2, ?3)",
            params![DEFAULT_DATABASE_ID, DEFAULT_DATABASE, DEFAULT_TENANT],
        )?;
        Ok(Self {
            root,
            catalog,
            topics: TopicScheme::default(),
            rng: ChaCha8Rng::seed_from_u64(7),
            collections: 0,
        })
    }

    /// Reseeds the vector generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validated handle on the store laid out so far.
    pub fn store(&self) -> Result<Store> {
        Store::open(&self.root)
    }

    /// Adds a database to the default tenant and returns its id.
    pub fn database(&mut self, name: &str) -> Result<String> {
        let id = format!("db-{name}");
        self.catalog.conn().execute(
            "INSERT INTO databases (id, name, tenant_id) VALUES (?1, ?2, ?3)",
            params![id, name, DEFAULT_TENANT],
        )?;
        Ok(id)
    }

    /// Adds a collection of `dim`-dimensional vectors in the default database
    /// with a vector and a metadata segment.
    pub fn collection(&mut self, name: &str, dim: u32) -> Result<FixtureCollection> {
        self.collection_in(DEFAULT_DATABASE_ID, name, dim)
    }

    /// Like [`Self::collection`], in the database with id `database_id`.
    pub fn collection_in(
        &mut self,
        database_id: &str,
        name: &str,
        dim: u32,
    ) -> Result<FixtureCollection> {
        self.collections += 1;
        let n = self.collections;
        let id = format!("c0ffee00-0000-4000-8000-{n:012}");
        let segment_id = format!("5e9e0000-0000-4000-8000-{n:012}");
        let metadata_segment_id = format!("3e7a0000-0000-4000-8000-{n:012}");
        let conn = self.catalog.conn();
        conn.execute(
            "INSERT INTO collections (id, name, dimension, database_id) VALUES (?1, ?2, ?3, ?4)",
            params![id, name, dim, database_id],
        )?;
        conn.execute(
            "INSERT INTO segments (id, type, scope, collection) VALUES (?1, ?2, ?3, ?4)",
            params![segment_id, TYPE_HNSW_PERSISTED, SCOPE_VECTOR, id],
        )?;
        conn.execute(
            "INSERT INTO segments (id, type, scope, collection) VALUES (?1, ?2, ?3, ?4)",
            params![metadata_segment_id, TYPE_SQLITE_METADATA, SCOPE_METADATA, id],
        )?;
        Ok(FixtureCollection {
            topic: self.topics.topic(&id),
            id,
            name: name.to_string(),
            segment_id,
            metadata_segment_id,
            dim,
        })
    }

    /// Writes a typed segment configuration row.
    pub fn segment_config(
        &mut self,
        collection: &FixtureCollection,
        key: ConfigKey,
        value: ConfigValue,
    ) -> Result<()> {
        let (s, i, f) = match value {
            ConfigValue::Str(s) => (Some(s), None, None),
            ConfigValue::Int(i) => (None, Some(i), None),
            ConfigValue::Float(f) => (None, None, Some(f)),
        };
        self.catalog.conn().execute(
            "INSERT OR REPLACE INTO segment_metadata (segment_id, key, str_value, int_value, float_value) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![collection.segment_id, key.metadata_key(), s, i, f],
        )?;
        Ok(())
    }

    /// Replaces the collection's configuration JSON.
    pub fn collection_config(&mut self, collection: &FixtureCollection, raw: &str) -> Result<()> {
        self.catalog.conn().execute(
            "UPDATE collections SET config_json_str = ?1 WHERE id = ?2",
            params![raw, collection.id],
        )?;
        Ok(())
    }

    /// Writes the retention configuration row.
    pub fn automatically_purge(&mut self, enabled: bool) -> Result<()> {
        let body = json!({
            "automatically_purge": enabled,
            "_type": "EmbeddingsQueueConfigurationInternal",
        });
        self.catalog.conn().execute(
            "INSERT OR REPLACE INTO embeddings_queue_config (id, config_json_str) VALUES (1, ?1)",
            params![body.to_string()],
        )?;
        Ok(())
    }

    /// Records the catalog watermark of a segment.
    pub fn max_seq_id(&mut self, collection: &FixtureCollection, seq_id: i64) -> Result<()> {
        self.catalog.conn().execute(
            "INSERT OR REPLACE INTO max_seq_id (segment_id, seq_id) VALUES (?1, ?2)",
            params![collection.segment_id, encode_seq_id(seq_id)],
        )?;
        Ok(())
    }

    /// Deterministic vector of `dim` values in `[-1, 1)`.
    pub fn vector(&mut self, dim: u32) -> Vec<f32> {
        (0..dim).map(|_| self.rng.gen_range(-1.0f32..1.0)).collect()
    }

    /// Appends a WAL row and returns its sequence id.
    pub fn wal(
        &mut self,
        collection: &FixtureCollection,
        operation: WalOperation,
        id: &str,
        vector: Option<&[f32]>,
    ) -> Result<i64> {
        let blob = vector.map(encode_vector);
        let encoding = vector.map(|_| ENCODING_FLOAT32);
        let metadata = json!({ "source": id }).to_string();
        self.catalog.conn().execute(
            "INSERT INTO embeddings_queue (operation, topic, id, vector, encoding, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![operation.code(), collection.topic, id, blob, encoding, metadata],
        )?;
        Ok(self.catalog.conn().last_insert_rowid())
    }

    /// Appends `count` ADD rows with fresh vectors that no index has seen.
    pub fn pending(&mut self, collection: &FixtureCollection, prefix: &str, count: usize) -> Result<Vec<i64>> {
        let mut seq_ids = Vec::with_capacity(count);
        for i in 0..count {
            let vector = self.vector(collection.dim);
            seq_ids.push(self.wal(collection, WalOperation::Add, &format!("{prefix}-{i}"), Some(&vector))?);
        }
        Ok(seq_ids)
    }

    /// Writes `records` ADD rows, deletes the first `deleted` of them, and
    /// persists the result the way the host does after a sync: an index whose
    /// positions are the insertion counter, the requested side-car and,
    /// optionally, the catalog watermark.
    pub fn committed(
        &mut self,
        collection: &FixtureCollection,
        records: usize,
        deleted: usize,
        sidecar: FixtureSidecar,
        record_max_seq_id: bool,
    ) -> Result<CommittedSegment> {
        if deleted > records {
            return Err(MaintError::Message(format!(
                "cannot delete {deleted} of {records} records"
            )));
        }
        let mut meta = SidecarMetadata::new(Some(collection.dim));
        let mut vectors = Vec::with_capacity(records);
        let mut labels = Vec::with_capacity(records);
        let mut out = CommittedSegment::default();
        for i in 0..records {
            let id = format!("{}-{i}", collection.name);
            let vector = self.vector(collection.dim);
            let seq_id = self.wal(collection, WalOperation::Add, &id, Some(&vector))?;
            let label = i as u64 + 1;
            meta.insert(&id, label, seq_id);
            meta.total_elements_added = label;
            vectors.push(vector);
            labels.push(label);
            out.live_ids.push(id);
            out.watermark = seq_id;
        }
        let mut tombstoned = Vec::with_capacity(deleted);
        let removed: Vec<String> = out.live_ids.drain(..deleted).collect();
        for id in removed {
            out.watermark = self.wal(collection, WalOperation::Delete, &id, None)?;
            if let Some(label) = meta.remove(&id) {
                tombstoned.push(label);
            }
            out.deleted_ids.push(id);
        }

        let dir = self.root.join(&collection.segment_id);
        fs::create_dir_all(&dir)?;
        let params = self.params_for(collection)?;
        let mut index = HnswDriver.open(&dir, OpenMode::Create, &params, records as u64)?;
        if !labels.is_empty() {
            index.insert(&vectors, &labels)?;
        }
        for label in tombstoned {
            index.mark_deleted(label)?;
        }
        index.close()?;

        match sidecar {
            FixtureSidecar::Watermarked => {
                meta.dialect = SidecarDialect::Watermarked {
                    max_seq_id: out.watermark,
                };
                meta.store(&dir.join(crate::store::SIDECAR_FILE))?;
            }
            FixtureSidecar::Legacy => {
                meta.dialect = SidecarDialect::Legacy;
                meta.store(&dir.join(crate::store::SIDECAR_FILE))?;
            }
            FixtureSidecar::Absent => {}
        }
        if record_max_seq_id {
            self.max_seq_id(collection, out.watermark)?;
        }
        Ok(out)
    }

    /// Writes `records` ADD rows and an index holding each vector at the
    /// position equal to its row's sequence id, with no side-car.
    pub fn indexed_by_seq_id(&mut self, collection: &FixtureCollection, records: usize) -> Result<Vec<i64>> {
        let mut vectors = Vec::with_capacity(records);
        let mut positions = Vec::with_capacity(records);
        for i in 0..records {
            let vector = self.vector(collection.dim);
            let seq_id = self.wal(
                collection,
                WalOperation::Add,
                &format!("{}-{i}", collection.name),
                Some(&vector),
            )?;
            vectors.push(vector);
            positions.push(seq_id);
        }
        let dir = self.root.join(&collection.segment_id);
        fs::create_dir_all(&dir)?;
        let params = self.params_for(collection)?;
        let mut index = HnswDriver.open(&dir, OpenMode::Create, &params, records as u64)?;
        let labels: Vec<u64> = positions.iter().map(|p| *p as u64).collect();
        if !labels.is_empty() {
            index.insert(&vectors, &labels)?;
        }
        index.close()?;
        Ok(positions)
    }

    /// Creates a directory that looks like a segment but has no catalog row.
    pub fn stray_segment_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(INDEX_HEADER_FILE), b"stray")?;
        Ok(dir)
    }

    fn params_for(&self, collection: &FixtureCollection) -> Result<IndexParams> {
        let rows = self.catalog.segment_config_rows(&collection.segment_id)?;
        let json = self
            .catalog
            .collection_by_id(&collection.id)?
            .and_then(|c| c.config_json);
        let resolved = ResolvedConfig::resolve(&rows, json.as_deref())?;
        Ok(IndexParams::from_config(&resolved.config, collection.dim))
    }
}
