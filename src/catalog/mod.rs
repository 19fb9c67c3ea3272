//! Typed access to the relational catalog.
//!
//! Every other component reads and writes the catalog through this module.
//! Reads are provided by [`CatalogRead`], implemented both by [`Catalog`] and
//! by the exclusive transaction handle [`ExclusiveTx`]; writes only exist on
//! the transaction.

mod schema;
mod tx;

use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::ConfigValue;
use crate::error::{MaintError, Result};
use crate::store::Store;

pub use schema::{
    DEFAULT_DATABASE, DEFAULT_TENANT, ENCODING_FLOAT32, SCOPE_METADATA, SCOPE_VECTOR,
    TYPE_HNSW_PERSISTED, TYPE_SQLITE_METADATA,
};
pub(crate) use schema::CREATE_SCHEMA;
pub use tx::ExclusiveTx;

/// Number of values bound per `IN (...)` statement.
pub const IN_CLAUSE_CHUNK: usize = 100;

/// A collection joined with its database and tenant.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollectionRow {
    /// Collection id.
    pub id: String,
    /// Collection name, unique within a database.
    pub name: String,
    /// Vector dimensionality, unknown until the first insert.
    pub dimension: Option<u32>,
    /// Database id.
    pub database_id: String,
    /// Database name.
    pub database: String,
    /// Tenant id.
    pub tenant: String,
    /// Raw `config_json_str` column.
    #[serde(skip)]
    pub config_json: Option<String>,
}

/// Role of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentScope {
    /// Graph index segment backed by a directory.
    Vector,
    /// Scalar metadata segment stored in the catalog.
    Metadata,
}

impl SegmentScope {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            SCOPE_VECTOR => Some(SegmentScope::Vector),
            SCOPE_METADATA => Some(SegmentScope::Metadata),
            _ => None,
        }
    }
}

/// A `segments` row.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SegmentRow {
    /// Segment id, also the directory name for vector segments.
    pub id: String,
    /// Implementation type URN.
    pub kind: String,
    /// Role.
    pub scope: SegmentScope,
    /// Owning collection id.
    pub collection: String,
}

/// The two segments every collection owns.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CollectionSegments {
    /// Vector segment.
    pub vector: SegmentRow,
    /// Metadata segment.
    pub metadata: SegmentRow,
}

/// Operation recorded by a WAL row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalOperation {
    /// Insert a new record.
    Add,
    /// Replace an existing record.
    Update,
    /// Insert or replace.
    Upsert,
    /// Remove a record.
    Delete,
}

impl WalOperation {
    /// Integer code stored in `embeddings_queue.operation`.
    pub fn code(self) -> i64 {
        match self {
            WalOperation::Add => 0,
            WalOperation::Update => 1,
            WalOperation::Upsert => 2,
            WalOperation::Delete => 3,
        }
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(WalOperation::Add),
            1 => Some(WalOperation::Update),
            2 => Some(WalOperation::Upsert),
            3 => Some(WalOperation::Delete),
            _ => None,
        }
    }
}

/// An `embeddings_queue` row.
#[derive(Clone, Debug, PartialEq)]
pub struct WalRow {
    /// Sequence id, strictly increasing per topic.
    pub seq_id: i64,
    /// Insertion timestamp as stored.
    pub created_at: String,
    /// Operation.
    pub operation: WalOperation,
    /// Topic of the owning collection.
    pub topic: String,
    /// External record identifier.
    pub id: String,
    /// Encoded vector payload.
    pub vector: Option<Vec<u8>>,
    /// Encoding tag of `vector`.
    pub encoding: Option<String>,
    /// Record metadata as JSON text.
    pub metadata: Option<String>,
}

impl WalRow {
    /// Decodes a `FLOAT32` little-endian payload.
    pub fn decode_vector(&self) -> Option<Vec<f32>> {
        let bytes = self.vector.as_ref()?;
        if bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

/// Encodes a vector the way WAL rows carry it.
pub fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// WAL row count of one topic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopicCount {
    /// Topic.
    pub topic: String,
    /// Number of rows.
    pub count: u64,
    /// Lowest sequence id present.
    pub first_seq_id: i64,
}

/// Global WAL retention configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RetentionConfig {
    /// Whether the host purges WAL rows after each flush.
    pub automatically_purge: bool,
    /// Whether the configuration row exists at all.
    pub present: bool,
}

/// Decodes a `max_seq_id.seq_id` value.
///
/// Integers are accepted as is. Blobs are big-endian: 8 bytes for the current
/// encoding, 24 bytes for the older one whose low 8 bytes carry the id.
pub fn decode_seq_id(value: ValueRef<'_>) -> Option<i64> {
    match value {
        ValueRef::Integer(v) => Some(v),
        ValueRef::Blob(bytes) if bytes.len() == 8 || bytes.len() == 24 => {
            let tail = &bytes[bytes.len() - 8..];
            let mut buf = [0u8; 8];
            buf.copy_from_slice(tail);
            i64::try_from(u64::from_be_bytes(buf)).ok()
        }
        _ => None,
    }
}

/// Encodes a sequence id for `max_seq_id`.
pub fn encode_seq_id(seq_id: i64) -> Vec<u8> {
    (seq_id.max(0) as u64).to_be_bytes().to_vec()
}

const COLLECTION_SELECT: &str = "SELECT c.id, c.name, c.dimension, c.database_id, d.name, d.tenant_id, c.config_json_str \
     FROM collections c JOIN databases d ON c.database_id = d.id";

fn collection_from_row(row: &Row<'_>) -> rusqlite::Result<CollectionRow> {
    let dimension: Option<i64> = row.get(2)?;
    Ok(CollectionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        dimension: dimension.and_then(|d| u32::try_from(d).ok()),
        database_id: row.get(3)?,
        database: row.get(4)?,
        tenant: row.get(5)?,
        config_json: row.get(6)?,
    })
}

fn segment_from_row(row: &Row<'_>) -> rusqlite::Result<Option<SegmentRow>> {
    let scope: String = row.get(2)?;
    let Some(scope) = SegmentScope::parse(&scope) else {
        return Ok(None);
    };
    Ok(Some(SegmentRow {
        id: row.get(0)?,
        kind: row.get(1)?,
        scope,
        collection: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
    }))
}

fn wal_from_row(row: &Row<'_>) -> rusqlite::Result<Option<WalRow>> {
    let code: i64 = row.get(2)?;
    let Some(operation) = WalOperation::from_code(code) else {
        return Ok(None);
    };
    let created_at = match row.get_ref(1)? {
        ValueRef::Text(text) => String::from_utf8_lossy(text).into_owned(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        _ => String::new(),
    };
    Ok(Some(WalRow {
        seq_id: row.get(0)?,
        created_at,
        operation,
        topic: row.get(3)?,
        id: row.get(4)?,
        vector: row.get(5)?,
        encoding: row.get(6)?,
        metadata: row.get(7)?,
    }))
}

/// Read access shared by the plain connection and the exclusive transaction.
pub trait CatalogRead {
    /// Underlying connection.
    fn conn(&self) -> &Connection;

    /// Every collection, ordered by database then name.
    fn collections(&self) -> Result<Vec<CollectionRow>> {
        let sql = format!("{COLLECTION_SELECT} ORDER BY d.name, c.name");
        let mut stmt = self.conn().prepare(&sql)?;
        let rows = stmt.query_map([], collection_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Collection by id.
    fn collection_by_id(&self, id: &str) -> Result<Option<CollectionRow>> {
        let sql = format!("{COLLECTION_SELECT} WHERE c.id = ?1");
        Ok(self
            .conn()
            .query_row(&sql, params![id], collection_from_row)
            .optional()?)
    }

    /// Resolves a collection name within a database.
    ///
    /// # Errors
    ///
    /// `NotFound` unless exactly one collection matches.
    fn find_collection(&self, name: &str, database: &str) -> Result<CollectionRow> {
        let sql = format!("{COLLECTION_SELECT} WHERE c.name = ?1 AND d.name = ?2");
        let mut stmt = self.conn().prepare(&sql)?;
        let mut matches = stmt
            .query_map(params![name, database], collection_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(MaintError::not_found(format!(
                "collection '{name}' in database '{database}'"
            ))),
            n => Err(MaintError::not_found(format!(
                "collection '{name}' is ambiguous in database '{database}' ({n} matches)"
            ))),
        }
    }

    /// Segments owned by a collection.
    fn segments_for(&self, collection_id: &str) -> Result<Vec<SegmentRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, type, scope, collection FROM segments WHERE collection = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![collection_id], segment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            if let Some(segment) = row? {
                out.push(segment);
            }
        }
        Ok(out)
    }

    /// The vector and metadata segments of a collection.
    ///
    /// # Errors
    ///
    /// `NotFound` when either row is missing.
    fn collection_segments(&self, collection: &CollectionRow) -> Result<CollectionSegments> {
        let segments = self.segments_for(&collection.id)?;
        let find = |scope: SegmentScope| {
            segments
                .iter()
                .find(|s| s.scope == scope)
                .cloned()
                .ok_or_else(|| {
                    MaintError::not_found(format!(
                        "{scope:?} segment of collection '{}' ({})",
                        collection.name, collection.id
                    ))
                })
        };
        Ok(CollectionSegments {
            vector: find(SegmentScope::Vector)?,
            metadata: find(SegmentScope::Metadata)?,
        })
    }

    /// Every vector segment joined with its collection, ordered by segment id.
    fn vector_segments(&self) -> Result<Vec<(SegmentRow, CollectionRow)>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, type, scope, collection FROM segments WHERE scope = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![SCOPE_VECTOR], segment_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            let Some(segment) = row? else { continue };
            match self.collection_by_id(&segment.collection)? {
                Some(collection) => out.push((segment, collection)),
                None => debug!(segment = %segment.id, "maint.catalog.segment_without_collection"),
            }
        }
        Ok(out)
    }

    /// Ids of every vector segment, including ones whose collection is gone.
    fn vector_segment_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT id FROM segments WHERE scope = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![SCOPE_VECTOR], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Typed configuration rows of a segment keyed by their metadata key.
    fn segment_config_rows(&self, segment_id: &str) -> Result<HashMap<String, ConfigValue>> {
        let mut stmt = self.conn().prepare(
            "SELECT key, str_value, int_value, float_value FROM segment_metadata WHERE segment_id = ?1",
        )?;
        let rows = stmt.query_map(params![segment_id], |row| {
            let key: String = row.get(0)?;
            let str_value: Option<String> = row.get(1)?;
            let int_value: Option<i64> = row.get(2)?;
            let float_value: Option<f64> = row.get(3)?;
            let value = match (str_value, int_value, float_value) {
                (Some(s), _, _) => Some(ConfigValue::Str(s)),
                (None, Some(i), _) => Some(ConfigValue::Int(i)),
                (None, None, Some(f)) => Some(ConfigValue::Float(f)),
                _ => None,
            };
            Ok((key, value))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (key, value) = row?;
            if let Some(value) = value {
                out.insert(key, value);
            }
        }
        Ok(out)
    }

    /// Highest sequence id the catalog records for a segment.
    fn max_seq_id(&self, segment_id: &str) -> Result<Option<i64>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT seq_id FROM max_seq_id WHERE segment_id = ?1")?;
        let mut rows = stmt.query(params![segment_id])?;
        match rows.next()? {
            Some(row) => Ok(decode_seq_id(row.get_ref(0)?)),
            None => Ok(None),
        }
    }

    /// WAL rows of a topic.
    fn wal_count(&self, topic: &str) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM embeddings_queue WHERE topic = ?1",
            params![topic],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// WAL rows of a topic strictly below `watermark`.
    fn wal_count_below(&self, topic: &str, watermark: i64) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM embeddings_queue WHERE topic = ?1 AND seq_id < ?2",
            params![topic, watermark],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// WAL rows of a topic strictly above `watermark`.
    fn wal_count_above(&self, topic: &str, watermark: i64) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM embeddings_queue WHERE topic = ?1 AND seq_id > ?2",
            params![topic, watermark],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// WAL rows of a topic whose sequence id is one of `seq_ids`.
    fn wal_count_in(&self, topic: &str, seq_ids: &[i64]) -> Result<u64> {
        let mut total = 0u64;
        for chunk in seq_ids.chunks(IN_CLAUSE_CHUNK) {
            let sql = format!(
                "SELECT COUNT(*) FROM embeddings_queue WHERE topic = ? AND seq_id IN ({})",
                placeholders(chunk.len())
            );
            let mut values: Vec<&dyn rusqlite::ToSql> = Vec::with_capacity(chunk.len() + 1);
            values.push(&topic);
            values.extend(chunk.iter().map(|v| v as &dyn rusqlite::ToSql));
            let count: i64 = self
                .conn()
                .query_row(&sql, values.as_slice(), |row| row.get(0))?;
            total += count as u64;
        }
        Ok(total)
    }

    /// Row count per topic, ordered by the first sequence id of each topic.
    fn wal_topics(&self) -> Result<Vec<TopicCount>> {
        let mut stmt = self.conn().prepare(
            "SELECT topic, COUNT(*), MIN(seq_id) FROM embeddings_queue GROUP BY topic ORDER BY MIN(seq_id)",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(TopicCount {
                topic: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                first_seq_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// WAL rows ordered by sequence id, optionally restricted to one topic and
    /// to sequence ids strictly above `after`.
    fn wal_rows(&self, topic: Option<&str>, after: Option<i64>) -> Result<Vec<WalRow>> {
        let mut stmt = self.conn().prepare(
            "SELECT seq_id, created_at, operation, topic, id, vector, encoding, metadata \
             FROM embeddings_queue \
             WHERE (?1 IS NULL OR topic = ?1) AND (?2 IS NULL OR seq_id > ?2) \
             ORDER BY seq_id",
        )?;
        let rows = stmt.query_map(params![topic, after], wal_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            match row? {
                Some(row) => out.push(row),
                None => debug!("maint.catalog.unknown_wal_operation"),
            }
        }
        Ok(out)
    }

    /// Total WAL rows.
    fn wal_total(&self) -> Result<u64> {
        let count: i64 =
            self.conn()
                .query_row("SELECT COUNT(*) FROM embeddings_queue", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Global retention configuration; absent row reads as purge disabled.
    fn retention_config(&self) -> Result<RetentionConfig> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT config_json_str FROM embeddings_queue_config ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw.flatten() else {
            return Ok(RetentionConfig::default());
        };
        let value: Value = serde_json::from_str(&raw)?;
        Ok(RetentionConfig {
            automatically_purge: value
                .get("automatically_purge")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            present: true,
        })
    }
}

pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

/// Connection to the catalog file of a store.
#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens the catalog for reading and writing. The file must exist.
    pub fn open(store: &Store) -> Result<Self> {
        Self::open_with_flags(
            &store.catalog_path(),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Opens the catalog read-only.
    pub fn open_read_only(store: &Store) -> Result<Self> {
        Self::open_with_flags(
            &store.catalog_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }

    /// Creates a catalog file with the host schema if it does not exist yet.
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_SCHEMA)?;
        Ok(Self { conn })
    }

    fn open_with_flags(path: &Path, flags: OpenFlags) -> Result<Self> {
        if !path.is_file() {
            return Err(MaintError::not_found(format!(
                "catalog {}",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(path, flags)?;
        Ok(Self { conn })
    }

    /// Takes the exclusive write lock and returns the transaction holding it.
    pub fn begin_exclusive(&mut self) -> Result<ExclusiveTx<'_>> {
        ExclusiveTx::begin(&mut self.conn)
    }

    /// Rebuilds the catalog file to reclaim space. Must run outside a
    /// transaction.
    pub fn vacuum(&self) -> Result<()> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }
}

impl CatalogRead for Catalog {
    fn conn(&self) -> &Connection {
        &self.conn
    }
}
