//! Catalog DDL as laid down by the host application.

/// `segments.scope` of the vector segment.
pub const SCOPE_VECTOR: &str = "VECTOR";
/// `segments.scope` of the scalar metadata segment.
pub const SCOPE_METADATA: &str = "METADATA";
/// `segments.type` of a persisted graph segment.
pub const TYPE_HNSW_PERSISTED: &str = "urn:chroma:segment/vector/hnsw-local-persisted";
/// `segments.type` of the sqlite metadata segment.
pub const TYPE_SQLITE_METADATA: &str = "urn:chroma:segment/metadata/sqlite";
/// Database name used when no qualifier is given.
pub const DEFAULT_DATABASE: &str = "default_database";
/// Tenant owning the default database.
pub const DEFAULT_TENANT: &str = "default_tenant";
/// Vector encoding tag of WAL rows.
pub const ENCODING_FLOAT32: &str = "FLOAT32";

pub(crate) const CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id TEXT PRIMARY KEY,
    UNIQUE (id)
);
CREATE TABLE IF NOT EXISTS databases (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    tenant_id TEXT NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
    UNIQUE (tenant_id, name)
);
CREATE TABLE IF NOT EXISTS collections (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    dimension INTEGER,
    database_id TEXT NOT NULL REFERENCES databases(id) ON DELETE CASCADE,
    config_json_str TEXT,
    UNIQUE (name, database_id)
);
CREATE TABLE IF NOT EXISTS segments (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL,
    scope TEXT NOT NULL,
    collection TEXT REFERENCES collections(id)
);
CREATE TABLE IF NOT EXISTS segment_metadata (
    segment_id TEXT REFERENCES segments(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    str_value TEXT,
    int_value INTEGER,
    float_value REAL,
    bool_value INTEGER,
    PRIMARY KEY (segment_id, key)
);
CREATE TABLE IF NOT EXISTS embeddings_queue (
    seq_id INTEGER PRIMARY KEY,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    operation INTEGER NOT NULL,
    topic TEXT NOT NULL,
    id TEXT NOT NULL,
    vector BLOB,
    encoding TEXT,
    metadata TEXT
);
CREATE TABLE IF NOT EXISTS embeddings_queue_config (
    id INTEGER PRIMARY KEY,
    config_json_str TEXT
);
CREATE TABLE IF NOT EXISTS max_seq_id (
    segment_id TEXT PRIMARY KEY,
    seq_id BLOB NOT NULL
);
"#;
