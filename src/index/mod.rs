//! Narrow driver interface over a persisted graph index segment.
//!
//! Maintenance code only talks to [`IndexDriver`] and the owned
//! [`VectorIndex`] handle it returns. The shipped driver, [`HnswDriver`],
//! persists vectors per position in `header.bin`/`data_level0.bin` and the
//! `hnsw_rs` graph built from the live positions as a `graph.hnsw.*` dump.

mod segment;

use std::fs;
use std::path::Path;

use crc32fast::Hasher;
use serde::Serialize;

use crate::config::{IndexConfig, Metric};
use crate::error::{MaintError, Result};
use crate::store::INDEX_HEADER_FILE;

pub use segment::{stored_graph, GraphSummary, HnswSegment};

const HEADER_MAGIC: [u8; 4] = *b"VIDX";
const HEADER_VERSION: u16 = 1;
pub(crate) const HEADER_LEN: usize = 4 + 2 + 1 + 4 + 4 + 4 + 8 + 8;

/// How a segment is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing files, no mutation allowed.
    ReadOnly,
    /// Existing files, mutations written back on flush.
    ReadWrite,
    /// Fresh empty index; existing index files in the directory are replaced
    /// on flush.
    Create,
}

/// Structural and runtime parameters an index is opened with.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexParams {
    /// Distance metric.
    pub metric: Metric,
    /// Vector dimensionality.
    pub dim: u32,
    /// Graph fan-out.
    pub m: usize,
    /// Construction breadth.
    pub ef_construction: usize,
    /// Search breadth.
    pub ef_search: usize,
    /// Worker threads for graph construction.
    pub num_threads: usize,
}

impl IndexParams {
    /// Parameters of a resolved configuration for vectors of `dim` values.
    pub fn from_config(config: &IndexConfig, dim: u32) -> Self {
        Self {
            metric: config.space,
            dim,
            m: config.m,
            ef_construction: config.construction_ef,
            ef_search: config.search_ef,
            num_threads: config.num_threads,
        }
    }
}

/// Decoded `header.bin`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexHeader {
    /// Distance metric.
    pub metric: Metric,
    /// Vector dimensionality.
    pub dim: u32,
    /// Graph fan-out the index was built with.
    pub m: u32,
    /// Construction breadth the index was built with.
    pub ef_construction: u32,
    /// Capacity.
    pub max_elements: u64,
    /// Positions ever allocated, deleted ones included.
    pub allocated: u64,
}

impl IndexHeader {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + 4);
        out.extend_from_slice(&HEADER_MAGIC);
        out.extend_from_slice(&HEADER_VERSION.to_le_bytes());
        out.push(self.metric.code());
        out.extend_from_slice(&self.dim.to_le_bytes());
        out.extend_from_slice(&self.m.to_le_bytes());
        out.extend_from_slice(&self.ef_construction.to_le_bytes());
        out.extend_from_slice(&self.max_elements.to_le_bytes());
        out.extend_from_slice(&self.allocated.to_le_bytes());
        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() != HEADER_LEN + 4 {
            return Err(format!(
                "header is {} bytes, expected {}",
                bytes.len(),
                HEADER_LEN + 4
            ));
        }
        let (body, crc) = bytes.split_at(HEADER_LEN);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize().to_le_bytes() != crc {
            return Err("header checksum mismatch".to_string());
        }
        if body[0..4] != HEADER_MAGIC {
            return Err("bad header magic".to_string());
        }
        let version = u16::from_le_bytes([body[4], body[5]]);
        if version != HEADER_VERSION {
            return Err(format!("unsupported header version {version}"));
        }
        let metric =
            Metric::from_code(body[6]).ok_or_else(|| format!("unknown metric code {}", body[6]))?;
        let u32_at = |at: usize| u32::from_le_bytes([body[at], body[at + 1], body[at + 2], body[at + 3]]);
        let u64_at = |at: usize| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&body[at..at + 8]);
            u64::from_le_bytes(buf)
        };
        let header = Self {
            metric,
            dim: u32_at(7),
            m: u32_at(11),
            ef_construction: u32_at(15),
            max_elements: u64_at(19),
            allocated: u64_at(27),
        };
        if header.dim == 0 {
            return Err("dimension is zero".to_string());
        }
        if header.allocated > header.max_elements {
            return Err(format!(
                "{} allocated positions exceed capacity {}",
                header.allocated, header.max_elements
            ));
        }
        Ok(header)
    }
}

/// Owned handle on an open index segment. Dropping it releases every
/// resource; unflushed writes are discarded.
pub trait VectorIndex {
    /// Segment directory.
    fn path(&self) -> &Path;

    /// Parameters the handle was opened with.
    fn params(&self) -> &IndexParams;

    /// Current capacity.
    fn max_elements(&self) -> u64;

    /// Positions neither free nor deleted.
    fn live_count(&self) -> u64;

    /// Positions ever allocated, deleted ones included.
    fn allocated_count(&self) -> u64;

    /// Live positions in ascending order.
    fn live_positions(&self) -> Vec<u64>;

    /// Vectors stored at `positions`, in the same order.
    fn fetch(&self, positions: &[u64]) -> Result<Vec<Vec<f32>>>;

    /// Stores `vectors[i]` at `positions[i]`, replacing any vector already
    /// there and clearing its deleted flag.
    fn insert(&mut self, vectors: &[Vec<f32>], positions: &[u64]) -> Result<()>;

    /// Tombstones a live position.
    fn mark_deleted(&mut self, position: u64) -> Result<()>;

    /// Changes the capacity; it cannot drop below the allocated count.
    fn resize(&mut self, max_elements: u64) -> Result<()>;

    /// Writes pending changes to disk.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and releases the handle.
    fn close(self: Box<Self>) -> Result<()>;

    /// Approximate `k` nearest live positions with their distances.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>>;
}

/// Opens index segments.
pub trait IndexDriver {
    /// Opens the segment in `dir`.
    ///
    /// # Errors
    ///
    /// `IndexOpenFailure` when the files are missing or unreadable, when the
    /// stored dimensionality or metric differs from `params`, or when
    /// `max_elements` is below the allocated count. `IndexCorrupt` when the
    /// files decode but disagree with each other.
    fn open(
        &self,
        dir: &Path,
        mode: OpenMode,
        params: &IndexParams,
        max_elements: u64,
    ) -> Result<Box<dyn VectorIndex>>;

    /// Reads the header of the segment in `dir` without opening it.
    fn describe(&self, dir: &Path) -> Result<IndexHeader>;
}

/// Driver for segments persisted by this crate's `hnsw_rs` backed format.
#[derive(Clone, Copy, Debug, Default)]
pub struct HnswDriver;

impl IndexDriver for HnswDriver {
    fn open(
        &self,
        dir: &Path,
        mode: OpenMode,
        params: &IndexParams,
        max_elements: u64,
    ) -> Result<Box<dyn VectorIndex>> {
        let segment = HnswSegment::open(dir, mode, params, max_elements)?;
        Ok(Box::new(segment))
    }

    fn describe(&self, dir: &Path) -> Result<IndexHeader> {
        read_header(dir)
    }
}

pub(crate) fn read_header(dir: &Path) -> Result<IndexHeader> {
    let path = dir.join(INDEX_HEADER_FILE);
    let bytes = fs::read(&path).map_err(|err| MaintError::index_open(dir, err.to_string()))?;
    IndexHeader::decode(&bytes).map_err(|detail| MaintError::index_open(dir, detail))
}
