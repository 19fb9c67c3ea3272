//! Side-car metadata of a vector segment.
//!
//! The side-car maps external record identifiers to index positions and
//! carries the insertion counter. Its absence is a valid state: the host only
//! writes it once enough elements have been flushed.
//!
//! Layout: magic `VSCM`, version `u16`, body, CRC32 of everything before the
//! trailer. All integers are little-endian. Version 1 (legacy) has no durable
//! watermark; version 2 carries one.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crc32fast::Hasher;
use serde::Serialize;

use crate::error::{MaintError, Result};

const MAGIC: [u8; 4] = *b"VSCM";
const VERSION_LEGACY: u16 = 1;
const VERSION_WATERMARKED: u16 = 2;

/// Format variant of a side-car file, fixed once the file is decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "dialect", rename_all = "snake_case")]
pub enum SidecarDialect {
    /// Older format without a durable watermark.
    Legacy,
    /// Current format recording the highest incorporated sequence id.
    Watermarked {
        /// Highest WAL sequence id reflected in the persisted index.
        max_seq_id: i64,
    },
}

impl SidecarDialect {
    /// Whether the file itself records a durable watermark.
    pub fn has_durable_watermark(&self) -> bool {
        matches!(self, SidecarDialect::Watermarked { .. })
    }

    /// The recorded watermark, if any.
    pub fn durable_watermark(&self) -> Option<i64> {
        match self {
            SidecarDialect::Legacy => None,
            SidecarDialect::Watermarked { max_seq_id } => Some(*max_seq_id),
        }
    }

    fn version(&self) -> u16 {
        match self {
            SidecarDialect::Legacy => VERSION_LEGACY,
            SidecarDialect::Watermarked { .. } => VERSION_WATERMARKED,
        }
    }
}

/// Decoded side-car file.
#[derive(Clone, Debug, PartialEq)]
pub struct SidecarMetadata {
    /// Vector dimensionality once known.
    pub dimensionality: Option<u32>,
    /// Number of elements ever added; never decreases.
    pub total_elements_added: u64,
    /// Format variant.
    pub dialect: SidecarDialect,
    /// Live identifier to position.
    pub id_to_label: BTreeMap<String, u64>,
    /// Live position to identifier.
    pub label_to_id: BTreeMap<u64, String>,
    /// Identifier to the sequence id of its last write.
    pub id_to_seq_id: BTreeMap<String, i64>,
}

impl SidecarMetadata {
    /// Empty metadata in the watermarked dialect.
    pub fn new(dimensionality: Option<u32>) -> Self {
        Self {
            dimensionality,
            total_elements_added: 0,
            dialect: SidecarDialect::Watermarked { max_seq_id: 0 },
            id_to_label: BTreeMap::new(),
            label_to_id: BTreeMap::new(),
            id_to_seq_id: BTreeMap::new(),
        }
    }

    /// Loads the side-car at `path`; a missing file yields `None`.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Self::decode(&bytes)
            .map(Some)
            .map_err(|detail| MaintError::sidecar_corrupt(path, detail))
    }

    /// Writes the side-car atomically (temporary file + rename).
    pub fn store(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, self.encode())?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Number of live elements.
    pub fn live_count(&self) -> u64 {
        self.id_to_label.len() as u64
    }

    /// Live positions in ascending order.
    pub fn live_positions(&self) -> Vec<u64> {
        self.label_to_id.keys().copied().collect()
    }

    /// Fragmentation estimated from the insertion counter alone.
    pub fn estimated_fragmentation(&self) -> f64 {
        fragmentation(self.total_elements_added, self.live_count())
    }

    /// Records `id` at `label`, replacing any previous position of `id`.
    pub fn insert(&mut self, id: &str, label: u64, seq_id: i64) {
        if let Some(previous) = self.id_to_label.insert(id.to_string(), label) {
            if previous != label {
                self.label_to_id.remove(&previous);
            }
        }
        self.label_to_id.insert(label, id.to_string());
        self.id_to_seq_id.insert(id.to_string(), seq_id);
    }

    /// Forgets `id`, returning the position it occupied.
    pub fn remove(&mut self, id: &str) -> Option<u64> {
        let label = self.id_to_label.remove(id)?;
        self.label_to_id.remove(&label);
        self.id_to_seq_id.remove(id);
        Some(label)
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64 + self.id_to_label.len() * 48);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&self.dialect.version().to_le_bytes());
        match self.dimensionality {
            Some(dim) => {
                out.push(1);
                out.extend_from_slice(&dim.to_le_bytes());
            }
            None => {
                out.push(0);
                out.extend_from_slice(&0u32.to_le_bytes());
            }
        }
        out.extend_from_slice(&self.total_elements_added.to_le_bytes());
        if let SidecarDialect::Watermarked { max_seq_id } = self.dialect {
            out.extend_from_slice(&max_seq_id.to_le_bytes());
        }
        out.extend_from_slice(&(self.id_to_label.len() as u32).to_le_bytes());
        for (id, label) in &self.id_to_label {
            put_str(&mut out, id);
            out.extend_from_slice(&label.to_le_bytes());
        }
        out.extend_from_slice(&(self.id_to_seq_id.len() as u32).to_le_bytes());
        for (id, seq_id) in &self.id_to_seq_id {
            put_str(&mut out, id);
            out.extend_from_slice(&seq_id.to_le_bytes());
        }
        let mut hasher = Hasher::new();
        hasher.update(&out);
        out.extend_from_slice(&hasher.finalize().to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        if bytes.len() < MAGIC.len() + 2 + 4 {
            return Err(format!("file too short ({} bytes)", bytes.len()));
        }
        let (body, trailer) = bytes.split_at(bytes.len() - 4);
        let mut hasher = Hasher::new();
        hasher.update(body);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if hasher.finalize() != expected {
            return Err("checksum mismatch".to_string());
        }
        let mut r = Reader::new(body);
        if r.take(4)? != MAGIC {
            return Err("bad magic".to_string());
        }
        let version = r.u16()?;
        let has_dim = r.u8()? != 0;
        let dim = r.u32()?;
        let total_elements_added = r.u64()?;
        let dialect = match version {
            VERSION_LEGACY => SidecarDialect::Legacy,
            VERSION_WATERMARKED => SidecarDialect::Watermarked {
                max_seq_id: r.i64()?,
            },
            other => return Err(format!("unsupported version {other}")),
        };
        let mut id_to_label = BTreeMap::new();
        let mut label_to_id = BTreeMap::new();
        for _ in 0..r.u32()? {
            let id = r.string()?;
            let label = r.u64()?;
            if label_to_id.insert(label, id.clone()).is_some() {
                return Err(format!("position {label} mapped twice"));
            }
            id_to_label.insert(id, label);
        }
        let mut id_to_seq_id = BTreeMap::new();
        for _ in 0..r.u32()? {
            let id = r.string()?;
            id_to_seq_id.insert(id, r.i64()?);
        }
        if !r.is_empty() {
            return Err("trailing bytes after body".to_string());
        }
        if (id_to_label.len() as u64) > total_elements_added {
            return Err(format!(
                "{} live elements exceed {} elements ever added",
                id_to_label.len(),
                total_elements_added
            ));
        }
        Ok(Self {
            dimensionality: has_dim.then_some(dim),
            total_elements_added,
            dialect,
            id_to_label,
            label_to_id,
            id_to_seq_id,
        })
    }
}

/// `(allocated - live) / allocated`, or 0 for an empty denominator.
pub fn fragmentation(allocated: u64, live: u64) -> f64 {
    if allocated == 0 {
        return 0.0;
    }
    allocated.saturating_sub(live) as f64 / allocated as f64
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> std::result::Result<u8, String> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> std::result::Result<i64, String> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| "identifier is not utf-8".to_string())
    }
}
