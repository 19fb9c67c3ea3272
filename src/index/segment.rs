use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use hnsw_rs::prelude::{AnnT, DistCosine, DistDot, DistL2, Hnsw, HnswIo};
use serde::Serialize;
use tracing::{debug, warn};

use super::{read_header, IndexHeader, IndexParams, OpenMode, VectorIndex};
use crate::config::Metric;
use crate::error::{MaintError, Result};
use crate::store::{INDEX_DATA_FILE, INDEX_GRAPH_BASENAME};

const MAX_LAYER: usize = 16;
const MAX_CONNECTIONS: usize = 256;
const DIST_DOT_SHRINK: f32 = 0.999_999;
const FLAG_DELETED: u8 = 0b1;

#[derive(Clone, Debug)]
struct Slot {
    deleted: bool,
    vector: Vec<f32>,
}

enum Graph<'b> {
    L2(Hnsw<'b, f32, DistL2>),
    Cosine(Hnsw<'b, f32, DistCosine>),
    Dot(Hnsw<'b, f32, DistDot>),
}

impl Graph<'_> {
    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u64, f32)> {
        let neighbours = match self {
            Graph::L2(h) => h.search(query, k, ef),
            Graph::Cosine(h) => h.search(query, k, ef),
            Graph::Dot(h) => h.search(&normalize(query.to_vec()), k, ef),
        };
        neighbours
            .into_iter()
            .map(|n| (n.d_id as u64, n.distance))
            .collect()
    }

    fn dump(&self, dir: &Path) -> Result<()> {
        let dumped = match self {
            Graph::L2(h) => h.file_dump(dir, INDEX_GRAPH_BASENAME),
            Graph::Cosine(h) => h.file_dump(dir, INDEX_GRAPH_BASENAME),
            Graph::Dot(h) => h.file_dump(dir, INDEX_GRAPH_BASENAME),
        };
        dumped.map(|_| ()).map_err(|err| {
            MaintError::Message(format!("cannot write graph in {}: {err}", dir.display()))
        })
    }

    fn summary(&self) -> GraphSummary {
        let (points, max_connections, ef_construction) = match self {
            Graph::L2(h) => (h.get_nb_point(), h.get_max_nb_connection(), h.get_ef_construction()),
            Graph::Cosine(h) => (h.get_nb_point(), h.get_max_nb_connection(), h.get_ef_construction()),
            Graph::Dot(h) => (h.get_nb_point(), h.get_max_nb_connection(), h.get_ef_construction()),
        };
        GraphSummary {
            points: points as u64,
            max_connections: u32::from(max_connections),
            ef_construction: ef_construction as u32,
        }
    }
}

/// Shape of a persisted graph dump.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    /// Points indexed by the graph.
    pub points: u64,
    /// Links kept per point and layer.
    pub max_connections: u32,
    /// Construction breadth the graph was built with.
    pub ef_construction: u32,
}

/// Reads the graph dump in `dir`, or `None` when the segment has never
/// persisted one (an empty index has none).
pub fn stored_graph(dir: &Path) -> Result<Option<GraphSummary>> {
    let header = read_header(dir)?;
    if !graph_files_exist(dir) {
        return Ok(None);
    }
    let mut io = HnswIo::new(dir, INDEX_GRAPH_BASENAME);
    let graph = load_graph(&mut io, dir, header.metric)?;
    Ok(Some(graph.summary()))
}

fn graph_paths(dir: &Path) -> [PathBuf; 2] {
    [
        dir.join(format!("{INDEX_GRAPH_BASENAME}.hnsw.graph")),
        dir.join(format!("{INDEX_GRAPH_BASENAME}.hnsw.data")),
    ]
}

fn graph_files_exist(dir: &Path) -> bool {
    graph_paths(dir).iter().all(|path| path.is_file())
}

fn load_graph<'a>(io: &'a mut HnswIo, dir: &Path, metric: Metric) -> Result<Graph<'a>> {
    let loaded = match metric {
        Metric::L2 => io.load_hnsw::<f32, DistL2>().map(Graph::L2),
        Metric::Cosine => io.load_hnsw::<f32, DistCosine>().map(Graph::Cosine),
        Metric::Ip => io.load_hnsw::<f32, DistDot>().map(Graph::Dot),
    };
    loaded.map_err(|err| MaintError::index_corrupt(dir, format!("graph dump: {err}")))
}

/// Persisted segment opened by the shipped driver.
///
/// Vectors live in memory keyed by position. Every flush rebuilds the graph
/// from the live slots under the handle's `M` and `ef_construction` and dumps
/// it next to the slot file. Searches on an unmodified handle read that dump;
/// after a mutation they use a graph built in memory.
pub struct HnswSegment {
    dir: PathBuf,
    params: IndexParams,
    mode: OpenMode,
    max_elements: u64,
    slots: BTreeMap<u64, Slot>,
    dirty: bool,
    graph: OnceCell<Graph<'static>>,
}

impl HnswSegment {
    /// Opens the segment in `dir`. See [`super::IndexDriver::open`].
    pub fn open(dir: &Path, mode: OpenMode, params: &IndexParams, max_elements: u64) -> Result<Self> {
        if params.dim == 0 {
            return Err(MaintError::index_open(dir, "dimension must be positive"));
        }
        if !dir.is_dir() {
            return Err(MaintError::index_open(dir, "segment directory does not exist"));
        }
        let mut segment = Self {
            dir: dir.to_path_buf(),
            params: params.clone(),
            mode,
            max_elements,
            slots: BTreeMap::new(),
            dirty: mode == OpenMode::Create,
            graph: OnceCell::new(),
        };
        if mode == OpenMode::Create {
            debug!(path = %dir.display(), max_elements, "maint.index.created");
            return Ok(segment);
        }

        let header = read_header(dir)?;
        if header.dim != params.dim {
            return Err(MaintError::index_open(
                dir,
                format!("dimension mismatch: stored {}, requested {}", header.dim, params.dim),
            ));
        }
        if header.metric != params.metric {
            return Err(MaintError::index_open(
                dir,
                format!(
                    "metric mismatch: stored {}, requested {}",
                    header.metric, params.metric
                ),
            ));
        }
        if max_elements < header.allocated {
            return Err(MaintError::index_open(
                dir,
                format!(
                    "capacity {max_elements} is below the {} allocated positions",
                    header.allocated
                ),
            ));
        }
        segment.slots = read_slots(dir, &header)?;
        debug!(
            path = %dir.display(),
            allocated = header.allocated,
            live = segment.live_count(),
            "maint.index.opened"
        );
        Ok(segment)
    }

    fn header(&self) -> IndexHeader {
        IndexHeader {
            metric: self.params.metric,
            dim: self.params.dim,
            m: self.params.m as u32,
            ef_construction: self.params.ef_construction as u32,
            max_elements: self.max_elements,
            allocated: self.slots.len() as u64,
        }
    }

    fn ensure_writable(&self, op: &str) -> Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(MaintError::Message(format!(
                "cannot {op} index at {} opened read-only",
                self.dir.display()
            )));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.dirty = true;
        self.graph = OnceCell::new();
    }

    fn build_graph(&self) -> Graph<'static> {
        let live: Vec<(Vec<f32>, usize)> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.deleted)
            .map(|(position, slot)| {
                let vector = match self.params.metric {
                    Metric::Ip => normalize(slot.vector.clone()),
                    Metric::L2 | Metric::Cosine => slot.vector.clone(),
                };
                (vector, *position as usize)
            })
            .collect();
        let capacity = live.len().max(1);
        let m = self.params.m.clamp(1, MAX_CONNECTIONS);
        let ef_c = self.params.ef_construction.max(1);
        let refs: Vec<(&Vec<f32>, usize)> = live.iter().map(|(v, id)| (v, *id)).collect();
        let parallel = self.params.num_threads > 1;
        macro_rules! build {
            ($dist:expr, $variant:path) => {{
                let mut hnsw = Hnsw::new(m, capacity, MAX_LAYER, ef_c, $dist);
                if parallel {
                    hnsw.parallel_insert(&refs);
                    hnsw.set_searching_mode(true);
                } else {
                    for (vector, id) in &refs {
                        hnsw.insert_slice((vector.as_slice(), *id));
                    }
                }
                $variant(hnsw)
            }};
        }
        match self.params.metric {
            Metric::L2 => build!(DistL2, Graph::L2),
            Metric::Cosine => build!(DistCosine, Graph::Cosine),
            Metric::Ip => build!(DistDot, Graph::Dot),
        }
    }

    fn write_graph(&mut self) -> Result<()> {
        if self.live_count() == 0 {
            for path in graph_paths(&self.dir) {
                match fs::remove_file(&path) {
                    Err(err) if err.kind() != ErrorKind::NotFound => return Err(err.into()),
                    _ => {}
                }
            }
            return Ok(());
        }
        let graph = match self.graph.take() {
            Some(graph) => graph,
            None => self.build_graph(),
        };
        graph.dump(&self.dir)?;
        self.graph = OnceCell::from(graph);
        Ok(())
    }
}

impl VectorIndex for HnswSegment {
    fn path(&self) -> &Path {
        &self.dir
    }

    fn params(&self) -> &IndexParams {
        &self.params
    }

    fn max_elements(&self) -> u64 {
        self.max_elements
    }

    fn live_count(&self) -> u64 {
        self.slots.values().filter(|slot| !slot.deleted).count() as u64
    }

    fn allocated_count(&self) -> u64 {
        self.slots.len() as u64
    }

    fn live_positions(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.deleted)
            .map(|(position, _)| *position)
            .collect()
    }

    fn fetch(&self, positions: &[u64]) -> Result<Vec<Vec<f32>>> {
        positions
            .iter()
            .map(|position| match self.slots.get(position) {
                Some(slot) if !slot.deleted => Ok(slot.vector.clone()),
                _ => Err(MaintError::index_corrupt(
                    &self.dir,
                    format!("position {position} is not live"),
                )),
            })
            .collect()
    }

    fn insert(&mut self, vectors: &[Vec<f32>], positions: &[u64]) -> Result<()> {
        self.ensure_writable("insert into")?;
        if vectors.len() != positions.len() {
            return Err(MaintError::Message(format!(
                "{} vectors for {} positions",
                vectors.len(),
                positions.len()
            )));
        }
        let dim = self.params.dim as usize;
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(MaintError::Message(format!(
                "vector of {} values does not match dimension {dim}",
                bad.len()
            )));
        }
        let fresh = positions
            .iter()
            .filter(|p| !self.slots.contains_key(p))
            .count() as u64;
        if self.allocated_count() + fresh > self.max_elements {
            return Err(MaintError::Message(format!(
                "index at {} is full: {} allocated, {fresh} new, capacity {}",
                self.dir.display(),
                self.allocated_count(),
                self.max_elements
            )));
        }
        for (vector, position) in vectors.iter().zip(positions) {
            self.slots.insert(
                *position,
                Slot {
                    deleted: false,
                    vector: vector.clone(),
                },
            );
        }
        self.touch();
        Ok(())
    }

    fn mark_deleted(&mut self, position: u64) -> Result<()> {
        self.ensure_writable("delete from")?;
        match self.slots.get_mut(&position) {
            Some(slot) if !slot.deleted => {
                slot.deleted = true;
            }
            _ => {
                return Err(MaintError::Message(format!(
                    "position {position} is not live in {}",
                    self.dir.display()
                )))
            }
        }
        self.touch();
        Ok(())
    }

    fn resize(&mut self, max_elements: u64) -> Result<()> {
        self.ensure_writable("resize")?;
        if max_elements < self.allocated_count() {
            return Err(MaintError::Message(format!(
                "cannot shrink capacity to {max_elements} below {} allocated positions",
                self.allocated_count()
            )));
        }
        self.max_elements = max_elements;
        self.dirty = true;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.ensure_writable("flush")?;
        let header = self.header();
        write_slots(&self.dir, &header, &self.slots)?;
        fs::write(self.dir.join(crate::store::INDEX_HEADER_FILE), header.encode())?;
        self.write_graph()?;
        self.dirty = false;
        debug!(
            path = %self.dir.display(),
            allocated = header.allocated,
            max_elements = header.max_elements,
            "maint.index.flushed"
        );
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.flush()
    }

    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        if query.len() != self.params.dim as usize {
            return Err(MaintError::Message(format!(
                "query of {} values does not match dimension {}",
                query.len(),
                self.params.dim
            )));
        }
        let live = self.live_count() as usize;
        if k == 0 || live == 0 {
            return Ok(Vec::new());
        }
        let k = k.min(live);
        let ef = self.params.ef_search.max(k);
        if self.graph.get().is_none() && !self.dirty && graph_files_exist(&self.dir) {
            let mut io = HnswIo::new(&self.dir, INDEX_GRAPH_BASENAME);
            let stored = load_graph(&mut io, &self.dir, self.params.metric)?;
            return Ok(stored.search(query, k, ef));
        }
        let graph = self.graph.get_or_init(|| self.build_graph());
        Ok(graph.search(query, k, ef))
    }
}

impl Drop for HnswSegment {
    fn drop(&mut self) {
        if self.dirty && self.mode != OpenMode::ReadOnly {
            warn!(path = %self.dir.display(), "maint.index.dropped_unflushed");
        }
    }
}

fn slot_len(dim: u32) -> usize {
    8 + 1 + 4 * dim as usize
}

fn read_slots(dir: &Path, header: &IndexHeader) -> Result<BTreeMap<u64, Slot>> {
    let path = dir.join(INDEX_DATA_FILE);
    let bytes = fs::read(&path).map_err(|err| MaintError::index_open(dir, err.to_string()))?;
    let len = slot_len(header.dim);
    let expected = len as u64 * header.allocated;
    if bytes.len() as u64 != expected {
        return Err(MaintError::index_corrupt(
            dir,
            format!(
                "{INDEX_DATA_FILE} is {} bytes, header implies {expected}",
                bytes.len()
            ),
        ));
    }
    let mut slots = BTreeMap::new();
    for chunk in bytes.chunks_exact(len) {
        let mut pos = [0u8; 8];
        pos.copy_from_slice(&chunk[..8]);
        let position = u64::from_le_bytes(pos);
        let deleted = chunk[8] & FLAG_DELETED != 0;
        let vector = chunk[9..]
            .chunks_exact(4)
            .map(|v| f32::from_le_bytes([v[0], v[1], v[2], v[3]]))
            .collect();
        if slots.insert(position, Slot { deleted, vector }).is_some() {
            return Err(MaintError::index_corrupt(
                dir,
                format!("position {position} stored twice"),
            ));
        }
    }
    Ok(slots)
}

fn write_slots(dir: &Path, header: &IndexHeader, slots: &BTreeMap<u64, Slot>) -> Result<()> {
    let mut out = Vec::with_capacity(slot_len(header.dim) * slots.len());
    for (position, slot) in slots {
        out.extend_from_slice(&position.to_le_bytes());
        out.push(if slot.deleted { FLAG_DELETED } else { 0 });
        for value in &slot.vector {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    let tmp = dir.join(format!("{INDEX_DATA_FILE}.tmp"));
    fs::write(&tmp, out)?;
    fs::rename(&tmp, dir.join(INDEX_DATA_FILE))?;
    Ok(())
}

fn normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm > 0.0 {
        let inv_norm = DIST_DOT_SHRINK / norm;
        for value in &mut vector {
            *value *= inv_norm;
        }
    }
    vector
}
