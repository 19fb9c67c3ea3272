//! Layout of a store root directory.
//!
//! A store root holds one catalog file and one directory per `VECTOR` segment,
//! named by the segment id. Nothing in here touches the catalog contents.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::{MaintError, Result};

/// File name of the relational catalog inside a store root.
pub const CATALOG_FILE: &str = "catalog.sqlite3";
/// Index header file; its presence marks a directory as a segment directory.
pub const INDEX_HEADER_FILE: &str = "header.bin";
/// Per-position vector slots.
pub const INDEX_DATA_FILE: &str = "data_level0.bin";
/// Base name of the persisted graph; `hnsw_rs` appends `.hnsw.graph` and
/// `.hnsw.data`.
pub const INDEX_GRAPH_BASENAME: &str = "graph";
/// Side-car metadata file.
pub const SIDECAR_FILE: &str = "index_metadata.bin";

/// Validated handle on a store root directory.
#[derive(Clone, Debug)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    /// Validates that `root` is a directory containing a catalog file.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the directory or the catalog file is missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(MaintError::not_found(format!(
                "store directory {} does not exist",
                root.display()
            )));
        }
        let catalog = root.join(CATALOG_FILE);
        if !catalog.is_file() {
            return Err(MaintError::not_found(format!(
                "{} does not appear to be a store directory (missing {CATALOG_FILE})",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Wraps a root without validation. Used when creating a new store.
    pub(crate) fn unchecked(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the catalog file.
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(CATALOG_FILE)
    }

    /// Directory owned by a `VECTOR` segment.
    pub fn segment_dir(&self, segment_id: &str) -> PathBuf {
        self.root.join(segment_id)
    }

    /// Side-car file of a `VECTOR` segment.
    pub fn sidecar_path(&self, segment_id: &str) -> PathBuf {
        self.segment_dir(segment_id).join(SIDECAR_FILE)
    }

    /// Total size in bytes of every regular file below the root.
    pub fn size_bytes(&self) -> Result<u64> {
        dir_size(&self.root)
    }

    /// Size of the catalog file in bytes.
    pub fn catalog_size_bytes(&self) -> Result<u64> {
        Ok(fs::metadata(self.catalog_path())?.len())
    }

    /// Names of the subdirectories that hold an index header, sorted.
    pub fn segment_dir_candidates(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if !entry.path().join(INDEX_HEADER_FILE).is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Sums the sizes of all regular files under `path`. A missing path has size 0.
pub fn dir_size(path: &Path) -> Result<u64> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };
    let mut total = 0u64;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            total += dir_size(&entry.path())?;
        } else if file_type.is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Recursively copies `src` into `dst`, which must not exist yet.
pub fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir(dst)?;
    let mut copied = 0u64;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else if file_type.is_file() {
            copied += fs::copy(entry.path(), &target)?;
        }
    }
    Ok(copied)
}

/// Renders a byte count with binary units, e.g. `1.5MiB`.
pub fn human_bytes(num: u64) -> String {
    let mut value = num as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi"] {
        if value.abs() < 1024.0 {
            return format!("{value:.1}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.1}EiB")
}
