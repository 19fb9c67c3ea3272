use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sysinfo::Disks;

use crate::catalog::DEFAULT_DATABASE;
use crate::error::{MaintError, Result};
use crate::index::{HnswDriver, IndexDriver};

pub use crate::config::DEFAULT_BATCH_SIZE;

/// Builds the WAL topic of a collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicScheme {
    /// Tenant segment of the topic.
    pub tenant: String,
    /// Namespace segment of the topic.
    pub namespace: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            tenant: "default".to_string(),
            namespace: "default".to_string(),
        }
    }
}

impl TopicScheme {
    /// `persistent://<tenant>/<namespace>/<collection id>`.
    pub fn topic(&self, collection_id: &str) -> String {
        format!(
            "persistent://{}/{}/{collection_id}",
            self.tenant, self.namespace
        )
    }
}

/// Reports free space on the filesystem holding a path.
pub trait SpaceProbe {
    /// Bytes available to an unprivileged writer below `path`.
    fn available_bytes(&self, path: &Path) -> Result<u64>;
}

/// Probe backed by the operating system's disk list.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemSpace;

impl SpaceProbe for SystemSpace {
    fn available_bytes(&self, path: &Path) -> Result<u64> {
        let canonical = path.canonicalize()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| canonical.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| {
                MaintError::Message(format!(
                    "no mounted filesystem found for {}",
                    canonical.display()
                ))
            })
    }
}

/// Probe reporting a fixed amount of free space.
#[derive(Clone, Copy, Debug)]
pub struct FixedSpace(pub u64);

impl SpaceProbe for FixedSpace {
    fn available_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.0)
    }
}

/// Collaborators shared by every maintenance operation.
#[derive(Clone)]
pub struct MaintOptions {
    /// Index driver used to open segments.
    pub driver: Arc<dyn IndexDriver>,
    /// WAL topic naming.
    pub topics: TopicScheme,
    /// Free-space source used by the rebuild preflight.
    pub space: Arc<dyn SpaceProbe>,
}

impl Default for MaintOptions {
    fn default() -> Self {
        Self {
            driver: Arc::new(HnswDriver),
            topics: TopicScheme::default(),
            space: Arc::new(SystemSpace),
        }
    }
}

impl fmt::Debug for MaintOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaintOptions")
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

impl MaintOptions {
    /// Replaces the index driver.
    pub fn with_driver(mut self, driver: Arc<dyn IndexDriver>) -> Self {
        self.driver = driver;
        self
    }

    /// Replaces the free-space source.
    pub fn with_space(mut self, space: Arc<dyn SpaceProbe>) -> Self {
        self.space = space;
        self
    }
}

/// Names a collection within a database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionRef {
    /// Collection name.
    pub name: String,
    /// Database name.
    pub database: String,
}

impl CollectionRef {
    /// Collection in the default database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    /// Sets the database qualifier.
    pub fn in_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }
}

pub(crate) fn staging_root(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(std::env::temp_dir)
}
