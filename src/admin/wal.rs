use std::collections::HashMap;
use std::io::Write;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use tracing::info;

use crate::admin::options::MaintOptions;
use crate::catalog::{Catalog, CatalogRead, RetentionConfig, WalOperation};
use crate::error::Result;
use crate::store::Store;

/// WAL rows of one topic.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TopicInfo {
    /// Owning collection name, when the topic maps to one.
    pub collection: Option<String>,
    /// Topic.
    pub topic: String,
    /// Row count.
    pub count: u64,
    /// Lowest sequence id present.
    pub first_seq_id: i64,
}

/// Result of [`wal_info`].
#[derive(Clone, Debug, Serialize)]
pub struct WalInfo {
    /// Retention configuration.
    pub retention: RetentionConfig,
    /// Total rows.
    pub total: u64,
    /// Per-topic counts ordered by first sequence id.
    pub topics: Vec<TopicInfo>,
}

/// Summarizes the WAL per topic.
pub fn wal_info(store: &Store, opts: &MaintOptions) -> Result<WalInfo> {
    let catalog = Catalog::open_read_only(store)?;
    let names: HashMap<String, String> = catalog
        .collections()?
        .into_iter()
        .map(|c| (opts.topics.topic(&c.id), c.name))
        .collect();
    let topics: Vec<TopicInfo> = catalog
        .wal_topics()?
        .into_iter()
        .map(|t| TopicInfo {
            collection: names.get(&t.topic).cloned(),
            topic: t.topic,
            count: t.count,
            first_seq_id: t.first_seq_id,
        })
        .collect();
    Ok(WalInfo {
        retention: catalog.retention_config()?,
        total: topics.iter().map(|t| t.count).sum(),
        topics,
    })
}

/// Requested purge behavior of the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Never purge automatically.
    Off,
    /// Purge after every flush.
    Auto,
}

impl PurgeMode {
    fn enabled(self) -> bool {
        matches!(self, PurgeMode::Auto)
    }
}

/// Outcome of [`configure_purge`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PurgeOutcome {
    /// Already in the requested state.
    Unchanged {
        /// Current value.
        automatically_purge: bool,
    },
    /// Declined at the confirmation prompt.
    Cancelled,
    /// Written.
    Applied {
        /// Previous value.
        old: bool,
        /// New value.
        new: bool,
    },
}

/// Switches the `automatically_purge` flag.
pub fn configure_purge(
    store: &Store,
    mode: PurgeMode,
    confirm: impl FnOnce(bool, bool) -> bool,
) -> Result<PurgeOutcome> {
    let mut catalog = Catalog::open(store)?;
    let mut tx = catalog.begin_exclusive()?;
    let current = tx.retention_config()?;
    let wanted = mode.enabled();
    if current.present && current.automatically_purge == wanted {
        return Ok(PurgeOutcome::Unchanged {
            automatically_purge: wanted,
        });
    }
    if !confirm(current.automatically_purge, wanted) {
        return Ok(PurgeOutcome::Cancelled);
    }
    tx.set_automatically_purge(wanted)?;
    tx.commit()?;
    info!(
        old = current.automatically_purge,
        new = wanted,
        "maint.wal.purge_configured"
    );
    Ok(PurgeOutcome::Applied {
        old: current.automatically_purge,
        new: wanted,
    })
}

#[derive(Serialize)]
struct ExportLine<'a> {
    seq_id: i64,
    created_at: &'a str,
    operation: i64,
    operation_name: WalOperation,
    topic: &'a str,
    id: &'a str,
    vector: Option<String>,
    encoding: Option<&'a str>,
    metadata: Option<&'a str>,
}

/// Writes every WAL row, ordered by sequence id, as one JSON object per line.
/// Vectors are base64 encoded. Returns the number of rows written.
pub fn export_wal(store: &Store, out: &mut impl Write) -> Result<u64> {
    let catalog = Catalog::open_read_only(store)?;
    let mut written = 0u64;
    for row in catalog.wal_rows(None, None)? {
        let line = ExportLine {
            seq_id: row.seq_id,
            created_at: &row.created_at,
            operation: row.operation.code(),
            operation_name: row.operation,
            topic: &row.topic,
            id: &row.id,
            vector: row.vector.as_ref().map(|v| STANDARD.encode(v)),
            encoding: row.encoding.as_deref(),
            metadata: row.metadata.as_deref(),
        };
        serde_json::to_writer(&mut *out, &line)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    info!(rows = written, "maint.wal.exported");
    Ok(written)
}
