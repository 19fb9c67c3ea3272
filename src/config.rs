//! Index configuration keys, defaults, resolution and diffs.
//!
//! Each vector segment is configured by eight keys. A key resolves to the
//! segment's own metadata row when present, then to the collection's JSON
//! configuration, then to the documented default.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MaintError, Result};

/// Default distance metric.
pub const DEFAULT_SPACE: Metric = Metric::L2;
/// Default graph fan-out.
pub const DEFAULT_M: usize = 16;
/// Default construction breadth.
pub const DEFAULT_CONSTRUCTION_EF: usize = 100;
/// Default search breadth.
pub const DEFAULT_SEARCH_EF: usize = 10;
/// Default insert/copy batch size.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default number of WAL rows the host buffers before persisting the index.
pub const DEFAULT_SYNC_THRESHOLD: usize = 1000;
/// Default capacity growth factor.
pub const DEFAULT_RESIZE_FACTOR: f64 = 1.2;

/// Default thread count: the available parallelism of this machine.
pub fn default_num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Distance metric of an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Squared euclidean distance.
    L2,
    /// Cosine distance.
    Cosine,
    /// Inner product distance (`1 - dot`).
    Ip,
}

impl Metric {
    /// Catalog spelling of the metric.
    pub fn as_str(self) -> &'static str {
        match self {
            Metric::L2 => "l2",
            Metric::Cosine => "cosine",
            Metric::Ip => "ip",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Metric::L2 => 0,
            Metric::Cosine => 1,
            Metric::Ip => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Metric::L2),
            1 => Some(Metric::Cosine),
            2 => Some(Metric::Ip),
            _ => None,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = MaintError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l2" => Ok(Metric::L2),
            "cosine" => Ok(Metric::Cosine),
            "ip" => Ok(Metric::Ip),
            other => Err(MaintError::InvalidConfig(format!(
                "unknown distance metric '{other}' (expected l2, cosine or ip)"
            ))),
        }
    }
}

/// One of the eight configuration keys of a vector segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKey {
    /// Distance metric.
    Space,
    /// Graph fan-out.
    M,
    /// Construction breadth.
    ConstructionEf,
    /// Search breadth.
    SearchEf,
    /// Thread count.
    NumThreads,
    /// Capacity growth factor.
    ResizeFactor,
    /// Batch size.
    BatchSize,
    /// Sync threshold.
    SyncThreshold,
}

impl ConfigKey {
    /// All keys in report order.
    pub const ALL: [ConfigKey; 8] = [
        ConfigKey::Space,
        ConfigKey::M,
        ConfigKey::ConstructionEf,
        ConfigKey::SearchEf,
        ConfigKey::NumThreads,
        ConfigKey::ResizeFactor,
        ConfigKey::BatchSize,
        ConfigKey::SyncThreshold,
    ];

    /// Key of the `segment_metadata` row.
    pub fn metadata_key(self) -> &'static str {
        match self {
            ConfigKey::Space => "hnsw:space",
            ConfigKey::M => "hnsw:M",
            ConfigKey::ConstructionEf => "hnsw:construction_ef",
            ConfigKey::SearchEf => "hnsw:search_ef",
            ConfigKey::NumThreads => "hnsw:num_threads",
            ConfigKey::ResizeFactor => "hnsw:resize_factor",
            ConfigKey::BatchSize => "hnsw:batch_size",
            ConfigKey::SyncThreshold => "hnsw:sync_threshold",
        }
    }

    /// Field name inside the collection's `hnsw_configuration` JSON object.
    pub fn json_field(self) -> &'static str {
        match self {
            ConfigKey::Space => "space",
            ConfigKey::M => "M",
            ConfigKey::ConstructionEf => "ef_construction",
            ConfigKey::SearchEf => "ef_search",
            ConfigKey::NumThreads => "num_threads",
            ConfigKey::ResizeFactor => "resize_factor",
            ConfigKey::BatchSize => "batch_size",
            ConfigKey::SyncThreshold => "sync_threshold",
        }
    }

    /// Whether the key can change without rebuilding the on-disk graph.
    pub fn is_runtime_mutable(self) -> bool {
        !matches!(
            self,
            ConfigKey::Space | ConfigKey::M | ConfigKey::ConstructionEf
        )
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.metadata_key())
    }
}

/// Typed value of a configuration row.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    /// `str_value` column.
    Str(String),
    /// `int_value` column.
    Int(i64),
    /// `float_value` column.
    Float(f64),
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Str(value) => f.write_str(value),
            ConfigValue::Int(value) => write!(f, "{value}"),
            ConfigValue::Float(value) => write!(f, "{value}"),
        }
    }
}

/// Where a resolved value came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    /// A `segment_metadata` row.
    Segment,
    /// The collection's JSON configuration.
    Collection,
    /// The built-in default.
    Default,
}

/// Fully resolved index configuration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct IndexConfig {
    /// Distance metric.
    pub space: Metric,
    /// Graph fan-out.
    pub m: usize,
    /// Construction breadth.
    pub construction_ef: usize,
    /// Search breadth.
    pub search_ef: usize,
    /// Thread count.
    pub num_threads: usize,
    /// Capacity growth factor.
    pub resize_factor: f64,
    /// Batch size.
    pub batch_size: usize,
    /// Sync threshold.
    pub sync_threshold: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            space: DEFAULT_SPACE,
            m: DEFAULT_M,
            construction_ef: DEFAULT_CONSTRUCTION_EF,
            search_ef: DEFAULT_SEARCH_EF,
            num_threads: default_num_threads(),
            resize_factor: DEFAULT_RESIZE_FACTOR,
            batch_size: DEFAULT_BATCH_SIZE,
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
        }
    }
}

impl IndexConfig {
    /// Current value of `key`.
    pub fn value(&self, key: ConfigKey) -> ConfigValue {
        match key {
            ConfigKey::Space => ConfigValue::Str(self.space.as_str().to_string()),
            ConfigKey::M => ConfigValue::Int(self.m as i64),
            ConfigKey::ConstructionEf => ConfigValue::Int(self.construction_ef as i64),
            ConfigKey::SearchEf => ConfigValue::Int(self.search_ef as i64),
            ConfigKey::NumThreads => ConfigValue::Int(self.num_threads as i64),
            ConfigKey::ResizeFactor => ConfigValue::Float(self.resize_factor),
            ConfigKey::BatchSize => ConfigValue::Int(self.batch_size as i64),
            ConfigKey::SyncThreshold => ConfigValue::Int(self.sync_threshold as i64),
        }
    }

    /// Sets `key` from a typed value, validating its type and range.
    pub fn set(&mut self, key: ConfigKey, value: &ConfigValue) -> Result<()> {
        match key {
            ConfigKey::Space => match value {
                ConfigValue::Str(raw) => self.space = raw.parse()?,
                other => return Err(type_mismatch(key, other)),
            },
            ConfigKey::ResizeFactor => {
                self.resize_factor = match value {
                    ConfigValue::Float(v) => *v,
                    ConfigValue::Int(v) => *v as f64,
                    other => return Err(type_mismatch(key, other)),
                }
            }
            _ => {
                let raw = match value {
                    ConfigValue::Int(v) => *v,
                    ConfigValue::Float(v) if v.fract() == 0.0 => *v as i64,
                    other => return Err(type_mismatch(key, other)),
                };
                let slot = self.int_slot(key);
                *slot = positive(key, raw)?;
            }
        }
        Ok(())
    }

    fn int_slot(&mut self, key: ConfigKey) -> &mut usize {
        match key {
            ConfigKey::M => &mut self.m,
            ConfigKey::ConstructionEf => &mut self.construction_ef,
            ConfigKey::SearchEf => &mut self.search_ef,
            ConfigKey::NumThreads => &mut self.num_threads,
            ConfigKey::BatchSize => &mut self.batch_size,
            ConfigKey::SyncThreshold => &mut self.sync_threshold,
            ConfigKey::Space | ConfigKey::ResizeFactor => {
                unreachable!("non-integer key {key:?} routed to integer slot")
            }
        }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if !self.resize_factor.is_finite() || self.resize_factor < 1.0 {
            return Err(MaintError::InvalidConfig(format!(
                "hnsw:resize_factor must be a finite value >= 1.0, got {}",
                self.resize_factor
            )));
        }
        if self.batch_size > self.sync_threshold {
            return Err(MaintError::InvalidConfig(format!(
                "hnsw:batch_size ({}) must not exceed hnsw:sync_threshold ({})",
                self.batch_size, self.sync_threshold
            )));
        }
        Ok(())
    }
}

fn positive(key: ConfigKey, raw: i64) -> Result<usize> {
    if raw < 1 {
        return Err(MaintError::InvalidConfig(format!(
            "{key} must be >= 1, got {raw}"
        )));
    }
    usize::try_from(raw).map_err(|_| MaintError::InvalidConfig(format!("{key} out of range")))
}

fn type_mismatch(key: ConfigKey, value: &ConfigValue) -> MaintError {
    MaintError::InvalidConfig(format!("{key} cannot take value '{value}'"))
}

/// Resolved configuration together with the source of each key.
#[derive(Clone, Debug, Serialize)]
pub struct ResolvedConfig {
    /// Effective values.
    pub config: IndexConfig,
    /// Source of each key.
    pub sources: HashMap<ConfigKey, ConfigSource>,
}

impl ResolvedConfig {
    /// Resolves each key: segment row, then collection JSON, then default.
    ///
    /// `collection_json` is the raw `config_json_str` column; unparsable JSON
    /// is treated as absent.
    pub fn resolve(
        segment_rows: &HashMap<String, ConfigValue>,
        collection_json: Option<&str>,
    ) -> Result<Self> {
        let hnsw = collection_json
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| value.get("hnsw_configuration").cloned());
        let mut config = IndexConfig::default();
        let mut sources = HashMap::new();
        for key in ConfigKey::ALL {
            if let Some(value) = segment_rows.get(key.metadata_key()) {
                config.set(key, value)?;
                sources.insert(key, ConfigSource::Segment);
                continue;
            }
            let json_value = hnsw
                .as_ref()
                .and_then(|obj| obj.get(key.json_field()))
                .and_then(json_to_config_value);
            if let Some(value) = json_value {
                config.set(key, &value)?;
                sources.insert(key, ConfigSource::Collection);
                continue;
            }
            sources.insert(key, ConfigSource::Default);
        }
        Ok(Self { config, sources })
    }

    /// Source of `key`.
    pub fn source(&self, key: ConfigKey) -> ConfigSource {
        self.sources
            .get(&key)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }
}

fn json_to_config_value(value: &Value) -> Option<ConfigValue> {
    match value {
        Value::String(s) => Some(ConfigValue::Str(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .map(ConfigValue::Int)
            .or_else(|| n.as_f64().map(ConfigValue::Float)),
        _ => None,
    }
}

/// Requested configuration values; `None` keeps the current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConfigOverrides {
    /// Distance metric.
    pub space: Option<Metric>,
    /// Graph fan-out.
    pub m: Option<usize>,
    /// Construction breadth.
    pub construction_ef: Option<usize>,
    /// Search breadth.
    pub search_ef: Option<usize>,
    /// Thread count.
    pub num_threads: Option<usize>,
    /// Capacity growth factor.
    pub resize_factor: Option<f64>,
    /// Batch size.
    pub batch_size: Option<usize>,
    /// Sync threshold.
    pub sync_threshold: Option<usize>,
}

impl ConfigOverrides {
    /// Whether no key is requested.
    pub fn is_empty(&self) -> bool {
        self.requested().is_empty()
    }

    /// Requested keys with their typed values.
    pub fn requested(&self) -> Vec<(ConfigKey, ConfigValue)> {
        let mut out = Vec::new();
        if let Some(v) = self.space {
            out.push((ConfigKey::Space, ConfigValue::Str(v.as_str().to_string())));
        }
        let ints = [
            (ConfigKey::M, self.m),
            (ConfigKey::ConstructionEf, self.construction_ef),
            (ConfigKey::SearchEf, self.search_ef),
            (ConfigKey::NumThreads, self.num_threads),
        ];
        for (key, value) in ints {
            if let Some(v) = value {
                out.push((key, ConfigValue::Int(v as i64)));
            }
        }
        if let Some(v) = self.resize_factor {
            out.push((ConfigKey::ResizeFactor, ConfigValue::Float(v)));
        }
        if let Some(v) = self.batch_size {
            out.push((ConfigKey::BatchSize, ConfigValue::Int(v as i64)));
        }
        if let Some(v) = self.sync_threshold {
            out.push((ConfigKey::SyncThreshold, ConfigValue::Int(v as i64)));
        }
        out
    }

    /// Applies the overrides to `current`, returning the new configuration and
    /// the keys whose value actually changes. Values equal to the current ones
    /// produce no change entry.
    pub fn apply(&self, current: &IndexConfig) -> Result<(IndexConfig, Vec<ConfigChange>)> {
        let mut next = current.clone();
        let mut changes = Vec::new();
        for (key, value) in self.requested() {
            let old = current.value(key);
            next.set(key, &value)?;
            let new = next.value(key);
            if old != new {
                changes.push(ConfigChange { key, old, new });
            }
        }
        next.validate()?;
        Ok((next, changes))
    }
}

/// Overrides restricted to keys that do not affect the on-disk graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RuntimeOverrides {
    /// Search breadth.
    pub search_ef: Option<usize>,
    /// Thread count.
    pub num_threads: Option<usize>,
    /// Capacity growth factor.
    pub resize_factor: Option<f64>,
    /// Batch size.
    pub batch_size: Option<usize>,
    /// Sync threshold.
    pub sync_threshold: Option<usize>,
}

impl From<RuntimeOverrides> for ConfigOverrides {
    fn from(value: RuntimeOverrides) -> Self {
        ConfigOverrides {
            search_ef: value.search_ef,
            num_threads: value.num_threads,
            resize_factor: value.resize_factor,
            batch_size: value.batch_size,
            sync_threshold: value.sync_threshold,
            ..ConfigOverrides::default()
        }
    }
}

/// A single key moving from one value to another.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigChange {
    /// Key being changed.
    pub key: ConfigKey,
    /// Current value.
    pub old: ConfigValue,
    /// Requested value.
    pub new: ConfigValue,
}

impl ConfigChange {
    /// Whether applying this change requires rebuilding the graph.
    pub fn requires_rebuild(&self) -> bool {
        !self.key.is_runtime_mutable()
    }
}
