use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::ui::Theme;

/// Settings read from `cli.toml`.
#[derive(Debug, Default)]
pub struct CliConfig {
    path: Option<PathBuf>,
    data: RawConfig,
}

impl CliConfig {
    pub fn load(explicit: Option<PathBuf>) -> Result<Self, ConfigError> {
        let path = explicit.or_else(default_config_path);
        let data = match path.as_ref() {
            Some(config_path) if config_path.exists() => read_file(config_path)?,
            _ => RawConfig::default(),
        };
        if let Some(theme) = data.ui.theme.as_deref() {
            parse_theme(theme)?;
        }
        Ok(Self { path, data })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Resolves the store argument: a named store from `[stores]`, the given
    /// path, or the configured default.
    pub fn resolve_store(&self, arg: Option<&Path>) -> Result<PathBuf, ConfigError> {
        match arg {
            Some(raw) => {
                let alias = raw.to_str().and_then(|name| self.data.stores.get(name));
                Ok(alias.cloned().unwrap_or_else(|| raw.to_path_buf()))
            }
            None => self
                .data
                .store
                .default_path
                .clone()
                .ok_or(ConfigError::NoStore),
        }
    }

    pub fn staging_dir(&self) -> Option<&PathBuf> {
        self.data.rebuild.staging_dir.as_ref()
    }

    pub fn backup(&self) -> Option<bool> {
        self.data.rebuild.backup
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.data.rebuild.batch_size
    }

    pub fn wal_exclude(&self) -> &[String] {
        &self.data.wal.exclude
    }

    pub fn theme(&self) -> Option<Theme> {
        self.data
            .ui
            .theme
            .as_deref()
            .and_then(|value| parse_theme(value).ok())
    }

    pub fn log_level(&self) -> Option<&str> {
        self.data.log_level.as_deref()
    }
}

fn parse_theme(value: &str) -> Result<Theme, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "auto" => Ok(Theme::Auto),
        "light" => Ok(Theme::Light),
        "dark" => Ok(Theme::Dark),
        "plain" => Ok(Theme::Plain),
        other => Err(ConfigError::InvalidTheme {
            value: other.to_string(),
        }),
    }
}

fn read_file(path: &Path) -> Result<RawConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RawConfig {
    #[serde(default)]
    store: StoreSection,
    #[serde(default)]
    stores: HashMap<String, PathBuf>,
    #[serde(default)]
    rebuild: RebuildSection,
    #[serde(default)]
    wal: WalSection,
    #[serde(default)]
    ui: UiSection,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct StoreSection {
    #[serde(rename = "default")]
    default_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct RebuildSection {
    staging_dir: Option<PathBuf>,
    backup: Option<bool>,
    batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct WalSection {
    #[serde(default)]
    exclude: Vec<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct UiSection {
    theme: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read CLI config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse CLI config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("theme '{value}' is invalid; expected auto, light, dark or plain")]
    InvalidTheme { value: String },
    #[error("no store given and no [store] default configured")]
    NoStore,
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("vecmaint").join("cli.toml"))
}
