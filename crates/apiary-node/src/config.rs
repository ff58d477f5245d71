// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Node configuration loading from a JSON file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// The only configuration format version this node understands.
const CONFIG_VERSION: u64 = 2;

/// Node configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem layout of the node.
    pub paths: Paths,
    /// Inclusive port range reserved for network services.
    pub port_range: (u16, u16),
    /// Service components, by name.
    pub services: HashMap<String, Component>,
    /// Storage components, by name.
    pub storages: HashMap<String, Component>,
    /// Logger components, by name.
    pub loggers: HashMap<String, Component>,
}

/// Filesystem layout of the node.
#[derive(Debug, Clone)]
pub struct Paths {
    pub plugins: PathBuf,
    pub runtime: PathBuf,
    pub spool: PathBuf,
}

/// A named pluggable component: a type tag plus free-form arguments.
#[derive(Debug, Clone, Deserialize)]
pub struct Component {
    #[serde(rename = "type", default = "unspecified")]
    pub kind: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

fn unspecified() -> String {
    "unspecified".to_string()
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    version: u64,
    paths: RawPaths,
    #[serde(rename = "port-mapper")]
    port_mapper: RawPortMapper,
    #[serde(default)]
    services: HashMap<String, Component>,
    #[serde(default)]
    storages: HashMap<String, Component>,
    #[serde(default)]
    loggers: HashMap<String, Component>,
}

#[derive(Debug, Deserialize)]
struct RawPaths {
    plugins: PathBuf,
    runtime: PathBuf,
    spool: PathBuf,
}

#[derive(Debug, Deserialize)]
struct RawPortMapper {
    range: (u64, u64),
}

/// Configuration errors; all of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("the configuration path doesn't exist")]
    Missing,

    #[error("the configuration path doesn't point to a file")]
    NotAFile,

    #[error("unable to open the configuration file: {0}")]
    Unreadable(#[source] std::io::Error),

    #[error("the configuration file is corrupted: {0}")]
    Corrupted(#[source] serde_json::Error),

    #[error("the configuration version is invalid")]
    InvalidVersion,

    #[error("the '{0}' path does not exist")]
    PathDoesNotExist(String),

    #[error("the '{0}' path is not a directory")]
    PathNotDirectory(String),

    #[error("the port range is invalid")]
    InvalidPortRange,

    #[error("the '{name}' manifest is invalid: {reason}")]
    Manifest { name: String, reason: String },

    #[error("the '{name}' profile is invalid: {reason}")]
    Profile { name: String, reason: String },
}

impl Config {
    /// Load and validate the configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::Missing);
        }
        if !path.is_file() {
            return Err(ConfigError::NotAFile);
        }

        let content = std::fs::read_to_string(path).map_err(ConfigError::Unreadable)?;
        let raw: RawConfig = serde_json::from_str(&content).map_err(ConfigError::Corrupted)?;

        if raw.version != CONFIG_VERSION {
            return Err(ConfigError::InvalidVersion);
        }

        validate_path(&raw.paths.plugins)?;
        validate_path(&raw.paths.runtime)?;
        validate_path(&raw.paths.spool)?;

        let (lo, hi) = raw.port_mapper.range;
        if lo == 0 || hi == 0 || lo > hi || hi > u16::MAX as u64 {
            return Err(ConfigError::InvalidPortRange);
        }

        Ok(Self {
            paths: Paths {
                plugins: raw.paths.plugins,
                runtime: raw.paths.runtime,
                spool: raw.paths.spool,
            },
            port_range: (lo as u16, hi as u16),
            services: raw.services,
            storages: raw.storages,
            loggers: raw.loggers,
        })
    }
}

fn validate_path(path: &Path) -> Result<(), ConfigError> {
    if !path.exists() {
        return Err(ConfigError::PathDoesNotExist(path.display().to_string()));
    }
    if !path.is_dir() {
        return Err(ConfigError::PathNotDirectory(path.display().to_string()));
    }
    Ok(())
}
