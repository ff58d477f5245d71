// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application manifests and profiles.
//!
//! The manifest is the immutable description of an application: which
//! executable to run and where to accept invocations. The profile holds the
//! tunables of its supervision: pool and queue ceilings, concurrency hint
//! and the lifecycle timeouts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::config::ConfigError;

/// Immutable per-application record.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Application name; taken from the spool directory, not the file.
    #[serde(skip)]
    pub name: String,
    /// Path to the worker executable.
    pub slave: PathBuf,
    /// Filesystem socket at which the application accepts invocations.
    pub endpoint: PathBuf,
    /// Environment passed to every spawned worker.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl Manifest {
    /// Load a manifest from a JSON file.
    pub fn load(path: impl AsRef<Path>, name: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Manifest {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let mut manifest: Manifest =
            serde_json::from_str(&content).map_err(|e| ConfigError::Manifest {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        manifest.name = name.to_string();
        Ok(manifest)
    }
}

/// Immutable per-application tunables.
///
/// All durations are in seconds and must be positive, as must all counts.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    #[serde(rename = "pool-limit", default = "default_pool_limit")]
    pub pool_limit: usize,

    #[serde(rename = "queue-limit", default = "default_queue_limit")]
    pub queue_limit: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: u64,

    #[serde(rename = "heartbeat-timeout", default = "default_heartbeat_timeout")]
    heartbeat_timeout_secs: u64,

    #[serde(rename = "idle-timeout", default = "default_idle_timeout")]
    idle_timeout_secs: u64,

    #[serde(rename = "startup-timeout", default = "default_startup_timeout")]
    startup_timeout_secs: u64,

    #[serde(
        rename = "termination-timeout",
        default = "default_termination_timeout"
    )]
    termination_timeout_secs: u64,

    /// Lines of worker output retained for post-mortem inspection.
    #[serde(rename = "log-retention", default = "default_log_retention")]
    pub log_retention: usize,
}

fn default_pool_limit() -> usize {
    10
}
fn default_queue_limit() -> usize {
    100
}
fn default_concurrency() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_idle_timeout() -> u64 {
    600
}
fn default_startup_timeout() -> u64 {
    10
}
fn default_termination_timeout() -> u64 {
    5
}
fn default_log_retention() -> usize {
    100
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            pool_limit: default_pool_limit(),
            queue_limit: default_queue_limit(),
            concurrency: default_concurrency(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            termination_timeout_secs: default_termination_timeout(),
            log_retention: default_log_retention(),
        }
    }
}

impl Profile {
    /// Load a profile from a JSON file; a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>, name: &str) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Profile {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let profile: Profile =
            serde_json::from_str(&content).map_err(|e| ConfigError::Profile {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        profile.validate(name)?;
        Ok(profile)
    }

    fn validate(&self, name: &str) -> Result<(), ConfigError> {
        let positive: [(&str, u64); 8] = [
            ("pool-limit", self.pool_limit as u64),
            ("queue-limit", self.queue_limit as u64),
            ("concurrency", self.concurrency),
            ("heartbeat-timeout", self.heartbeat_timeout_secs),
            ("idle-timeout", self.idle_timeout_secs),
            ("startup-timeout", self.startup_timeout_secs),
            ("termination-timeout", self.termination_timeout_secs),
            ("log-retention", self.log_retention as u64),
        ];
        for (option, value) in positive {
            if value == 0 {
                return Err(ConfigError::Profile {
                    name: name.to_string(),
                    reason: format!("the '{option}' option must be positive"),
                });
            }
        }
        Ok(())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }
}
