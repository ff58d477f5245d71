// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The node: hosts every application found in the spool directory.
//!
//! Each subdirectory of `paths.spool` holding a `manifest.json` (plus an
//! optional `profile.json`) is an application. SIGHUP rescans the spool:
//! new applications start, removed ones stop gracefully. Pending
//! invocations die with their application.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{error, info};

use crate::app::App;
use crate::config::Config;
use crate::isolate::{Isolate, ProcessIsolate};
use crate::manifest::{Manifest, Profile};
use crate::signals;

pub struct Node {
    config: Config,
    isolate: Arc<dyn Isolate>,
    apps: HashMap<String, App>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        Self::with_isolate(config, Arc::new(ProcessIsolate))
    }

    /// Substitute the worker launcher; used by tests.
    pub fn with_isolate(config: Config, isolate: Arc<dyn Isolate>) -> Self {
        Self {
            config,
            isolate,
            apps: HashMap::new(),
        }
    }

    /// Application names present in the spool right now.
    fn discover(&self) -> HashSet<String> {
        let mut found = HashSet::new();
        let entries = match std::fs::read_dir(&self.config.paths.spool) {
            Ok(entries) => entries,
            Err(e) => {
                error!(spool = %self.config.paths.spool.display(), error = %e, "unable to scan the spool");
                return found;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() && path.join("manifest.json").is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    found.insert(name.to_string());
                }
            }
        }
        found
    }

    fn start_app(&mut self, name: &str) {
        let dir = self.config.paths.spool.join(name);

        let manifest = match Manifest::load(dir.join("manifest.json"), name) {
            Ok(manifest) => manifest,
            Err(e) => {
                error!(app = %name, error = %e, "unable to load the manifest");
                return;
            }
        };
        let profile = match Profile::load_or_default(dir.join("profile.json"), name) {
            Ok(profile) => profile,
            Err(e) => {
                error!(app = %name, error = %e, "unable to load the profile");
                return;
            }
        };

        match App::start(
            &self.config.paths.runtime,
            manifest,
            profile,
            self.isolate.clone(),
        ) {
            Ok(app) => {
                self.apps.insert(name.to_string(), app);
            }
            Err(e) => {
                error!(app = %name, error = %e, "unable to start the application");
            }
        }
    }

    /// Start every application currently in the spool.
    pub fn start_apps(&mut self) {
        for name in self.discover() {
            if !self.apps.contains_key(&name) {
                self.start_app(&name);
            }
        }
        info!(apps = self.apps.len(), "applications started");
    }

    /// Rescan the spool: start new applications, stop removed ones.
    pub async fn reload(&mut self) {
        info!("reloading the application list");
        let desired = self.discover();

        let running: Vec<String> = self.apps.keys().cloned().collect();
        for name in running {
            if !desired.contains(&name) {
                if let Some(app) = self.apps.remove(&name) {
                    app.stop().await;
                }
            }
        }
        for name in desired {
            if !self.apps.contains_key(&name) {
                self.start_app(&name);
            }
        }
    }

    /// Stop every application.
    pub async fn stop(&mut self) {
        for (_, app) in self.apps.drain() {
            app.stop().await;
        }
    }

    /// Run until a termination signal arrives, reloading on SIGHUP.
    pub async fn run(mut self) -> std::io::Result<()> {
        use tokio::signal::unix::{SignalKind, signal};

        self.start_apps();

        let mut shutdown = signals::ShutdownSignals::install()?;
        let mut sighup = signal(SignalKind::hangup())?;
        loop {
            tokio::select! {
                name = shutdown.recv() => {
                    info!(signal = name, "caught a termination signal, exiting");
                    break;
                }
                _ = sighup.recv() => {
                    self.reload().await;
                }
            }
        }

        self.stop().await;
        info!("node stopped");
        Ok(())
    }

    pub fn app(&self, name: &str) -> Option<&App> {
        self.apps.get(name)
    }

    pub fn app_count(&self) -> usize {
        self.apps.len()
    }
}
