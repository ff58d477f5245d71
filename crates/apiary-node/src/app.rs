// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application facade: wires a manifest and a profile into an overseer, a
//! balancer and the listening endpoints.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::balancer::LoadBalancer;
use crate::error::Error;
use crate::isolate::Isolate;
use crate::manifest::{Manifest, Profile};
use crate::overseer::{AppInfo, Overseer, OverseerHandle};
use crate::endpoint;

/// One running application: an overseer task, a balancer and two sockets.
pub struct App {
    name: String,
    endpoint: PathBuf,
    worker_endpoint: PathBuf,
    handle: OverseerHandle,
    overseer_task: JoinHandle<()>,
    client_listener: JoinHandle<()>,
    worker_listener: JoinHandle<()>,
}

impl App {
    /// Start the application: spin up its overseer and bind its endpoints.
    pub fn start(
        runtime_path: &Path,
        manifest: Manifest,
        profile: Profile,
        isolate: Arc<dyn Isolate>,
    ) -> std::io::Result<App> {
        let name = manifest.name.clone();
        let endpoint = manifest.endpoint.clone();
        let worker_endpoint = runtime_path.join(format!("{name}.worker"));

        let profile = Arc::new(profile);
        let balancer = Box::new(LoadBalancer::new(profile.concurrency));
        let (overseer, handle) = Overseer::new(
            name.clone(),
            Arc::new(manifest),
            profile,
            isolate,
            worker_endpoint.clone(),
            balancer,
        );
        let overseer_task = tokio::spawn(overseer.run());

        let client_listener = endpoint::bind_client(&endpoint, handle.clone())?;
        let worker_listener = endpoint::bind_worker(&worker_endpoint, handle.clone())?;

        info!(app = %name, endpoint = %endpoint.display(), "application started");

        Ok(App {
            name,
            endpoint,
            worker_endpoint,
            handle,
            overseer_task,
            client_listener,
            worker_listener,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the application's overseer.
    pub fn overseer(&self) -> &OverseerHandle {
        &self.handle
    }

    /// Per-slave load and state, queue depth, pool size.
    pub async fn info(&self) -> Option<AppInfo> {
        self.handle.info().await
    }

    /// Stop the application: close the sockets, despawn the slaves.
    pub async fn stop(self) {
        self.client_listener.abort();
        self.worker_listener.abort();

        self.handle.stop();
        let _ = self.overseer_task.await;

        let _ = std::fs::remove_file(&self.endpoint);
        let _ = std::fs::remove_file(&self.worker_endpoint);

        info!(app = %self.name, "application stopped");
    }

    /// Terminate one slave of this application.
    pub fn despawn(&self, slave_id: String) {
        self.handle.despawn(slave_id, Error::Shutdown);
    }
}
