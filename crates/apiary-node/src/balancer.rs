// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement policy: decides which slave receives each queued invocation
//! and whether the pool should grow.

use serde::Serialize;

use crate::overseer::OverseerHandle;

/// Placement decision for the head of the pending queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Bind the invocation to this slave.
    Assign(String),
    /// No suitable slave; ask for another spawn and keep the head queued.
    Spawn,
    /// Leave the invocation queued until the pool changes.
    Defer,
}

/// Point-in-time view of one slave, as the balancer sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SlaveSnapshot {
    pub id: String,
    pub state: &'static str,
    pub active: bool,
    pub load: u64,
    pub uptime_secs: i64,
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub slaves: Vec<SlaveSnapshot>,
    pub pool_limit: usize,
    pub queue_depth: usize,
}

/// Per-application policy object choosing slave placement.
///
/// Implementations are driven synchronously from the overseer's event loop;
/// they never block and never call back into the overseer re-entrantly.
pub trait Balancer: Send {
    /// Binds the balancer to its overseer (non-owning handle).
    fn attach(&mut self, overseer: OverseerHandle);

    /// Invoked with the head of the queue; returns the placement decision.
    fn queue_changed(&mut self, event: &str, pool: &PoolSnapshot) -> Placement;

    /// Signals that the pool composition or the per-slave loads changed.
    fn pool_changed(&mut self, pool: &PoolSnapshot);

    fn channel_started(&mut self, _channel: u64) {}

    fn channel_finished(&mut self, _channel: u64) {}
}

/// Default policy: least-loaded active slave under the concurrency hint.
///
/// If no active slave has spare concurrency, requests a spawn while the
/// pool is below its ceiling, otherwise defers until a slot frees.
pub struct LoadBalancer {
    concurrency: u64,
    #[allow(dead_code)]
    overseer: Option<OverseerHandle>,
}

impl LoadBalancer {
    pub fn new(concurrency: u64) -> Self {
        Self {
            concurrency,
            overseer: None,
        }
    }
}

impl Balancer for LoadBalancer {
    fn attach(&mut self, overseer: OverseerHandle) {
        self.overseer = Some(overseer);
    }

    fn queue_changed(&mut self, _event: &str, pool: &PoolSnapshot) -> Placement {
        let target = pool
            .slaves
            .iter()
            .filter(|slave| slave.active && slave.load < self.concurrency)
            .min_by_key(|slave| slave.load);

        match target {
            Some(slave) => Placement::Assign(slave.id.clone()),
            None if pool.slaves.len() < pool.pool_limit => Placement::Spawn,
            None => Placement::Defer,
        }
    }

    fn pool_changed(&mut self, _pool: &PoolSnapshot) {}
}
