// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-application supervisor: owns the pool of slaves and the queue of
//! pending invocations.
//!
//! The overseer is a single task; the pool and the queue mutate only on
//! that task. Slaves, endpoints and the balancer talk to it through a
//! non-owning handle whose sends become no-ops once the overseer is gone,
//! which breaks the ownership cycle between the three.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use apiary_protocol::{CONTROL_CHANNEL, Frame};
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::balancer::{Balancer, Placement, PoolSnapshot, SlaveSnapshot};
use crate::error::Error;
use crate::isolate::Isolate;
use crate::manifest::{Manifest, Profile};
use crate::slave::{ChannelDescriptor, ChannelHandler, Session, SlaveContext, SlaveMachine};

/// An invocation waiting for placement.
struct PendingInvocation {
    event: String,
    upstream: Box<dyn AsyncRead + Send + Unpin>,
    downstream: mpsc::UnboundedSender<Frame>,
}

/// Commands processed on the overseer's event loop.
enum Command {
    Enqueue {
        event: String,
        upstream: Box<dyn AsyncRead + Send + Unpin>,
        downstream: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Activate {
        uuid: String,
        session: Session,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    PoolChanged {
        id: String,
    },
    ChannelFinished {
        id: String,
        channel: u64,
    },
    Despawn {
        id: String,
        reason: Error,
    },
    Info {
        reply: oneshot::Sender<AppInfo>,
    },
    Stop,
}

/// Point-in-time view of one application.
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
    pub app: String,
    pub pool: PoolSnapshot,
    pub queue_limit: usize,
}

/// Non-owning handle to an overseer task.
#[derive(Clone)]
pub struct OverseerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl OverseerHandle {
    /// Append a pending invocation and ask for placement.
    ///
    /// Fails with `QueueFull` when the queue is at its ceiling; the
    /// invocation is then not enqueued.
    pub async fn enqueue(
        &self,
        event: String,
        upstream: Box<dyn AsyncRead + Send + Unpin>,
        downstream: mpsc::UnboundedSender<Frame>,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Enqueue {
                event,
                upstream,
                downstream,
                reply,
            })
            .is_err()
        {
            return Err(Error::Shutdown);
        }
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Route a worker handshake to its pending slave.
    pub async fn activate(&self, uuid: String, session: Session) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Command::Activate {
                uuid,
                session,
                reply,
            })
            .is_err()
        {
            return Err(Error::Shutdown);
        }
        rx.await.unwrap_or(Err(Error::Shutdown))
    }

    /// Invoked by slave cleanup handlers when a slave changes state.
    pub fn pool_changed(&self, id: String) {
        let _ = self.tx.send(Command::PoolChanged { id });
    }

    /// Invoked by a slave's channel handler when a channel is released.
    pub fn channel_finished(&self, id: String, channel: u64) {
        let _ = self.tx.send(Command::ChannelFinished { id, channel });
    }

    /// Terminate a specific slave.
    pub fn despawn(&self, id: String, reason: Error) {
        let _ = self.tx.send(Command::Despawn { id, reason });
    }

    /// Per-slave load and state, queue depth, pool size.
    pub async fn info(&self) -> Option<AppInfo> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Info { reply }).ok()?;
        rx.await.ok()
    }

    /// Stop the overseer, despawning every slave.
    pub fn stop(&self) {
        let _ = self.tx.send(Command::Stop);
    }
}

/// Per-application owner of the slave pool and the pending-invocation queue.
pub struct Overseer {
    app: String,
    manifest: Arc<Manifest>,
    profile: Arc<Profile>,
    isolate: Arc<dyn Isolate>,
    worker_endpoint: PathBuf,

    balancer: Box<dyn Balancer>,
    pool: BTreeMap<String, Arc<SlaveMachine>>,
    queue: VecDeque<PendingInvocation>,

    handle: OverseerHandle,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Overseer {
    pub fn new(
        app: String,
        manifest: Arc<Manifest>,
        profile: Arc<Profile>,
        isolate: Arc<dyn Isolate>,
        worker_endpoint: PathBuf,
        mut balancer: Box<dyn Balancer>,
    ) -> (Self, OverseerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = OverseerHandle { tx };
        balancer.attach(handle.clone());

        let overseer = Self {
            app,
            manifest,
            profile,
            isolate,
            worker_endpoint,
            balancer,
            pool: BTreeMap::new(),
            queue: VecDeque::new(),
            handle: handle.clone(),
            rx,
        };
        (overseer, handle)
    }

    /// Drive the overseer until it is stopped or every handle is dropped.
    pub async fn run(mut self) {
        info!(app = %self.app, "overseer started");

        while let Some(command) = self.rx.recv().await {
            match command {
                Command::Enqueue {
                    event,
                    upstream,
                    downstream,
                    reply,
                } => self.handle_enqueue(event, upstream, downstream, reply),
                Command::Activate {
                    uuid,
                    session,
                    reply,
                } => self.handle_activate(uuid, session, reply),
                Command::PoolChanged { id } => self.handle_pool_changed(id),
                Command::ChannelFinished { id, channel } => {
                    self.handle_channel_finished(id, channel)
                }
                Command::Despawn { id, reason } => self.handle_despawn(id, reason),
                Command::Info { reply } => {
                    let _ = reply.send(self.info());
                }
                Command::Stop => break,
            }
        }

        // Teardown: drop the queue with an error to every waiting client
        // and despawn the pool.
        for invocation in self.queue.drain(..) {
            if let Ok(frame) = Frame::error(
                CONTROL_CHANNEL,
                Error::Shutdown.code(),
                &Error::Shutdown.to_string(),
            ) {
                let _ = invocation.downstream.send(frame);
            }
        }
        for machine in self.pool.values() {
            machine.terminate(Error::Shutdown);
        }
        self.pool.clear();

        info!(app = %self.app, "overseer stopped");
    }

    fn handle_enqueue(
        &mut self,
        event: String,
        upstream: Box<dyn AsyncRead + Send + Unpin>,
        downstream: mpsc::UnboundedSender<Frame>,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        if self.queue.len() >= self.profile.queue_limit {
            warn!(
                app = %self.app,
                event = %event,
                depth = self.queue.len(),
                "queue is at its ceiling, rejecting invocation"
            );
            let _ = reply.send(Err(Error::QueueFull));
            return;
        }

        debug!(app = %self.app, event = %event, depth = self.queue.len() + 1, "invocation enqueued");
        self.queue.push_back(PendingInvocation {
            event,
            upstream,
            downstream,
        });
        let _ = reply.send(Ok(()));
        self.rebalance();
    }

    fn handle_activate(
        &mut self,
        uuid: String,
        session: Session,
        reply: oneshot::Sender<Result<(), Error>>,
    ) {
        let result = match self.pool.get(&uuid) {
            Some(machine) => machine.activate(session).map(|_control| ()),
            None => {
                warn!(app = %self.app, slave_id = %uuid, "handshake from an unknown slave");
                Err(Error::InvalidState)
            }
        };
        let activated = result.is_ok();
        let _ = reply.send(result);

        if activated {
            let snapshot = self.snapshot();
            self.balancer.pool_changed(&snapshot);
            self.rebalance();
        }
    }

    fn handle_pool_changed(&mut self, id: String) {
        let broken = self.pool.get(&id).is_some_and(|machine| machine.broken());
        if broken {
            self.pool.remove(&id);
            info!(app = %self.app, slave_id = %id, pool = self.pool.len(), "slave removed from the pool");
        }
        let snapshot = self.snapshot();
        self.balancer.pool_changed(&snapshot);
        self.rebalance();
    }

    fn handle_channel_finished(&mut self, id: String, channel: u64) {
        debug!(app = %self.app, slave_id = %id, channel, "channel finished");
        self.balancer.channel_finished(channel);
        self.rebalance();
    }

    fn handle_despawn(&mut self, id: String, reason: Error) {
        match self.pool.remove(&id) {
            Some(machine) => {
                info!(app = %self.app, slave_id = %id, reason = %reason, "despawning slave");
                machine.terminate(reason);
                let snapshot = self.snapshot();
                self.balancer.pool_changed(&snapshot);
                self.rebalance();
            }
            None => debug!(app = %self.app, slave_id = %id, "despawn of an unknown slave"),
        }
    }

    /// Consume as many queue heads as the balancer will place.
    ///
    /// Dequeues are atomic: a popped invocation is either bound or restored
    /// to the head of the queue in its original position.
    fn rebalance(&mut self) {
        loop {
            let Some(head) = self.queue.front() else { break };
            let event = head.event.clone();
            let snapshot = self.snapshot();

            match self.balancer.queue_changed(&event, &snapshot) {
                Placement::Assign(id) => {
                    let Some(invocation) = self.queue.pop_front() else {
                        break;
                    };
                    let Some(machine) = self.pool.get(&id) else {
                        warn!(app = %self.app, slave_id = %id, "balancer chose an unknown slave");
                        self.queue.push_front(invocation);
                        break;
                    };

                    let PendingInvocation {
                        event,
                        upstream,
                        downstream,
                    } = invocation;
                    let descriptor = ChannelDescriptor {
                        event,
                        upstream,
                        downstream,
                    };
                    match machine.inject(descriptor, self.channel_handler(id.clone())) {
                        Ok(channel) => {
                            self.balancer.channel_started(channel);
                        }
                        Err((error, descriptor)) => {
                            debug!(
                                app = %self.app,
                                slave_id = %id,
                                error = %error,
                                "bind failed, restoring invocation"
                            );
                            let ChannelDescriptor {
                                event,
                                upstream,
                                downstream,
                            } = descriptor;
                            self.queue.push_front(PendingInvocation {
                                event,
                                upstream,
                                downstream,
                            });
                            let snapshot = self.snapshot();
                            self.balancer.pool_changed(&snapshot);
                            break;
                        }
                    }
                }
                Placement::Spawn => {
                    self.spawn_slave();
                    break;
                }
                Placement::Defer => break,
            }
        }
    }

    fn channel_handler(&self, slave_id: String) -> ChannelHandler {
        let handle = self.handle.clone();
        Box::new(move |channel| handle.channel_finished(slave_id, channel))
    }

    /// Spawn a new slave into the pool, respecting the pool ceiling.
    ///
    /// Spawning members count toward the ceiling, so there is no separate
    /// pending-spawn ledger. Failed spawns are not retried here; the
    /// balancer may request another.
    fn spawn_slave(&mut self) {
        if self.pool.len() >= self.profile.pool_limit {
            debug!(
                app = %self.app,
                pool = self.pool.len(),
                error = %Error::PoolExhausted,
                "spawn request ignored"
            );
            return;
        }

        let context = SlaveContext::new(
            self.app.clone(),
            self.manifest.clone(),
            self.profile.clone(),
            self.isolate.clone(),
            self.worker_endpoint.clone(),
        );
        let id = context.id.clone();

        let handle = self.handle.clone();
        let cleanup_id = id.clone();
        let machine = SlaveMachine::create(
            context,
            Box::new(move |_reason| handle.pool_changed(cleanup_id)),
        );

        info!(app = %self.app, slave_id = %id, pool = self.pool.len() + 1, "slave added to the pool");
        self.pool.insert(id, machine);
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            slaves: self
                .pool
                .iter()
                .map(|(id, machine)| SlaveSnapshot {
                    id: id.clone(),
                    state: machine.state_name(),
                    active: machine.active(),
                    load: machine.load(),
                    uptime_secs: machine.uptime().num_seconds(),
                })
                .collect(),
            pool_limit: self.profile.pool_limit,
            queue_depth: self.queue.len(),
        }
    }

    fn info(&self) -> AppInfo {
        AppInfo {
            app: self.app.clone(),
            pool: self.snapshot(),
            queue_limit: self.profile.queue_limit,
        }
    }
}
