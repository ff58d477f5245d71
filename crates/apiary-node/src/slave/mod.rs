// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Slave state machine: drives one worker process from spawn to termination.
//!
//! A slave owns its worker through the full lifecycle
//! (spawning → handshaking → active → terminating → broken), accepts channel
//! injections while active, tracks per-channel half-close state and invokes
//! its cleanup handler exactly once on breakage.
//!
//! The state is a sum type carrying only per-state data; every transition
//! happens under the state mutex. The load map is separately guarded because
//! the two close events of a channel originate on different tasks. Handler
//! invocation always happens after the locks are released.

mod control;

pub use control::{ControlHandle, Session};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use apiary_protocol::{CONTROL_CHANNEL, Frame, FrameError, MessageType, read_frame, write_frame};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;
use crate::fetcher::Fetcher;
use crate::isolate::{Isolate, SpawnOptions, WorkerHandle};
use crate::manifest::{Manifest, Profile};

/// Invoked exactly once when a channel is fully released, with its id.
pub type ChannelHandler = Box<dyn FnOnce(u64) + Send + 'static>;

/// Invoked exactly once when the slave breaks, unless termination was
/// requested explicitly.
pub type CleanupHandler = Box<dyn FnOnce(Error) + Send + 'static>;

const SIDE_TX: u8 = 0b01;
const SIDE_RX: u8 = 0b10;

/// Everything a slave needs to exist.
pub struct SlaveContext {
    pub app: String,
    pub id: String,
    pub manifest: Arc<Manifest>,
    pub profile: Arc<Profile>,
    pub isolate: Arc<dyn Isolate>,
    /// Socket the spawned worker connects back to.
    pub worker_endpoint: PathBuf,
}

impl SlaveContext {
    pub fn new(
        app: String,
        manifest: Arc<Manifest>,
        profile: Arc<Profile>,
        isolate: Arc<dyn Isolate>,
        worker_endpoint: PathBuf,
    ) -> Self {
        Self {
            app,
            id: Uuid::new_v4().simple().to_string(),
            manifest,
            profile,
            isolate,
            worker_endpoint,
        }
    }
}

/// One bidirectional logical stream between a client and a worker.
pub struct ChannelDescriptor {
    /// Event name to be processed.
    pub event: String,
    /// Client-to-worker half, framed.
    pub upstream: Box<dyn AsyncRead + Send + Unpin>,
    /// Worker-to-client half; frames queued here reach the client verbatim.
    pub downstream: mpsc::UnboundedSender<Frame>,
}

struct LoadEntry {
    sides: u8,
    handler: ChannelHandler,
    downstream: mpsc::UnboundedSender<Frame>,
}

enum State {
    Spawning,
    Handshaking {
        worker: WorkerHandle,
    },
    Active {
        worker: WorkerHandle,
        control: mpsc::UnboundedSender<Frame>,
    },
    Terminating {
        worker: WorkerHandle,
        reason: Error,
    },
    Broken,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Spawning => "spawning",
            State::Handshaking { .. } => "handshaking",
            State::Active { .. } => "active",
            State::Terminating { .. } => "terminating",
            State::Broken => "broken",
        }
    }
}

/// The slave state machine.
///
/// Shared by the overseer and by its own asynchronous operations; timers
/// hold weak references and no-op once the state has advanced past them.
pub struct SlaveMachine {
    weak: Weak<SlaveMachine>,

    id: String,
    app: String,
    manifest: Arc<Manifest>,
    profile: Arc<Profile>,
    isolate: Arc<dyn Isolate>,
    worker_endpoint: PathBuf,
    birthstamp: DateTime<Utc>,

    state: Mutex<State>,
    /// One-shot latch making `shutdown` idempotent from any origin.
    shutdowned: AtomicBool,
    /// Set by `terminate`; suppresses the cleanup callback even if an
    /// unrelated breakage wins the race.
    terminated: AtomicBool,
    cleanup: Mutex<Option<CleanupHandler>>,

    /// Channel id source, monotone within this slave.
    counter: AtomicU64,
    /// Activity epoch; a stale idle timer detects it changed and no-ops.
    epoch: AtomicU64,
    load: Mutex<HashMap<u64, LoadEntry>>,

    fetcher: Fetcher,
    /// Cancelled on breakage to tear down session and relay tasks.
    halt: CancellationToken,
}

impl SlaveMachine {
    /// Creates the state machine and immediately starts the spawn.
    pub fn create(context: SlaveContext, cleanup: CleanupHandler) -> Arc<SlaveMachine> {
        let SlaveContext {
            app,
            id,
            manifest,
            profile,
            isolate,
            worker_endpoint,
        } = context;

        let fetcher = Fetcher::new(id.clone(), profile.log_retention);
        let machine = Arc::new_cyclic(|weak| SlaveMachine {
            weak: weak.clone(),
            id,
            app,
            manifest,
            profile,
            isolate,
            worker_endpoint,
            birthstamp: Utc::now(),
            state: Mutex::new(State::Spawning),
            shutdowned: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            cleanup: Mutex::new(Some(cleanup)),
            counter: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            load: Mutex::new(HashMap::new()),
            fetcher,
            halt: CancellationToken::new(),
        });

        info!(slave_id = %machine.id, app = %machine.app, "slave created");
        machine.start();
        machine
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn birthstamp(&self) -> DateTime<Utc> {
        self.birthstamp
    }

    pub fn uptime(&self) -> chrono::Duration {
        Utc::now() - self.birthstamp
    }

    /// True iff the current state is active.
    pub fn active(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Active { .. })
    }

    pub fn broken(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), State::Broken)
    }

    pub fn state_name(&self) -> &'static str {
        self.state.lock().unwrap().name()
    }

    /// Number of live channels.
    pub fn load(&self) -> u64 {
        self.load.lock().unwrap().len() as u64
    }

    /// Tail of recent worker output lines, oldest first.
    pub fn output_tail(&self) -> Vec<String> {
        self.fetcher.tail()
    }

    fn arc(&self) -> Arc<SlaveMachine> {
        self.weak.upgrade().expect("slave machine is alive")
    }

    // Spawning

    fn start(&self) {
        let weak = self.weak.clone();
        let deadline = self.profile.startup_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(machine) = weak.upgrade() {
                machine.on_startup_deadline();
            }
        });

        let this = self.arc();
        let halt = self.halt.clone();
        tokio::spawn(async move {
            let options = SpawnOptions {
                executable: this.manifest.slave.clone(),
                args: vec![
                    "--app".into(),
                    this.app.clone(),
                    "--uuid".into(),
                    this.id.clone(),
                    "--endpoint".into(),
                    this.worker_endpoint.display().to_string(),
                ],
                environment: this.manifest.environment.clone(),
            };
            tokio::select! {
                _ = halt.cancelled() => {
                    debug!(slave_id = %this.id, "spawn abandoned, slave is gone");
                }
                result = this.isolate.spawn(options) => match result {
                    Ok(worker) => this.on_spawned(worker),
                    Err(e) => this.shutdown(Error::SpawnFailed(e.to_string())),
                },
            }
        });
    }

    fn on_spawned(&self, mut worker: WorkerHandle) {
        let stdout = worker.take_stdout();
        let stderr = worker.take_stderr();
        let pid = worker.pid;

        let installed = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                State::Spawning => {
                    *state = State::Handshaking { worker };
                    true
                }
                // Already broken; dropping the handle reaps the process.
                _ => false,
            }
        };
        if !installed {
            debug!(slave_id = %self.id, "worker spawned into a dead slave, discarding");
            return;
        }

        if let Some(stdout) = stdout {
            let weak = self.weak.clone();
            self.fetcher.run(stdout, move |e| {
                if let Some(machine) = weak.upgrade() {
                    machine.shutdown(Error::OutputReadFailed(e.to_string()));
                }
            });
        }
        if let Some(stderr) = stderr {
            let slave_id = self.id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(slave_id = %slave_id, line = %line, "worker stderr");
                }
            });
        }

        info!(slave_id = %self.id, pid = ?pid, "worker spawned, awaiting handshake");
    }

    fn on_startup_deadline(&self) {
        self.shutdown_when(|state| match state {
            State::Spawning => Some(Error::SpawnTimeout),
            State::Handshaking { .. } => Some(Error::HandshakeTimeout),
            _ => None,
        });
    }

    // Activation

    /// Binds the worker's session and produces the control dispatcher.
    ///
    /// Legal only while handshaking.
    pub fn activate(&self, session: Session) -> Result<ControlHandle, Error> {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            match std::mem::replace(&mut *state, State::Broken) {
                State::Handshaking { worker } => {
                    *state = State::Active {
                        worker,
                        control: control_tx.clone(),
                    };
                }
                other => {
                    let name = other.name();
                    *state = other;
                    debug!(slave_id = %self.id, state = name, "activation rejected");
                    return Err(Error::InvalidState);
                }
            }
        }

        info!(slave_id = %self.id, app = %self.app, "slave activated");

        let Session { reader, writer } = session;
        tokio::spawn(self.arc().run_session_writer(control_rx, writer));
        tokio::spawn(self.arc().run_session_reader(reader));

        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.arm_idle_timer();

        Ok(ControlHandle::new(control_tx))
    }

    // Channels

    /// Assigns the next channel id, installs the handler and wires the
    /// relays. Legal only while active; on rejection the descriptor is
    /// returned so the invocation can be restored to the queue.
    pub fn inject(
        &self,
        channel: ChannelDescriptor,
        handler: ChannelHandler,
    ) -> Result<u64, (Error, ChannelDescriptor)> {
        let id;
        let control;
        {
            let state = self.state.lock().unwrap();
            let State::Active { control: ctl, .. } = &*state else {
                return Err((Error::SlaveNotActive, channel));
            };
            control = ctl.clone();
            id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            // Inserted while the state lock is held, so a concurrent
            // breakage either sees this entry or rejects the inject.
            self.load.lock().unwrap().insert(
                id,
                LoadEntry {
                    sides: SIDE_TX | SIDE_RX,
                    handler,
                    downstream: channel.downstream.clone(),
                },
            );
        }
        self.epoch.fetch_add(1, Ordering::SeqCst);

        let ChannelDescriptor {
            event, upstream, ..
        } = channel;

        debug!(slave_id = %self.id, channel = id, event = %event, "channel injected");
        match Frame::invoke(id, &event) {
            Ok(frame) => {
                let _ = control.send(frame);
            }
            Err(e) => warn!(slave_id = %self.id, error = %e, "unable to encode invoke"),
        }

        tokio::spawn(self.arc().run_upstream_relay(id, upstream, control));
        Ok(id)
    }

    fn on_channel_close(&self, id: u64, side: u8) {
        let finished = {
            let mut load = self.load.lock().unwrap();
            match load.get_mut(&id) {
                Some(entry) => {
                    entry.sides &= !side;
                    if entry.sides == 0 {
                        load.remove(&id).map(|entry| entry.handler)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some(handler) = finished {
            debug!(slave_id = %self.id, channel = id, "channel fully closed");
            handler(id);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            if self.active() && self.load() == 0 {
                self.arm_idle_timer();
            }
        }
    }

    /// Remove every channel, notify the clients and collect the handlers.
    /// The caller invokes the handlers after releasing its locks.
    fn drain_channels(&self, reason: &Error) -> Vec<(u64, ChannelHandler)> {
        let drained: Vec<(u64, LoadEntry)> = self.load.lock().unwrap().drain().collect();
        let mut handlers = Vec::with_capacity(drained.len());
        for (id, entry) in drained {
            if let Ok(frame) = Frame::error(CONTROL_CHANNEL, reason.code(), &reason.to_string()) {
                let _ = entry.downstream.send(frame);
            }
            handlers.push((id, entry.handler));
        }
        handlers
    }

    // Termination

    /// Asks for graceful worker termination with the given reason.
    ///
    /// The cleanup callback won't be called after this; repeated calls have
    /// no further effect.
    pub fn terminate(&self, reason: Error) {
        self.terminated.store(true, Ordering::SeqCst);
        self.begin_termination(reason);
    }

    fn begin_termination(&self, reason: Error) {
        enum Step {
            Graceful,
            Immediate,
            Noop,
        }

        let step = {
            let mut state = self.state.lock().unwrap();
            match &*state {
                State::Active { .. } => {
                    let State::Active { worker, control } =
                        std::mem::replace(&mut *state, State::Broken)
                    else {
                        unreachable!()
                    };
                    match Frame::terminate(reason.code(), &reason.to_string()) {
                        Ok(frame) => {
                            let _ = control.send(frame);
                        }
                        Err(e) => {
                            warn!(slave_id = %self.id, error = %e, "unable to encode terminate")
                        }
                    }
                    *state = State::Terminating {
                        worker,
                        reason: reason.clone(),
                    };
                    Step::Graceful
                }
                State::Terminating { .. } | State::Broken => Step::Noop,
                State::Spawning | State::Handshaking { .. } => Step::Immediate,
            }
        };

        match step {
            Step::Graceful => {
                info!(slave_id = %self.id, reason = %reason, "terminating slave gracefully");
                for (id, handler) in self.drain_channels(&reason) {
                    handler(id);
                }

                let weak = self.weak.clone();
                let deadline = self.profile.termination_timeout();
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    if let Some(machine) = weak.upgrade() {
                        machine.shutdown_when(|state| {
                            matches!(state, State::Terminating { .. })
                                .then_some(Error::TerminationTimeout)
                        });
                    }
                });
            }
            Step::Immediate => self.shutdown(reason),
            Step::Noop => {}
        }
    }

    // Breakage

    /// Internal termination; can be called from any origin, but only the
    /// first call takes effect.
    pub fn shutdown(&self, reason: Error) {
        self.shutdown_when(move |_| Some(reason));
    }

    /// The single transition point into the broken state. The decision
    /// closure runs under the state lock; everything irreversible happens
    /// only after the one-shot latch is won.
    fn shutdown_when(&self, decide: impl FnOnce(&State) -> Option<Error>) {
        let (previous, reason) = {
            let mut state = self.state.lock().unwrap();
            let Some(reason) = decide(&state) else { return };
            if self.shutdowned.swap(true, Ordering::SeqCst) {
                return;
            }
            (std::mem::replace(&mut *state, State::Broken), reason)
        };

        // Release resources before the cleanup handler fires: kill the
        // worker, close the control session, stop the output pump.
        self.halt.cancel();
        self.fetcher.stop();
        let was = previous.name();
        drop(previous);

        let tail = self.fetcher.tail();
        if !tail.is_empty() {
            info!(
                slave_id = %self.id,
                lines = tail.len(),
                tail = ?tail,
                "worker output tail"
            );
        }

        for (id, handler) in self.drain_channels(&reason) {
            handler(id);
        }

        let cleanup = self.cleanup.lock().unwrap().take();
        if self.terminated.load(Ordering::SeqCst) {
            // The slave was despawned on purpose; the losing error is only
            // worth a log line.
            info!(slave_id = %self.id, from = was, error = %reason, "terminated slave is broken");
        } else {
            warn!(slave_id = %self.id, from = was, error = %reason, "slave is broken");
            if let Some(cleanup) = cleanup {
                cleanup(reason);
            }
        }
    }

    // Timers

    fn arm_idle_timer(&self) {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let weak = self.weak.clone();
        let idle = self.profile.idle_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(machine) = weak.upgrade() {
                machine.on_idle_deadline(epoch);
            }
        });
    }

    fn on_idle_deadline(&self, epoch: u64) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if !self.active() || self.load() != 0 {
            return;
        }
        info!(slave_id = %self.id, "slave has been idle for too long, retiring");
        self.begin_termination(Error::IdleShutdown);
    }

    // Session pumps

    async fn run_session_writer(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Frame>,
        mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        let halt = self.halt.clone();
        loop {
            let frame = tokio::select! {
                biased;

                _ = halt.cancelled() => break,

                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(slave_id = %self.id, error = %e, "worker session write failed");
                self.shutdown(Error::WorkerDisconnected);
                return;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn run_session_reader(self: Arc<Self>, mut reader: Box<dyn AsyncRead + Send + Unpin>) {
        let halt = self.halt.clone();
        let heartbeat = self.profile.heartbeat_timeout();
        loop {
            let frame = tokio::select! {
                biased;

                _ = halt.cancelled() => return,

                result = tokio::time::timeout(heartbeat, read_frame(&mut reader)) => match result {
                    Err(_) => {
                        warn!(slave_id = %self.id, "worker went silent past the heartbeat timeout");
                        self.shutdown(Error::WorkerDisconnected);
                        return;
                    }
                    Ok(Err(FrameError::ConnectionClosed)) => {
                        self.on_worker_disconnected();
                        return;
                    }
                    Ok(Err(e)) => {
                        warn!(slave_id = %self.id, error = %e, "worker session read failed");
                        self.shutdown(Error::WorkerDisconnected);
                        return;
                    }
                    Ok(Ok(frame)) => frame,
                },
            };

            match frame.message_type {
                MessageType::Heartbeat => {}
                MessageType::Chunk => {
                    let channel = frame.channel;
                    let payload = frame.payload;
                    let sent = {
                        let load = self.load.lock().unwrap();
                        load.get(&channel)
                            .map(|entry| entry.downstream.send(Frame::chunk(CONTROL_CHANNEL, payload)))
                    };
                    if sent.is_none() {
                        debug!(slave_id = %self.id, channel, "chunk for an unknown channel");
                    }
                }
                MessageType::Choke => {
                    let channel = frame.channel;
                    {
                        let load = self.load.lock().unwrap();
                        if let Some(entry) = load.get(&channel) {
                            let _ = entry.downstream.send(Frame::choke(CONTROL_CHANNEL));
                        }
                    }
                    self.on_channel_close(channel, SIDE_RX);
                }
                MessageType::Error => {
                    let channel = frame.channel;
                    {
                        let load = self.load.lock().unwrap();
                        if let Some(entry) = load.get(&channel) {
                            let _ = entry.downstream.send(Frame {
                                message_type: MessageType::Error,
                                channel: CONTROL_CHANNEL,
                                payload: frame.payload,
                            });
                        }
                    }
                    self.on_channel_close(channel, SIDE_RX);
                }
                other => {
                    debug!(slave_id = %self.id, message_type = ?other, "unexpected worker frame");
                }
            }
        }
    }

    fn on_worker_disconnected(&self) {
        let reason = match &*self.state.lock().unwrap() {
            // A worker exiting while terminating is the graceful outcome;
            // the breakage reason is the one termination was asked with.
            State::Terminating { reason, .. } => reason.clone(),
            _ => Error::WorkerDisconnected,
        };
        self.shutdown(reason);
    }

    async fn run_upstream_relay(
        self: Arc<Self>,
        id: u64,
        mut upstream: Box<dyn AsyncRead + Send + Unpin>,
        control: mpsc::UnboundedSender<Frame>,
    ) {
        let halt = self.halt.clone();
        loop {
            let frame = tokio::select! {
                biased;

                _ = halt.cancelled() => break,

                result = read_frame(&mut upstream) => match result {
                    Ok(frame) => frame,
                    Err(_) => {
                        // The client went away; half-close towards the worker.
                        let _ = control.send(Frame::choke(id));
                        break;
                    }
                },
            };
            match frame.message_type {
                MessageType::Chunk => {
                    if control.send(Frame::chunk(id, frame.payload)).is_err() {
                        break;
                    }
                }
                MessageType::Choke => {
                    let _ = control.send(Frame::choke(id));
                    break;
                }
                other => {
                    debug!(slave_id = %self.id, channel = id, message_type = ?other, "unexpected client frame");
                }
            }
        }
        self.on_channel_close(id, SIDE_TX);
    }
}

impl Drop for SlaveMachine {
    fn drop(&mut self) {
        self.halt.cancel();
        self.fetcher.stop();
    }
}
