// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Isolate contract: spawning and supervising worker processes.
//!
//! The supervision core talks to the process launcher through this trait so
//! that tests can substitute a scriptable implementation.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;

/// Errors from isolate operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IsolateError {
    /// The worker executable was not found.
    #[error("worker executable not found: {0}")]
    ExecutableNotFound(String),

    /// The process could not be started.
    #[error("unable to start the worker process: {0}")]
    StartFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for isolate operations.
pub type Result<T> = std::result::Result<T, IsolateError>;

/// Options for launching a worker.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Path to the worker executable.
    pub executable: PathBuf,
    /// Command-line arguments.
    pub args: Vec<String>,
    /// Environment variables (applied on top of a clean environment).
    pub environment: HashMap<String, String>,
}

/// Handle for a spawned worker process.
///
/// Dropping the handle kills the process; the output descriptors can be
/// taken exactly once each.
pub struct WorkerHandle {
    /// PID of the spawned process, captured at spawn time.
    pub pid: Option<u32>,
    /// When the worker was started.
    pub started_at: DateTime<Utc>,
    child: Option<tokio::process::Child>,
    stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl WorkerHandle {
    /// Build a handle around an arbitrary output stream, without a process
    /// behind it.
    pub fn detached(
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    ) -> Self {
        Self {
            pid: None,
            started_at: Utc::now(),
            child: None,
            stdout,
            stderr,
        }
    }

    /// Take the worker's standard output descriptor.
    pub fn take_stdout(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stdout.take()
    }

    /// Take the worker's standard error descriptor.
    pub fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.stderr.take()
    }

    /// Ask the kernel to kill the process. Best effort; the process is also
    /// killed when the handle is dropped.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// Trait for worker process launchers.
///
/// Isolates are pure execution engines: they spawn and kill processes and
/// know nothing about pools, queues or channels.
#[async_trait]
pub trait Isolate: Send + Sync {
    /// Isolate type identifier (e.g., "process", "mock").
    fn isolate_type(&self) -> &'static str;

    /// Spawn a worker process.
    async fn spawn(&self, options: SpawnOptions) -> Result<WorkerHandle>;
}

/// Spawns workers as plain child processes.
pub struct ProcessIsolate;

#[async_trait]
impl Isolate for ProcessIsolate {
    fn isolate_type(&self) -> &'static str {
        "process"
    }

    async fn spawn(&self, options: SpawnOptions) -> Result<WorkerHandle> {
        if !options.executable.exists() {
            return Err(IsolateError::ExecutableNotFound(
                options.executable.display().to_string(),
            ));
        }

        let mut cmd = Command::new(&options.executable);
        cmd.args(&options.args)
            .envs(&options.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| IsolateError::StartFailed(e.to_string()))?;

        let pid = child.id();
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn AsyncRead + Send + Unpin>);

        Ok(WorkerHandle {
            pid,
            started_at: Utc::now(),
            child: Some(child),
            stdout,
            stderr,
        })
    }
}

/// How the mock isolate reacts to a spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Produce a worker handle with a scriptable output stream.
    Ready,
    /// Fail the spawn.
    Fail,
    /// Never complete the spawn. Useful for testing timeout enforcement.
    Pending,
}

/// Mock isolate for testing.
pub struct MockIsolate {
    behavior: MockBehavior,
    spawns: Mutex<Vec<SpawnOptions>>,
    outputs: Mutex<Vec<tokio::io::DuplexStream>>,
}

impl MockIsolate {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            spawns: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
        }
    }

    /// Options of every spawn requested so far, in order.
    pub fn spawns(&self) -> Vec<SpawnOptions> {
        self.spawns.lock().unwrap().clone()
    }

    /// Number of spawns requested so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    /// Write ends of the output streams handed out so far, in spawn order.
    /// Feeding one of these simulates worker output.
    pub fn take_outputs(&self) -> Vec<tokio::io::DuplexStream> {
        std::mem::take(&mut *self.outputs.lock().unwrap())
    }
}

#[async_trait]
impl Isolate for MockIsolate {
    fn isolate_type(&self) -> &'static str {
        "mock"
    }

    async fn spawn(&self, options: SpawnOptions) -> Result<WorkerHandle> {
        self.spawns.lock().unwrap().push(options.clone());

        match self.behavior {
            MockBehavior::Ready => {
                let (feed, output) = tokio::io::duplex(4096);
                self.outputs.lock().unwrap().push(feed);
                Ok(WorkerHandle::detached(Some(Box::new(output)), None))
            }
            MockBehavior::Fail => Err(IsolateError::StartFailed("mock spawn failure".into())),
            MockBehavior::Pending => {
                std::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}
