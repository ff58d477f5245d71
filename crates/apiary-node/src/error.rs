// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy of the supervision core.
//!
//! Transport and worker-lifecycle errors convert into slave state
//! transitions; admission errors surface to the requesting client as a
//! stream error frame; configuration errors abort the process before any
//! loop runs (see [`crate::config::ConfigError`]).

use thiserror::Error;

/// Result type using the node error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the supervision core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    /// The isolate could not produce a worker process.
    #[error("unable to spawn the worker: {0}")]
    SpawnFailed(String),

    /// The worker process did not start within the startup timeout.
    #[error("the worker did not start within the startup timeout")]
    SpawnTimeout,

    /// The worker did not present its handshake within the startup timeout.
    #[error("the worker did not handshake within the startup timeout")]
    HandshakeTimeout,

    /// A channel was injected into a slave that is not active.
    #[error("the slave is not active")]
    SlaveNotActive,

    /// An operation was attempted in a state that does not permit it.
    #[error("the operation is not permitted in the current state")]
    InvalidState,

    /// I/O error on the worker output descriptor.
    #[error("unable to read the worker output: {0}")]
    OutputReadFailed(String),

    /// The worker control connection closed unexpectedly.
    #[error("the worker has unexpectedly disconnected")]
    WorkerDisconnected,

    /// Graceful termination did not complete in time.
    #[error("the worker did not terminate within the termination timeout")]
    TerminationTimeout,

    /// The pending-invocation queue is at its ceiling.
    #[error("the pending queue is full")]
    QueueFull,

    /// The pool is at its ceiling and cannot grow.
    #[error("the pool is exhausted")]
    PoolExhausted,

    /// The slave retired itself after staying idle past the idle timeout.
    #[error("the slave has been idle for too long")]
    IdleShutdown,

    /// The application or the node is being stopped.
    #[error("the application is shutting down")]
    Shutdown,
}

impl Error {
    /// Wire code for protocol error frames.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SpawnFailed(_) => "SPAWN_FAILED",
            Self::SpawnTimeout => "SPAWN_TIMEOUT",
            Self::HandshakeTimeout => "HANDSHAKE_TIMEOUT",
            Self::SlaveNotActive => "SLAVE_NOT_ACTIVE",
            Self::InvalidState => "INVALID_STATE",
            Self::OutputReadFailed(_) => "OUTPUT_READ_FAILED",
            Self::WorkerDisconnected => "WORKER_DISCONNECTED",
            Self::TerminationTimeout => "TERMINATION_TIMEOUT",
            Self::QueueFull => "QUEUE_FULL",
            Self::PoolExhausted => "POOL_EXHAUSTED",
            Self::IdleShutdown => "IDLE_SHUTDOWN",
            Self::Shutdown => "SHUTDOWN",
        }
    }
}
