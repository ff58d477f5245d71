// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed bodies for control frames.
//!
//! Chunk frames have no body type: their payload is opaque and relayed
//! verbatim between clients and workers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::CONTROL_CHANNEL;
use crate::frame::{Frame, FrameError, MessageType};

/// Worker presents itself on its control connection after spawning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Identity the worker was spawned with.
    pub uuid: String,
}

/// Graceful termination request sent to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminate {
    pub code: String,
    pub reason: String,
}

/// Opens a new channel on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoke {
    /// Event name to be processed.
    pub event: String,
}

/// Error on a channel or a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Client submits a new invocation on the application endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enqueue {
    /// Event name to be processed.
    pub event: String,
}

impl Frame {
    /// Worker handshake on the control channel.
    pub fn handshake(uuid: &str) -> Result<Self, FrameError> {
        Frame::with_body(
            MessageType::Handshake,
            CONTROL_CHANNEL,
            &Handshake { uuid: uuid.into() },
        )
    }

    /// Worker liveness signal.
    pub fn heartbeat() -> Self {
        Frame::bare(MessageType::Heartbeat, CONTROL_CHANNEL)
    }

    /// Graceful termination request.
    pub fn terminate(code: &str, reason: &str) -> Result<Self, FrameError> {
        Frame::with_body(
            MessageType::Terminate,
            CONTROL_CHANNEL,
            &Terminate {
                code: code.into(),
                reason: reason.into(),
            },
        )
    }

    /// Channel open request.
    pub fn invoke(channel: u64, event: &str) -> Result<Self, FrameError> {
        Frame::with_body(
            MessageType::Invoke,
            channel,
            &Invoke {
                event: event.into(),
            },
        )
    }

    /// Half-close of a channel.
    pub fn choke(channel: u64) -> Self {
        Frame::bare(MessageType::Choke, channel)
    }

    /// Error on a channel.
    pub fn error(channel: u64, code: &str, message: &str) -> Result<Self, FrameError> {
        Frame::with_body(
            MessageType::Error,
            channel,
            &ErrorBody {
                code: code.into(),
                message: message.into(),
            },
        )
    }

    /// New invocation on the application endpoint.
    pub fn enqueue(event: &str) -> Result<Self, FrameError> {
        Frame::with_body(
            MessageType::Enqueue,
            CONTROL_CHANNEL,
            &Enqueue {
                event: event.into(),
            },
        )
    }

    /// Chunk of opaque data on a channel.
    pub fn data(channel: u64, payload: impl Into<Bytes>) -> Self {
        Frame::chunk(channel, payload.into())
    }
}
