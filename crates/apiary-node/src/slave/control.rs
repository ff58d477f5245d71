// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker control session plumbing.

use apiary_protocol::Frame;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// A bound worker connection, split into its two halves.
pub struct Session {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Session {
    /// Split a duplex stream into a session.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    pub fn from_parts(
        reader: Box<dyn AsyncRead + Send + Unpin>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Self {
        Self { reader, writer }
    }
}

/// Dispatcher for frames directed at an activated worker.
///
/// All frames funnel through one queue, so for a given channel the worker
/// observes them in submission order.
#[derive(Clone)]
pub struct ControlHandle {
    tx: mpsc::UnboundedSender<Frame>,
}

impl ControlHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Frame>) -> Self {
        Self { tx }
    }

    /// Queue a frame for the worker. Returns false once the session is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }
}
