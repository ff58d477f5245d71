// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application endpoints: filesystem sockets for clients and workers.
//!
//! The client endpoint accepts exactly one method, `enqueue(event)`, and
//! then relays frames opaquely in both directions. The worker endpoint
//! accepts connections from spawned workers and routes their handshake to
//! the pending slave with the matching identity.

use std::path::Path;
use std::time::Duration;

use apiary_protocol::messages::{Enqueue, Handshake};
use apiary_protocol::{CONTROL_CHANNEL, Frame, MessageType, read_frame, write_frame};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::overseer::OverseerHandle;
use crate::slave::Session;

/// How long a fresh connection may take to present its first frame.
const GREETING_TIMEOUT: Duration = Duration::from_secs(30);

fn bind(path: &Path) -> std::io::Result<UnixListener> {
    // A stale socket file from a previous run would fail the bind.
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    UnixListener::bind(path)
}

/// Bind the client endpoint and start accepting invocations.
pub fn bind_client(path: &Path, overseer: OverseerHandle) -> std::io::Result<JoinHandle<()>> {
    let listener = bind(path)?;
    info!(endpoint = %path.display(), "client endpoint bound");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let overseer = overseer.clone();
                    tokio::spawn(async move {
                        handle_client(stream, overseer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "client endpoint accept failed");
                }
            }
        }
    }))
}

/// Bind the worker endpoint and start routing handshakes.
pub fn bind_worker(path: &Path, overseer: OverseerHandle) -> std::io::Result<JoinHandle<()>> {
    let listener = bind(path)?;
    info!(endpoint = %path.display(), "worker endpoint bound");

    Ok(tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let overseer = overseer.clone();
                    tokio::spawn(async move {
                        handle_worker(stream, overseer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "worker endpoint accept failed");
                }
            }
        }
    }))
}

async fn handle_client(stream: UnixStream, overseer: OverseerHandle) {
    let (mut reader, mut writer) = stream.into_split();

    let frame = match tokio::time::timeout(GREETING_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!(error = %e, "client connection dropped before enqueue");
            return;
        }
        Err(_) => {
            debug!("client connection timed out before enqueue");
            return;
        }
    };

    if frame.message_type != MessageType::Enqueue {
        let _ = respond_error(&mut writer, Error::InvalidState).await;
        return;
    }
    let enqueue: Enqueue = match frame.decode_body() {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "malformed enqueue body");
            let _ = respond_error(&mut writer, Error::InvalidState).await;
            return;
        }
    };

    // Frames queued for this client drain through a dedicated writer task.
    // The sender lives in the pending invocation and later in the slave's
    // load map; the stream closes once the last clone is gone.
    let (downstream, mut rx) = mpsc::unbounded_channel::<Frame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    match overseer
        .enqueue(enqueue.event.clone(), Box::new(reader), downstream.clone())
        .await
    {
        Ok(()) => {
            debug!(event = %enqueue.event, "invocation accepted");
        }
        Err(error) => {
            debug!(event = %enqueue.event, error = %error, "invocation rejected");
            if let Ok(frame) = Frame::error(CONTROL_CHANNEL, error.code(), &error.to_string()) {
                let _ = downstream.send(frame);
            }
        }
    }
}

async fn handle_worker(stream: UnixStream, overseer: OverseerHandle) {
    let (mut reader, writer) = stream.into_split();

    let frame = match tokio::time::timeout(GREETING_TIMEOUT, read_frame(&mut reader)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => {
            debug!(error = %e, "worker connection dropped before handshake");
            return;
        }
        Err(_) => {
            debug!("worker connection timed out before handshake");
            return;
        }
    };

    if frame.message_type != MessageType::Handshake {
        debug!(message_type = ?frame.message_type, "worker connection sent no handshake");
        return;
    }
    let handshake: Handshake = match frame.decode_body() {
        Ok(body) => body,
        Err(e) => {
            debug!(error = %e, "malformed handshake body");
            return;
        }
    };

    let session = Session::from_parts(Box::new(reader), Box::new(writer));
    if let Err(error) = overseer.activate(handshake.uuid.clone(), session).await {
        warn!(slave_id = %handshake.uuid, error = %error, "handshake rejected");
    }
}

async fn respond_error<W>(writer: &mut W, error: Error) -> Result<(), apiary_protocol::FrameError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = Frame::error(CONTROL_CHANNEL, error.code(), &error.to_string())?;
    write_frame(writer, &frame).await
}
