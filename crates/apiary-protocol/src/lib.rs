// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire protocol shared by the apiary node, its clients and its workers.
//!
//! A single socket carries many logical channels, so every frame names the
//! channel it belongs to. Control messages (handshake, heartbeat, terminate,
//! invoke, choke, error, enqueue) carry JSON bodies; `chunk` frames carry
//! opaque bytes that the node relays verbatim.

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError, FramedStream, MessageType, read_frame, write_frame};
pub use messages::{Enqueue, ErrorBody, Handshake, Invoke, Terminate};

/// The control channel: frames that are not bound to a request channel.
pub const CONTROL_CHANNEL: u64 = 0;
