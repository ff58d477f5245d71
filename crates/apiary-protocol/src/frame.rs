// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for stream framing.
//!
//! Each frame has the following format:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - 8 bytes: channel id (big-endian; 0 for the control channel)
//! - N bytes: payload (JSON body for control messages, raw bytes for chunks)

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type + 8 bytes channel id)
pub const HEADER_SIZE: usize = 14;

/// Message types for the wire protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Worker presents itself after spawning
    Handshake = 1,
    /// Worker liveness signal
    Heartbeat = 2,
    /// Graceful termination request
    Terminate = 3,
    /// Open a new channel on the worker
    Invoke = 4,
    /// Opaque data on a channel
    Chunk = 5,
    /// Half-close of a channel
    Choke = 6,
    /// Channel or stream error
    Error = 7,
    /// Client submits a new invocation
    Enqueue = 8,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Handshake),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::Terminate),
            4 => Ok(MessageType::Invoke),
            5 => Ok(MessageType::Chunk),
            6 => Ok(MessageType::Choke),
            7 => Ok(MessageType::Error),
            8 => Ok(MessageType::Enqueue),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors that can occur during frame encoding/decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("body decode error: {0}")]
    Body(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message with type, channel id and payload
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub channel: u64,
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame with a JSON body
    pub fn with_body<M: Serialize>(
        message_type: MessageType,
        channel: u64,
        body: &M,
    ) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(body)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            channel,
            payload: Bytes::from(payload),
        })
    }

    /// Create a frame with no payload
    pub fn bare(message_type: MessageType, channel: u64) -> Self {
        Self {
            message_type,
            channel,
            payload: Bytes::new(),
        }
    }

    /// Create a chunk frame carrying opaque bytes
    pub fn chunk(channel: u64, payload: Bytes) -> Self {
        Self {
            message_type: MessageType::Chunk,
            channel,
            payload,
        }
    }

    /// Decode the payload as a JSON body
    pub fn decode_body<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.put_u64(self.channel);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from bytes
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        let message_type = MessageType::try_from(bytes.get_u16())?;
        let channel = bytes.get_u64();

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self {
            message_type,
            channel,
            payload,
        })
    }
}

/// Write a frame to an async writer
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    // Read header
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;
    let channel = u64::from_be_bytes([
        header[6], header[7], header[8], header[9], header[10], header[11], header[12], header[13],
    ]);

    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    // Read payload
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        channel,
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }
}
