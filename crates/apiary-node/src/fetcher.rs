// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pumps a worker output descriptor through the splitter, retaining the tail
//! of recent lines for post-mortem inspection.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::splitter::Splitter;

/// A line longer than this is flushed without waiting for its newline.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const READ_CHUNK: usize = 4096;

/// Asynchronous reader for a worker output descriptor.
///
/// Every complete line is pushed into a bounded ring (oldest evicted on
/// overflow) and re-emitted through the logger tagged with the slave id.
pub struct Fetcher {
    slave_id: String,
    ring: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
    token: CancellationToken,
}

impl Fetcher {
    pub fn new(slave_id: String, ring_capacity: usize) -> Self {
        Self {
            slave_id,
            ring: Arc::new(Mutex::new(VecDeque::with_capacity(ring_capacity))),
            capacity: ring_capacity,
            token: CancellationToken::new(),
        }
    }

    /// Begin reading from the descriptor.
    ///
    /// Runs until EOF, cancellation or a read error. Errors other than EOF
    /// and cancellation are handed to `on_error`; the owning slave uses that
    /// to demote itself.
    pub fn run<R>(
        &self,
        mut descriptor: R,
        on_error: impl FnOnce(std::io::Error) + Send + 'static,
    ) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let slave_id = self.slave_id.clone();
        let ring = self.ring.clone();
        let capacity = self.capacity;
        let token = self.token.clone();

        tokio::spawn(async move {
            let mut splitter = Splitter::new();
            let mut buf = [0u8; READ_CHUNK];

            let error = loop {
                let n = tokio::select! {
                    biased;

                    _ = token.cancelled() => {
                        debug!(slave_id = %slave_id, "output fetcher cancelled");
                        return;
                    }

                    result = descriptor.read(&mut buf) => match result {
                        Ok(0) => {
                            debug!(slave_id = %slave_id, "worker output reached EOF");
                            return;
                        }
                        Ok(n) => n,
                        Err(e) => break e,
                    },
                };

                splitter.consume(&buf[..n]);
                while let Some(line) = splitter.next() {
                    push_line(&ring, capacity, &slave_id, line);
                }
                if splitter.buffered() > MAX_LINE_BYTES {
                    let line = splitter.take_buffered();
                    push_line(&ring, capacity, &slave_id, line);
                }
            };

            on_error(error);
        })
    }

    /// Cancel pending reads; idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Snapshot of the current ring contents, oldest first.
    pub fn tail(&self) -> Vec<String> {
        self.ring.lock().unwrap().iter().cloned().collect()
    }
}

fn push_line(ring: &Mutex<VecDeque<String>>, capacity: usize, slave_id: &str, line: String) {
    debug!(slave_id = %slave_id, line = %line, "worker output");
    let mut ring = ring.lock().unwrap();
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(line);
}
