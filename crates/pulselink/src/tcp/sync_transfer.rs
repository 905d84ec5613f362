// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Synchronous fan-out transfer path.
//!
//! In latency-sensitive deployments the per-session pump threads are
//! collapsed into this handler: the outlet thread itself serializes one
//! chunk and fans it out to every handed-off socket with blocking writes.
//! This trades fairness (one slow consumer stalls the push for everyone)
//! for deterministic push latency.

use std::io::{self, Write};
use std::net::TcpStream;

use parking_lot::Mutex;

/// Set of sockets served by blocking fan-out writes.
pub struct SyncTransferHandler {
    /// Sockets added since the last push; merged at the next
    /// `write_all_blocking`, mirroring the deferred add of the session
    /// handoff.
    pending: Mutex<Vec<TcpStream>>,
    sockets: Mutex<Vec<TcpStream>>,
}

impl SyncTransferHandler {
    /// Empty fan-out set.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
        }
    }

    /// Schedule a handed-off socket to join the set at the next push.
    pub fn add_socket(&self, stream: TcpStream) {
        self.pending.lock().push(stream);
    }

    /// Number of sockets currently in the set (pending included).
    pub fn socket_count(&self) -> usize {
        self.sockets.lock().len() + self.pending.lock().len()
    }

    /// Write the same scatter-buffer list to every socket.
    ///
    /// Per-socket outcome: success keeps the socket; broken pipe or
    /// connection reset closes and removes it after the pass; a timeout
    /// (an aborted push) keeps the socket and only skips this chunk; any
    /// other error is logged at error level and the socket kept.
    pub fn write_all_blocking(&self, bufs: &[&[u8]]) {
        let mut sockets = self.sockets.lock();
        sockets.append(&mut self.pending.lock());

        let mut any_session_broken = false;
        let mut broken = vec![false; sockets.len()];
        for (idx, sock) in sockets.iter_mut().enumerate() {
            match write_bufs(sock, bufs) {
                Ok(()) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::BrokenPipe
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    log::warn!("[tcp/sync] broken pipe / connection reset, closing socket");
                    let _ = sock.shutdown(std::net::Shutdown::Both);
                    broken[idx] = true;
                    any_session_broken = true;
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    log::info!("[tcp/sync] socket wasn't fast enough, push skipped");
                }
                Err(e) => {
                    log::error!("[tcp/sync] unhandled fan-out write error: {}", e);
                }
            }
        }

        if any_session_broken {
            let mut idx = 0;
            sockets.retain(|_| {
                let keep = !broken[idx];
                idx += 1;
                keep
            });
        }
    }
}

impl Default for SyncTransferHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn write_bufs(sock: &mut TcpStream, bufs: &[&[u8]]) -> io::Result<()> {
    for buf in bufs {
        sock.write_all(buf)?;
    }
    sock.flush()
}
