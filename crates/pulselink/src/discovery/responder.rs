// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outlet-side UDP query responder.
//!
//! Every outlet runs one responder per listening socket: one bound to the
//! well-known multicast port (joined to the configured groups, so it sees
//! multicast and broadcast queries) and one bound inside the data port
//! range (the target of unicast queries from peers that know this host).
//! A request whose query matches the outlet's stream info is answered
//! with `<query_id>\n<shortinfo>` sent to the requester's advertised
//! reply port. Everything else on the wire is logged at debug and dropped.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::{ApiConfig, DATAGRAM_SCRATCH_BYTES};
use crate::error::Result;
use crate::info::StreamInfo;
use crate::net;
use crate::query;

/// How the responder's socket is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderMode {
    /// Bound to the shared multicast port with the groups joined;
    /// receives multicast and broadcast queries.
    Multicast,
    /// Bound to a port in the data port range; receives unicast queries.
    Unicast,
}

/// Background thread answering discovery queries for one outlet.
pub struct QueryResponder {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    port: u16,
}

impl QueryResponder {
    /// Bind the socket for `mode` and start serving.
    pub fn start(
        info: Arc<StreamInfo>,
        config: Arc<ApiConfig>,
        mode: ResponderMode,
    ) -> Result<Self> {
        let (sock, port) = match mode {
            ResponderMode::Multicast => open_multicast_listener(&config)?,
            ResponderMode::Unicast => {
                let (raw, v6) = net::open_recv_socket(config.allow_ipv4, config.allow_ipv6)?;
                let port = net::bind_udp_in_range(&raw, v6, config.base_port, config.port_range)?;
                (raw.into(), port)
            }
        };
        sock.set_read_timeout(Some(Duration::from_millis(200)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shortinfo = info.to_shortinfo_message();
        let handle = thread::Builder::new()
            .name("pulselink-responder".to_string())
            .spawn({
                let shutdown = Arc::clone(&shutdown);
                move || responder_loop(sock, info, shortinfo, shutdown)
            })
            .map_err(crate::error::Error::Io)?;

        log::debug!("[responder] serving {:?} queries on port {}", mode, port);
        Ok(Self {
            shutdown,
            handle: Some(handle),
            port,
        })
    }

    /// Port the responder is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signal the thread to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QueryResponder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bind the shared multicast port (with address reuse, so several outlets
/// coexist on one host) and join the configured v4 groups.
fn open_multicast_listener(config: &ApiConfig) -> Result<(UdpSocket, u16)> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    let _ = sock.set_reuse_port(true);
    sock.bind(
        &SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.multicast_port).into(),
    )?;
    let _ = sock.set_multicast_loop_v4(true);

    let sock: UdpSocket = sock.into();
    for addr in &config.multicast_addresses {
        if let Ok(IpAddr::V4(group)) = addr.parse::<IpAddr>() {
            if !group.is_multicast() {
                continue;
            }
            let interfaces = net::multicast_interfaces();
            if interfaces.is_empty() {
                if let Err(e) = sock.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED) {
                    log::debug!("[responder] cannot join group {}: {}", group, e);
                }
            } else {
                for iface in interfaces {
                    if let Err(e) = sock.join_multicast_v4(&group, &iface) {
                        log::debug!(
                            "[responder] cannot join group {} on {}: {}",
                            group,
                            iface,
                            e
                        );
                    }
                }
            }
        }
    }
    let port = config.multicast_port;
    Ok((sock, port))
}

fn responder_loop(
    sock: UdpSocket,
    info: Arc<StreamInfo>,
    shortinfo: String,
    shutdown: Arc<AtomicBool>,
) {
    let mut scratch = vec![0u8; DATAGRAM_SCRATCH_BYTES];
    loop {
        if shutdown.load(Ordering::Relaxed) {
            log::debug!("[responder] shutdown signal received, stopping");
            break;
        }
        let (len, remote) = match sock.recv_from(&mut scratch) {
            Ok(received) => received,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                log::warn!("[responder] receive error: {}", e);
                break;
            }
        };

        let request = match query::parse_request(&scratch[..len]) {
            Ok(req) => req,
            Err(e) => {
                log::debug!("[responder] dropping malformed datagram from {}: {}", remote, e);
                continue;
            }
        };
        let predicate = match query::check_query(&request.query) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("[responder] unparseable query from {}: {}", remote, e);
                continue;
            }
        };
        if !info.matches_parsed(&predicate) {
            continue;
        }

        let reply = query::build_response(&request.query_id, &shortinfo);
        let reply_to = SocketAddr::new(remote.ip(), request.reply_port);
        if let Err(e) = sock.send_to(reply.as_bytes(), reply_to) {
            log::debug!("[responder] reply to {} failed: {}", reply_to, e);
        }
    }
}
