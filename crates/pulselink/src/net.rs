// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket plumbing shared by discovery and transport.
//!
//! Consolidates endpoint classification, port-range probing, multicast
//! group management and the socket options applied before handing sockets
//! to the event loops.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

// ============================================================================
// Endpoint classification
// ============================================================================

/// Query targets grouped by transport class.
#[derive(Debug, Default)]
pub struct TargetSets {
    /// IPv4 multicast groups.
    pub multicast_v4: Vec<SocketAddr>,
    /// IPv6 multicast groups.
    pub multicast_v6: Vec<SocketAddr>,
    /// Non-multicast addresses, assumed to be broadcast targets (IPv4).
    pub broadcast: Vec<SocketAddr>,
}

/// Split a mixed target list by family and multicast-ness.
///
/// Addresses of a disabled family are dropped. A non-multicast address is
/// assumed to be a valid broadcast address; anything else would reach at
/// most one outlet.
pub fn classify_targets(
    addrs: &[IpAddr],
    port: u16,
    allow_v4: bool,
    allow_v6: bool,
) -> TargetSets {
    let mut sets = TargetSets::default();
    for addr in addrs {
        match addr {
            IpAddr::V4(_) if !allow_v4 => continue,
            IpAddr::V6(_) if !allow_v6 => continue,
            _ => {}
        }
        let ep = SocketAddr::new(*addr, port);
        match addr {
            IpAddr::V4(v4) if v4.is_multicast() => sets.multicast_v4.push(ep),
            IpAddr::V6(v6) if v6.is_multicast() => sets.multicast_v6.push(ep),
            IpAddr::V4(_) => sets.broadcast.push(ep),
            // a non-multicast v6 target can only be reached as plain unicast
            IpAddr::V6(_) => sets.broadcast.push(ep),
        }
    }
    sets
}

/// Rewrite an IPv4 target as v4-mapped IPv6 so a dual-stack socket can
/// reach it.
pub fn to_v6_mapped(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(v4) => SocketAddr::new(IpAddr::V6(v4.to_ipv6_mapped()), addr.port()),
        IpAddr::V6(_) => addr,
    }
}

// ============================================================================
// Receive socket and port-range probing
// ============================================================================

/// Open the discovery receive socket.
///
/// If IPv6 is allowed, a v6 socket is opened with `v6_only` set to the
/// negation of the IPv4 flag, so both-families-enabled yields a dual-stack
/// socket. When that fails the socket falls back to plain IPv4; with IPv4
/// disabled too there is nothing left to run on.
pub fn open_recv_socket(allow_v4: bool, allow_v6: bool) -> Result<(Socket, bool)> {
    if allow_v6 {
        match open_v6_recv(allow_v4) {
            Ok(sock) => return Ok((sock, true)),
            Err(e) => {
                log::warn!("[net] couldn't open IPv6 socket: {}", e);
                if !allow_v4 {
                    return Err(Error::NoTransport);
                }
            }
        }
    }
    if !allow_v4 {
        return Err(Error::NoTransport);
    }
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    Ok((sock, false))
}

fn open_v6_recv(allow_v4: bool) -> io::Result<Socket> {
    let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    // dual stack when v4 is also enabled; fails on v6-only kernels
    sock.set_only_v6(!allow_v4)?;
    Ok(sock)
}

/// Bind a UDP socket to a port in `base_port..base_port + port_range`.
///
/// When every in-range port is taken the socket falls back to an ephemeral
/// port with a warning; discovery still works, the port is just not one a
/// firewall rule would know about.
pub fn bind_udp_in_range(sock: &Socket, v6: bool, base_port: u16, port_range: u16) -> Result<u16> {
    let any: IpAddr = if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    for port in base_port..base_port.saturating_add(port_range) {
        match sock.bind(&SocketAddr::new(any, port).into()) {
            Ok(()) => return Ok(port),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    log::warn!(
        "[net] could not bind to a port in {}..{}; using a randomly assigned one",
        base_port,
        base_port.saturating_add(port_range)
    );
    sock.bind(&SocketAddr::new(any, 0).into())?;
    let port = sock
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .ok_or_else(|| Error::Bind("no local address after bind".into()))?;
    Ok(port)
}

/// Bind and listen a TCP acceptor on a port in the probing range.
///
/// At most `retries` ports are attempted; acceptors do not fall back to
/// ephemeral ports since the bound port is advertised through discovery.
pub fn bind_tcp_in_range(
    v6: bool,
    base_port: u16,
    port_range: u16,
    retries: u16,
) -> Result<(TcpListener, u16)> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let any: IpAddr = if v6 {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let attempts = port_range.min(retries);
    for port in base_port..base_port.saturating_add(attempts) {
        let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if v6 {
            // the v4 acceptor owns the v4 side of the range
            let _ = sock.set_only_v6(true);
        }
        match sock.bind(&SocketAddr::new(any, port).into()) {
            Ok(()) => {
                sock.listen(128)?;
                return Ok((sock.into(), port));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Bind(format!(
        "no free TCP port in {}..{}",
        base_port,
        base_port.saturating_add(attempts)
    )))
}

// ============================================================================
// Sender sockets
// ============================================================================

/// Open a multicast sender for one family and join every group.
///
/// Groups that cannot be joined are logged and skipped; a socket for which
/// no join succeeded is discarded (`None`).
pub fn open_multicast_sender(
    v6: bool,
    groups: &[SocketAddr],
    ttl: u32,
) -> Option<UdpSocket> {
    let domain = if v6 { Domain::IPV6 } else { Domain::IPV4 };
    let sock = match Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[net] cannot open UDP multicast socket: {}", e);
            return None;
        }
    };

    if v6 {
        let _ = sock.set_multicast_hops_v6(ttl);
        let _ = sock.set_multicast_loop_v6(true);
    } else {
        let _ = sock.set_multicast_ttl_v4(ttl);
        let _ = sock.set_multicast_loop_v4(true);
    }

    let mut any_join_succeeded = false;
    for group in groups {
        let joined = match group.ip() {
            IpAddr::V4(g) => join_v4_group(&sock, &g),
            IpAddr::V6(g) => sock.join_multicast_v6(&g, 0).is_ok(),
        };
        if joined {
            any_join_succeeded = true;
        } else {
            log::warn!("[net] cannot join multicast group {}", group.ip());
        }
    }
    if !any_join_succeeded {
        return None;
    }
    Some(sock.into())
}

/// Join a v4 group on every suitable interface, falling back to the
/// unspecified interface when none are known.
fn join_v4_group(sock: &Socket, group: &Ipv4Addr) -> bool {
    let interfaces = multicast_interfaces();
    if interfaces.is_empty() {
        return sock.join_multicast_v4(group, &Ipv4Addr::UNSPECIFIED).is_ok();
    }
    let mut ok = false;
    for iface in &interfaces {
        match sock.join_multicast_v4(group, iface) {
            Ok(()) => ok = true,
            // already joined on the same physical NIC
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => ok = true,
            Err(e) => {
                log::debug!(
                    "[net] join_multicast_v4({}) on {} failed (non-fatal): {}",
                    group,
                    iface,
                    e
                );
            }
        }
    }
    ok
}

/// Open an IPv4 sender with SO_BROADCAST enabled.
pub fn open_broadcast_sender() -> io::Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_broadcast(true)?;
    sock.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0).into())?;
    Ok(sock.into())
}

/// Open a plain unicast sender for one family.
pub fn open_unicast_sender(v6: bool) -> io::Result<UdpSocket> {
    let (domain, any): (Domain, IpAddr) = if v6 {
        (Domain::IPV6, IpAddr::V6(Ipv6Addr::UNSPECIFIED))
    } else {
        (Domain::IPV4, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.bind(&SocketAddr::new(any, 0).into())?;
    Ok(sock.into())
}

/// Apply configured SO_SNDBUF/SO_RCVBUF sizes; 0 keeps the OS default.
pub fn apply_buffer_sizes(sock: &Socket, send: usize, recv: usize) {
    if send > 0 {
        if let Err(e) = sock.set_send_buffer_size(send) {
            log::warn!("[net] failed to set send buffer size {}: {}", send, e);
        }
    }
    if recv > 0 {
        if let Err(e) = sock.set_recv_buffer_size(recv) {
            log::warn!("[net] failed to set receive buffer size {}: {}", recv, e);
        }
    }
}

/// Apply SO_SNDBUF/SO_RCVBUF to an already-connected stream by raw fd.
#[cfg(unix)]
pub fn apply_raw_buffer_sizes(fd: std::os::fd::RawFd, send: usize, recv: usize) {
    if send == 0 && recv == 0 {
        return;
    }
    // SAFETY: the fd belongs to the caller's live socket and is only
    // borrowed for the duration of this call
    let fd = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let sock = socket2::SockRef::from(&fd);
    if send > 0 {
        if let Err(e) = sock.set_send_buffer_size(send) {
            log::warn!("[net] failed to set send buffer size {}: {}", send, e);
        }
    }
    if recv > 0 {
        if let Err(e) = sock.set_recv_buffer_size(recv) {
            log::warn!("[net] failed to set receive buffer size {}: {}", recv, e);
        }
    }
}

// ============================================================================
// Host identity
// ============================================================================

/// All non-loopback IPv4 interfaces suitable for multicast.
pub fn multicast_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[net] failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
        .collect()
}

/// Best-effort hostname of this machine.
pub fn hostname() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    if let Ok(contents) = std::fs::read_to_string("/etc/hostname") {
        let name = contents.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    "localhost".to_string()
}
