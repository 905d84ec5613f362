// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! One running resolve attempt.
//!
//! An attempt owns its sockets, its wave schedule and its result map, and
//! is driven by a single-threaded mio poll loop: drain response datagrams,
//! fire query waves whose deadline passed, re-check the done predicate
//! after every receive, stop when done or cancelled. Cross-thread
//! cancellation goes through an atomic flag plus a poll waker so a cancel
//! issued from any thread interrupts a parked loop immediately.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::config::{ApiConfig, DATAGRAM_SCRATCH_BYTES};
use crate::error::Result;
use crate::info::StreamInfo;
use crate::net;
use crate::query::{self, Predicate};

/// Token of the receive socket.
const RECV_TOKEN: Token = Token(0);
/// Token of the cancellation waker.
const WAKER_TOKEN: Token = Token(1);

/// Poll timeout when no wave or cancel deadline is armed.
const IDLE_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Resolve results: stream UID -> (info, last time a reply was seen).
pub type ResultMap = HashMap<String, (StreamInfo, Instant)>;

// ============================================================================
// Query sender
// ============================================================================

/// One sending socket with its fixed target list.
struct QuerySender {
    sock: UdpSocket,
    targets: Vec<SocketAddr>,
}

impl QuerySender {
    fn new(sock: UdpSocket, targets: Vec<SocketAddr>) -> Self {
        Self { sock, targets }
    }

    /// Send the query to every target; true when at least one send left
    /// the machine. Per-target errors are expected (unreachable subnets)
    /// and only logged at debug.
    fn send_query(&self, msg: &str) -> bool {
        let mut any_successful = false;
        for target in &self.targets {
            match self.sock.send_to(msg.as_bytes(), target) {
                Ok(_) => any_successful = true,
                Err(e) => {
                    log::debug!("[resolver] query send to {} failed: {}", target, e);
                }
            }
        }
        any_successful
    }
}

// ============================================================================
// Attempt handle (shared with the resolver front door)
// ============================================================================

/// Cross-thread view of a running attempt: cancel it, read its results.
#[derive(Clone)]
pub struct AttemptHandle {
    cancelled: Arc<AtomicBool>,
    waker: Arc<Waker>,
    results: Arc<Mutex<ResultMap>>,
}

impl AttemptHandle {
    /// Request destructive shutdown. Idempotent and safe from any thread;
    /// the loop observes the flag at its next wakeup and closes all
    /// sockets before exiting.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.waker.wake() {
                log::debug!("[resolver] cancel wake failed: {}", e);
            }
        }
    }

    /// Whether a cancel has been issued.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// The attempt's result map.
    pub fn results(&self) -> &Arc<Mutex<ResultMap>> {
        &self.results
    }
}

// ============================================================================
// Resolve attempt
// ============================================================================

/// An asynchronous resolve attempt for a single query.
///
/// Life cycle: construct with target lists, arm timers with
/// [`setup_handlers`](Self::setup_handlers), drive with [`run`](Self::run)
/// (on the caller's thread or a dedicated one), read the results once the
/// loop has returned or under the mutex while it runs.
pub struct ResolveAttempt {
    config: Arc<ApiConfig>,
    poll: Poll,
    recv_sock: Option<mio::net::UdpSocket>,
    recv_port: u16,
    scratch: Box<[u8]>,

    cancelled: Arc<AtomicBool>,
    waker: Arc<Waker>,
    results: Arc<Mutex<ResultMap>>,

    query_id: String,
    query_msg: String,
    /// Parsed query, kept only when response validation is enabled.
    validate: Option<Predicate>,

    unicast_senders: Vec<QuerySender>,
    /// Multicast senders per family plus the broadcast sender; they share
    /// one wave schedule.
    mcast_senders: Vec<QuerySender>,

    // wave schedule, armed by setup_handlers
    unicast_wait: Duration,
    multicast_wait: Duration,
    next_unicast: Option<Instant>,
    next_multicast: Option<Instant>,
    cancel_at: Option<Instant>,

    // done-predicate parameters
    minimum: usize,
    resolve_atleast_until: Instant,
}

impl ResolveAttempt {
    /// Set up sockets and the query message for a new attempt.
    ///
    /// `ucast_targets` is the expanded known-peers x port-range list;
    /// `mcast_targets` is the configured multicast/broadcast group list.
    pub fn new(
        ucast_targets: &[SocketAddr],
        mcast_targets: &[IpAddr],
        query: &str,
        config: Arc<ApiConfig>,
    ) -> Result<Self> {
        // receive socket: dual stack when both families are enabled
        let (sock, v6) = net::open_recv_socket(config.allow_ipv4, config.allow_ipv6)?;
        net::apply_buffer_sizes(
            &sock,
            config.socket_send_buffer_size,
            config.socket_receive_buffer_size,
        );
        let recv_port = net::bind_udp_in_range(&sock, v6, config.base_port, config.port_range)?;
        sock.set_nonblocking(true)?;
        let recv_sock = mio::net::UdpSocket::from_std(sock.into());

        let poll = Poll::new()?;
        let mut recv_sock = recv_sock;
        poll.registry()
            .register(&mut recv_sock, RECV_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let targets = net::classify_targets(
            mcast_targets,
            config.multicast_port,
            config.allow_ipv4,
            config.allow_ipv6,
        );

        let validate = if config.validate_query_responses {
            Some(query::check_query(query)?)
        } else {
            None
        };
        let query_id = query::query_id(query);
        let query_msg = query::build_request(query, recv_port);
        log::debug!(
            "[resolver] waiting for query results on port {} for {:?}",
            recv_port,
            query
        );

        let mut unicast_senders = Vec::new();
        if !ucast_targets.is_empty() {
            let v4: Vec<SocketAddr> = ucast_targets
                .iter()
                .filter(|a| a.is_ipv4())
                .copied()
                .collect();
            let v6t: Vec<SocketAddr> = ucast_targets
                .iter()
                .filter(|a| a.is_ipv6())
                .copied()
                .collect();
            if config.allow_ipv4 && !v4.is_empty() {
                match net::open_unicast_sender(false) {
                    Ok(sock) => unicast_senders.push(QuerySender::new(sock, v4)),
                    Err(e) => log::warn!("[resolver] cannot open unicast socket: {}", e),
                }
            }
            if config.allow_ipv6 && !v6t.is_empty() {
                match net::open_unicast_sender(true) {
                    Ok(sock) => unicast_senders.push(QuerySender::new(sock, v6t)),
                    Err(e) => log::warn!("[resolver] cannot open IPv6 unicast socket: {}", e),
                }
            }
        }

        let mut mcast_senders = Vec::new();
        if config.allow_ipv4 && !targets.broadcast.is_empty() {
            match net::open_broadcast_sender() {
                Ok(sock) => mcast_senders.push(QuerySender::new(sock, targets.broadcast.clone())),
                Err(e) => {
                    log::warn!("[resolver] cannot open UDP broadcast socket: {}", e);
                }
            }
        }
        // one sender per family whose allow flag is set and that has groups
        for (is_v6, groups) in [(false, &targets.multicast_v4), (true, &targets.multicast_v6)] {
            if groups.is_empty() {
                continue;
            }
            if let Some(sock) = net::open_multicast_sender(is_v6, groups, config.multicast_ttl) {
                mcast_senders.push(QuerySender::new(sock, groups.clone()));
            }
        }

        let now = Instant::now();
        Ok(Self {
            config,
            poll,
            recv_sock: Some(recv_sock),
            recv_port,
            scratch: vec![0u8; DATAGRAM_SCRATCH_BYTES].into_boxed_slice(),
            cancelled: Arc::new(AtomicBool::new(false)),
            waker,
            results: Arc::new(Mutex::new(HashMap::new())),
            query_id,
            query_msg,
            validate,
            unicast_senders,
            mcast_senders,
            unicast_wait: Duration::ZERO,
            multicast_wait: Duration::ZERO,
            next_unicast: None,
            next_multicast: None,
            cancel_at: None,
            minimum: 0,
            resolve_atleast_until: now,
        })
    }

    /// Port the receive socket ended up bound to.
    pub fn recv_port(&self) -> u16 {
        self.recv_port
    }

    /// Handle for cancelling and reading this attempt from other threads.
    pub fn handle(&self) -> AttemptHandle {
        AttemptHandle {
            cancelled: Arc::clone(&self.cancelled),
            waker: Arc::clone(&self.waker),
            results: Arc::clone(&self.results),
        }
    }

    /// Set the done-predicate goal: stop once `minimum` distinct streams
    /// are known, but never before `minimum_time` has elapsed. A zero
    /// minimum resolves until the cancel deadline.
    pub fn set_goal(&mut self, minimum: usize, minimum_time: Duration) {
        self.minimum = minimum;
        self.resolve_atleast_until = Instant::now() + minimum_time;
    }

    /// Fire the initial query burst and arm the wave/cancel schedule.
    ///
    /// When both a unicast and a multicast sender exist, the first
    /// multicast wave is pushed out by `unicast_min_rtt` so the two waves
    /// interleave instead of colliding.
    pub fn setup_handlers(
        &mut self,
        unicast_wait: Duration,
        mut multicast_wait: Duration,
        cancel_after: Option<Duration>,
    ) {
        let now = Instant::now();
        self.cancel_at = cancel_after.map(|d| now + d);

        if !self.unicast_senders.is_empty() {
            self.unicast_wait = unicast_wait;
            self.next_unicast = Some(now + unicast_wait);
            // delay the next multicast wave by the unicast round trip
            multicast_wait += crate::config::secs(self.config.unicast_min_rtt);
            for sender in &self.unicast_senders {
                sender.send_query(&self.query_msg);
            }
        }
        if !self.mcast_senders.is_empty() {
            self.multicast_wait = multicast_wait;
            self.next_multicast = Some(now + multicast_wait);
            for sender in &self.mcast_senders {
                sender.send_query(&self.query_msg);
            }
        }
    }

    /// Drive the attempt until it is done or cancelled, then close every
    /// socket. The result map stays readable through the handle.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(8);
        loop {
            if self.cancelled.load(Ordering::SeqCst) || self.is_done() {
                break;
            }
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::warn!("[resolver] poll error: {}", e);
                break;
            }
            for event in events.iter() {
                match event.token() {
                    RECV_TOKEN => {
                        if self.drain_datagrams() {
                            // done predicate satisfied mid-drain: stop
                            // without posting another receive
                            self.do_cancel();
                            return;
                        }
                    }
                    WAKER_TOKEN => {
                        // cancel flag is re-checked at the loop head
                    }
                    _ => {}
                }
            }
            self.fire_due_waves();
        }
        self.do_cancel();
    }

    /// Time until the nearest armed deadline.
    fn next_timeout(&self) -> Duration {
        let now = Instant::now();
        [self.next_unicast, self.next_multicast, self.cancel_at]
            .iter()
            .flatten()
            .map(|t| t.saturating_duration_since(now))
            .min()
            .unwrap_or(IDLE_POLL_TIMEOUT)
    }

    /// The attempt is finished when it was cancelled, its deadline passed,
    /// or a positive minimum is satisfied and the soft deadline elapsed.
    fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if let Some(cancel_at) = self.cancel_at {
            if now > cancel_at {
                return true;
            }
        }
        if self.minimum == 0 {
            return false;
        }
        let results = self.results.lock();
        log::debug!(
            "[resolver] checking result set size ({} / {})",
            results.len(),
            self.minimum
        );
        results.len() >= self.minimum && now >= self.resolve_atleast_until
    }

    /// Receive datagrams until the socket runs dry; true when the done
    /// predicate became satisfied after a receive.
    fn drain_datagrams(&mut self) -> bool {
        loop {
            let recv = match &self.recv_sock {
                Some(s) => s,
                None => return false,
            };
            match recv.recv_from(&mut self.scratch) {
                Ok((len, remote)) => {
                    let datagram = self.scratch[..len].to_vec();
                    self.handle_datagram(&datagram, remote);
                    if self.is_done() {
                        return true;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    log::debug!("[resolver] receive error: {}", e);
                    return false;
                }
            }
        }
    }

    /// Process one response datagram: check the query id, parse the
    /// shortinfo block, update the result map. Junk on the wire is logged
    /// and swallowed.
    fn handle_datagram(&mut self, datagram: &[u8], remote: SocketAddr) {
        let payload = match query::parse_response(datagram, &self.query_id) {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                log::debug!("[resolver] dropping reply to a stale query from {}", remote);
                return;
            }
            Err(e) => {
                log::warn!(
                    "[resolver] hiccup while processing received data: {}",
                    e
                );
                return;
            }
        };
        let info = match StreamInfo::from_shortinfo_message(payload) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("[resolver] bad shortinfo from {}: {}", remote, e);
                return;
            }
        };
        if let Some(predicate) = &self.validate {
            if !info.matches_parsed(predicate) {
                log::warn!(
                    "[resolver] received streaminfo from {} doesn't match the query",
                    remote
                );
                return;
            }
        }

        let uid = info.uid.clone();
        let source = canonical_source(remote.ip());
        let now = Instant::now();
        let mut results = self.results.lock();
        let entry = results.entry(uid).or_insert_with(|| (info, now));
        entry.1 = now;
        // record the reply's source address per family, but never override
        // an earlier record: the first route to answer is the faster one
        match source {
            IpAddr::V4(addr) => {
                if entry.0.v4address.is_empty() {
                    entry.0.v4address = addr.to_string();
                }
            }
            IpAddr::V6(addr) => {
                if entry.0.v6address.is_empty() {
                    entry.0.v6address = addr.to_string();
                }
            }
        }
    }

    /// Re-send queries whose wave deadline passed and re-arm the timers.
    fn fire_due_waves(&mut self) {
        let now = Instant::now();
        if let Some(due) = self.next_unicast {
            if now >= due {
                for sender in &self.unicast_senders {
                    sender.send_query(&self.query_msg);
                }
                self.next_unicast = Some(now + self.unicast_wait);
            }
        }
        if let Some(due) = self.next_multicast {
            if now >= due {
                for sender in &self.mcast_senders {
                    sender.send_query(&self.query_msg);
                }
                self.next_multicast = Some(now + self.multicast_wait);
            }
        }
    }

    /// Destructive shutdown: disarm all timers and close every socket.
    /// Idempotent; runs on the attempt's own loop thread.
    fn do_cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.next_unicast = None;
        self.next_multicast = None;
        self.cancel_at = None;
        self.unicast_senders.clear();
        self.mcast_senders.clear();
        if let Some(mut sock) = self.recv_sock.take() {
            if let Err(e) = self.poll.registry().deregister(&mut sock) {
                log::debug!("[resolver] deregister failed: {}", e);
            }
        }
    }
}

impl Drop for ResolveAttempt {
    fn drop(&mut self) {
        // all sockets must be closed by the time the attempt goes away
        self.do_cancel();
    }
}

/// Collapse v4-mapped IPv6 sources to plain IPv4 so the family-qualified
/// address slots stay meaningful on dual-stack receive sockets.
fn canonical_source(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ChannelFormat;

    fn test_config() -> Arc<ApiConfig> {
        let mut cfg = ApiConfig::new();
        // keep unit tests off the production multicast groups
        cfg.multicast_addresses = vec![];
        cfg.base_port = 18800;
        Arc::new(cfg)
    }

    fn announce(attempt: &mut ResolveAttempt, uid: &str, from: SocketAddr) {
        let mut info = StreamInfo::new("a", "EEG", 1, 100.0, ChannelFormat::Float32, "");
        info.uid = uid.into();
        info.session_id = "s".into();
        let wire = query::build_response(&attempt.query_id, &info.to_shortinfo_message());
        attempt.handle_datagram(wire.as_bytes(), from);
    }

    #[test]
    fn test_first_address_per_family_wins() {
        let cfg = test_config();
        let query = "session_id='s'";
        let mut attempt = ResolveAttempt::new(&[], &[], query, cfg).unwrap();

        announce(&mut attempt, "u1", "10.0.0.1:5000".parse().unwrap());
        announce(&mut attempt, "u1", "10.0.0.2:5000".parse().unwrap());
        let results = attempt.results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results["u1"].0.v4address, "10.0.0.1");
    }

    #[test]
    fn test_v4_mapped_source_fills_v4_slot() {
        let cfg = test_config();
        let mut attempt = ResolveAttempt::new(&[], &[], "*", cfg).unwrap();
        announce(&mut attempt, "u1", "[::ffff:10.0.0.9]:5000".parse().unwrap());
        let results = attempt.results.lock();
        assert_eq!(results["u1"].0.v4address, "10.0.0.9");
        assert!(results["u1"].0.v6address.is_empty());
    }

    #[test]
    fn test_last_seen_refreshes_on_repeat() {
        let cfg = test_config();
        let mut attempt = ResolveAttempt::new(&[], &[], "*", cfg).unwrap();
        announce(&mut attempt, "u1", "10.0.0.1:5000".parse().unwrap());
        let first = attempt.results.lock()["u1"].1;
        std::thread::sleep(Duration::from_millis(5));
        announce(&mut attempt, "u1", "10.0.0.1:5000".parse().unwrap());
        let second = attempt.results.lock()["u1"].1;
        assert!(second >= first);
    }

    #[test]
    fn test_stale_query_ids_ignored() {
        let cfg = test_config();
        let mut attempt = ResolveAttempt::new(&[], &[], "*", cfg).unwrap();
        let mut info = StreamInfo::new("a", "EEG", 1, 100.0, ChannelFormat::Float32, "");
        info.uid = "u9".into();
        let wire = query::build_response("999999", &info.to_shortinfo_message());
        attempt.handle_datagram(wire.as_bytes(), "10.0.0.1:5000".parse().unwrap());
        assert!(attempt.results.lock().is_empty());
    }

    #[test]
    fn test_done_predicate_boundaries() {
        let cfg = test_config();
        let mut attempt = ResolveAttempt::new(&[], &[], "*", cfg).unwrap();

        // minimum 0: never done before the deadline
        attempt.set_goal(0, Duration::ZERO);
        attempt.cancel_at = Some(Instant::now() + Duration::from_secs(60));
        assert!(!attempt.is_done());

        // minimum 1, satisfied, no soft deadline
        attempt.set_goal(1, Duration::ZERO);
        announce(&mut attempt, "u1", "10.0.0.1:5000".parse().unwrap());
        assert!(attempt.is_done());

        // minimum satisfied but the soft deadline still holds it open
        attempt.set_goal(1, Duration::from_secs(60));
        assert!(!attempt.is_done());

        // expired hard deadline ends the attempt regardless
        attempt.cancel_at = Some(Instant::now() - Duration::from_millis(1));
        assert!(attempt.is_done());
    }

    #[test]
    fn test_cancel_is_idempotent_and_closes_sockets() {
        let cfg = test_config();
        let mut attempt = ResolveAttempt::new(&[], &[], "*", cfg).unwrap();
        let handle = attempt.handle();
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        attempt.run(); // observes the flag immediately and tears down
        assert!(attempt.recv_sock.is_none());
        assert!(attempt.unicast_senders.is_empty());
        assert!(attempt.mcast_senders.is_empty());
    }

    #[test]
    fn test_validation_rejects_mismatched_info() {
        let mut cfg = ApiConfig::new();
        cfg.multicast_addresses = vec![];
        cfg.base_port = 18830;
        cfg.validate_query_responses = true;
        let query = "session_id='s' and type='Gaze'";
        let mut attempt = ResolveAttempt::new(&[], &[], query, Arc::new(cfg)).unwrap();
        // announced stream is EEG, query wants Gaze: must be dropped
        announce(&mut attempt, "u1", "10.0.0.1:5000".parse().unwrap());
        assert!(attempt.results.lock().is_empty());
    }
}
