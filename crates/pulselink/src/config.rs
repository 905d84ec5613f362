// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Global configuration - single source of truth.
//!
//! This module centralizes all wire-protocol constants and the runtime
//! configuration that every subsystem consumes. **Never hardcode elsewhere!**
//!
//! - **Level 1 (static)**: compile-time constants (protocol versions, default
//!   ports, buffer sizes).
//! - **Level 2 (dynamic)**: [`ApiConfig`] for per-deployment settings
//!   (session id, peers, timeouts), shared as `Arc<ApiConfig>`.

use std::time::Duration;

// =======================================================================
// Protocol versions
// =======================================================================

/// Highest stream protocol version this build speaks.
///
/// Version 1.10 adds binary-transfer negotiation (byte order, IEEE-754
/// capability, subnormal handling). Encoded on the wire as `110`.
pub const PROTOCOL_VERSION: u32 = 110;

/// Legacy portable-binary protocol version (`LSL:streamfeed` without a
/// version suffix). All scalars travel in the portable archive format.
pub const LEGACY_PROTOCOL_VERSION: u32 = 100;

/// Major-version granularity used when checking client requests.
pub const PROTOCOL_MAJOR_GAIN: u32 = 100;

// =======================================================================
// Well-known ports
// =======================================================================

/// Default UDP port that discovery queries are sent to.
pub const MULTICAST_PORT: u16 = 16571;

/// First port of the probing range used for receive sockets and data
/// acceptors. The range covers `BASE_PORT..BASE_PORT + PORT_RANGE`.
pub const BASE_PORT: u16 = 16572;

/// Number of ports probed before falling back to an ephemeral port.
pub const PORT_RANGE: u16 = 32;

/// Acceptor bind retries before construction fails.
pub const ACCEPTOR_BIND_RETRIES: u16 = 10;

// =======================================================================
// Buffers and scratch sizes
// =======================================================================

/// Scratch buffer for inbound discovery datagrams. Larger replies are
/// truncated by the OS and will fail to parse, which is intended.
pub const DATAGRAM_SCRATCH_BYTES: usize = 65536;

/// Get/put buffer size of the cancellable byte stream.
pub const STREAM_BUFFER_BYTES: usize = 16384;

/// Putback reserve kept at the front of the stream get buffer.
pub const STREAM_PUTBACK_BYTES: usize = 8;

// =======================================================================
// Discovery timing defaults (seconds)
// =======================================================================

/// Minimum spacing between unicast query waves.
pub const UNICAST_MIN_RTT: f64 = 0.75;

/// Minimum spacing between multicast query waves.
pub const MULTICAST_MIN_RTT: f64 = 0.25;

/// Extra wave spacing applied in continuous resolve mode.
pub const CONTINUOUS_RESOLVE_INTERVAL: f64 = 0.5;

/// Default multicast TTL (link-local scope).
pub const MULTICAST_TTL: u32 = 1;

// =======================================================================
// Runtime configuration
// =======================================================================

/// Runtime configuration for one deployment.
///
/// A value of this type is built once at startup and shared (via `Arc`)
/// with the resolver, the query responder and the TCP server. Field
/// semantics follow the configuration keys of the ecosystem config file;
/// defaults match the ecosystem-wide values so independently configured
/// hosts can see each other out of the box.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Deployment scope: conjoined into every outgoing query, so only
    /// outlets with the same session id are visible.
    pub session_id: String,
    /// Hostnames/addresses probed with unicast queries in addition to the
    /// multicast groups.
    pub known_peers: Vec<String>,
    /// Multicast group addresses (non-multicast entries are treated as
    /// broadcast targets).
    pub multicast_addresses: Vec<String>,
    /// UDP port queried during discovery.
    pub multicast_port: u16,
    /// TTL/hop limit for outgoing multicast queries.
    pub multicast_ttl: u32,
    /// First port of the receive/data port probing range.
    pub base_port: u16,
    /// Width of the port probing range.
    pub port_range: u16,
    /// Allow IPv4 sockets.
    pub allow_ipv4: bool,
    /// Allow IPv6 sockets.
    pub allow_ipv6: bool,
    /// Minimum spacing between unicast waves, in seconds.
    pub unicast_min_rtt: f64,
    /// Minimum spacing between multicast waves, in seconds.
    pub multicast_min_rtt: f64,
    /// Additional wave spacing in continuous mode, in seconds.
    pub continuous_resolve_interval: f64,
    /// Re-match every response against the query before accepting it
    /// (defense against cross-talk from other resolvers).
    pub validate_query_responses: bool,
    /// Cap for the negotiated protocol version.
    pub use_protocol_version: u32,
    /// SO_SNDBUF for data sockets; 0 keeps the OS default.
    pub socket_send_buffer_size: usize,
    /// SO_RCVBUF for data sockets; 0 keeps the OS default.
    pub socket_receive_buffer_size: usize,
    /// Server-side chunk granularity (samples); 0 means unbounded.
    pub chunk_size: u32,
    /// Collapse all per-session transfer threads into the blocking
    /// fan-out path.
    pub sync_transfer: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            session_id: "default".to_string(),
            known_peers: Vec::new(),
            multicast_addresses: vec![
                // link-local and organization scope groups, v4 and v6
                "224.0.0.183".to_string(),
                "239.255.172.215".to_string(),
                "ff02::113d:6fdd:2c17:a643".to_string(),
                "ff05::113d:6fdd:2c17:a643".to_string(),
            ],
            multicast_port: MULTICAST_PORT,
            multicast_ttl: MULTICAST_TTL,
            base_port: BASE_PORT,
            port_range: PORT_RANGE,
            allow_ipv4: true,
            allow_ipv6: true,
            unicast_min_rtt: UNICAST_MIN_RTT,
            multicast_min_rtt: MULTICAST_MIN_RTT,
            continuous_resolve_interval: CONTINUOUS_RESOLVE_INTERVAL,
            validate_query_responses: false,
            use_protocol_version: PROTOCOL_VERSION,
            socket_send_buffer_size: 0,
            socket_receive_buffer_size: 0,
            chunk_size: 0,
            sync_transfer: false,
        }
    }
}

impl ApiConfig {
    /// Config with ecosystem defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the session id (builder style).
    #[must_use]
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Set the unicast peer list (builder style).
    #[must_use]
    pub fn with_known_peers(mut self, peers: Vec<String>) -> Self {
        self.known_peers = peers;
        self
    }

    /// Restrict the socket families (builder style).
    #[must_use]
    pub fn with_families(mut self, allow_ipv4: bool, allow_ipv6: bool) -> Self {
        self.allow_ipv4 = allow_ipv4;
        self.allow_ipv6 = allow_ipv6;
        self
    }

    /// Highest protocol major version this config will negotiate.
    pub fn protocol_major(&self) -> u32 {
        self.use_protocol_version / PROTOCOL_MAJOR_GAIN
    }

    /// Wave spacing for one-shot resolves.
    pub fn oneshot_waves(&self) -> (Duration, Duration) {
        (
            secs(self.unicast_min_rtt),
            secs(self.multicast_min_rtt),
        )
    }

    /// Wave spacing for continuous resolves (lengthened so a permanently
    /// running resolver doesn't saturate the network).
    pub fn continuous_waves(&self) -> (Duration, Duration) {
        (
            secs(self.unicast_min_rtt + self.continuous_resolve_interval),
            secs(self.multicast_min_rtt + self.continuous_resolve_interval),
        )
    }
}

/// Convert a non-negative seconds value into a `Duration`, clamping
/// negatives to zero.
pub fn secs(s: f64) -> Duration {
    if s <= 0.0 || !s.is_finite() {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(s)
    }
}
