// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Crate-wide error type.
//!
//! Propagation policy: per-datagram errors during discovery are logged and
//! swallowed (the wire carries junk), per-session errors end that session
//! only, and construction-time configuration errors are fatal to the caller.

use std::fmt;
use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the discovery and transport cores.
#[derive(Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The operation was torn down by a cancel; terminates the affected
    /// chain silently.
    Cancelled,
    /// A one-shot resolve was requested while a continuous resolve is
    /// running on the same instance (or vice versa).
    AlreadyRunning,

    // ========================================================================
    // Queries and protocol
    // ========================================================================
    /// The query string does not parse as a predicate.
    InvalidQuery(String),
    /// A malformed response datagram or TCP header.
    Protocol(String),
    /// The peer rejected our protocol version; carries the highest
    /// version the peer speaks.
    VersionUnsupported(u32),
    /// The requested stream UID is not served by the contacted outlet.
    UidMismatch,

    // ========================================================================
    // Transport and configuration
    // ========================================================================
    /// Underlying socket error.
    Io(io::Error),
    /// Failed to bind a socket within the configured port range.
    Bind(String),
    /// Neither IPv4 nor IPv6 is available.
    NoTransport,
    /// Invalid or inconsistent configuration.
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::AlreadyRunning => {
                write!(f, "resolver is already running in a different mode")
            }
            Error::InvalidQuery(q) => write!(f, "invalid query '{}'", q),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::VersionUnsupported(supported) => {
                write!(f, "protocol version not supported (peer speaks up to {})", supported)
            }
            Error::UidMismatch => write!(f, "requested stream UID not found"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Bind(msg) => write!(f, "bind failed: {}", msg),
            Error::NoTransport => {
                write!(f, "IPv6 support unavailable and IPv4 disabled")
            }
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_contains_context() {
        let e = Error::InvalidQuery("type=".into());
        assert!(e.to_string().contains("type="));

        let e = Error::VersionUnsupported(110);
        assert!(e.to_string().contains("110"));
    }

    #[test]
    fn test_io_error_source_preserved() {
        use std::error::Error as _;
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(e.source().is_some());
    }
}
