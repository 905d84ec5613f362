// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP transport: the outlet-side stream server and the inlet-side
//! cancellable byte stream.
//!
//! ```text
//! +-------------------------------------------------------------+
//! |                        TcpServer                            |
//! |  +------------------------------------------------------+   |
//! |  |                  mio::Poll (one thread)              |   |
//! |  |  - v4/v6 acceptors (port-range probed)               |   |
//! |  |  - per-session reads/writes + negotiation            |   |
//! |  |  - Waker (commands from pumps and the owner)         |   |
//! |  +------------------------------------------------------+   |
//! |        |  chunk writes, acked per session                   |
//! |        v                                                    |
//! |  one transfer pump thread per session                       |
//! |  (or one blocking fan-out set in sync mode)                 |
//! +-------------------------------------------------------------+
//! ```

mod byte_stream;
mod server;
mod session;
mod sync_transfer;

pub use byte_stream::{CancelToken, CancellableByteStream};
pub use server::TcpServer;
pub use sync_transfer::SyncTransferHandler;

use crate::error::{Error, Result};

/// Interpret the status line of a feed response on the inlet side.
///
/// `LSL/<ver> 200 OK` yields the peer's protocol version; the rejection
/// statuses map onto the matching error variants.
pub fn parse_status_line(line: &str) -> Result<u32> {
    let rest = line
        .trim()
        .strip_prefix("LSL/")
        .ok_or_else(|| Error::Protocol(format!("not a status line: '{}'", line.trim())))?;
    let mut parts = rest.splitn(2, ' ');
    let version: u32 = parts
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Error::Protocol("bad version in status line".into()))?;
    let status = parts.next().unwrap_or("").trim();
    let code: u32 = status
        .split(' ')
        .next()
        .and_then(|c| c.parse().ok())
        .ok_or_else(|| Error::Protocol("missing status code".into()))?;
    match code {
        200 => Ok(version),
        404 => Err(Error::UidMismatch),
        505 => Err(Error::VersionUnsupported(version)),
        other => Err(Error::Protocol(format!("unexpected status code {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status_line("LSL/110 200 OK").unwrap(), 110);
        assert!(matches!(
            parse_status_line("LSL/110 404 Not found"),
            Err(Error::UidMismatch)
        ));
        assert!(matches!(
            parse_status_line("LSL/110 505 Version not supported"),
            Err(Error::VersionUnsupported(110))
        ));
        assert!(parse_status_line("HTTP/1.1 200 OK").is_err());
        assert!(parse_status_line("LSL/abc 200 OK").is_err());
    }
}
