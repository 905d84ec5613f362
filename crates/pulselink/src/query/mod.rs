// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Query language and discovery datagram codec.
//!
//! # Supported syntax
//!
//! ```text
//! predicate ::= comparison
//!             | predicate AND predicate
//!             | predicate OR predicate
//!             | NOT predicate
//!             | '(' predicate ')'
//!             | '*'
//!
//! comparison ::= attribute ('=' | '!=' | '<>') quoted_literal
//! ```
//!
//! Every query sent over the wire is conjoined with the local session id,
//! so deployments only see their own outlets.
//!
//! # Wire format
//!
//! Request datagram:
//!
//! ```text
//! LSL:shortinfo\r\n
//! <query>\r\n
//! <reply_port> <query_id>\r\n
//! ```
//!
//! Response datagram: `<query_id>\n<shortinfo XML block>`. The query id is
//! the decimal rendering of a stable 64-bit hash of the exact query string;
//! an attempt only accepts responses carrying its own id, so replies to
//! stale or foreign queries are dropped without parsing the payload.

mod evaluator;
mod parser;

pub use parser::{parse_predicate, Operator, Predicate};

use crate::error::{Error, Result};

/// Request verb for compact stream metadata (UDP discovery and TCP).
pub const SHORTINFO_VERB: &str = "LSL:shortinfo";
/// Request verb for extended stream metadata (TCP only).
pub const FULLINFO_VERB: &str = "LSL:fullinfo";
/// Request verb opening a sample feed (TCP only).
pub const STREAMFEED_VERB: &str = "LSL:streamfeed";

/// Validate that a query parses as a predicate.
///
/// Ill-formed queries are rejected here, before any I/O happens.
pub fn check_query(query: &str) -> Result<Predicate> {
    parse_predicate(query)
}

/// Build the wire query for a predicate or a property/value pair.
///
/// Produces `session_id='<sid>'`, `session_id='<sid>' and <pred>` or
/// `session_id='<sid>' and <prop>='<value>'`.
pub fn build_query(session_id: &str, pred_or_prop: Option<&str>, value: Option<&str>) -> String {
    let mut query = String::with_capacity(64);
    query.push_str("session_id='");
    query.push_str(session_id);
    query.push('\'');
    if let Some(pred) = pred_or_prop {
        query.push_str(" and ");
        query.push_str(pred);
        if let Some(value) = value {
            query.push_str("='");
            query.push_str(value);
            query.push('\'');
        }
    }
    query
}

/// Short stable id for a query string: decimal FNV-1a 64.
///
/// Only per-process stability is required (responders echo the id they were
/// sent), but a deterministic hash keeps captured datagrams reproducible.
pub fn query_id(query: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in query.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash.to_string()
}

/// A parsed discovery request datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// The wire query (already conjoined with the sender's session id).
    pub query: String,
    /// Port the sender bound its receive socket to.
    pub reply_port: u16,
    /// Query id the response must echo.
    pub query_id: String,
}

/// Build a request datagram.
pub fn build_request(query: &str, reply_port: u16) -> String {
    let mut msg = String::with_capacity(query.len() + 48);
    msg.push_str(SHORTINFO_VERB);
    msg.push_str("\r\n");
    msg.push_str(query);
    msg.push_str("\r\n");
    msg.push_str(&reply_port.to_string());
    msg.push(' ');
    msg.push_str(&query_id(query));
    msg.push_str("\r\n");
    msg
}

/// Parse a request datagram received by a responder.
pub fn parse_request(datagram: &[u8]) -> Result<QueryRequest> {
    let text = std::str::from_utf8(datagram)
        .map_err(|_| Error::Protocol("request datagram is not UTF-8".into()))?;
    let mut lines = text.lines();
    let verb = lines
        .next()
        .ok_or_else(|| Error::Protocol("empty request datagram".into()))?;
    if verb.trim() != SHORTINFO_VERB {
        return Err(Error::Protocol(format!("unknown verb '{}'", verb.trim())));
    }
    let query = lines
        .next()
        .ok_or_else(|| Error::Protocol("request datagram lacks a query line".into()))?
        .trim()
        .to_string();
    let reply_line = lines
        .next()
        .ok_or_else(|| Error::Protocol("request datagram lacks a reply line".into()))?;
    let mut parts = reply_line.split_whitespace();
    let reply_port: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| Error::Protocol("bad reply port".into()))?;
    let query_id = parts
        .next()
        .ok_or_else(|| Error::Protocol("missing query id".into()))?
        .to_string();
    Ok(QueryRequest {
        query,
        reply_port,
        query_id,
    })
}

/// Build a response datagram for a matching stream.
pub fn build_response(query_id: &str, shortinfo: &str) -> String {
    let mut msg = String::with_capacity(query_id.len() + 1 + shortinfo.len());
    msg.push_str(query_id);
    msg.push('\n');
    msg.push_str(shortinfo);
    msg
}

/// Split a response datagram into `(returned_id, shortinfo payload)`.
///
/// Returns `Ok(None)` when the datagram carries a different query id (a
/// reply to a stale or foreign query); `Err` when it is structurally
/// malformed.
pub fn parse_response<'a>(datagram: &'a [u8], expected_id: &str) -> Result<Option<&'a str>> {
    let text = std::str::from_utf8(datagram)
        .map_err(|_| Error::Protocol("response datagram is not UTF-8".into()))?;
    let newline = text
        .find('\n')
        .ok_or_else(|| Error::Protocol("no payload after query id".into()))?;
    let returned_id = text[..newline].trim();
    if returned_id != expected_id {
        return Ok(None);
    }
    Ok(Some(&text[newline + 1..]))
}
