// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-connection client session: protocol state machine, feed
//! negotiation and the sample transfer pump.
//!
//! The state machine runs on the server's event loop:
//!
//! ```text
//! READ_COMMAND -> "LSL:shortinfo"   -> READ_QUERY -> write shortinfo -> close
//!              -> "LSL:fullinfo"    -> write fullinfo -> close
//!              -> "LSL:streamfeed"  -> READ_FEEDPARAMS (protocol 100)
//!              -> "LSL:streamfeed/V"-> READ_FEEDPARAMS (protocol V)
//!              -> anything else     -> close
//! READ_FEEDPARAMS -> negotiate -> write feedheader -> STREAMING | close
//! ```
//!
//! Once the feed header is flushed the session either spawns a dedicated
//! transfer thread (the pump) or hands its socket to the synchronous
//! fan-out set. The pump serializes samples into a chunk buffer and, on
//! every flush point, posts exactly one write to the event loop and parks
//! on a condition variable until the loop reports the outcome - one
//! outstanding write per session, by construction.

use std::io::{self, Read, Write};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::buffer::ConsumerQueue;
use crate::config::{LEGACY_PROTOCOL_VERSION, PROTOCOL_MAJOR_GAIN};
use crate::info::ChannelFormat;
use crate::query::{FULLINFO_VERB, SHORTINFO_VERB, STREAMFEED_VERB};
use crate::sample::{
    can_convert_endian, measure_endian_performance, native_byte_order, write_portable_string,
    Sample,
};

use super::server::{Command, ServerShared};

// ============================================================================
// Shared session state (event loop + pump + in-flight table)
// ============================================================================

/// State shared between the loop-owned session, its transfer pump and the
/// server's in-flight table. Dropping the last reference deregisters the
/// session.
pub(crate) struct SessionShared {
    /// Session id, also the key in the in-flight table.
    pub id: u64,
    /// Outcome slot of the one outstanding write.
    transfer: Mutex<Option<io::Result<usize>>>,
    transfer_done: Condvar,
    server: Weak<ServerShared>,
}

impl SessionShared {
    pub fn new(id: u64, server: Weak<ServerShared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            transfer: Mutex::new(None),
            transfer_done: Condvar::new(),
            server,
        })
    }

    /// Report the outcome of the posted write and wake the pump.
    pub fn complete_write(&self, outcome: io::Result<usize>) {
        *self.transfer.lock() = Some(outcome);
        self.transfer_done.notify_all();
    }

    /// Park until the event loop reports the write outcome.
    fn await_write(&self) -> io::Result<usize> {
        let mut slot = self.transfer.lock();
        loop {
            if let Some(outcome) = slot.take() {
                return outcome;
            }
            self.transfer_done.wait(&mut slot);
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if let Some(server) = self.server.upgrade() {
            server.inflight.lock().remove(&self.id);
            log::debug!("[tcp] session {} deregistered", self.id);
        }
    }
}

// ============================================================================
// Loop-side session
// ============================================================================

/// Transfer parameters fixed by negotiation.
#[derive(Debug, Clone)]
pub(crate) struct PumpParams {
    pub data_protocol_version: u32,
    pub reverse_byte_order: bool,
    pub suppress_subnormals: bool,
    pub max_buffered: i64,
    pub max_samples_per_chunk: usize,
}

/// What the event loop should do with a session after servicing it.
pub(crate) enum Control {
    Keep,
    Close,
    /// Feed header flushed: start the transfer path with these parameters.
    StartTransfer(PumpParams),
}

enum AfterWrite {
    Close,
    StartTransfer(PumpParams),
}

enum Phase {
    ReadCommand,
    ReadQuery,
    ReadFeedParams { protocol: u32, uid: String },
    /// Flush the write queue, then act.
    Draining(AfterWrite),
    /// Pump running; writes arrive as commands.
    Streaming,
}

/// One accepted connection, owned by the server's event loop.
pub(crate) struct Session {
    pub stream: mio::net::TcpStream,
    pub shared: Arc<SessionShared>,
    read_buf: Vec<u8>,
    write_queue: Vec<u8>,
    write_offset: usize,
    /// Length of the pump chunk currently being flushed, if any.
    pending_write: Option<usize>,
    phase: Phase,
}

impl Session {
    pub fn new(stream: mio::net::TcpStream, shared: Arc<SessionShared>) -> Self {
        Self {
            stream,
            shared,
            read_buf: Vec::new(),
            write_queue: Vec::new(),
            write_offset: 0,
            pending_write: None,
            phase: Phase::ReadCommand,
        }
    }

    /// Mark the feed header as delivered and the pump as attached.
    pub fn set_streaming(&mut self) {
        self.phase = Phase::Streaming;
    }

    /// Queue a pump chunk for writing. At most one chunk is in flight; the
    /// pump guarantees that by waiting for the previous outcome.
    pub fn start_write(&mut self, data: Vec<u8>) {
        self.pending_write = Some(data.len());
        self.write_queue = data;
        self.write_offset = 0;
    }

    /// True when a pump write is waiting for its outcome.
    pub fn has_pending_write(&self) -> bool {
        self.pending_write.is_some()
    }

    /// Drain inbound data and advance the state machine.
    pub fn on_readable(&mut self, server: &Arc<ServerShared>) -> Control {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    log::debug!("[tcp] session {}: peer closed", self.shared.id);
                    return Control::Close;
                }
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("[tcp] session {}: read error: {}", self.shared.id, e);
                    return Control::Close;
                }
            }
        }
        self.advance(server)
    }

    /// Make write progress; on completion perform the deferred action or
    /// report the pump outcome.
    pub fn on_writable(&mut self) -> Control {
        while self.write_offset < self.write_queue.len() {
            match self.stream.write(&self.write_queue[self.write_offset..]) {
                Ok(0) => return self.write_failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.write_offset += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Control::Keep,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return self.write_failed(e),
            }
        }
        if !self.write_queue.is_empty() {
            self.write_queue.clear();
            self.write_offset = 0;
            if let Some(len) = self.pending_write.take() {
                self.shared.complete_write(Ok(len));
            }
            if let Phase::Draining(_) = self.phase {
                // take the deferred action now that the bytes are out
                let after = match std::mem::replace(&mut self.phase, Phase::ReadCommand) {
                    Phase::Draining(after) => after,
                    _ => unreachable!(),
                };
                return match after {
                    AfterWrite::Close => Control::Close,
                    AfterWrite::StartTransfer(params) => Control::StartTransfer(params),
                };
            }
        }
        Control::Keep
    }

    /// Fail a pump write (if one is pending) and close.
    pub fn write_failed(&mut self, e: io::Error) -> Control {
        log::debug!("[tcp] session {}: write error: {}", self.shared.id, e);
        if self.pending_write.take().is_some() {
            self.shared.complete_write(Err(e));
        }
        Control::Close
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn advance(&mut self, server: &Arc<ServerShared>) -> Control {
        loop {
            match &self.phase {
                Phase::ReadCommand => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None => return Control::Keep,
                    };
                    match self.dispatch_command(&line, server) {
                        Some(ctrl) => return ctrl,
                        None => continue,
                    }
                }
                Phase::ReadQuery => {
                    let query = match self.take_line() {
                        Some(line) => line,
                        None => return Control::Keep,
                    };
                    return self.answer_query(&query, server);
                }
                Phase::ReadFeedParams { protocol, uid } => {
                    let protocol = *protocol;
                    let uid = uid.clone();
                    let block = if protocol >= 110 {
                        match self.take_header_block() {
                            Some(block) => block,
                            None => return Control::Keep,
                        }
                    } else {
                        match self.take_line() {
                            Some(line) => line,
                            None => return Control::Keep,
                        }
                    };
                    return self.negotiate(protocol, &uid, &block, server);
                }
                Phase::Draining(_) => return Control::Keep,
                Phase::Streaming => {
                    // inbound data during streaming carries no meaning
                    self.read_buf.clear();
                    return Control::Keep;
                }
            }
        }
    }

    /// Pop one CRLF-terminated line off the read buffer.
    fn take_line(&mut self) -> Option<String> {
        let pos = find_subsequence(&self.read_buf, b"\r\n")?;
        let line = String::from_utf8_lossy(&self.read_buf[..pos]).trim().to_string();
        self.read_buf.drain(..pos + 2);
        Some(line)
    }

    /// Pop a blank-line-terminated header block off the read buffer.
    fn take_header_block(&mut self) -> Option<String> {
        if self.read_buf.starts_with(b"\r\n") {
            self.read_buf.drain(..2);
            return Some(String::new());
        }
        let pos = find_subsequence(&self.read_buf, b"\r\n\r\n")?;
        let block = String::from_utf8_lossy(&self.read_buf[..pos + 2]).to_string();
        self.read_buf.drain(..pos + 4);
        Some(block)
    }

    /// Handle the request line; `None` keeps stepping the machine.
    fn dispatch_command(&mut self, line: &str, server: &Arc<ServerShared>) -> Option<Control> {
        if line == SHORTINFO_VERB {
            self.phase = Phase::ReadQuery;
            None
        } else if line == FULLINFO_VERB {
            self.enqueue(server.fullinfo_msg.as_bytes());
            self.phase = Phase::Draining(AfterWrite::Close);
            Some(Control::Keep)
        } else if line == STREAMFEED_VERB {
            self.phase = Phase::ReadFeedParams {
                protocol: LEGACY_PROTOCOL_VERSION,
                uid: String::new(),
            };
            None
        } else if let Some(rest) = line.strip_prefix("LSL:streamfeed/") {
            let mut parts = rest.split_whitespace();
            let protocol: u32 = match parts.next().and_then(|v| v.parse().ok()) {
                Some(v) => v,
                None => {
                    log::debug!("[tcp] session {}: bad streamfeed version", self.shared.id);
                    return Some(Control::Close);
                }
            };
            let uid = parts.next().unwrap_or("").to_string();
            self.phase = Phase::ReadFeedParams { protocol, uid };
            None
        } else {
            log::debug!(
                "[tcp] session {}: unknown request '{}'",
                self.shared.id,
                line
            );
            Some(Control::Close)
        }
    }

    /// Shortinfo query: reply only when the stream matches, close either
    /// way.
    fn answer_query(&mut self, query: &str, server: &Arc<ServerShared>) -> Control {
        match server.info.matches_query(query) {
            Ok(true) => {
                self.enqueue(server.shortinfo_msg.as_bytes());
                self.phase = Phase::Draining(AfterWrite::Close);
                Control::Keep
            }
            Ok(false) => {
                log::debug!(
                    "[tcp] session {}: got a shortinfo query for the wrong query",
                    self.shared.id
                );
                Control::Close
            }
            Err(e) => {
                log::debug!("[tcp] session {}: bad query: {}", self.shared.id, e);
                Control::Close
            }
        }
    }

    // ------------------------------------------------------------------
    // Feed negotiation
    // ------------------------------------------------------------------

    fn negotiate(
        &mut self,
        request_protocol_version: u32,
        request_uid: &str,
        params_block: &str,
        server: &Arc<ServerShared>,
    ) -> Control {
        let our_version = server.config.use_protocol_version;

        // reject protocol majors newer than ours
        if request_protocol_version / PROTOCOL_MAJOR_GAIN > our_version / PROTOCOL_MAJOR_GAIN {
            log::debug!(
                "[tcp] session {}: request for too new protocol {}",
                self.shared.id,
                request_protocol_version
            );
            self.enqueue(format!("LSL/{} 505 Version not supported", our_version).as_bytes());
            self.phase = Phase::Draining(AfterWrite::Close);
            return Control::Keep;
        }
        // reject mismatched stream UIDs
        if !request_uid.is_empty() && request_uid != server.info.uid {
            self.enqueue(format!("LSL/{} 404 Not found", our_version).as_bytes());
            self.phase = Phase::Draining(AfterWrite::Close);
            return Control::Keep;
        }

        let info = &server.info;
        let format = info.channel_format;

        let mut params = FeedParams::new(request_protocol_version, info.channel_bytes());
        if request_protocol_version >= 110 {
            params.parse_headers(params_block);
        } else {
            params.parse_legacy_line(params_block);
        }

        // agree on the least common denominator protocol version
        let mut data_protocol_version = our_version.min(params.protocol_version);
        // downgrade to the portable protocol when a binary transfer could
        // be lossy: value sizes differ, or floats are not IEEE-754 on
        // either side
        if format != ChannelFormat::String && info.channel_bytes() != params.value_size {
            data_protocol_version = LEGACY_PROTOCOL_VERSION;
        }
        if (format.is_float() && !format.is_ieee754()) || !params.has_ieee754_floats {
            data_protocol_version = LEGACY_PROTOCOL_VERSION;
        }

        let mut use_byte_order = native_byte_order();
        let mut reverse_byte_order = false;
        let mut suppress_subnormals = false;
        if data_protocol_version >= 110 {
            // flip the byte order only when it differs, conversion is
            // supported and wide enough to matter, and we are measurably
            // faster at converting than the client
            if native_byte_order() != params.byte_order
                && can_convert_endian(params.byte_order, params.value_size)
                && params.value_size > 1
                && measure_endian_performance() > params.endian_performance
            {
                use_byte_order = params.byte_order;
                reverse_byte_order = true;
            }
            suppress_subnormals = format.carries_subnormals() && !params.supports_subnormals;
        }

        // the 1.00 handshake carries no response block
        if request_protocol_version >= 110 {
            let response = format!(
                "LSL/{} 200 OK\r\nUID: {}\r\nByte-Order: {}\r\nSuppress-Subnormals: {}\r\nData-Protocol-Version: {}\r\n\r\n",
                our_version,
                info.uid,
                use_byte_order,
                if suppress_subnormals { 1 } else { 0 },
                data_protocol_version,
            );
            self.enqueue(response.as_bytes());
        }

        // feed header: in the portable protocol the shortinfo message
        // itself, then two test-pattern samples so the client can verify
        // framing and endianness before live data
        let mut header = Vec::new();
        if data_protocol_version == LEGACY_PROTOCOL_VERSION {
            write_portable_string(&mut header, &server.shortinfo_msg);
        }
        for offset in [4, 2] {
            let mut pattern = Sample::new(format, info.channel_count, 0.0, false);
            pattern.assign_test_pattern(offset);
            pattern.serialize_into(
                &mut header,
                data_protocol_version,
                reverse_byte_order,
                suppress_subnormals,
            );
        }
        self.enqueue(&header);
        log::debug!(
            "[tcp] session {}: negotiated protocol {} (reverse={}, suppress={})",
            self.shared.id,
            data_protocol_version,
            reverse_byte_order,
            suppress_subnormals
        );

        let max_samples_per_chunk = if params.max_chunk_length > 0 {
            params.max_chunk_length as usize
        } else if server.config.chunk_size > 0 {
            server.config.chunk_size as usize
        } else {
            usize::MAX
        };
        self.phase = Phase::Draining(AfterWrite::StartTransfer(PumpParams {
            data_protocol_version,
            reverse_byte_order,
            suppress_subnormals,
            max_buffered: params.max_buffer_length,
            max_samples_per_chunk,
        }));
        Control::Keep
    }

    fn enqueue(&mut self, data: &[u8]) {
        self.write_queue.extend_from_slice(data);
    }
}

// ============================================================================
// Feed parameter parsing
// ============================================================================

/// Client-supplied feed parameters with their assumed defaults.
struct FeedParams {
    byte_order: u32,
    endian_performance: f64,
    has_ieee754_floats: bool,
    supports_subnormals: bool,
    value_size: usize,
    max_buffer_length: i64,
    max_chunk_length: i64,
    protocol_version: u32,
}

impl FeedParams {
    fn new(request_protocol_version: u32, our_value_size: usize) -> Self {
        Self {
            byte_order: 1234,
            endian_performance: 0.0,
            has_ieee754_floats: true,
            supports_subnormals: true,
            value_size: our_value_size,
            max_buffer_length: 0,
            max_chunk_length: 0,
            protocol_version: request_protocol_version,
        }
    }

    /// Parse `key: value` header lines; keys are case-insensitive and `;`
    /// introduces a comment.
    fn parse_headers(&mut self, block: &str) {
        for raw_line in block.lines() {
            let mut line = raw_line.to_ascii_lowercase();
            if let Some(semicolon) = line.find(';') {
                line.truncate(semicolon);
            }
            let Some(colon) = line.find(':') else {
                if !line.trim().is_empty() {
                    log::debug!("[tcp] request line '{}' contained no key-value pair", raw_line);
                }
                continue;
            };
            let key = line[..colon].trim().to_string();
            let value = line[colon + 1..].trim().to_string();
            match key.as_str() {
                "native-byte-order" => parse_into(&value, &mut self.byte_order),
                "endian-performance" => parse_into(&value, &mut self.endian_performance),
                "has-ieee754-floats" => self.has_ieee754_floats = parse_bool(&value),
                "supports-subnormals" => self.supports_subnormals = parse_bool(&value),
                "value-size" => parse_into(&value, &mut self.value_size),
                "max-buffer-length" => parse_into(&value, &mut self.max_buffer_length),
                "max-chunk-length" => parse_into(&value, &mut self.max_chunk_length),
                "protocol-version" => parse_into(&value, &mut self.protocol_version),
                _ => {}
            }
        }
    }

    /// Legacy 1.00 parameter line: `<max_buffered> <chunk_granularity>`.
    fn parse_legacy_line(&mut self, line: &str) {
        let mut parts = line.split_whitespace();
        if let Some(v) = parts.next().and_then(|v| v.parse().ok()) {
            self.max_buffer_length = v;
        }
        if let Some(v) = parts.next().and_then(|v| v.parse().ok()) {
            self.max_chunk_length = v;
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) {
    if let Ok(parsed) = value.parse() {
        *slot = parsed;
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "1" | "true")
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

// ============================================================================
// Transfer pump
// ============================================================================

/// Body of the per-session transfer thread.
///
/// Blocks on the consumer queue, serializes samples into the feed buffer
/// and flushes a chunk whenever a sample demands pushthrough or the chunk
/// limit is reached. Wakeup pings are skipped (they exist so shutdown can
/// unblock the pop). Exits when serving has ended, the server is gone, or
/// a write fails; on exit it eagerly asks the loop to drop the session.
pub(crate) fn transfer_samples_thread(
    shared: Arc<SessionShared>,
    server: Weak<ServerShared>,
    queue: Arc<ConsumerQueue>,
    params: PumpParams,
    cmd_tx: crossbeam::channel::Sender<Command>,
    waker: Arc<mio::Waker>,
) {
    let mut feed: Vec<u8> = Vec::new();
    let mut samples_in_chunk = 0usize;

    loop {
        // serving ended or the outlet is gone: stop pumping
        let serving = match server.upgrade() {
            Some(server) => !server.shutdown.load(Ordering::SeqCst),
            None => false,
        };
        if !serving {
            break;
        }

        let sample = queue.pop_sample();
        if sample.wakeup {
            continue;
        }
        sample.serialize_into(
            &mut feed,
            params.data_protocol_version,
            params.reverse_byte_order,
            params.suppress_subnormals,
        );
        samples_in_chunk += 1;

        if sample.pushthrough || samples_in_chunk >= params.max_samples_per_chunk {
            let chunk = std::mem::take(&mut feed);
            if cmd_tx
                .send(Command::StartWrite {
                    session: shared.id,
                    data: chunk,
                })
                .is_err()
            {
                break; // event loop is gone
            }
            let _ = waker.wake();
            match shared.await_write() {
                Ok(_written) => {
                    samples_in_chunk = 0;
                }
                Err(e) => {
                    log::debug!("[tcp] session {}: transfer ended: {}", shared.id, e);
                    break;
                }
            }
        }
    }

    // eager deregistration so the loop notices without waiting for the
    // weak handle to expire
    if cmd_tx
        .send(Command::CloseSession { session: shared.id })
        .is_ok()
    {
        let _ = waker.wake();
    }
    log::debug!("[tcp] session {}: transfer thread exiting", shared.id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_params_parsing() {
        let mut params = FeedParams::new(110, 4);
        params.parse_headers(
            "Native-Byte-Order: 4321\r\n\
             Endian-Performance: 125.5 ; measured\r\n\
             Has-IEEE754-Floats: 0\r\n\
             Supports-Subnormals: false\r\n\
             Value-Size: 8\r\n\
             Max-Buffer-Length: 360\r\n\
             Max-Chunk-Length: 32\r\n\
             Protocol-Version: 110\r\n",
        );
        assert_eq!(params.byte_order, 4321);
        assert_eq!(params.endian_performance, 125.5);
        assert!(!params.has_ieee754_floats);
        assert!(!params.supports_subnormals);
        assert_eq!(params.value_size, 8);
        assert_eq!(params.max_buffer_length, 360);
        assert_eq!(params.max_chunk_length, 32);
        assert_eq!(params.protocol_version, 110);
    }

    #[test]
    fn test_feed_params_defaults_survive_junk() {
        let mut params = FeedParams::new(110, 4);
        params.parse_headers("this line has no colon\r\nvalue-size: notanumber\r\n");
        assert_eq!(params.value_size, 4);
        assert_eq!(params.byte_order, 1234);
        assert!(params.has_ieee754_floats);
    }

    #[test]
    fn test_legacy_params_line() {
        let mut params = FeedParams::new(100, 4);
        params.parse_legacy_line("360 16");
        assert_eq!(params.max_buffer_length, 360);
        assert_eq!(params.max_chunk_length, 16);
    }

    #[test]
    fn test_find_subsequence() {
        assert_eq!(find_subsequence(b"abc\r\ndef", b"\r\n"), Some(3));
        assert_eq!(find_subsequence(b"abcdef", b"\r\n"), None);
        assert_eq!(find_subsequence(b"a\r\n\r\nb", b"\r\n\r\n"), Some(1));
    }
}
