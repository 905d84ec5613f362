// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream metadata: identity, channel shape, and the shortinfo/fullinfo
//! XML codec used on the wire.
//!
//! A [`StreamInfo`] has two kinds of state: the logical identity an outlet
//! is created with (name, type, channel shape, nominal rate, source id) and
//! the per-instantiation fields the transport stamps at server start (UID,
//! session id, creation time, hostname, advertised data ports). The UID
//! uniquely identifies one instantiation of a stream; the session id scopes
//! a deployment.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::query::{check_query, Predicate};

// ============================================================================
// Channel format
// ============================================================================

/// Value type of every channel in a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelFormat {
    /// 32-bit IEEE-754 float
    Float32,
    /// 64-bit IEEE-754 float
    Float64,
    /// Variable-length UTF-8 string
    String,
    /// 32-bit signed integer
    Int32,
    /// 16-bit signed integer
    Int16,
    /// 8-bit signed integer
    Int8,
    /// 64-bit signed integer
    Int64,
    /// Unknown/unset format
    Undefined,
}

impl ChannelFormat {
    /// Bytes per value, 0 for variable-length and undefined formats.
    pub fn sample_bytes(self) -> usize {
        match self {
            ChannelFormat::Float32 | ChannelFormat::Int32 => 4,
            ChannelFormat::Float64 | ChannelFormat::Int64 => 8,
            ChannelFormat::Int16 => 2,
            ChannelFormat::Int8 => 1,
            ChannelFormat::String | ChannelFormat::Undefined => 0,
        }
    }

    /// Whether values of this format are floating point.
    pub fn is_float(self) -> bool {
        matches!(self, ChannelFormat::Float32 | ChannelFormat::Float64)
    }

    /// Whether the format can carry subnormal values.
    pub fn carries_subnormals(self) -> bool {
        self.is_float()
    }

    /// Whether this build stores the format as IEEE-754. True for all
    /// supported targets; kept as a table so the negotiation logic reads
    /// the same as the downgrade rules it implements.
    pub fn is_ieee754(self) -> bool {
        !matches!(self, ChannelFormat::Undefined)
    }

    /// Wire name of the format.
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelFormat::Float32 => "float32",
            ChannelFormat::Float64 => "double64",
            ChannelFormat::String => "string",
            ChannelFormat::Int32 => "int32",
            ChannelFormat::Int16 => "int16",
            ChannelFormat::Int8 => "int8",
            ChannelFormat::Int64 => "int64",
            ChannelFormat::Undefined => "undefined",
        }
    }

    /// Parse a wire name back into a format.
    pub fn from_str_wire(s: &str) -> Self {
        match s {
            "float32" => ChannelFormat::Float32,
            "double64" => ChannelFormat::Float64,
            "string" => ChannelFormat::String,
            "int32" => ChannelFormat::Int32,
            "int16" => ChannelFormat::Int16,
            "int8" => ChannelFormat::Int8,
            "int64" => ChannelFormat::Int64,
            _ => ChannelFormat::Undefined,
        }
    }
}

impl fmt::Display for ChannelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Stream info
// ============================================================================

/// Advertised metadata of one stream outlet.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    /// Human-readable stream name (e.g. `BioProbe`).
    pub name: String,
    /// Content type (e.g. `EEG`, `Markers`).
    pub stream_type: String,
    /// Number of channels per sample.
    pub channel_count: u32,
    /// Nominal sampling rate in Hz, 0.0 for irregular streams.
    pub nominal_srate: f64,
    /// Value format of every channel.
    pub channel_format: ChannelFormat,
    /// Stable device/source identifier, may be empty.
    pub source_id: String,
    /// Protocol version of the advertising host.
    pub version: u32,
    /// Creation timestamp on the local clock of the advertising host.
    pub created_at: f64,
    /// Unique id of this stream instantiation.
    pub uid: String,
    /// Deployment session id.
    pub session_id: String,
    /// Hostname of the advertising machine.
    pub hostname: String,
    /// IPv4 address the stream was resolved at (filled by the resolver).
    pub v4address: String,
    /// Advertised IPv4 TCP data port (0 = not served).
    pub v4data_port: u16,
    /// IPv6 address the stream was resolved at (filled by the resolver).
    pub v6address: String,
    /// Advertised IPv6 TCP data port (0 = not served).
    pub v6data_port: u16,
    /// Extended description subtree carried only in fullinfo messages.
    pub desc: String,
}

impl StreamInfo {
    /// New stream info with the given logical identity. Instantiation
    /// fields (uid, session id, timestamps, ports) start empty and are
    /// stamped by the TCP server at start.
    pub fn new(
        name: impl Into<String>,
        stream_type: impl Into<String>,
        channel_count: u32,
        nominal_srate: f64,
        channel_format: ChannelFormat,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            stream_type: stream_type.into(),
            channel_count,
            nominal_srate,
            channel_format,
            source_id: source_id.into(),
            version: crate::config::PROTOCOL_VERSION,
            created_at: 0.0,
            uid: String::new(),
            session_id: String::new(),
            hostname: String::new(),
            v4address: String::new(),
            v4data_port: 0,
            v6address: String::new(),
            v6data_port: 0,
            desc: String::new(),
        }
    }

    /// Assign a fresh instantiation UID.
    pub fn reset_uid(&mut self) {
        self.uid = fresh_uid();
    }

    /// Bytes per channel value.
    pub fn channel_bytes(&self) -> usize {
        self.channel_format.sample_bytes()
    }

    /// Bytes of one full numeric sample (0 for string streams).
    pub fn sample_bytes(&self) -> usize {
        self.channel_bytes() * self.channel_count as usize
    }

    // ------------------------------------------------------------------
    // Query evaluation
    // ------------------------------------------------------------------

    /// Textual value of a queryable attribute.
    pub fn attribute(&self, name: &str) -> Option<String> {
        match name {
            "name" => Some(self.name.clone()),
            "type" => Some(self.stream_type.clone()),
            "channel_count" => Some(self.channel_count.to_string()),
            "nominal_srate" => Some(format_f64(self.nominal_srate)),
            "channel_format" => Some(self.channel_format.as_str().to_string()),
            "source_id" => Some(self.source_id.clone()),
            "uid" => Some(self.uid.clone()),
            "session_id" => Some(self.session_id.clone()),
            "hostname" => Some(self.hostname.clone()),
            _ => None,
        }
    }

    /// Whether this stream satisfies the given query string.
    ///
    /// Returns `Err` when the query does not parse; a non-matching stream
    /// is `Ok(false)`.
    pub fn matches_query(&self, query: &str) -> Result<bool> {
        Ok(self.matches_parsed(&check_query(query)?))
    }

    /// Whether this stream satisfies an already-parsed predicate.
    pub fn matches_parsed(&self, predicate: &Predicate) -> bool {
        predicate.matches(&|attr| self.attribute(attr))
    }

    // ------------------------------------------------------------------
    // Wire codec
    // ------------------------------------------------------------------

    /// Serialize the compact metadata block sent in discovery replies and
    /// shortinfo responses.
    pub fn to_shortinfo_message(&self) -> String {
        let mut out = String::with_capacity(512);
        out.push_str("<?xml version=\"1.0\"?>\n<info>\n");
        push_element(&mut out, "name", &self.name);
        push_element(&mut out, "type", &self.stream_type);
        push_element(&mut out, "channel_count", &self.channel_count.to_string());
        push_element(&mut out, "nominal_srate", &format_f64(self.nominal_srate));
        push_element(&mut out, "channel_format", self.channel_format.as_str());
        push_element(&mut out, "source_id", &self.source_id);
        push_element(&mut out, "version", &self.version.to_string());
        push_element(&mut out, "created_at", &format_f64(self.created_at));
        push_element(&mut out, "uid", &self.uid);
        push_element(&mut out, "session_id", &self.session_id);
        push_element(&mut out, "hostname", &self.hostname);
        push_element(&mut out, "v4address", &self.v4address);
        push_element(&mut out, "v4data_port", &self.v4data_port.to_string());
        push_element(&mut out, "v6address", &self.v6address);
        push_element(&mut out, "v6data_port", &self.v6data_port.to_string());
        out.push_str("</info>\n");
        out
    }

    /// Serialize the extended metadata block served over TCP.
    pub fn to_fullinfo_message(&self) -> String {
        let mut out = self.to_shortinfo_message();
        // splice the <desc> subtree in before the closing tag
        let insert_at = out.rfind("</info>").unwrap_or(out.len());
        let desc = if self.desc.is_empty() {
            "  <desc />\n".to_string()
        } else {
            format!("  <desc>{}</desc>\n", self.desc)
        };
        out.insert_str(insert_at, &desc);
        out
    }

    /// Parse a shortinfo (or fullinfo) message back into a `StreamInfo`.
    ///
    /// Unknown elements are ignored so newer peers stay compatible;
    /// messages without an `<info>` root are a protocol error.
    pub fn from_shortinfo_message(message: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(message)
            .map_err(|e| Error::Protocol(format!("bad stream info XML: {}", e)))?;
        let root = doc.root_element();
        if root.tag_name().name() != "info" {
            return Err(Error::Protocol(format!(
                "expected <info> root, got <{}>",
                root.tag_name().name()
            )));
        }

        let mut fields: HashMap<&str, String> = HashMap::new();
        let mut desc = String::new();
        for child in root.children().filter(|c| c.is_element()) {
            let tag = child.tag_name().name();
            if tag == "desc" {
                desc = child.text().unwrap_or("").to_string();
            } else {
                // first occurrence wins
                fields
                    .entry(tag)
                    .or_insert_with(|| child.text().unwrap_or("").to_string());
            }
        }

        fn take(fields: &mut HashMap<&str, String>, key: &str) -> String {
            fields.remove(key).unwrap_or_default()
        }
        let info = Self {
            name: take(&mut fields, "name"),
            stream_type: take(&mut fields, "type"),
            channel_count: take(&mut fields, "channel_count").parse().unwrap_or(0),
            nominal_srate: take(&mut fields, "nominal_srate").parse().unwrap_or(0.0),
            channel_format: ChannelFormat::from_str_wire(&take(&mut fields, "channel_format")),
            source_id: take(&mut fields, "source_id"),
            version: take(&mut fields, "version").parse().unwrap_or(0),
            created_at: take(&mut fields, "created_at").parse().unwrap_or(0.0),
            uid: take(&mut fields, "uid"),
            session_id: take(&mut fields, "session_id"),
            hostname: take(&mut fields, "hostname"),
            v4address: take(&mut fields, "v4address"),
            v4data_port: take(&mut fields, "v4data_port").parse().unwrap_or(0),
            v6address: take(&mut fields, "v6address"),
            v6data_port: take(&mut fields, "v6data_port").parse().unwrap_or(0),
            desc,
        };
        if info.name.is_empty() && info.uid.is_empty() {
            return Err(Error::Protocol(
                "stream info lacks both name and uid".into(),
            ));
        }
        Ok(info)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn push_element(out: &mut String, tag: &str, value: &str) {
    out.push_str("  <");
    out.push_str(tag);
    if value.is_empty() {
        out.push_str(" />\n");
        return;
    }
    out.push('>');
    xml_escape_into(out, value);
    out.push_str("</");
    out.push_str(tag);
    out.push_str(">\n");
}

fn xml_escape_into(out: &mut String, value: &str) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

/// Render a float without losing precision while keeping integral rates
/// compact (`100` rather than `100.0`).
fn format_f64(v: f64) -> String {
    if v == v.trunc() && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Process-unique instantiation id: wall-clock nanos, pid and a counter.
fn fresh_uid() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() as u64;
    format!(
        "{:08x}-{:04x}-{:04x}-{:012x}",
        nanos as u32,
        (pid & 0xffff) as u16,
        (count & 0xffff) as u16,
        (nanos >> 16) ^ (pid << 40)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> StreamInfo {
        let mut info = StreamInfo::new("BioProbe", "EEG", 32, 500.0, ChannelFormat::Float32, "p1");
        info.reset_uid();
        info.session_id = "lab7".into();
        info.created_at = 123.5;
        info.hostname = "bench-a".into();
        info.v4data_port = 16574;
        info
    }

    #[test]
    fn test_shortinfo_roundtrip() {
        let info = sample_info();
        let msg = info.to_shortinfo_message();
        let parsed = StreamInfo::from_shortinfo_message(&msg).unwrap();
        assert_eq!(parsed, info);
    }

    #[test]
    fn test_fullinfo_carries_desc() {
        let mut info = sample_info();
        info.desc = "manufacturer data".into();
        let msg = info.to_fullinfo_message();
        assert!(msg.contains("<desc>manufacturer data</desc>"));
        let parsed = StreamInfo::from_shortinfo_message(&msg).unwrap();
        assert_eq!(parsed.desc, "manufacturer data");
    }

    #[test]
    fn test_xml_escaping() {
        let mut info = sample_info();
        info.name = "a<b&c".into();
        let parsed = StreamInfo::from_shortinfo_message(&info.to_shortinfo_message()).unwrap();
        assert_eq!(parsed.name, "a<b&c");
    }

    #[test]
    fn test_unknown_elements_ignored() {
        let msg = "<info><name>x</name><uid>u</uid><future_field>y</future_field></info>";
        let parsed = StreamInfo::from_shortinfo_message(msg).unwrap();
        assert_eq!(parsed.name, "x");
        assert_eq!(parsed.uid, "u");
    }

    #[test]
    fn test_malformed_messages_rejected() {
        assert!(StreamInfo::from_shortinfo_message("not xml").is_err());
        assert!(StreamInfo::from_shortinfo_message("<wrong/>").is_err());
        assert!(StreamInfo::from_shortinfo_message("<info></info>").is_err());
    }

    #[test]
    fn test_matches_query_on_attributes() {
        let info = sample_info();
        assert!(info.matches_query("type='EEG'").unwrap());
        assert!(info
            .matches_query("session_id='lab7' and type='EEG'")
            .unwrap());
        assert!(!info
            .matches_query("session_id='other' and type='EEG'")
            .unwrap());
        assert!(info.matches_query("channel_count='32'").unwrap());
        assert!(info.matches_query("*").unwrap());
        assert!(info.matches_query("type=").is_err());
    }

    #[test]
    fn test_built_queries_select_by_every_property() {
        let info = sample_info();
        for prop in [
            "name",
            "type",
            "channel_count",
            "nominal_srate",
            "channel_format",
            "source_id",
            "uid",
            "session_id",
            "hostname",
        ] {
            let value = info.attribute(prop).unwrap();
            let hit = crate::query::build_query("lab7", Some(prop), Some(&value));
            assert!(
                info.matches_query(&hit).unwrap(),
                "query '{}' must match",
                hit
            );
            let miss = crate::query::build_query("lab7", Some(prop), Some("no-such-value"));
            assert!(!info.matches_query(&miss).unwrap());
        }
    }

    #[test]
    fn test_uid_uniqueness() {
        let mut a = sample_info();
        let before = a.uid.clone();
        a.reset_uid();
        assert_ne!(a.uid, before);
    }

    #[test]
    fn test_channel_format_table() {
        assert_eq!(ChannelFormat::Float32.sample_bytes(), 4);
        assert_eq!(ChannelFormat::Float64.sample_bytes(), 8);
        assert_eq!(ChannelFormat::Int16.sample_bytes(), 2);
        assert_eq!(ChannelFormat::String.sample_bytes(), 0);
        assert!(ChannelFormat::Float32.carries_subnormals());
        assert!(!ChannelFormat::Int32.carries_subnormals());
        for fmt in [
            ChannelFormat::Float32,
            ChannelFormat::Float64,
            ChannelFormat::String,
            ChannelFormat::Int32,
            ChannelFormat::Int16,
            ChannelFormat::Int8,
            ChannelFormat::Int64,
        ] {
            assert_eq!(ChannelFormat::from_str_wire(fmt.as_str()), fmt);
        }
    }
}
