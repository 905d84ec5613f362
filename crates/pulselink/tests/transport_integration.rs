// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end TCP transport tests over loopback: control requests, feed
//! negotiation, the sample pump and the synchronous fan-out mode.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pulselink::sample::native_byte_order;
use pulselink::{
    ApiConfig, CancellableByteStream, ChannelFormat, Sample, SendBuffer, StreamInfo, TcpServer,
};

const CHANNELS: u32 = 4;

fn config(base_port: u16) -> Arc<ApiConfig> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cfg = ApiConfig::new().with_session_id("transport-tests");
    cfg.multicast_addresses = vec![];
    cfg.base_port = base_port;
    Arc::new(cfg)
}

fn start_server(cfg: &Arc<ApiConfig>) -> (TcpServer, Arc<SendBuffer>) {
    let info = StreamInfo::new("probe", "EEG", CHANNELS, 250.0, ChannelFormat::Float32, "");
    let buffer = SendBuffer::new();
    let mut server =
        TcpServer::new(info, Arc::clone(&buffer), Arc::clone(cfg)).expect("server must start");
    server.begin_serving().unwrap();
    (server, buffer)
}

fn connect(server: &TcpServer) -> TcpStream {
    let port = server.info().v4data_port;
    assert_ne!(port, 0, "server must advertise a v4 data port");
    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Read until the peer closes, tolerating nothing but EOF.
fn read_to_end(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    stream.read_to_end(&mut data).unwrap();
    data
}

/// Read until a blank line, returning the header text.
fn read_header_block(stream: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).expect("header must terminate");
        data.push(byte[0]);
    }
    String::from_utf8(data).unwrap()
}

fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).unwrap();
    buf
}

/// One direct-binary f32 sample with a transmitted timestamp.
const LIVE_SAMPLE_BYTES: usize = 1 + 8 + (CHANNELS as usize) * 4;
/// One direct-binary f32 sample with a deduced timestamp (test patterns).
const PATTERN_SAMPLE_BYTES: usize = 1 + (CHANNELS as usize) * 4;

fn expected_pattern(offset: i32) -> Vec<f32> {
    let mut sample = Sample::new(ChannelFormat::Float32, CHANNELS, 0.0, false);
    sample.assign_test_pattern(offset);
    sample.as_f32().unwrap()
}

// ============================================================================
// Control requests
// ============================================================================

#[test]
fn test_unsupported_version_rejected() {
    let cfg = config(19400);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client.write_all(b"LSL:streamfeed/999\r\n\r\n").unwrap();
    let reply = String::from_utf8(read_to_end(&mut client)).unwrap();
    assert!(reply.starts_with("LSL/"), "reply was: {:?}", reply);
    assert!(reply.ends_with("505 Version not supported"));
    assert!(matches!(
        pulselink::tcp::parse_status_line(&reply),
        Err(pulselink::Error::VersionUnsupported(110))
    ));
}

#[test]
fn test_uid_mismatch_rejected() {
    let cfg = config(19450);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client
        .write_all(b"LSL:streamfeed/110 deadbeef\r\nMax-Buffer-Length: 16\r\n\r\n")
        .unwrap();
    let reply = String::from_utf8(read_to_end(&mut client)).unwrap();
    assert!(reply.starts_with("LSL/"));
    assert!(reply.ends_with("404 Not found"));
    assert!(matches!(
        pulselink::tcp::parse_status_line(&reply),
        Err(pulselink::Error::UidMismatch)
    ));
}

#[test]
fn test_unknown_verb_closes_silently() {
    let cfg = config(19500);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
    assert!(read_to_end(&mut client).is_empty());
}

#[test]
fn test_shortinfo_query_roundtrip() {
    let cfg = config(19550);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client
        .write_all(b"LSL:shortinfo\r\ntype='EEG'\r\n")
        .unwrap();
    let reply = String::from_utf8(read_to_end(&mut client)).unwrap();
    let parsed = StreamInfo::from_shortinfo_message(&reply).unwrap();
    assert_eq!(parsed.uid, server.info().uid);
    assert_eq!(parsed.v4data_port, server.info().v4data_port);

    // non-matching query: connection closes without a reply
    let mut client = connect(&server);
    client
        .write_all(b"LSL:shortinfo\r\ntype='Gaze'\r\n")
        .unwrap();
    assert!(read_to_end(&mut client).is_empty());
}

#[test]
fn test_fullinfo_carries_desc() {
    let cfg = config(19600);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client.write_all(b"LSL:fullinfo\r\n").unwrap();
    let reply = String::from_utf8(read_to_end(&mut client)).unwrap();
    assert!(reply.contains("<desc"));
    let parsed = StreamInfo::from_shortinfo_message(&reply).unwrap();
    assert_eq!(parsed.uid, server.info().uid);
}

#[test]
fn test_shortinfo_via_cancellable_byte_stream() {
    let cfg = config(19650);
    let (server, _buffer) = start_server(&cfg);

    let addr = format!("127.0.0.1:{}", server.info().v4data_port)
        .parse()
        .unwrap();
    let mut stream = CancellableByteStream::connect(addr).unwrap();
    stream.write_all(b"LSL:shortinfo\r\n*\r\n").unwrap();
    stream.flush().unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    let parsed = StreamInfo::from_shortinfo_message(&String::from_utf8(reply).unwrap()).unwrap();
    assert_eq!(parsed.uid, server.info().uid);
}

// ============================================================================
// Feed negotiation and the sample pump
// ============================================================================

#[test]
fn test_feed_negotiation_and_test_patterns() {
    let cfg = config(19700);
    let (server, buffer) = start_server(&cfg);

    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\n\
         Native-Byte-Order: {}\r\n\
         Value-Size: 4\r\n\
         Max-Buffer-Length: 32\r\n\
         Protocol-Version: 110\r\n\r\n",
        server.info().uid,
        native_byte_order(),
    );
    client.write_all(request.as_bytes()).unwrap();

    let header = read_header_block(&mut client);
    assert!(header.starts_with("LSL/110 200 OK\r\n"), "header: {:?}", header);
    assert!(header.contains(&format!("UID: {}", server.info().uid)));
    assert!(header.contains(&format!("Byte-Order: {}", native_byte_order())));
    assert!(header.contains("Suppress-Subnormals: 0"));
    assert!(header.contains("Data-Protocol-Version: 110"));

    // two framing-check samples, offsets 4 then 2
    for offset in [4, 2] {
        let raw = read_exactly(&mut client, PATTERN_SAMPLE_BYTES);
        let (sample, used) =
            Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 110, false).unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(sample.timestamp, 0.0);
        assert_eq!(sample.as_f32().unwrap(), expected_pattern(offset));
    }

    // live data follows once the pump is attached
    thread::sleep(Duration::from_millis(100));
    let values = [1.0f32, -2.0, 3.5, 0.25];
    buffer.push_sample(&Arc::new(Sample::from_f32(&values, 42.5, true)));

    let raw = read_exactly(&mut client, LIVE_SAMPLE_BYTES);
    let (sample, _) =
        Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 110, false).unwrap();
    assert_eq!(sample.timestamp, 42.5);
    assert_eq!(sample.as_f32().unwrap(), values.to_vec());
}

#[test]
fn test_chunk_boundary_flush() {
    let cfg = config(19750);
    let (server, buffer) = start_server(&cfg);

    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\nMax-Buffer-Length: 32\r\nMax-Chunk-Length: 3\r\n\r\n",
        server.info().uid
    );
    client.write_all(request.as_bytes()).unwrap();
    let _header = read_header_block(&mut client);
    let _patterns = read_exactly(&mut client, 2 * PATTERN_SAMPLE_BYTES);

    thread::sleep(Duration::from_millis(100));
    // three quiet samples reach the chunk limit and flush together
    for i in 0..3 {
        let values = [i as f32; CHANNELS as usize];
        buffer.push_sample(&Arc::new(Sample::from_f32(&values, 1.0 + i as f64, false)));
    }
    let raw = read_exactly(&mut client, 3 * LIVE_SAMPLE_BYTES);
    let mut pos = 0;
    for i in 0..3 {
        let (sample, used) =
            Sample::deserialize(&raw[pos..], ChannelFormat::Float32, CHANNELS, 110, false)
                .unwrap();
        pos += used;
        assert_eq!(sample.timestamp, 1.0 + i as f64);
        assert_eq!(sample.as_f32().unwrap(), vec![i as f32; CHANNELS as usize]);
    }
}

#[test]
fn test_byte_swap_negotiation() {
    let cfg = config(19800);
    let (server, buffer) = start_server(&cfg);
    let foreign_order = if native_byte_order() == 1234 { 4321 } else { 1234 };

    // client is slow at converting: the server takes the swap
    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\n\
         Native-Byte-Order: {}\r\n\
         Endian-Performance: 0\r\n\
         Max-Buffer-Length: 32\r\n\r\n",
        server.info().uid,
        foreign_order,
    );
    client.write_all(request.as_bytes()).unwrap();
    let header = read_header_block(&mut client);
    assert!(header.contains(&format!("Byte-Order: {}", foreign_order)));

    // the patterns arrive in the client's byte order
    let raw = read_exactly(&mut client, PATTERN_SAMPLE_BYTES);
    let (sample, _) =
        Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 110, true).unwrap();
    assert_eq!(sample.as_f32().unwrap(), expected_pattern(4));

    let _rest = read_exactly(&mut client, PATTERN_SAMPLE_BYTES);
    thread::sleep(Duration::from_millis(100));
    let values = [7.5f32, -1.0, 0.5, 2.0];
    buffer.push_sample(&Arc::new(Sample::from_f32(&values, 3.0, true)));
    let raw = read_exactly(&mut client, LIVE_SAMPLE_BYTES);
    let (sample, _) =
        Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 110, true).unwrap();
    assert_eq!(sample.as_f32().unwrap(), values.to_vec());
    assert_eq!(sample.timestamp, 3.0);
}

#[test]
fn test_byte_swap_declined_when_client_is_faster() {
    let cfg = config(19850);
    let (server, _buffer) = start_server(&cfg);
    let foreign_order = if native_byte_order() == 1234 { 4321 } else { 1234 };

    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\n\
         Native-Byte-Order: {}\r\n\
         Endian-Performance: 1e18\r\n\
         Max-Buffer-Length: 32\r\n\r\n",
        server.info().uid,
        foreign_order,
    );
    client.write_all(request.as_bytes()).unwrap();
    let header = read_header_block(&mut client);
    // the overwhelmingly faster client does its own conversion
    assert!(header.contains(&format!("Byte-Order: {}", native_byte_order())));
}

#[test]
fn test_zero_buffer_closes_after_feed_header() {
    let cfg = config(19900);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\nMax-Buffer-Length: 0\r\n\r\n",
        server.info().uid
    );
    client.write_all(request.as_bytes()).unwrap();
    let _header = read_header_block(&mut client);
    let _patterns = read_exactly(&mut client, 2 * PATTERN_SAMPLE_BYTES);
    // nothing else: the session closes cleanly
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn test_legacy_streamfeed_portable_header() {
    let cfg = config(19950);
    let (server, buffer) = start_server(&cfg);

    let mut client = connect(&server);
    client.write_all(b"LSL:streamfeed\r\n16 1\r\n").unwrap();

    // portable feed header: length-prefixed shortinfo message
    let len_bytes = read_exactly(&mut client, 4);
    let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
    let shortinfo = String::from_utf8(read_exactly(&mut client, len)).unwrap();
    let parsed = StreamInfo::from_shortinfo_message(&shortinfo).unwrap();
    assert_eq!(parsed.uid, server.info().uid);

    // portable test patterns: tag + (width byte + 4 bytes) per channel
    let portable_pattern_bytes = 1 + (CHANNELS as usize) * 5;
    for offset in [4, 2] {
        let raw = read_exactly(&mut client, portable_pattern_bytes);
        let (sample, _) =
            Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 100, false).unwrap();
        assert_eq!(sample.as_f32().unwrap(), expected_pattern(offset));
    }

    // live samples travel portable too, with a timestamp
    thread::sleep(Duration::from_millis(100));
    buffer.push_sample(&Arc::new(Sample::from_f32(&[1.0; 4], 9.0, true)));
    let portable_live_bytes = 1 + 9 + (CHANNELS as usize) * 5;
    let raw = read_exactly(&mut client, portable_live_bytes);
    let (sample, _) =
        Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 100, false).unwrap();
    assert_eq!(sample.timestamp, 9.0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_session_registry_drains_after_close() {
    let cfg = config(20000);
    let (server, _buffer) = start_server(&cfg);

    {
        let mut client = connect(&server);
        client.write_all(b"LSL:fullinfo\r\n").unwrap();
        let _ = read_to_end(&mut client);
    }
    let deadline = Instant::now() + Duration::from_secs(3);
    while server.session_count() > 0 {
        assert!(Instant::now() < deadline, "session never deregistered");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_server_shutdown_unblocks_streaming_client() {
    let cfg = config(20050);
    let (server, _buffer) = start_server(&cfg);

    let mut client = connect(&server);
    let request = format!(
        "LSL:streamfeed/110 {}\r\nMax-Buffer-Length: 32\r\n\r\n",
        server.info().uid
    );
    client.write_all(request.as_bytes()).unwrap();
    let _header = read_header_block(&mut client);
    let _patterns = read_exactly(&mut client, 2 * PATTERN_SAMPLE_BYTES);
    thread::sleep(Duration::from_millis(100));

    // dropping the server ends serving, closes the session socket and
    // wakes the pump; the client observes EOF promptly
    let start = Instant::now();
    drop(server);
    let mut rest = Vec::new();
    let _ = client.read_to_end(&mut rest);
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn test_sync_transfer_fanout() {
    let mut cfg = ApiConfig::new().with_session_id("transport-tests");
    cfg.multicast_addresses = vec![];
    cfg.base_port = 20100;
    cfg.sync_transfer = true;
    let cfg = Arc::new(cfg);
    let (server, _buffer) = start_server(&cfg);

    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut client = connect(&server);
        let request = format!(
            "LSL:streamfeed/110 {}\r\nMax-Buffer-Length: 32\r\n\r\n",
            server.info().uid
        );
        client.write_all(request.as_bytes()).unwrap();
        let _header = read_header_block(&mut client);
        let _patterns = read_exactly(&mut client, 2 * PATTERN_SAMPLE_BYTES);
        clients.push(client);
    }
    thread::sleep(Duration::from_millis(100));

    // the outlet thread serializes one chunk and fans it out itself
    let mut chunk = Vec::new();
    Sample::from_f32(&[5.0; 4], 11.0, true).serialize_into(&mut chunk, 110, false, false);
    server.write_all_blocking(&[&chunk]).unwrap();

    for client in &mut clients {
        let raw = read_exactly(client, LIVE_SAMPLE_BYTES);
        let (sample, _) =
            Sample::deserialize(&raw, ChannelFormat::Float32, CHANNELS, 110, false).unwrap();
        assert_eq!(sample.timestamp, 11.0);
        assert_eq!(sample.as_f32().unwrap(), vec![5.0; 4]);
    }
}
