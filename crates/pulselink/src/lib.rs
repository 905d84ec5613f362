// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pulselink - LAN discovery and transport for time-series streams
//!
//! A publish/subscribe core for low-latency sample streams on a local
//! network. Producers ("outlets") advertise named streams of fixed-shape
//! samples; consumers ("inlets") locate outlets by content query over UDP
//! and pull samples over TCP.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulselink::{ApiConfig, ChannelFormat, Resolver, SendBuffer, StreamInfo, TcpServer};
//!
//! fn main() -> pulselink::Result<()> {
//!     let config = Arc::new(ApiConfig::new().with_session_id("lab7"));
//!
//!     // outlet side: advertise a stream and serve samples
//!     let info = StreamInfo::new("BioProbe", "EEG", 32, 500.0, ChannelFormat::Float32, "");
//!     let buffer = SendBuffer::new();
//!     let mut server = TcpServer::new(info, Arc::clone(&buffer), Arc::clone(&config))?;
//!     server.begin_serving()?;
//!
//!     // inlet side: find it by content query
//!     let resolver = Resolver::new(config);
//!     let query = resolver.build_query(Some("type"), Some("EEG"));
//!     let found = resolver.resolve_oneshot(&query, 1, 5.0, 0.0)?;
//!     println!("found {} stream(s)", found.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +------------------------------------------------------------------+
//! |                          Discovery                               |
//! |  Resolver -> ResolveAttempt (UDP waves, result map)              |
//! |  QueryResponder (outlet side, answers matching queries)          |
//! +------------------------------------------------------------------+
//! |                          Transport                               |
//! |  TcpServer -> ClientSession (negotiation, feed header, pump)     |
//! |  SyncTransferHandler (blocking fan-out mode)                     |
//! |  CancellableByteStream (interruptible inlet reads)               |
//! +------------------------------------------------------------------+
//! |  StreamInfo / query predicates / samples / send buffer / config  |
//! +------------------------------------------------------------------+
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Resolver`] | One-shot and continuous stream discovery |
//! | [`QueryResponder`] | Outlet-side discovery answerer |
//! | [`TcpServer`] | Streams samples to every subscribed client |
//! | [`SendBuffer`] | Fan-out point between an outlet and its sessions |
//! | [`StreamInfo`] | Advertised metadata of one stream |
//! | [`CancellableByteStream`] | Blocking TCP reads that a teardown can abort |

/// Sample fan-out between outlets and their subscriber sessions.
pub mod buffer;
/// Global configuration (wire constants, runtime config).
pub mod config;
/// Stream discovery over UDP (resolver, attempts, responder).
pub mod discovery;
/// Crate-wide error type.
pub mod error;
/// Stream metadata and its wire codec.
pub mod info;
/// Socket plumbing shared by discovery and transport.
pub mod net;
/// Query language and discovery datagram codec.
pub mod query;
/// Samples and their wire serialization.
pub mod sample;
/// TCP transport (stream server, sessions, cancellable byte stream).
pub mod tcp;

pub use buffer::{ConsumerQueue, SendBuffer};
pub use config::ApiConfig;
pub use discovery::{QueryResponder, ResolveAttempt, Resolver, ResponderMode};
pub use error::{Error, Result};
pub use info::{ChannelFormat, StreamInfo};
pub use query::{build_query, check_query, Predicate};
pub use sample::{local_clock, Sample};
pub use tcp::{CancelToken, CancellableByteStream, SyncTransferHandler, TcpServer};

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
