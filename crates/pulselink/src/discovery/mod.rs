// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream discovery over UDP.
//!
//! Resolvers fire query waves at multicast, broadcast and unicast targets
//! and collect shortinfo replies into a deduplicated, timestamped live
//! set; outlets run query responders that answer matching queries.
//!
//! ```text
//!  resolver                              outlet
//!  +----------------+   query waves    +-----------------+
//!  | ResolveAttempt | ---------------> | QueryResponder  |
//!  |  recv socket   | <--------------- |  (mcast + ucast)|
//!  +----------------+  shortinfo reply +-----------------+
//!         |
//!         v
//!  UID -> (StreamInfo, last_seen)
//! ```

mod attempt;
mod resolver;
mod responder;

pub use attempt::{AttemptHandle, ResolveAttempt, ResultMap};
pub use resolver::Resolver;
pub use responder::{QueryResponder, ResponderMode};
