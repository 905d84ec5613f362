// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Resolver front door: one-shot and continuous stream resolution.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{secs, ApiConfig};
use crate::error::{Error, Result};
use crate::info::StreamInfo;
use crate::query::{build_query, check_query};

use super::attempt::{AttemptHandle, ResolveAttempt};

/// Which mode this instance has committed to. One-shot and continuous are
/// mutually exclusive per resolver.
enum Mode {
    Idle,
    OneShot,
    Continuous {
        handle: AttemptHandle,
        thread: Option<JoinHandle<()>>,
        forget_after: Duration,
    },
}

/// Finds streams on the network by content query.
///
/// A resolver either answers one-off queries ([`resolve_oneshot`]) or runs
/// a background attempt forever ([`resolve_continuous`] + [`results`]),
/// never both. Dropping the resolver cancels any background attempt and
/// joins its thread.
///
/// [`resolve_oneshot`]: Resolver::resolve_oneshot
/// [`resolve_continuous`]: Resolver::resolve_continuous
/// [`results`]: Resolver::results
pub struct Resolver {
    config: Arc<ApiConfig>,
    ucast_endpoints: Vec<SocketAddr>,
    mcast_endpoints: Vec<IpAddr>,
    mode: Mutex<Mode>,
    /// Handle of whichever attempt is currently live, for cross-thread
    /// cancellation of one-shot resolves too.
    current: Mutex<Option<AttemptHandle>>,
    cancelled: AtomicBool,
}

impl Resolver {
    /// New resolver: expands the configured peer list and multicast groups
    /// into target endpoints.
    pub fn new(config: Arc<ApiConfig>) -> Self {
        let mut mcast_endpoints = Vec::new();
        for addr in &config.multicast_addresses {
            match addr.parse::<IpAddr>() {
                Ok(ip) => mcast_endpoints.push(ip),
                Err(e) => {
                    log::debug!("[resolver] ignoring bad multicast address '{}': {}", addr, e);
                }
            }
        }

        // expand known peers x port range into unicast targets
        let mut ucast_endpoints = Vec::new();
        for peer in &config.known_peers {
            match (peer.as_str(), config.base_port).to_socket_addrs() {
                Ok(resolved) => {
                    for addr in resolved {
                        for offset in 0..config.port_range {
                            ucast_endpoints
                                .push(SocketAddr::new(addr.ip(), config.base_port + offset));
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[resolver] cannot resolve known peer '{}': {}", peer, e);
                }
            }
        }

        Self {
            config,
            ucast_endpoints,
            mcast_endpoints,
            mode: Mutex::new(Mode::Idle),
            current: Mutex::new(None),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Build the wire query for a predicate or property/value pair,
    /// scoped to this deployment's session id.
    pub fn build_query(&self, pred_or_prop: Option<&str>, value: Option<&str>) -> String {
        build_query(&self.config.session_id, pred_or_prop, value)
    }

    /// Resolve until `minimum` streams are known (or the timeout expires)
    /// and return the consolidated results.
    ///
    /// The attempt's event loop runs on the calling thread. A zero
    /// `minimum` gathers until the timeout; a non-zero `minimum_time`
    /// keeps gathering past the count so late competing streams still get
    /// a fair chance to appear.
    pub fn resolve_oneshot(
        &self,
        query: &str,
        minimum: usize,
        timeout: f64,
        minimum_time: f64,
    ) -> Result<Vec<StreamInfo>> {
        {
            let mut mode = self.mode.lock();
            match &*mode {
                Mode::Continuous { .. } => return Err(Error::AlreadyRunning),
                Mode::Idle => {
                    check_query(query)?;
                    *mode = Mode::OneShot;
                }
                Mode::OneShot => {
                    check_query(query)?;
                }
            }
        }

        let mut attempt = ResolveAttempt::new(
            &self.ucast_endpoints,
            &self.mcast_endpoints,
            query,
            Arc::clone(&self.config),
        )?;
        attempt.set_goal(minimum, secs(minimum_time));
        let cancel_after = timeout.is_finite().then(|| secs(timeout));
        let (unicast_wait, multicast_wait) = self.config.oneshot_waves();
        attempt.setup_handlers(unicast_wait, multicast_wait, cancel_after);

        let handle = attempt.handle();
        *self.current.lock() = Some(handle.clone());

        let mut output = Vec::new();
        if !self.cancelled.load(Ordering::SeqCst) {
            attempt.run();
            // the loop has drained; nobody else touches the map anymore
            let map = std::mem::take(&mut *handle.results().lock());
            output.reserve(map.len());
            output.extend(map.into_values().map(|(info, _)| info));
        }
        *self.current.lock() = None;
        Ok(output)
    }

    /// Start resolving in the background until cancelled.
    ///
    /// Wave spacings are lengthened by `continuous_resolve_interval` so a
    /// permanently running resolver stays polite. Snapshots of the live
    /// set come from [`results`](Self::results).
    pub fn resolve_continuous(&self, query: &str, forget_after: f64) -> Result<()> {
        {
            let mode = self.mode.lock();
            if !matches!(&*mode, Mode::Idle) {
                return Err(Error::AlreadyRunning);
            }
            check_query(query)?;
        }

        let mut attempt = ResolveAttempt::new(
            &self.ucast_endpoints,
            &self.mcast_endpoints,
            query,
            Arc::clone(&self.config),
        )?;
        let (unicast_wait, multicast_wait) = self.config.continuous_waves();
        attempt.setup_handlers(unicast_wait, multicast_wait, None);

        let handle = attempt.handle();
        let thread = thread::Builder::new()
            .name("pulselink-resolve".to_string())
            .spawn(move || attempt.run())
            .map_err(Error::Io)?;

        *self.current.lock() = Some(handle.clone());
        *self.mode.lock() = Mode::Continuous {
            handle,
            thread: Some(thread),
            forget_after: secs(forget_after),
        };
        Ok(())
    }

    /// Snapshot of the continuous live set, at most `max_results` entries.
    ///
    /// Entries whose last reply is older than `forget_after` are pruned
    /// from the map in the same pass, so the live set never serves stale
    /// streams.
    pub fn results(&self, max_results: usize) -> Result<Vec<StreamInfo>> {
        let mode = self.mode.lock();
        let (handle, forget_after) = match &*mode {
            Mode::Continuous {
                handle,
                forget_after,
                ..
            } => (handle, *forget_after),
            _ => {
                return Err(Error::Config(
                    "results() requires an ongoing continuous resolve".into(),
                ))
            }
        };

        let mut output = Vec::new();
        let expired_before = Instant::now().checked_sub(forget_after);
        let mut results = handle.results().lock();
        results.retain(|_, (info, last_seen)| {
            let live = match expired_before {
                Some(cutoff) => *last_seen >= cutoff,
                // the process is younger than forget_after
                None => true,
            };
            if live && output.len() < max_results {
                output.push(info.clone());
            }
            live
        });
        Ok(output)
    }

    /// Cancel whatever attempt is running. Idempotent and safe from any
    /// thread; a one-shot resolve on another thread returns promptly with
    /// the results gathered so far.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(handle) = &*self.current.lock() {
            handle.cancel();
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel();
        let mut mode = self.mode.lock();
        if let Mode::Continuous { thread, .. } = &mut *mode {
            if let Some(thread) = thread.take() {
                if thread.join().is_err() {
                    log::error!("[resolver] background thread panicked");
                }
            }
        }
    }
}
