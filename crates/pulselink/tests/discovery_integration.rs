// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end discovery tests over loopback.
//!
//! Outlets are modeled by unicast query responders and resolvers are
//! pointed at 127.0.0.1 via `known_peers`, so the tests run on machines
//! without working multicast. Every test gets its own port band to stay
//! independent under parallel execution.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pulselink::discovery::{QueryResponder, ResponderMode};
use pulselink::{ApiConfig, ChannelFormat, Resolver, StreamInfo};

fn config(session_id: &str, base_port: u16) -> Arc<ApiConfig> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut cfg = ApiConfig::new().with_session_id(session_id);
    cfg.known_peers = vec!["127.0.0.1".to_string()];
    cfg.multicast_addresses = vec![]; // loopback unicast only
    cfg.base_port = base_port;
    // tight waves keep the tests fast
    cfg.unicast_min_rtt = 0.1;
    cfg.continuous_resolve_interval = 0.1;
    Arc::new(cfg)
}

fn start_outlet(
    name: &str,
    stream_type: &str,
    config: &Arc<ApiConfig>,
) -> (Arc<StreamInfo>, QueryResponder) {
    let mut info = StreamInfo::new(name, stream_type, 8, 250.0, ChannelFormat::Float32, "");
    info.reset_uid();
    info.session_id = config.session_id.clone();
    let info = Arc::new(info);
    let responder = QueryResponder::start(
        Arc::clone(&info),
        Arc::clone(config),
        ResponderMode::Unicast,
    )
    .expect("responder must start");
    (info, responder)
}

#[test]
fn test_oneshot_finds_two_outlets() {
    let cfg = config("sess-two", 19000);
    let (info_a, _responder_a) = start_outlet("A", "EEG", &cfg);
    let (info_b, _responder_b) = start_outlet("B", "EEG", &cfg);

    let resolver = Resolver::new(Arc::clone(&cfg));
    let query = resolver.build_query(Some("type"), Some("EEG"));
    let start = Instant::now();
    let results = resolver.resolve_oneshot(&query, 2, 2.0, 0.0).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2), "must satisfy the minimum early");

    assert_eq!(results.len(), 2);
    let uids: Vec<&str> = results.iter().map(|r| r.uid.as_str()).collect();
    assert!(uids.contains(&info_a.uid.as_str()));
    assert!(uids.contains(&info_b.uid.as_str()));
    // the resolver recorded where the replies came from
    for r in &results {
        assert_eq!(r.v4address, "127.0.0.1");
    }
}

#[test]
fn test_session_id_isolation() {
    let outlet_cfg = config("session-x", 19050);
    let (_info, _responder) = start_outlet("A", "EEG", &outlet_cfg);

    // resolver lives in a different session on the same ports
    let resolver_cfg = config("session-y", 19050);
    let resolver = Resolver::new(Arc::clone(&resolver_cfg));
    let query = resolver.build_query(Some("*"), None);
    let results = resolver.resolve_oneshot(&query, 0, 1.0, 0.0).unwrap();
    assert!(results.is_empty(), "cross-session streams must stay invisible");
}

#[test]
fn test_minimum_time_holds_result_open() {
    let cfg = config("sess-mintime", 19100);
    let (_info, _responder) = start_outlet("A", "EEG", &cfg);

    let resolver = Resolver::new(Arc::clone(&cfg));
    let query = resolver.build_query(None, None);
    let start = Instant::now();
    let results = resolver.resolve_oneshot(&query, 1, 5.0, 0.6).unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(600),
        "must not return before minimum_time even though the count is met"
    );
    assert_eq!(results.len(), 1);
}

#[test]
fn test_continuous_pruning() {
    let cfg = config("sess-prune", 19150);
    let resolver = Resolver::new(Arc::clone(&cfg));
    let query = resolver.build_query(None, None);
    resolver.resolve_continuous(&query, 1.0).unwrap();

    let (info, responder) = start_outlet("A", "EEG", &cfg);
    // wait for a wave to hit the outlet
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let results = resolver.results(10).unwrap();
        if results.len() == 1 {
            assert_eq!(results[0].uid, info.uid);
            break;
        }
        assert!(Instant::now() < deadline, "outlet never appeared");
        thread::sleep(Duration::from_millis(50));
    }

    // stop the outlet; its entry must age out of the live set
    responder.shutdown();
    thread::sleep(Duration::from_secs(2));
    assert!(
        resolver.results(10).unwrap().is_empty(),
        "stale entries must be pruned after forget_after"
    );
}

#[test]
fn test_cancellation_under_load() {
    let cfg = config("sess-cancel", 19200);
    let (_info, _responder) = start_outlet("A", "EEG", &cfg);

    let resolver = Arc::new(Resolver::new(Arc::clone(&cfg)));
    let query = resolver.build_query(None, None);
    resolver.resolve_continuous(&query, 5.0).unwrap();
    thread::sleep(Duration::from_millis(200));

    let canceller = {
        let resolver = Arc::clone(&resolver);
        thread::spawn(move || resolver.cancel())
    };
    canceller.join().unwrap();

    // the destructor must join the background thread promptly
    let start = Instant::now();
    drop(
        Arc::try_unwrap(resolver)
            .map_err(|_| "resolver still shared")
            .unwrap(),
    );
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "cancelled resolver must not hang on drop"
    );
}

#[test]
fn test_repeated_oneshots_deduplicate_by_uid() {
    let cfg = config("sess-dedup", 19250);
    let (info, _responder) = start_outlet("A", "EEG", &cfg);

    let resolver = Resolver::new(Arc::clone(&cfg));
    let query = resolver.build_query(Some("name"), Some("A"));
    for _ in 0..2 {
        // several waves may answer within the window; the UID keyed map
        // must still collapse them to one entry
        let results = resolver.resolve_oneshot(&query, 1, 2.0, 0.3).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].uid, info.uid);
    }
}
