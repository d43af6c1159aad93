//! Common test utilities for eRPC Nexus integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use erpc::{Nexus, NexusConfig};

/// Route `tracing` output to the test harness. `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A Nexus on an ephemeral SM port with a short event loop.
pub fn test_nexus(hostname: &str, num_bg_threads: usize) -> Nexus {
    let config = NexusConfig::new(hostname, 0)
        .with_bg_threads(num_bg_threads)
        .with_sm_event_loop(Duration::from_millis(5));
    Nexus::new(config).expect("failed to create Nexus")
}

/// Address another Nexus on this host can use to reach `nexus`.
pub fn loopback_addr(nexus: &Nexus) -> String {
    format!("127.0.0.1:{}", nexus.sm_udp_port())
}

/// Call `poll` until it has returned at least `n` items in total, or panic
/// after a timeout.
pub fn poll_until<T>(n: usize, timeout_ms: u64, mut poll: impl FnMut() -> Vec<T>) -> Vec<T> {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    let mut items = Vec::new();
    while items.len() < n {
        assert!(
            Instant::now() < deadline,
            "timed out with {} of {} items",
            items.len(),
            n
        );
        items.extend(poll());
        std::thread::sleep(Duration::from_millis(1));
    }
    items
}

/// Wait until `cond` holds, or panic after a timeout.
pub fn wait_until(timeout_ms: u64, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        std::thread::sleep(Duration::from_millis(1));
    }
}
