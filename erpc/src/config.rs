//! Configuration types for the eRPC Nexus.

use std::time::Duration;

use crate::error::{Error, Result};

/// Maximum number of background threads per process.
pub const MAX_BG_THREADS: usize = 8;

/// Maximum Rpc ID. 255 is reserved as the invalid ID.
pub const MAX_RPC_ID: u8 = u8::MAX - 1;

/// Request type reserved for session management packets.
pub const SM_REQ_TYPE: u8 = u8::MAX;

/// Number of request types that may carry an application handler.
pub const MAX_REQ_TYPES: usize = SM_REQ_TYPE as usize;

/// Nexus configuration.
///
/// Controls the session management port, the background thread pool, and the
/// fixed capacities of the hook and request handler tables.
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Host name of this process, declared to peers during the SM handshake.
    pub hostname: String,
    /// UDP port for session management packets. 0 binds an ephemeral port.
    pub sm_udp_port: u16,
    /// Number of background request processing threads.
    /// Default: 0
    ///
    /// Background threads are only useful with a small-RPC optimization level
    /// that supports them; this coupling is documented, not checked.
    pub num_bg_threads: usize,
    /// Bounded wait of one session management event loop iteration.
    /// Default: 20ms
    pub sm_event_loop: Duration,
    /// Sleep of an idle background thread between queue polls.
    /// Default: 1ms
    pub bg_poll_interval: Duration,
    /// CPU core to pin the session management thread to.
    /// Default: None
    pub sm_thread_core: Option<usize>,
    /// Maximum number of registered request handlers.
    /// Default: MAX_REQ_TYPES
    pub max_req_funcs: usize,
    /// Largest Rpc ID accepted by `register_hook`.
    /// Default: MAX_RPC_ID
    pub max_rpc_id: u8,
    /// UDP control-plane transport settings.
    pub udp: UdpSmConfig,
}

impl NexusConfig {
    /// Create a new configuration with default values.
    pub fn new(hostname: impl Into<String>, sm_udp_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            sm_udp_port,
            num_bg_threads: 0,
            sm_event_loop: Duration::from_millis(20),
            bg_poll_interval: Duration::from_millis(1),
            sm_thread_core: None,
            max_req_funcs: MAX_REQ_TYPES,
            max_rpc_id: MAX_RPC_ID,
            udp: UdpSmConfig::default(),
        }
    }

    /// Set the number of background threads.
    pub fn with_bg_threads(mut self, num_bg_threads: usize) -> Self {
        self.num_bg_threads = num_bg_threads;
        self
    }

    /// Set the session management event loop wait.
    pub fn with_sm_event_loop(mut self, sm_event_loop: Duration) -> Self {
        self.sm_event_loop = sm_event_loop;
        self
    }

    /// Set the background thread poll interval.
    pub fn with_bg_poll_interval(mut self, bg_poll_interval: Duration) -> Self {
        self.bg_poll_interval = bg_poll_interval;
        self
    }

    /// Pin the session management thread to a CPU core.
    pub fn with_sm_thread_core(mut self, core: usize) -> Self {
        self.sm_thread_core = Some(core);
        self
    }

    /// Set the request handler table capacity.
    pub fn with_max_req_funcs(mut self, max_req_funcs: usize) -> Self {
        self.max_req_funcs = max_req_funcs;
        self
    }

    /// Set the largest accepted Rpc ID.
    pub fn with_max_rpc_id(mut self, max_rpc_id: u8) -> Self {
        self.max_rpc_id = max_rpc_id;
        self
    }

    /// Set the UDP control-plane transport settings.
    pub fn with_udp(mut self, udp: UdpSmConfig) -> Self {
        self.udp = udp;
        self
    }

    /// Check the configuration against the fixed capacities.
    pub fn validate(&self) -> Result<()> {
        if self.num_bg_threads > MAX_BG_THREADS {
            return Err(Error::InvalidConfig(format!(
                "num_bg_threads {} exceeds {}",
                self.num_bg_threads, MAX_BG_THREADS
            )));
        }
        if self.max_req_funcs > MAX_REQ_TYPES {
            return Err(Error::InvalidConfig(format!(
                "max_req_funcs {} exceeds {}",
                self.max_req_funcs, MAX_REQ_TYPES
            )));
        }
        if self.max_rpc_id > MAX_RPC_ID {
            return Err(Error::InvalidConfig(format!(
                "max_rpc_id {} exceeds {}",
                self.max_rpc_id, MAX_RPC_ID
            )));
        }
        if self.sm_event_loop.is_zero() {
            return Err(Error::InvalidConfig("sm_event_loop cannot be 0".into()));
        }
        if self.hostname.is_empty() {
            return Err(Error::InvalidConfig("hostname cannot be empty".into()));
        }
        Ok(())
    }
}

/// Settings for the UDP session management transport.
#[derive(Debug, Clone)]
pub struct UdpSmConfig {
    /// Interval between handshake retransmissions to a pending peer.
    /// Default: 100ms
    pub connect_retry: Duration,
    /// Time after which a pending peer is reported disconnected.
    /// Default: 2s
    pub connect_timeout: Duration,
    /// Largest datagram accepted on the control plane.
    /// Default: 2048
    pub max_pkt_size: usize,
}

impl Default for UdpSmConfig {
    fn default() -> Self {
        Self {
            connect_retry: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(2),
            max_pkt_size: 2048,
        }
    }
}
