//! The session management thread.
//!
//! One per process. Each loop iteration waits a bounded time for control-plane
//! events, delivers received SM packets to the addressed Rpc's hook, and then
//! transmits the SM packets that Rpc threads queued. Packets for a host whose
//! connection is still being set up wait in that peer's record and are flushed
//! in order once it connects.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::mt_queue::MtQueue;
use crate::nexus::NexusState;
use crate::sm::{PeerId, SmPeer, SmPkt, SmWorkItem};
use crate::tls_registry::TlsRegistry;
use crate::transport::{SmEvent, SmTransport};

/// Upper bound on events handled before the transmit half of an iteration.
const SM_MAX_EVENTS_PER_ITER: usize = 64;

/// Metadata for a connection the SM thread opened as a client.
#[derive(Debug)]
pub(crate) struct PeerConnectionRecord {
    /// Host name given by the Rpc that first addressed this peer.
    rem_hostname: String,
    connected: bool,
    /// Work items to transmit once the peer connects.
    wi_tx_queue: VecDeque<SmWorkItem>,
}

/// Session management thread context.
pub(crate) struct SmThreadCtx<T: SmTransport> {
    // Installed by the Nexus
    transport: T,
    kill_switch: Arc<AtomicBool>,
    state: Arc<Mutex<NexusState>>,
    /// SM packets to transmit, pushed by Rpc threads.
    sm_tx_queue: Arc<MtQueue<SmWorkItem>>,
    tls_registry: Arc<TlsRegistry>,
    event_loop_wait: Duration,
    core: Option<usize>,

    // Client-mode connections only
    peers: HashMap<PeerId, PeerConnectionRecord>,
    name_map: HashMap<String, PeerId>,
}

impl<T: SmTransport> SmThreadCtx<T> {
    pub(crate) fn new(
        transport: T,
        kill_switch: Arc<AtomicBool>,
        state: Arc<Mutex<NexusState>>,
        sm_tx_queue: Arc<MtQueue<SmWorkItem>>,
        tls_registry: Arc<TlsRegistry>,
        event_loop_wait: Duration,
        core: Option<usize>,
    ) -> Self {
        Self {
            transport,
            kill_switch,
            state,
            sm_tx_queue,
            tls_registry,
            event_loop_wait,
            core,
            peers: HashMap::new(),
            name_map: HashMap::new(),
        }
    }

    /// The thread function executed by the session management thread.
    pub(crate) fn run(mut self) {
        if let Some(core) = self.core
            && !core_affinity::set_for_current(core_affinity::CoreId { id: core })
        {
            warn!(core, "failed to pin SM thread");
        }
        let etid = self.tls_registry.init();
        info!(port = self.transport.local_port(), etid, "SM thread running");

        while !self.kill_switch.load(Ordering::Acquire) {
            self.sm_rx();
            self.sm_tx();
        }

        let pending: usize = self.peers.values().map(|p| p.wi_tx_queue.len()).sum();
        info!(
            pending,
            unsent = self.sm_tx_queue.len(),
            "SM thread exiting"
        );
    }

    /// Handle control-plane events. Blocks for up to the event loop wait.
    pub(crate) fn sm_rx(&mut self) {
        let mut wait = self.event_loop_wait;
        for _ in 0..SM_MAX_EVENTS_PER_ITER {
            match self.transport.service(wait) {
                Ok(Some(event)) => self.handle_event(event),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "SM transport service failed");
                    break;
                }
            }
            wait = Duration::ZERO;
        }
    }

    fn handle_event(&mut self, event: SmEvent) {
        match event {
            SmEvent::Connect(peer) => self.handle_connect(peer),
            SmEvent::Receive { peer, pkt } => self.handle_receive(peer, pkt),
            SmEvent::Disconnect(peer) => self.handle_disconnect(peer),
        }
    }

    fn handle_connect(&mut self, peer: PeerId) {
        let Some(record) = self.peers.get_mut(&peer) else {
            debug!(?peer, "server-mode peer connected");
            return;
        };
        record.connected = true;
        let queued = std::mem::take(&mut record.wi_tx_queue);
        info!(?peer, host = %record.rem_hostname, queued = queued.len(), "connected");

        for wi in queued {
            self.transmit(peer, &wi);
        }
    }

    fn handle_receive(&mut self, peer: PeerId, pkt: SmPkt) {
        let rpc_id = pkt.dst_rpc_id;
        // Hold the Nexus lock only for the lookup.
        let rx_queue = {
            let state = self.state.lock();
            state.hook(rpc_id).map(|hook| Arc::clone(hook.sm_rx_queue()))
        };

        match rx_queue {
            Some(queue) => {
                trace!(?peer, rpc_id, pkt_type = ?pkt.pkt_type, "delivering SM packet");
                queue.push(SmWorkItem::to_peer(rpc_id, pkt, peer));
            }
            None => warn!(?peer, rpc_id, "no registered Rpc for SM packet, dropping"),
        }
    }

    fn handle_disconnect(&mut self, peer: PeerId) {
        match self.peers.remove(&peer) {
            Some(record) => {
                self.name_map.retain(|_, p| *p != peer);
                if record.wi_tx_queue.is_empty() {
                    info!(?peer, host = %record.rem_hostname, "disconnected");
                } else {
                    warn!(
                        ?peer,
                        host = %record.rem_hostname,
                        discarded = record.wi_tx_queue.len(),
                        "disconnected with queued SM packets"
                    );
                }
            }
            None => debug!(?peer, "server-mode peer disconnected"),
        }
    }

    /// Transmit SM packets queued by Rpc threads.
    pub(crate) fn sm_tx(&mut self) {
        for wi in self.sm_tx_queue.drain_all() {
            match &wi.peer {
                SmPeer::Handle(peer) => {
                    let peer = *peer;
                    self.transmit(peer, &wi);
                }
                SmPeer::Host(hostname) => {
                    let hostname = hostname.clone();
                    self.tx_to_host(&hostname, wi);
                }
            }
        }
    }

    fn tx_to_host(&mut self, hostname: &str, wi: SmWorkItem) {
        let peer = match self.name_map.get(hostname) {
            Some(&peer) => peer,
            None => match self.transport.connect(hostname) {
                Ok(peer) => {
                    debug!(host = hostname, ?peer, "connecting to new peer");
                    self.name_map.insert(hostname.to_string(), peer);
                    peer
                }
                Err(e) => {
                    warn!(host = hostname, rpc_id = wi.rpc_id, error = %e, "failed to connect, dropping SM packet");
                    return;
                }
            },
        };

        let record = self.peers.entry(peer).or_insert_with(|| PeerConnectionRecord {
            rem_hostname: hostname.to_string(),
            connected: false,
            wi_tx_queue: VecDeque::new(),
        });
        if record.connected {
            self.transmit(peer, &wi);
        } else {
            record.wi_tx_queue.push_back(wi);
        }
    }

    fn transmit(&mut self, peer: PeerId, wi: &SmWorkItem) {
        if let Err(e) = self.transport.send(peer, &wi.sm_pkt) {
            warn!(?peer, rpc_id = wi.rpc_id, error = %e, "failed to send SM packet");
        }
    }
}
