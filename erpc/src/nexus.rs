//! The per-process Nexus.
//!
//! A Nexus owns the session management (SM) thread and the background request
//! threads, plus the tables shared with every Rpc endpoint in the process:
//! the request handler table and the hook table indexed by Rpc ID.
//!
//! Request handlers must be registered before the first hook. Registering a
//! hook freezes the handler table; every hook and background thread reads the
//! same frozen snapshot afterwards.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::bg_thread::{BgThreadCtx, bg_thread_func};
use crate::config::{MAX_RPC_ID, NexusConfig, SM_REQ_TYPE};
use crate::error::{Error, RegistrationError, Result};
use crate::hook::Hook;
use crate::mt_queue::MtQueue;
use crate::sm::SmWorkItem;
use crate::sm_thread::SmThreadCtx;
use crate::timing::measure_rdtsc_freq;
use crate::tls_registry::TlsRegistry;
use crate::transport::{SmTransport, UdpSmTransport};
use crate::work::{BgWorkItem, ReqFunc, ReqFuncTable};

/// Registration state guarded by the Nexus lock.
///
/// The SM thread takes the same lock briefly to look up the hook a received
/// SM packet is addressed to.
#[derive(Debug)]
pub(crate) struct NexusState {
    /// Registered hooks, indexed by Rpc ID.
    hooks: Box<[Option<Arc<Hook>>]>,
    req_funcs: ReqFuncTable,
    /// Cleared permanently by the first `register_hook`.
    req_func_registration_allowed: bool,
}

impl NexusState {
    pub(crate) fn new() -> Self {
        Self {
            hooks: vec![None; MAX_RPC_ID as usize + 1].into_boxed_slice(),
            req_funcs: ReqFuncTable::new(),
            req_func_registration_allowed: true,
        }
    }

    #[inline]
    pub(crate) fn hook(&self, rpc_id: u8) -> Option<&Arc<Hook>> {
        self.hooks.get(rpc_id as usize)?.as_ref()
    }

    #[cfg(test)]
    pub(crate) fn insert_hook(&mut self, hook: &Arc<Hook>) {
        self.hooks[hook.rpc_id() as usize] = Some(Arc::clone(hook));
    }
}

/// A per-process library object used for initializing eRPC.
///
/// Dropping the Nexus stops its threads. Shutdown is ungraceful: queued
/// background work and SM packets not yet transmitted are discarded.
pub struct Nexus<T: SmTransport = UdpSmTransport> {
    hostname: String,
    /// Port the SM transport is actually bound to.
    sm_udp_port: u16,
    num_bg_threads: usize,
    max_req_funcs: usize,
    max_rpc_id: u8,
    /// Cycle counter frequency, measured once at construction.
    freq_ghz: f64,

    state: Arc<Mutex<NexusState>>,
    /// Handler snapshot taken by the first `register_hook`.
    frozen_req_funcs: Arc<OnceLock<Arc<ReqFuncTable>>>,
    tls_registry: Arc<TlsRegistry>,
    kill_switch: Arc<AtomicBool>,

    sm_tx_queue: Arc<MtQueue<SmWorkItem>>,
    bg_req_queues: Vec<Arc<MtQueue<BgWorkItem>>>,

    sm_thread: Option<JoinHandle<()>>,
    bg_threads: Vec<JoinHandle<()>>,
    _transport: PhantomData<fn() -> T>,
}

impl Nexus<UdpSmTransport> {
    /// Create the Nexus with a UDP session management transport bound to
    /// `config.sm_udp_port`.
    pub fn new(config: NexusConfig) -> Result<Self> {
        config.validate()?;
        let transport = UdpSmTransport::bind(&config.hostname, config.sm_udp_port, config.udp.clone())?;
        Self::with_transport(config, transport)
    }
}

impl<T: SmTransport> Nexus<T> {
    /// Create the Nexus over an already bound SM transport.
    ///
    /// Spawns the SM thread and `config.num_bg_threads` background threads.
    /// If a spawn fails, threads already started are stopped before the error
    /// is returned.
    pub fn with_transport(config: NexusConfig, transport: T) -> Result<Self> {
        config.validate()?;

        let num_bg_threads = config.num_bg_threads;
        let mut nexus = Self {
            hostname: config.hostname.clone(),
            sm_udp_port: transport.local_port(),
            num_bg_threads,
            max_req_funcs: config.max_req_funcs,
            max_rpc_id: config.max_rpc_id,
            freq_ghz: measure_rdtsc_freq(),
            state: Arc::new(Mutex::new(NexusState::new())),
            frozen_req_funcs: Arc::new(OnceLock::new()),
            tls_registry: Arc::new(TlsRegistry::new()),
            kill_switch: Arc::new(AtomicBool::new(false)),
            sm_tx_queue: Arc::new(MtQueue::new()),
            bg_req_queues: (0..num_bg_threads).map(|_| Arc::new(MtQueue::new())).collect(),
            sm_thread: None,
            bg_threads: Vec::with_capacity(num_bg_threads),
            _transport: PhantomData,
        };

        for bg_thread_index in 0..num_bg_threads {
            let ctx = BgThreadCtx {
                kill_switch: Arc::clone(&nexus.kill_switch),
                req_funcs: Arc::clone(&nexus.frozen_req_funcs),
                tls_registry: Arc::clone(&nexus.tls_registry),
                bg_thread_index,
                bg_req_queue: Arc::clone(&nexus.bg_req_queues[bg_thread_index]),
                poll_interval: config.bg_poll_interval,
            };
            let handle = spawn(format!("erpc-bg-{bg_thread_index}"), move || bg_thread_func(ctx))?;
            nexus.bg_threads.push(handle);
        }

        let sm_ctx = SmThreadCtx::new(
            transport,
            Arc::clone(&nexus.kill_switch),
            Arc::clone(&nexus.state),
            Arc::clone(&nexus.sm_tx_queue),
            Arc::clone(&nexus.tls_registry),
            config.sm_event_loop,
            config.sm_thread_core,
        );
        nexus.sm_thread = Some(spawn("erpc-sm".to_string(), move || sm_ctx.run())?);

        info!(
            hostname = %nexus.hostname,
            sm_udp_port = nexus.sm_udp_port,
            num_bg_threads,
            freq_ghz = nexus.freq_ghz,
            "Nexus created"
        );
        Ok(nexus)
    }

    /// Register a request handler for `req_type`.
    ///
    /// Only allowed before the first hook is registered.
    pub fn register_req_func(&self, req_type: u8, req_func: ReqFunc) -> std::result::Result<(), RegistrationError> {
        if req_type == SM_REQ_TYPE {
            return Err(RegistrationError::ReservedReqType(req_type));
        }

        let mut state = self.state.lock();
        if !state.req_func_registration_allowed {
            return Err(RegistrationError::RegistrationClosed);
        }
        if state.req_funcs.contains(req_type) {
            return Err(RegistrationError::DuplicateReqType(req_type));
        }
        if state.req_funcs.len() >= self.max_req_funcs {
            return Err(RegistrationError::ReqTableFull {
                max: self.max_req_funcs,
            });
        }

        debug!(req_type, func_type = ?req_func.func_type(), "registered request handler");
        state.req_funcs.insert(req_type, req_func);
        Ok(())
    }

    /// Register an Rpc's hook and install the Nexus queues into it.
    ///
    /// The first call closes request handler registration, whether or not it
    /// succeeds.
    pub fn register_hook(&self, hook: &Arc<Hook>) -> std::result::Result<(), RegistrationError> {
        let rpc_id = hook.rpc_id();
        let mut state = self.state.lock();

        let req_funcs = Arc::clone(
            self.frozen_req_funcs
                .get_or_init(|| Arc::new(state.req_funcs.clone())),
        );
        if state.req_func_registration_allowed {
            state.req_func_registration_allowed = false;
            debug!(num_req_funcs = req_funcs.len(), "request handler table frozen");
        }

        if rpc_id > self.max_rpc_id {
            return Err(RegistrationError::CapacityExceeded {
                rpc_id,
                max: self.max_rpc_id,
            });
        }
        if state.hooks[rpc_id as usize].is_some() {
            return Err(RegistrationError::DuplicateHook(rpc_id));
        }

        hook.install(&self.bg_req_queues, &self.sm_tx_queue, &req_funcs)?;
        state.hooks[rpc_id as usize] = Some(Arc::clone(hook));
        info!(rpc_id, "registered hook");
        Ok(())
    }

    /// Remove a previously registered hook.
    ///
    /// SM packets that arrive for this Rpc ID afterwards are dropped.
    pub fn unregister_hook(&self, hook: &Arc<Hook>) -> std::result::Result<(), RegistrationError> {
        let rpc_id = hook.rpc_id();
        let mut state = self.state.lock();
        match state.hooks.get_mut(rpc_id as usize) {
            Some(slot) if slot.as_ref().is_some_and(|h| Arc::ptr_eq(h, hook)) => {
                *slot = None;
                info!(rpc_id, "unregistered hook");
                Ok(())
            }
            _ => Err(RegistrationError::HookNotFound(rpc_id)),
        }
    }

    /// Whether a hook is registered for `rpc_id`.
    pub fn rpc_id_exists(&self, rpc_id: u8) -> bool {
        self.state.lock().hook(rpc_id).is_some()
    }

    /// Whether request handlers may still be registered.
    pub fn req_func_registration_allowed(&self) -> bool {
        self.state.lock().req_func_registration_allowed
    }

    #[inline]
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    #[inline]
    pub fn sm_udp_port(&self) -> u16 {
        self.sm_udp_port
    }

    #[inline]
    pub fn num_bg_threads(&self) -> usize {
        self.num_bg_threads
    }

    /// Cycle counter frequency in GHz, shared by every Rpc in the process.
    #[inline]
    pub fn freq_ghz(&self) -> f64 {
        self.freq_ghz
    }

    pub fn tls_registry(&self) -> &Arc<TlsRegistry> {
        &self.tls_registry
    }
}

impl<T: SmTransport> Drop for Nexus<T> {
    fn drop(&mut self) {
        self.kill_switch.store(true, Ordering::Release);

        if let Some(handle) = self.sm_thread.take()
            && handle.join().is_err()
        {
            warn!("SM thread panicked");
        }
        for (i, handle) in self.bg_threads.drain(..).enumerate() {
            if handle.join().is_err() {
                warn!(bg_thread_index = i, "background thread panicked");
            }
        }
        info!(hostname = %self.hostname, "Nexus destroyed");
    }
}

fn spawn<F>(name: String, f: F) -> Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.clone())
        .spawn(f)
        .map_err(|source| Error::ThreadSpawn { name, source })
}
