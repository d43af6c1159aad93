//! Per-endpoint hook shared between an Rpc thread and the Nexus.
//!
//! An Rpc thread creates a [`Hook`] and registers it with the Nexus. The Nexus
//! installs the background request queues, the SM thread's transmit queue and
//! a snapshot of the request handler table; after that the Rpc thread talks to
//! the other threads only by pushing to and draining these queues.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::error::RegistrationError;
use crate::mt_queue::MtQueue;
use crate::sm::SmWorkItem;
use crate::work::{BgWorkItem, Context, Continuation, ReqFuncTable, ReqHandle, RespHandle};

/// A hook created by an Rpc thread, and shared with the Nexus.
pub struct Hook {
    /// ID of the Rpc that created this hook.
    rpc_id: u8,

    // Installed once by the Nexus at registration, read-only afterwards.
    /// Background thread request queues.
    bg_req_queues: OnceLock<Box<[Arc<MtQueue<BgWorkItem>>]>>,
    /// The SM thread's transmit queue.
    sm_tx_queue: OnceLock<Arc<MtQueue<SmWorkItem>>>,
    /// Frozen request handler table.
    req_funcs: OnceLock<Arc<ReqFuncTable>>,

    /// SM packets received for this Rpc, pushed by the SM thread.
    sm_rx_queue: Arc<MtQueue<SmWorkItem>>,
    /// Requests finished by background threads.
    bg_resp_queue: Arc<MtQueue<ReqHandle>>,
}

impl Hook {
    pub fn new(rpc_id: u8) -> Arc<Self> {
        Arc::new(Self {
            rpc_id,
            bg_req_queues: OnceLock::new(),
            sm_tx_queue: OnceLock::new(),
            req_funcs: OnceLock::new(),
            sm_rx_queue: Arc::new(MtQueue::new()),
            bg_resp_queue: Arc::new(MtQueue::new()),
        })
    }

    #[inline]
    pub fn rpc_id(&self) -> u8 {
        self.rpc_id
    }

    /// Whether a Nexus has installed its queues into this hook.
    #[inline]
    pub fn is_installed(&self) -> bool {
        self.sm_tx_queue.get().is_some()
    }

    /// Install the Nexus-owned queues. Called under the Nexus lock.
    ///
    /// Installing the same Nexus's queues again (re-registration after an
    /// unregister) is a no-op.
    pub(crate) fn install(
        &self,
        bg_req_queues: &[Arc<MtQueue<BgWorkItem>>],
        sm_tx_queue: &Arc<MtQueue<SmWorkItem>>,
        req_funcs: &Arc<ReqFuncTable>,
    ) -> Result<(), RegistrationError> {
        if let Err(ours) = self.sm_tx_queue.set(Arc::clone(sm_tx_queue)) {
            let installed = self.sm_tx_queue.get().is_some_and(|q| Arc::ptr_eq(q, &ours));
            return if installed {
                Ok(())
            } else {
                Err(RegistrationError::HookBoundElsewhere(self.rpc_id))
            };
        }
        // The sm_tx_queue set above is the only gate; these are still empty.
        let bg_set = self.bg_req_queues.set(bg_req_queues.to_vec().into_boxed_slice());
        let funcs_set = self.req_funcs.set(Arc::clone(req_funcs));
        debug_assert!(bg_set.is_ok() && funcs_set.is_ok());
        Ok(())
    }

    pub(crate) fn sm_rx_queue(&self) -> &Arc<MtQueue<SmWorkItem>> {
        &self.sm_rx_queue
    }

    fn bg_req_queues(&self) -> &[Arc<MtQueue<BgWorkItem>>] {
        match self.bg_req_queues.get() {
            Some(queues) => &queues[..],
            None => &[],
        }
    }

    /// Number of background threads reachable through this hook.
    pub fn num_bg_threads(&self) -> usize {
        self.bg_req_queues().len()
    }

    /// The request handler snapshot taken at registration.
    pub fn req_funcs(&self) -> Option<&ReqFuncTable> {
        self.req_funcs.get().map(|t| &**t)
    }

    /// Hand a request to background thread `bg_idx`.
    ///
    /// The finished request comes back through [`Hook::drain_bg_responses`].
    ///
    /// # Panics
    /// Panics if the hook is not registered or `bg_idx` is out of range.
    pub fn submit_bg_request(&self, bg_idx: usize, handle: ReqHandle, context: Context) {
        let item = BgWorkItem::request(self.rpc_id, context, handle, Arc::clone(&self.bg_resp_queue));
        self.bg_queue(bg_idx).push(item);
    }

    /// Hand a response continuation to background thread `bg_idx`.
    ///
    /// # Panics
    /// Panics if the hook is not registered or `bg_idx` is out of range.
    pub fn submit_bg_response(&self, bg_idx: usize, resp: RespHandle, cont: Continuation, context: Context) {
        let item = BgWorkItem::response(self.rpc_id, context, resp, cont);
        self.bg_queue(bg_idx).push(item);
    }

    fn bg_queue(&self, bg_idx: usize) -> &MtQueue<BgWorkItem> {
        let queues = self.bg_req_queues();
        assert!(
            bg_idx < queues.len(),
            "Rpc {}: background thread {} of {}",
            self.rpc_id,
            bg_idx,
            queues.len()
        );
        &queues[bg_idx]
    }

    /// Queue an SM packet for the SM thread to transmit.
    ///
    /// # Panics
    /// Panics if the hook is not registered.
    pub fn sm_tx(&self, item: SmWorkItem) {
        match self.sm_tx_queue.get() {
            Some(queue) => queue.push(item),
            None => panic!("Rpc {}: hook is not registered with a Nexus", self.rpc_id),
        }
    }

    /// Take every SM packet the SM thread delivered to this Rpc.
    pub fn drain_sm_rx(&self) -> Vec<SmWorkItem> {
        self.sm_rx_queue.drain_all()
    }

    /// Take every request finished by a background thread.
    pub fn drain_bg_responses(&self) -> Vec<ReqHandle> {
        self.bg_resp_queue.drain_all()
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("rpc_id", &self.rpc_id)
            .field("installed", &self.is_installed())
            .field("num_bg_threads", &self.num_bg_threads())
            .finish()
    }
}
