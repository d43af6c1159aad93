//! Background request processing threads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::mt_queue::MtQueue;
use crate::tls_registry::TlsRegistry;
use crate::work::{BgWorkItem, ReqFuncTable};

/// Background thread context.
pub(crate) struct BgThreadCtx {
    /// The Nexus's kill switch.
    pub kill_switch: Arc<AtomicBool>,
    /// The Nexus's request handler table. Background threads start before
    /// handlers are registered, so they read the table once it is frozen.
    pub req_funcs: Arc<OnceLock<Arc<ReqFuncTable>>>,
    pub tls_registry: Arc<TlsRegistry>,
    /// Index of this background thread.
    pub bg_thread_index: usize,
    /// This thread's request queue. Only this thread drains it.
    pub bg_req_queue: Arc<MtQueue<BgWorkItem>>,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
}

/// The function executed by background threads.
///
/// Items run strictly in drained order. A panicking handler or continuation
/// does not stop the worker. The kill switch is checked once per iteration;
/// queued items left at shutdown are dropped.
pub(crate) fn bg_thread_func(ctx: BgThreadCtx) {
    let etid = ctx.tls_registry.init();
    debug!(bg_thread_index = ctx.bg_thread_index, etid, "background thread running");

    while !ctx.kill_switch.load(Ordering::Acquire) {
        if ctx.bg_req_queue.is_empty() {
            thread::sleep(ctx.poll_interval);
            continue;
        }

        let items = ctx.bg_req_queue.drain_all();
        let req_funcs = ctx.req_funcs.get().map(|t| &**t);
        for wi in items {
            trace!(bg_thread_index = ctx.bg_thread_index, ?wi, "executing");
            wi.execute(req_funcs);
        }
    }

    debug!(
        bg_thread_index = ctx.bg_thread_index,
        dropped = ctx.bg_req_queue.len(),
        "background thread exiting"
    );
}
