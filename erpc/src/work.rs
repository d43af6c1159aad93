//! Request handlers and deferred work items for background threads.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::buffer::MsgBuffer;
use crate::config::MAX_REQ_TYPES;
use crate::mt_queue::MtQueue;

/// Opaque execution context handed to request handlers and continuations.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Application request handler.
pub type ReqHandler = Arc<dyn Fn(&mut ReqHandle, &Context) + Send + Sync>;

/// Continuation run when a response arrives.
pub type Continuation = Box<dyn FnOnce(RespHandle, &Context) + Send>;

/// Where a request handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqFuncType {
    /// Inline on the endpoint thread.
    Foreground,
    /// On a background thread, for handlers that may run long.
    Background,
}

/// A registered request handler.
#[derive(Clone)]
pub struct ReqFunc {
    handler: ReqHandler,
    func_type: ReqFuncType,
}

impl ReqFunc {
    pub fn new<F>(func_type: ReqFuncType, handler: F) -> Self
    where
        F: Fn(&mut ReqHandle, &Context) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            func_type,
        }
    }

    pub fn foreground<F>(handler: F) -> Self
    where
        F: Fn(&mut ReqHandle, &Context) + Send + Sync + 'static,
    {
        Self::new(ReqFuncType::Foreground, handler)
    }

    pub fn background<F>(handler: F) -> Self
    where
        F: Fn(&mut ReqHandle, &Context) + Send + Sync + 'static,
    {
        Self::new(ReqFuncType::Background, handler)
    }

    #[inline]
    pub fn func_type(&self) -> ReqFuncType {
        self.func_type
    }

    #[inline]
    pub fn is_background(&self) -> bool {
        self.func_type == ReqFuncType::Background
    }

    /// Run the handler.
    pub fn call(&self, handle: &mut ReqHandle, context: &Context) {
        (self.handler)(handle, context)
    }
}

impl fmt::Debug for ReqFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqFunc").field("func_type", &self.func_type).finish()
    }
}

/// Fixed-capacity table of request handlers indexed by request type.
#[derive(Debug, Clone)]
pub struct ReqFuncTable {
    funcs: Box<[Option<ReqFunc>]>,
    count: usize,
}

impl ReqFuncTable {
    pub fn new() -> Self {
        Self {
            funcs: vec![None; MAX_REQ_TYPES].into_boxed_slice(),
            count: 0,
        }
    }

    #[inline]
    pub fn get(&self, req_type: u8) -> Option<&ReqFunc> {
        self.funcs.get(req_type as usize)?.as_ref()
    }

    #[inline]
    pub fn contains(&self, req_type: u8) -> bool {
        self.get(req_type).is_some()
    }

    /// Number of installed handlers.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Install a handler in a free slot. The caller checks capacity and duplicates.
    pub(crate) fn insert(&mut self, req_type: u8, func: ReqFunc) {
        let slot = &mut self.funcs[req_type as usize];
        debug_assert!(slot.is_none());
        *slot = Some(func);
        self.count += 1;
    }
}

impl Default for ReqFuncTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side state of one request exchange.
pub struct ReqHandle {
    pub session_num: u16,
    pub req_num: u64,
    pub req_type: u8,
    /// The received request.
    pub req_msgbuf: MsgBuffer,
    resp_msgbuf: Option<MsgBuffer>,
}

impl ReqHandle {
    pub fn new(session_num: u16, req_num: u64, req_type: u8, req_msgbuf: MsgBuffer) -> Self {
        Self {
            session_num,
            req_num,
            req_type,
            req_msgbuf,
            resp_msgbuf: None,
        }
    }

    /// Attach the response. A later call replaces an earlier one.
    pub fn respond(&mut self, resp_msgbuf: MsgBuffer) {
        self.resp_msgbuf = Some(resp_msgbuf);
    }

    #[inline]
    pub fn has_response(&self) -> bool {
        self.resp_msgbuf.is_some()
    }

    pub fn response(&self) -> Option<&MsgBuffer> {
        self.resp_msgbuf.as_ref()
    }

    pub fn take_response(&mut self) -> Option<MsgBuffer> {
        self.resp_msgbuf.take()
    }
}

impl fmt::Debug for ReqHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReqHandle")
            .field("session_num", &self.session_num)
            .field("req_num", &self.req_num)
            .field("req_type", &self.req_type)
            .field("has_response", &self.has_response())
            .finish()
    }
}

/// Client-side state of a completed exchange.
#[derive(Debug)]
pub struct RespHandle {
    pub session_num: u16,
    pub req_num: u64,
    pub resp_msgbuf: MsgBuffer,
}

/// Kind of a background work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BgWorkItemType {
    Req,
    Resp,
}

enum BgWork {
    Req {
        handle: ReqHandle,
        /// The submitting endpoint's queue for finished requests.
        done: Arc<MtQueue<ReqHandle>>,
    },
    Resp {
        resp: RespHandle,
        cont: Continuation,
    },
}

/// A work item submitted to a background thread.
///
/// Consumed exactly once by the worker whose queue it was pushed to.
pub struct BgWorkItem {
    /// The Rpc that submitted this item.
    pub rpc_id: u8,
    pub context: Context,
    work: BgWork,
}

impl BgWorkItem {
    pub(crate) fn request(
        rpc_id: u8,
        context: Context,
        handle: ReqHandle,
        done: Arc<MtQueue<ReqHandle>>,
    ) -> Self {
        Self {
            rpc_id,
            context,
            work: BgWork::Req { handle, done },
        }
    }

    pub(crate) fn response(rpc_id: u8, context: Context, resp: RespHandle, cont: Continuation) -> Self {
        Self {
            rpc_id,
            context,
            work: BgWork::Resp { resp, cont },
        }
    }

    #[inline]
    pub fn wi_type(&self) -> BgWorkItemType {
        match self.work {
            BgWork::Req { .. } => BgWorkItemType::Req,
            BgWork::Resp { .. } => BgWorkItemType::Resp,
        }
    }

    #[inline]
    pub fn is_req(&self) -> bool {
        self.wi_type() == BgWorkItemType::Req
    }

    /// Request number of the exchange this item resumes.
    pub fn req_num(&self) -> u64 {
        match &self.work {
            BgWork::Req { handle, .. } => handle.req_num,
            BgWork::Resp { resp, .. } => resp.req_num,
        }
    }

    /// Run the item. Requests go through `req_funcs` and are handed back to
    /// the submitting endpoint; responses run their continuation.
    ///
    /// A panicking handler or continuation is logged and contained. The
    /// request handle still goes back to the endpoint, without a response.
    pub(crate) fn execute(self, req_funcs: Option<&ReqFuncTable>) {
        let Self { rpc_id, context, work } = self;
        match work {
            BgWork::Req { mut handle, done } => {
                match req_funcs.and_then(|t| t.get(handle.req_type)) {
                    Some(func) => {
                        let ran = panic::catch_unwind(AssertUnwindSafe(|| func.call(&mut handle, &context)));
                        if ran.is_err() {
                            warn!(
                                rpc_id,
                                req_type = handle.req_type,
                                req_num = handle.req_num,
                                "background request handler panicked"
                            );
                            handle.take_response();
                        }
                    }
                    None => warn!(
                        rpc_id,
                        req_type = handle.req_type,
                        "background request for unregistered request type"
                    ),
                }
                done.push(handle);
            }
            BgWork::Resp { resp, cont } => {
                let req_num = resp.req_num;
                if panic::catch_unwind(AssertUnwindSafe(|| cont(resp, &context))).is_err() {
                    warn!(rpc_id, req_num, "background continuation panicked");
                }
            }
        }
    }
}

impl fmt::Debug for BgWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BgWorkItem")
            .field("rpc_id", &self.rpc_id)
            .field("wi_type", &self.wi_type())
            .field("req_num", &self.req_num())
            .finish()
    }
}
