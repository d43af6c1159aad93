//! # eRPC Nexus - per-process runtime for eRPC endpoints
//!
//! This crate provides the process-wide pieces of eRPC (NSDI 2019): the
//! message buffer layout shared by every endpoint, and the Nexus that owns
//! the session management thread and the background request threads.
//!
//! ## Features
//!
//! - **Message buffers**: Data region with a packet header in front of it and
//!   one header per extra packet behind it, ready for scatter-gather transmit
//! - **Request handler table**: Fixed-size, registered up front, then frozen
//!   and shared read-only with every endpoint
//! - **Hooks**: Per-endpoint queue bundle for talking to the Nexus threads
//! - **Session management thread**: Exchanges SM packets with remote
//!   processes over UDP, buffering packets until a peer connects
//! - **Background threads**: Run long request handlers and continuations
//!   off the endpoint's dispatch thread
//!
//! ## Usage
//!
//! ```ignore
//! use erpc::{Hook, Nexus, NexusConfig, ReqFunc, ReqHandle, Context};
//!
//! let nexus = Nexus::new(NexusConfig::new("node-a", 31850).with_bg_threads(2))?;
//!
//! // Handlers first: the first hook freezes the table.
//! nexus.register_req_func(1, ReqFunc::background(|handle: &mut ReqHandle, _: &Context| {
//!     // Build the response
//! }))?;
//!
//! let hook = Hook::new(0);
//! nexus.register_hook(&hook)?;
//!
//! // Talk to the Nexus threads through the hook.
//! hook.submit_bg_request(0, req_handle, context);
//! for done in hook.drain_bg_responses() {
//!     // Transmit the response
//! }
//! ```
//!
//! ## Architecture
//!
//! The crate is organized as follows:
//!
//! - [`config`]: Configuration types (`NexusConfig`, `UdpSmConfig`)
//! - [`packet`]: Packet header format (`PktHdr`)
//! - [`buffer`]: Message buffers (`Buffer`, `MsgBuffer`)
//! - [`mt_queue`]: Multi-producer hand-off queue (`MtQueue`)
//! - [`work`]: Request handlers and background work items
//! - [`sm`]: Session management packets and work items
//! - [`transport`]: Control-plane transport (`SmTransport`, `UdpSmTransport`)
//! - [`hook`]: Per-endpoint hook (`Hook`)
//! - [`timing`]: Cycle counter and its frequency
//! - [`tls_registry`]: Per-thread eRPC IDs
//! - [`nexus`]: The per-process Nexus (`Nexus`)
//!
//! ## References
//!
//! - [eRPC: General-Purpose RPCs for the Datacenter (NSDI 2019)](https://www.usenix.org/conference/nsdi19/presentation/kalia)

pub mod buffer;
pub mod config;
pub mod error;
pub mod hook;
pub mod mt_queue;
pub mod nexus;
pub mod packet;
pub mod sm;
pub mod timing;
pub mod tls_registry;
pub mod transport;
pub mod work;

mod bg_thread;
mod sm_thread;

// Re-export main types
pub use buffer::{Buffer, Direction, MsgBuffer, Progress};
pub use config::{MAX_BG_THREADS, MAX_RPC_ID, NexusConfig, SM_REQ_TYPE, UdpSmConfig};
pub use error::{Error, RegistrationError, Result};
pub use hook::Hook;
pub use mt_queue::MtQueue;
pub use nexus::Nexus;
pub use packet::{PKT_HDR_SIZE, PktHdr, PktType};
pub use sm::{PeerId, SmPeer, SmPkt, SmPktType, SmWorkItem};
pub use tls_registry::TlsRegistry;
pub use transport::{SmEvent, SmTransport, UdpSmTransport};
pub use work::{
    BgWorkItem, BgWorkItemType, Context, Continuation, ReqFunc, ReqFuncTable, ReqFuncType, ReqHandle, ReqHandler,
    RespHandle,
};
