//! Error types for the eRPC Nexus.
//!
//! Two families are kept apart. [`Error`] covers setup failures that leave the
//! process without a working Nexus (bind, thread spawn, bad configuration).
//! [`RegistrationError`] is the set of discrete, recoverable failure codes
//! returned to endpoint threads when they register handlers or hooks.

use thiserror::Error;

/// Error type for Nexus construction and control-plane I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// The session management port could not be bound.
    #[error("failed to bind session management port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// A background or session management thread could not be spawned.
    #[error("failed to spawn thread {name}: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error from the control-plane transport.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A session management packet could not be decoded.
    #[error("invalid session management packet: {0}")]
    InvalidSmPacket(String),
}

/// Failure codes for request handler and hook registration.
///
/// These are never fatal; the endpoint decides whether to retry or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// A handler is already installed for this request type.
    #[error("request type {0} already has a handler")]
    DuplicateReqType(u8),

    /// The handler table holds `max` handlers already.
    #[error("request handler table is full ({max} handlers)")]
    ReqTableFull { max: usize },

    /// The request type is reserved for session management.
    #[error("request type {0} is reserved")]
    ReservedReqType(u8),

    /// A hook has been registered, so the handler table is frozen.
    #[error("request handler registration is closed")]
    RegistrationClosed,

    /// A hook with this Rpc ID is already registered.
    #[error("Rpc ID {0} already has a registered hook")]
    DuplicateHook(u8),

    /// The Rpc ID is beyond the Nexus's hook capacity.
    #[error("Rpc ID {rpc_id} exceeds the maximum of {max}")]
    CapacityExceeded { rpc_id: u8, max: u8 },

    /// No hook is registered for this Rpc ID.
    #[error("no hook registered for Rpc ID {0}")]
    HookNotFound(u8),

    /// The hook's queues were installed by a different Nexus.
    #[error("hook for Rpc ID {0} is bound to another Nexus")]
    HookBoundElsewhere(u8),
}

/// Result type for Nexus operations.
pub type Result<T> = std::result::Result<T, Error>;
