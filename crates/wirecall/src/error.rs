//! User-visible error taxonomy.
//!
//! Three tiers: `ConfigError` is synchronous and pre-backend, `CallError`
//! is synchronous misuse of an existing handle, and `RpcError` is how an
//! awaited call settles when it does not settle with a result. All
//! backend-side failures travel the envelope channel and arrive here as
//! `RpcError` variants — there is no out-of-band signaling.

use std::time::Duration;

use crate::protocol::{ErrorPayload, ResponseKind};

/// Rejected before any backend is constructed.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no program source supplied")]
    MissingSource,

    #[error("ambiguous program source: {0} forms supplied, expected exactly one")]
    AmbiguousSource(usize),

    #[error("no program registered under name `{0}`")]
    UnknownProgram(String),

    #[error("failed to start worker thread: {0}")]
    Spawn(String),
}

/// Synchronous `call()` failures. These never contact the backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("handle is terminated")]
    Terminated,

    #[error("`{0}` is a reserved action name")]
    ReservedAction(String),
}

/// How a pending call settles when it does not resolve with a payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RpcError {
    /// The backend program failed to load or initialize.
    #[error("program initialization failed: {message}")]
    Init {
        message: String,
        detail: Option<String>,
    },

    /// The operation itself failed (returned an error or panicked).
    #[error("operation failed: {message}")]
    Execution { message: String },

    /// The backend acknowledged a cooperative cancel for this call.
    #[error("operation cancelled")]
    Cancelled,

    /// No terminal envelope arrived within the configured window.
    #[error("no response within {after:?}")]
    Timeout { after: Duration },

    /// The handle was terminated while this call was still pending.
    #[error("handle terminated while the call was pending")]
    Terminated,

    /// The settlement channel vanished without a terminal envelope.
    #[error("backend channel closed before a terminal response")]
    ChannelClosed,
}

impl RpcError {
    /// Map a terminal error envelope onto the taxonomy.
    pub(crate) fn from_terminal(kind: ResponseKind, payload: &ErrorPayload) -> Self {
        match kind {
            ResponseKind::InitError => Self::Init {
                message: payload.message.clone(),
                detail: payload.detail.clone(),
            },
            _ if payload.cancelled => Self::Cancelled,
            _ => Self::Execution {
                message: payload.message.clone(),
            },
        }
    }
}
