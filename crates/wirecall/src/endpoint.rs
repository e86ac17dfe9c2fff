//! Endpoint: uniform boundary over either backend.
//!
//! Posting hands the backend a fresh copy of the envelope through a
//! channel, never executing backend code within the calling turn — a
//! caller can always register its pending call before any response could
//! arrive. Inbound traffic is pumped to exactly one dispatcher in arrival
//! order; anything that does not decode as an envelope is dropped.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::backend::BackendMode;
use crate::protocol::Envelope;

/// One of the two execution regimes behind an [`Endpoint`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Enqueue a wire value for the backend. Must never execute operation
    /// code synchronously in the caller's turn.
    fn deliver(&self, wire: Value);

    /// Release backend resources. Idempotent.
    async fn shutdown(&self);

    fn mode(&self) -> BackendMode;
}

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint is shut down")]
    Closed,

    #[error("a dispatcher is already subscribed")]
    AlreadySubscribed,
}

pub struct Endpoint {
    backend: Arc<dyn Backend>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    closed: AtomicBool,
}

impl Endpoint {
    pub fn new(backend: Arc<dyn Backend>, inbound: mpsc::UnboundedReceiver<Value>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            inbound: StdMutex::new(Some(inbound)),
            closed: AtomicBool::new(false),
        })
    }

    /// Post an envelope to the backend. The backend receives a deep copy;
    /// delivery happens on a later turn, never inside this call.
    pub fn post(&self, envelope: &Envelope) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::SeqCst) {
            tracing::warn!(
                target: "wirecall::endpoint",
                call_id = %envelope.id,
                action = %envelope.action,
                "Post after shutdown rejected"
            );
            return Err(EndpointError::Closed);
        }
        self.backend.deliver(envelope.encode());
        Ok(())
    }

    /// Subscribe the single inbound dispatcher and start the pump task.
    /// Must be called from within a Tokio runtime.
    pub fn subscribe<F>(&self, dispatcher: F) -> Result<(), EndpointError>
    where
        F: Fn(Envelope) + Send + 'static,
    {
        let mut receiver = self
            .inbound
            .lock()
            .ok()
            .and_then(|mut guard| guard.take())
            .ok_or(EndpointError::AlreadySubscribed)?;

        // Detached on purpose: the pump ends once the backend drops its
        // outbound senders, after draining whatever was already sent.
        tokio::spawn(async move {
            while let Some(wire) = receiver.recv().await {
                match Envelope::decode(&wire) {
                    Some(envelope) => dispatcher(envelope),
                    None => {
                        tracing::debug!(target: "wirecall::endpoint", "Dropping malformed envelope");
                    }
                }
            }
            tracing::debug!(target: "wirecall::endpoint", "Inbound pump exiting");
        });
        Ok(())
    }

    /// Release backend resources. Idempotent; the pump drains whatever the
    /// backend already sent and then exits on its own.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.backend.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> BackendMode {
        self.backend.mode()
    }
}
