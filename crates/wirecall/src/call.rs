//! Controller-side handles for one in-flight call.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::endpoint::Endpoint;
use crate::error::RpcError;
use crate::protocol::Envelope;
use crate::registry::CallOutcome;

/// Advisory cancellation handle for one call.
///
/// `cancel()` posts the reserved `cancel` envelope, fire-and-forget: it is
/// effective only if the call has not already settled, and it never
/// preempts work the backend has already started — the backend merely
/// stops producing output once it observes the flag.
#[derive(Clone)]
pub struct AbortHandle {
    id: String,
    requested: CancellationToken,
    endpoint: Arc<Endpoint>,
}

impl AbortHandle {
    pub(crate) fn new(id: String, endpoint: Arc<Endpoint>) -> Self {
        Self {
            id,
            requested: CancellationToken::new(),
            endpoint,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether cancellation was requested through this handle.
    pub fn is_aborted(&self) -> bool {
        self.requested.is_cancelled()
    }

    pub fn cancel(&self) {
        if self.requested.is_cancelled() {
            return;
        }
        self.requested.cancel();
        if self.endpoint.post(&Envelope::cancel(self.id.clone())).is_err() {
            tracing::debug!(target: "wirecall::call", call_id = %self.id, "Cancel after shutdown, nothing to do");
        }
    }
}

/// One pending call: await it for the settlement, cancel it through the
/// attached [`AbortHandle`]. Settles exactly once, with the result payload
/// or one [`RpcError`] variant.
pub struct CallHandle {
    id: String,
    rx: oneshot::Receiver<CallOutcome>,
    abort: AbortHandle,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle").field("id", &self.id).finish()
    }
}

impl CallHandle {
    pub(crate) fn new(id: String, rx: oneshot::Receiver<CallOutcome>, abort: AbortHandle) -> Self {
        Self { id, rx, abort }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn cancel(&self) {
        self.abort.cancel();
    }

    /// Await the settlement.
    pub async fn wait(self) -> Result<serde_json::Value, RpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::ChannelClosed),
        }
    }
}
