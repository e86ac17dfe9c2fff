//! Console conduit: backend-side logging forwarded to the controller.
//!
//! Every sink call performs the local `tracing` emission first — local
//! visibility is never delayed or suppressed by forwarding — then ships a
//! `console` envelope over the outbound channel. One sink exists per
//! backend instance; per-call scoping clones it with the call id so
//! forwarded lines stay attributable.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::protocol::{Envelope, ResponseKind};

/// Scope id used for console output emitted outside any call (program
/// registration, backend housekeeping).
pub(crate) const BACKEND_SCOPE_ID: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Payload schema of `console` envelopes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleMessage {
    pub level: ConsoleLevel,
    pub message: String,
}

/// Per-severity logging handle available to backend-side operation code.
#[derive(Clone)]
pub struct ConsoleSink {
    scope_id: String,
    tx: mpsc::UnboundedSender<Value>,
}

impl ConsoleSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Value>) -> Self {
        Self {
            scope_id: BACKEND_SCOPE_ID.to_string(),
            tx,
        }
    }

    /// Clone of this sink attributed to a specific call id.
    pub(crate) fn scoped(&self, call_id: &str) -> Self {
        Self {
            scope_id: call_id.to_string(),
            tx: self.tx.clone(),
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(ConsoleLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(ConsoleLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(ConsoleLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(ConsoleLevel::Error, message);
    }

    pub fn log(&self, level: ConsoleLevel, message: &str) {
        // Local emission first.
        match level {
            ConsoleLevel::Debug => {
                tracing::debug!(target: "wirecall::console", call_id = %self.scope_id, "{message}")
            }
            ConsoleLevel::Info => {
                tracing::info!(target: "wirecall::console", call_id = %self.scope_id, "{message}")
            }
            ConsoleLevel::Warn => {
                tracing::warn!(target: "wirecall::console", call_id = %self.scope_id, "{message}")
            }
            ConsoleLevel::Error => {
                tracing::error!(target: "wirecall::console", call_id = %self.scope_id, "{message}")
            }
        }

        let envelope = Envelope::response(
            self.scope_id.clone(),
            ResponseKind::Console,
            json!({"level": level.as_str(), "message": message}),
        );
        if self.tx.send(envelope.encode()).is_err() {
            tracing::debug!(target: "wirecall::console", "Console channel closed, line not forwarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_forwards_console_envelopes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ConsoleSink::new(tx);

        sink.info("hello");
        sink.error("boom");

        let first = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first.kind(), Some(ResponseKind::Console));
        assert_eq!(first.id, BACKEND_SCOPE_ID);
        assert_eq!(first.payload["level"], json!("info"));
        assert_eq!(first.payload["message"], json!("hello"));

        let second = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second.payload["level"], json!("error"));
    }

    #[tokio::test]
    async fn scoped_sink_carries_call_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ConsoleSink::new(tx).scoped("42");

        sink.warn("careful");
        let envelope = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope.id, "42");
        assert_eq!(envelope.payload["level"], json!("warn"));
    }

    #[test]
    fn closed_channel_does_not_panic() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let sink = ConsoleSink::new(tx);
        sink.info("nobody listening");
    }

    #[test]
    fn console_message_roundtrip() {
        let msg = ConsoleMessage {
            level: ConsoleLevel::Warn,
            message: "careful".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value, json!({"level": "warn", "message": "careful"}));

        let decoded: ConsoleMessage = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.level, ConsoleLevel::Warn);
    }
}
