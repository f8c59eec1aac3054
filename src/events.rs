//! Event sink
//!
//! The core never talks to a UI. Everything observable (lifecycle changes,
//! shell output, tunnel notifications) is pushed through an injected
//! [`EventSink`]. Events are fire-and-forget and carry plain data only.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::forwarding::TunnelConfig;
use crate::session::SessionState;
use crate::ssh::ErrorKind;

/// An event addressed to a session, tunnel or file-session id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "topic", content = "payload", rename_all = "camelCase")]
pub enum SessionEvent {
    /// Session is connected and its shell is open
    Ready,
    /// Shell output, in arrival order
    Data { data: Vec<u8> },
    Error {
        message: String,
        #[serde(rename = "type")]
        kind: ErrorKind,
        /// Set on the final error of a session that will not be retried
        terminal: bool,
    },
    Close,
    /// Lifecycle state transition
    State {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(rename = "delayMs", skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        terminal: bool,
    },
    TunnelStarted {
        #[serde(rename = "tunnelId")]
        tunnel_id: String,
        config: TunnelConfig,
    },
}

impl SessionEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            SessionEvent::Ready => "ready",
            SessionEvent::Data { .. } => "data",
            SessionEvent::Error { .. } => "error",
            SessionEvent::Close => "close",
            SessionEvent::State { .. } => "state",
            SessionEvent::TunnelStarted { .. } => "tunnelStarted",
        }
    }

    pub(crate) fn state(state: SessionState) -> Self {
        SessionEvent::State {
            state,
            attempt: None,
            delay_ms: None,
            terminal: false,
        }
    }
}

/// Consumer of core events.
///
/// Called synchronously from inside the core; implementations must not
/// block (queue the event and return).
pub trait EventSink: Send + Sync {
    fn emit(&self, id: &str, event: SessionEvent);
}

/// Sink that drops everything (pooled sessions, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _id: &str, _event: SessionEvent) {}
}

/// An event together with the id it was emitted for
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmittedEvent {
    pub id: String,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Sink that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EmittedEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EmittedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, id: &str, event: SessionEvent) {
        if self
            .tx
            .send(EmittedEvent {
                id: id.to_string(),
                event,
            })
            .is_err()
        {
            tracing::trace!("Event receiver dropped, discarding event for {}", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let event = EmittedEvent {
            id: "s1".into(),
            event: SessionEvent::Error {
                message: "boom".into(),
                kind: ErrorKind::Timeout,
                terminal: false,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["id"], "s1");
        assert_eq!(json["topic"], "error");
        assert_eq!(json["payload"]["type"], "timeout");
        assert_eq!(json["payload"]["message"], "boom");

        let json = serde_json::to_value(SessionEvent::State {
            state: SessionState::Reconnecting,
            attempt: Some(1),
            delay_ms: Some(1000),
            terminal: false,
        })
        .unwrap();
        assert_eq!(json["topic"], "state");
        assert_eq!(json["payload"]["state"], "reconnecting");
        assert_eq!(json["payload"]["delayMs"], 1000);

        let json = serde_json::to_value(SessionEvent::Ready).unwrap();
        assert_eq!(json["topic"], "ready");
    }

    #[tokio::test]
    async fn test_channel_sink_preserves_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit("a", SessionEvent::Data { data: b"1".to_vec() });
        sink.emit("a", SessionEvent::Data { data: b"2".to_vec() });
        sink.emit("a", SessionEvent::Close);

        let topics: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event.topic())
            .collect();
        assert_eq!(topics, vec!["data", "data", "close"]);
    }
}
