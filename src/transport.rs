//! # Transport Boundary
//!
//! The service does not own a connection. It consumes [`InboundMessage`]s
//! delivered by some publish/subscribe client and hands replies and events back
//! through the [`Transport`] trait. Publishing is fire-and-forget: failures are
//! logged by the caller and never retried.
//!
//! `tokio::sync::mpsc::UnboundedSender<OutboundMessage>` implements
//! [`Transport`], so an adapter task can forward published messages to a real
//! broker connection.

use crate::error::FrameworkError;
use tokio::sync::mpsc;
use tracing::{trace, warn};

/// A message received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub subject: String,
    /// Address to send the reply to. `None` for messages expecting no reply.
    pub reply: Option<String>,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(subject: impl Into<String>, reply: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: Some(reply.into()),
            payload: payload.into(),
        }
    }
}

/// A message the service publishes: a reply, a timeout extension, or an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
        }
    }

    /// Payload as UTF-8, lossily.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Outbound half of a broker connection.
pub trait Transport: Send + Sync + 'static {
    /// Publishes `payload` on `subject` without waiting for acknowledgement.
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), FrameworkError>;
}

impl Transport for mpsc::UnboundedSender<OutboundMessage> {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), FrameworkError> {
        self.send(OutboundMessage::new(subject, payload.to_vec()))
            .map_err(|_| FrameworkError::Transport("outbound channel closed".to_string()))
    }
}

/// Publishes and logs a failure instead of returning it.
pub(crate) fn publish_logged(transport: &dyn Transport, subject: &str, payload: &[u8]) {
    trace!(subject, payload = %String::from_utf8_lossy(payload), "<==");
    if let Err(e) = transport.publish(subject, payload) {
        warn!(subject, error = %e, "Publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sender_is_a_transport() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.publish("event.a.b.change", br#"{"x":1}"#).unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.subject, "event.a.b.change");
        assert_eq!(msg.text(), r#"{"x":1}"#);

        drop(rx);
        assert!(matches!(tx.publish("x", b""), Err(FrameworkError::Transport(_))));
    }
}
