//! # Mock Transport
//!
//! An in-memory [`Transport`] for tests. It records every publish and lets a
//! test wait for the message sent to a given subject, typically the reply
//! address of a request it dispatched.
//!
//! ```ignore
//! let transport = MockTransport::new();
//! let service = service.start(transport.clone());
//!
//! service.dispatch(InboundMessage::new("get.library.book.1", "_INBOX.1", ""));
//! let reply = transport.wait_for("_INBOX.1").await;
//! assert_eq!(reply.text(), r#"{"result":{"model":{"title":"Dune"}}}"#);
//! ```

use crate::error::FrameworkError;
use crate::transport::{OutboundMessage, Transport};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Records published messages in order.
#[derive(Default)]
pub struct MockTransport {
    messages: Mutex<Vec<OutboundMessage>>,
    published: Notify,
    failing: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every message published so far.
    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.messages.lock().clone()
    }

    /// Messages published on `subject`, oldest first.
    pub fn published_to(&self, subject: &str) -> Vec<OutboundMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.subject == subject)
            .cloned()
            .collect()
    }

    pub fn count(&self, subject: &str) -> usize {
        self.messages.lock().iter().filter(|m| m.subject == subject).count()
    }

    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    /// Makes subsequent publishes fail (and not be recorded) while `fail` is set.
    pub fn fail_publishes(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    /// Waits for the first message on `subject`.
    ///
    /// # Panics
    /// If nothing is published on `subject` within five seconds.
    pub async fn wait_for(&self, subject: &str) -> OutboundMessage {
        let mut found = self.wait_for_count(subject, 1).await;
        found.remove(0)
    }

    /// Waits until at least `n` messages were published on `subject` and
    /// returns all of them.
    ///
    /// # Panics
    /// If fewer than `n` arrive within five seconds.
    pub async fn wait_for_count(&self, subject: &str, n: usize) -> Vec<OutboundMessage> {
        let wait = async {
            loop {
                let notified = self.published.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                let found = self.published_to(subject);
                if found.len() >= n {
                    return found;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(WAIT_TIMEOUT, wait).await {
            Ok(found) => found,
            Err(_) => panic!(
                "timed out waiting for {n} message(s) on {subject:?}, got {:?}",
                self.published_to(subject)
            ),
        }
    }
}

impl Transport for MockTransport {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<(), FrameworkError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(FrameworkError::Transport("mock publish failure".to_string()));
        }
        self.messages
            .lock()
            .push(OutboundMessage::new(subject, payload.to_vec()));
        self.published.notify_waiters();
        Ok(())
    }
}
