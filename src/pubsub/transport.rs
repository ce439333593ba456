//! Pub/sub transport collaborator trait.

use std::sync::Arc;

use crate::error::TransportError;

/// One-shot completion of a subscribe or unsubscribe round trip.
pub type Completion = Box<dyn FnOnce(Result<(), TransportError>) + Send>;

/// Inbound delivery callback: `(topic, raw_payload)`.
pub type Receiver = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Trait for a topic-based publish/subscribe connection.
///
/// Implementations might include:
/// - `InMemoryTransport` - For testing and single-process scenarios
/// - A Redis pub/sub connection for multi-process deployments
///
/// Topics seen here are transport topics, prefix included.
pub trait Transport: Send + Sync {
    /// Best-effort fan-out; there is no delivery acknowledgement.
    fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError>;

    /// One round trip; `done` may run before this returns or later on any thread.
    fn subscribe(&self, topic: &str, done: Completion);

    fn unsubscribe(&self, topic: &str, done: Completion);

    /// Install the callback receiving messages for subscribed topics.
    fn set_receiver(&self, receiver: Receiver);
}
