//! PubSub - topic fan-out over a transport with single-flight subscriptions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PubSub (per exchange)                     │
//! │  - send(message, topic) -> publisher connection             │
//! │  - subscribe / unsubscribe -> subscriber connection          │
//! │  - on_message(topic, message) from subscriber connection     │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TopicTable (one record per topic)            │
//! │  Idle -> Subscribing -> Subscribed -> Unsubscribing -> Idle  │
//! │  at most one transport request in flight per topic           │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────┐    ┌──────────────────────────────┐
//! │ InMemoryTransport   │    │ Redis pub/sub connection     │
//! │ (included)          │    │ (external)                   │
//! └─────────────────────┘    └──────────────────────────────┘
//! ```

mod in_memory;
mod pubsub;
mod state;
mod transport;

pub use in_memory::{CompletionMode, InMemoryBroker, InMemoryTransport, Operation};
pub use pubsub::{PubSub, TopicMessageListener};
pub use state::TopicPhase;
pub use transport::{Completion, Receiver, Transport};
