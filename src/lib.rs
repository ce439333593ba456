//! Message exchange: durable queue ingestion first, then per-topic fan-out
//! over a pub/sub transport.
//!
//! An outbound [`Message`] without a `published` marker is sent to the job
//! queue. The exchange's [`Handler`] receives it there and may publish it
//! again with a target topic; that hop goes to the transport, and every
//! process subscribed to the topic delivers it to its local listeners and
//! [`Channel`]s.

mod channel;
mod config;
mod error;
mod observers;

pub mod exchange;
pub mod in_memory;
pub mod message;
pub mod pubsub;
pub mod queue;

pub use channel::{Channel, ChannelListener};
pub use config::{
    AckPolicy, ChannelConfig, ExchangeConfig, PubSubConfig, QueueConfig, TeardownPolicy,
    DEFAULT_WORK_TYPE,
};
pub use error::{CodecError, ExchangeError, HandlerError, QueueError, TransportError};
#[cfg(feature = "emitter")]
pub use exchange::EmitterHandler;
pub use exchange::{Exchange, Handler, HandlerRegistry};
pub use in_memory::{in_memory, in_memory_with, InMemoryStack};
pub use message::Message;
pub use observers::{ErrorListener, ListenerId};
pub use pubsub::{PubSub, TopicPhase, Transport};
pub use queue::{JobQueue, Queue};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
