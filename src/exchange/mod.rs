//! Exchange - queue first, then per-topic fan-out
//!
//! ```text
//! producer ──publish──▶ Exchange ──unpublished──▶ Queue ──▶ Handler
//!                          ▲                                  │
//!                          └──────── publish (with target) ◀──┘
//!                          │
//!                          └──published──▶ PubSub ──▶ transport
//!                                             │
//!        Channel / topic listeners ◀──────────┘ (every subscribed process)
//! ```

#[cfg(feature = "emitter")]
mod emitter;
mod exchange;
mod handler;

#[cfg(feature = "emitter")]
pub use emitter::EmitterHandler;
pub use exchange::{Exchange, TopicListener};
pub use handler::{ActionHandler, Handler, HandlerRegistry};
