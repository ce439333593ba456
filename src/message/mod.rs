//! The message value routed by the exchange, and its wire codec.

pub mod codec;
mod message;

pub use message::Message;
