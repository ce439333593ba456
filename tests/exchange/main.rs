//! Exchange Tests
//!
//! End-to-end behavior of the exchange over the in-memory job queue and
//! pub/sub broker:
//! - routing between the queue hop and the transport hop
//! - single-flight subscribe/unsubscribe under concurrent callers
//! - channel handshake, pending publishes and teardown

mod channels;
mod routing;
mod subscriptions;
