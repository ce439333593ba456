//! In-memory wiring of a complete exchange stack.
//!
//! Process-level convenience for tests, development and single-process
//! deployments. The core types never construct collaborators themselves.

use crate::config::ExchangeConfig;
use crate::exchange::Exchange;
use crate::pubsub::{CompletionMode, InMemoryBroker, InMemoryTransport, PubSub};
use crate::queue::{InMemoryJobQueue, Queue};

/// An exchange wired to in-memory collaborators, with handles to each of
/// them for inspection.
#[derive(Clone)]
pub struct InMemoryStack {
    pub exchange: Exchange,
    pub jobs: InMemoryJobQueue,
    pub broker: InMemoryBroker,
    /// Outbound connection of the pubsub adapter
    pub publisher: InMemoryTransport,
    /// Inbound connection of the pubsub adapter
    pub subscriber: InMemoryTransport,
}

impl InMemoryStack {
    /// Another exchange on the same broker, as a second process would have
    /// with its own queue.
    pub fn peer(&self, config: ExchangeConfig, mode: CompletionMode) -> InMemoryStack {
        build(self.broker.clone(), config, mode)
    }
}

/// Default configuration; transport round trips complete immediately.
///
/// ```
/// use bus_exchange::{in_memory, Message};
///
/// let stack = in_memory();
/// stack.exchange.publish(&mut Message::new("chat.say"));
/// assert_eq!(stack.jobs.completed_ids(), vec![1]);
/// ```
pub fn in_memory() -> InMemoryStack {
    in_memory_with(ExchangeConfig::default(), CompletionMode::Immediate)
}

/// `mode` applies to the inbound connection, where subscribes happen.
pub fn in_memory_with(config: ExchangeConfig, mode: CompletionMode) -> InMemoryStack {
    build(InMemoryBroker::new(), config, mode)
}

fn build(broker: InMemoryBroker, config: ExchangeConfig, mode: CompletionMode) -> InMemoryStack {
    let jobs = InMemoryJobQueue::new();
    let publisher = broker.connect();
    let subscriber = broker.connect_with(mode);

    let queue = Queue::with_config(jobs.clone(), config.queue);
    let pubsub = PubSub::with_config(publisher.clone(), subscriber.clone(), config.pubsub);
    let exchange = Exchange::new(queue, pubsub);
    exchange.set_channel_config(config.channel);

    InMemoryStack {
        exchange,
        jobs,
        broker,
        publisher,
        subscriber,
    }
}
