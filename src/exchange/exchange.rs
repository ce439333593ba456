//! Exchange: routes outbound messages through the queue or the transport and
//! dispatches inbound messages from both.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{Handler, HandlerRegistry};
use crate::channel::{Channel, WeakChannel};
use crate::config::ChannelConfig;
use crate::error::{panic_message, ExchangeError, HandlerError};
use crate::observers::{ErrorListener, ListenerId, Observers, TopicListeners};
use crate::pubsub::PubSub;
use crate::queue::Queue;
use crate::Message;

/// Callback receiving messages delivered on one topic.
pub type TopicListener = dyn Fn(&Message) -> Result<(), HandlerError> + Send + Sync;

/// Routing layer between a durable queue and a pub/sub transport.
///
/// A message without a `published` marker goes to the queue first; the
/// handler sees it there and may publish it again with a target, and that
/// second hop goes to the transport.
///
/// Cloning yields another handle to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<ExchangeInner>,
}

struct ExchangeInner {
    wiring: Mutex<Wiring>,
    listeners: TopicListeners<TopicListener>,
    /// Subscriptions waiting on the transport, by listener id.
    pending: Mutex<HashMap<ListenerId, String>>,
    channels: Mutex<HashMap<String, WeakChannel>>,
    channel_config: Mutex<ChannelConfig>,
    errors: Observers<ErrorListener>,
}

/// Current collaborators and the ids of the exchange's observers on them.
struct Wiring {
    queue: Queue,
    queue_observers: (ListenerId, ListenerId),
    pubsub: PubSub,
    pubsub_observers: (ListenerId, ListenerId),
    handler: Arc<dyn Handler>,
}

impl Exchange {
    /// Exchange dispatching ingested messages to an empty [`HandlerRegistry`].
    pub fn new(queue: Queue, pubsub: PubSub) -> Self {
        Self::with_handler(queue, pubsub, HandlerRegistry::new())
    }

    pub fn with_handler(queue: Queue, pubsub: PubSub, handler: impl Handler + 'static) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<ExchangeInner>| ExchangeInner {
            wiring: Mutex::new(Wiring {
                queue_observers: attach_queue(weak, &queue),
                queue,
                pubsub_observers: attach_pubsub(weak, &pubsub),
                pubsub,
                handler: Arc::new(handler),
            }),
            listeners: TopicListeners::new(),
            pending: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            channel_config: Mutex::new(ChannelConfig::default()),
            errors: Observers::new(),
        });
        debug!("new exchange");
        Self { inner }
    }

    /// Route a message.
    ///
    /// Unpublished messages are marked published and sent to the queue.
    /// Published messages go to the transport on their `target` topic.
    /// Failures are reported as error notifications.
    pub fn publish(&self, message: &mut Message) -> &Self {
        if !message.is_published() {
            debug!(message_id = %message.id, "publish to queue");
            message.mark_published();
            self.queue().send(message);
            return self;
        }

        match message.target.as_deref() {
            Some(target) => {
                debug!(
                    message_id = %message.id,
                    target,
                    "already queued, publish to target"
                );
                self.pubsub().send(message, target);
            }
            None => self.inner.errors.raise(
                "exchange",
                ExchangeError::MissingTarget {
                    id: message.id.clone(),
                },
            ),
        }
        self
    }

    /// Send a message straight to the transport on `topic`, bypassing the queue.
    pub fn publish_to(&self, message: &Message, topic: &str) -> &Self {
        debug!(message_id = %message.id, topic, "publish on topic");
        self.pubsub().send(message, topic);
        self
    }

    pub fn queue(&self) -> Queue {
        self.inner.wiring.lock().queue.clone()
    }

    /// Replace the queue, detaching from the previous one first.
    pub fn set_queue(&self, queue: Queue) -> &Self {
        let weak = Arc::downgrade(&self.inner);
        let mut wiring = self.inner.wiring.lock();
        let (messages, errors) = wiring.queue_observers;
        wiring.queue.remove_message_listener(messages);
        wiring.queue.remove_error_listener(errors);
        wiring.queue_observers = attach_queue(&weak, &queue);
        wiring.queue = queue;
        debug!("queue replaced");
        self
    }

    pub fn pubsub(&self) -> PubSub {
        self.inner.wiring.lock().pubsub.clone()
    }

    /// Replace the pubsub adapter, detaching from the previous one first.
    pub fn set_pubsub(&self, pubsub: PubSub) -> &Self {
        let weak = Arc::downgrade(&self.inner);
        let mut wiring = self.inner.wiring.lock();
        let (messages, errors) = wiring.pubsub_observers;
        wiring.pubsub.remove_message_listener(messages);
        wiring.pubsub.remove_error_listener(errors);
        wiring.pubsub_observers = attach_pubsub(&weak, &pubsub);
        wiring.pubsub = pubsub;
        debug!("pubsub replaced");
        self
    }

    pub fn handler(&self) -> Arc<dyn Handler> {
        Arc::clone(&self.inner.wiring.lock().handler)
    }

    pub fn set_handler(&self, handler: impl Handler + 'static) -> &Self {
        self.inner.wiring.lock().handler = Arc::new(handler);
        self
    }

    /// Register `listener` on `topic` once the transport subscription exists.
    ///
    /// A topic that is already subscribed costs no transport round trip. The
    /// listener is registered only when `done` reports success; the returned
    /// id is valid for [`unsubscribe`](Self::unsubscribe) either way, and
    /// unsubscribing before `done` runs cancels the registration.
    pub fn subscribe<L, D>(&self, topic: &str, listener: L, done: D) -> ListenerId
    where
        L: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
        D: FnOnce(Result<String, ExchangeError>) + Send + 'static,
    {
        debug!(topic, "subscribe to topic");
        let id = ListenerId::next();
        self.inner.pending.lock().insert(id, topic.to_string());

        let listener: Arc<TopicListener> = Arc::new(listener);
        let weak = Arc::downgrade(&self.inner);
        let owned = topic.to_string();
        self.pubsub().subscribe(topic, move |result| {
            if let Some(inner) = weak.upgrade() {
                let mut pending = inner.pending.lock();
                let live = pending.remove(&id).is_some();
                if live && result.is_ok() {
                    inner.listeners.insert(&owned, id, listener);
                } else if !live {
                    debug!(topic = %owned, "subscription cancelled before it settled");
                }
            }
            done(result)
        });
        id
    }

    /// Remove a listener; the last one on `topic` also drops the transport
    /// subscription. Subscriptions still waiting on the transport count as
    /// listeners.
    pub fn unsubscribe<D>(&self, topic: &str, id: ListenerId, done: D) -> &Self
    where
        D: FnOnce(Result<String, ExchangeError>) + Send + 'static,
    {
        let remaining = {
            let mut pending = self.inner.pending.lock();
            pending.remove(&id);
            let waiting = pending.values().filter(|t| t.as_str() == topic).count();
            self.inner.listeners.remove(topic, id) + waiting
        };
        debug!(topic, remaining, "unsubscribe from topic");
        if remaining == 0 {
            self.pubsub().unsubscribe(topic, done);
        } else {
            done(Ok(topic.to_string()));
        }
        self
    }

    /// Register a topic listener without touching the transport.
    pub fn attach<L>(&self, topic: &str, listener: L) -> ListenerId
    where
        L: Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner.listeners.add(topic, Arc::new(listener))
    }

    pub fn listener_count(&self, topic: &str) -> usize {
        self.inner.listeners.count(topic)
    }

    /// Topics with at least one registered listener, sorted.
    pub fn topics(&self) -> Vec<String> {
        self.inner.listeners.topics()
    }

    /// The live channel for `topic`, created on first use.
    pub fn channel(&self, topic: &str) -> Channel {
        let mut channels = self.inner.channels.lock();
        if let Some(channel) = channels.get(topic).and_then(WeakChannel::upgrade) {
            return channel;
        }
        let config = *self.inner.channel_config.lock();
        let channel = Channel::with_config(topic, self, config);
        channels.insert(topic.to_string(), channel.downgrade());
        channel
    }

    /// Configuration for channels created by [`channel`](Self::channel).
    pub fn set_channel_config(&self, config: ChannelConfig) -> &Self {
        *self.inner.channel_config.lock() = config;
        self
    }

    /// Topics with a live channel in the registry, sorted.
    pub fn channel_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .channels
            .lock()
            .iter()
            .filter(|(_, channel)| channel.is_alive())
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    /// Drop the registry entry for `channel` if it is still the registered one.
    pub(crate) fn forget_channel(&self, channel: &Channel) {
        let mut channels = self.inner.channels.lock();
        let registered = channels
            .get(channel.topic())
            .is_some_and(|entry| entry.points_to(channel));
        if registered {
            channels.remove(channel.topic());
        }
    }

    /// Error notifications from the exchange, its queue and its pubsub.
    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExchangeError) + Send + Sync + 'static,
    {
        self.inner.errors.add(Arc::new(listener))
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.errors.remove(id)
    }

    /// Whether two handles refer to the same exchange.
    pub fn same_as(&self, other: &Exchange) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn on_queue_message(&self, message: Message) -> Result<(), ExchangeError> {
        debug!(message_id = %message.id, action = %message.action, "on queue message");
        let handler = self.handler();
        let action = message.action.clone();

        let outcome = match catch_unwind(AssertUnwindSafe(|| handler.handle(message, self))) {
            Ok(outcome) => outcome,
            Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
        };

        outcome.map_err(|source| {
            let err = ExchangeError::Handler { action, source };
            self.inner.errors.raise("exchange", err.clone());
            err
        })
    }

    fn on_pubsub_message(&self, topic: &str, message: &Message) {
        let listeners = self.inner.listeners.snapshot(topic);
        debug!(
            message_id = %message.id,
            topic,
            listeners = listeners.len(),
            "on pubsub message"
        );

        for listener in listeners {
            let outcome = match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(outcome) => outcome,
                Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
            };
            if let Err(source) = outcome {
                self.inner.errors.raise(
                    "exchange",
                    ExchangeError::Listener {
                        topic: topic.to_string(),
                        source,
                    },
                );
            }
        }
    }
}

fn upgrade(weak: &Weak<ExchangeInner>) -> Option<Exchange> {
    weak.upgrade().map(|inner| Exchange { inner })
}

fn attach_queue(weak: &Weak<ExchangeInner>, queue: &Queue) -> (ListenerId, ListenerId) {
    let on_message = weak.clone();
    let messages = queue.on_message(move |message| match upgrade(&on_message) {
        Some(exchange) => exchange.on_queue_message(message),
        None => Ok(()),
    });
    let on_error = weak.clone();
    let errors = queue.on_error(move |err| {
        if let Some(inner) = on_error.upgrade() {
            inner.errors.notify(err);
        }
    });
    (messages, errors)
}

fn attach_pubsub(weak: &Weak<ExchangeInner>, pubsub: &PubSub) -> (ListenerId, ListenerId) {
    let on_message = weak.clone();
    let messages = pubsub.on_message(move |topic, message| {
        if let Some(exchange) = upgrade(&on_message) {
            exchange.on_pubsub_message(topic, message);
        }
    });
    let on_error = weak.clone();
    let errors = pubsub.on_error(move |err| {
        if let Some(inner) = on_error.upgrade() {
            inner.errors.notify(err);
        }
    });
    (messages, errors)
}
