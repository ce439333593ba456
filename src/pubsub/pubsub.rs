//! PubSub adapter: transport I/O plus the single-flight subscription table.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error};

use super::state::{Admission, Request, TopicPhase, TopicTable, Waiter};
use super::{Completion, Transport};
use crate::config::PubSubConfig;
use crate::error::{panic_message, ExchangeError, HandlerError, TransportError};
use crate::message::codec;
use crate::observers::{ErrorListener, ListenerId, Observers};
use crate::Message;

/// Callback receiving every inbound message as `(topic, message)`.
///
/// The topic is the logical topic, with the transport prefix stripped.
pub type TopicMessageListener = dyn Fn(&str, &Message) + Send + Sync;

/// Owns one outbound and one inbound transport connection.
///
/// Cloning yields another handle to the same adapter.
#[derive(Clone)]
pub struct PubSub {
    inner: Arc<PubSubInner>,
}

struct PubSubInner {
    publisher: Arc<dyn Transport>,
    subscriber: Arc<dyn Transport>,
    config: PubSubConfig,
    topics: Mutex<TopicTable>,
    listeners: Observers<TopicMessageListener>,
    errors: Observers<ErrorListener>,
}

impl PubSub {
    pub fn new(publisher: impl Transport + 'static, subscriber: impl Transport + 'static) -> Self {
        Self::with_config(publisher, subscriber, PubSubConfig::default())
    }

    /// Create the adapter and install it as the receiver of `subscriber`.
    pub fn with_config(
        publisher: impl Transport + 'static,
        subscriber: impl Transport + 'static,
        config: PubSubConfig,
    ) -> Self {
        let inner = Arc::new(PubSubInner {
            publisher: Arc::new(publisher),
            subscriber: Arc::new(subscriber),
            config,
            topics: Mutex::new(TopicTable::default()),
            listeners: Observers::new(),
            errors: Observers::new(),
        });

        let weak: Weak<PubSubInner> = Arc::downgrade(&inner);
        inner
            .subscriber
            .set_receiver(Arc::new(move |topic: &str, payload: &str| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_transport_message(topic, payload);
                }
            }));

        debug!(prefix = %inner.config.prefix, "new pubsub");
        Self { inner }
    }

    /// Encode a message and publish it on `topic` under the configured prefix.
    ///
    /// Fire and forget: failures are reported as error notifications.
    pub fn send(&self, message: &Message, topic: &str) -> &Self {
        self.inner.send(message, topic, &self.inner.config.prefix);
        self
    }

    /// Like [`send`](Self::send) with a prefix other than the configured one.
    pub fn send_with_prefix(&self, message: &Message, topic: &str, prefix: &str) -> &Self {
        self.inner.send(message, topic, prefix);
        self
    }

    /// Ensure a transport subscription for `topic`.
    ///
    /// `done` receives the topic on success. Concurrent callers share one
    /// transport request and are resolved in registration order.
    pub fn subscribe<F>(&self, topic: &str, done: F) -> &Self
    where
        F: FnOnce(Result<String, ExchangeError>) + Send + 'static,
    {
        let owned = topic.to_string();
        let waiter: Waiter = Box::new(move |result: Result<String, TransportError>| {
            done(result.map_err(|source| ExchangeError::Subscribe {
                topic: owned,
                source,
            }))
        });
        let admission = self.inner.topics.lock().begin_subscribe(topic, waiter);
        PubSubInner::admit(&self.inner, topic, admission);
        self
    }

    /// Drop the transport subscription for `topic`. Unsubscribing a topic
    /// that is not subscribed succeeds immediately.
    pub fn unsubscribe<F>(&self, topic: &str, done: F) -> &Self
    where
        F: FnOnce(Result<String, ExchangeError>) + Send + 'static,
    {
        let owned = topic.to_string();
        let waiter: Waiter = Box::new(move |result: Result<String, TransportError>| {
            done(result.map_err(|source| ExchangeError::Unsubscribe {
                topic: owned,
                source,
            }))
        });
        let admission = self.inner.topics.lock().begin_unsubscribe(topic, waiter);
        PubSubInner::admit(&self.inner, topic, admission);
        self
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str, &Message) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    pub fn remove_message_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    pub fn on_error<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ExchangeError) + Send + Sync + 'static,
    {
        self.inner.errors.add(Arc::new(listener))
    }

    pub fn remove_error_listener(&self, id: ListenerId) -> bool {
        self.inner.errors.remove(id)
    }

    pub fn topic_state(&self, topic: &str) -> TopicPhase {
        self.inner.topics.lock().phase(topic)
    }

    /// True while the transport subscription exists, including during an
    /// unsubscribe that has not resolved yet.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        matches!(
            self.topic_state(topic),
            TopicPhase::Subscribed | TopicPhase::Unsubscribing
        )
    }

    /// Sorted list of subscribed topics.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.topics.lock().subscribed()
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    /// Whether two handles refer to the same adapter.
    pub fn same_as(&self, other: &PubSub) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PubSubInner {
    fn send(&self, message: &Message, topic: &str, prefix: &str) {
        let payload = match codec::encode(message) {
            Ok(payload) => payload,
            Err(e) => {
                self.errors.raise("pubsub", ExchangeError::Codec(e));
                return;
            }
        };
        debug!(topic, message_id = %message.id, "send message");
        if let Err(e) = self.publisher.publish(&format!("{prefix}{topic}"), payload) {
            self.errors.raise("pubsub", ExchangeError::Transport(e));
        }
    }

    fn admit(inner: &Arc<Self>, topic: &str, admission: Admission) {
        match admission {
            Admission::Ready(waiters) => {
                debug!(topic, "no transport request needed");
                inner.resolve(topic, waiters, Ok(topic.to_string()));
            }
            Admission::Joined => debug!(topic, "waiting on pending request"),
            Admission::Issue(request) => Self::issue(inner, topic, request),
        }
    }

    fn issue(inner: &Arc<Self>, topic: &str, request: Request) {
        let wire_topic = format!("{}{}", inner.config.prefix, topic);
        let this = Arc::clone(inner);
        let owned = topic.to_string();
        let done: Completion = Box::new(move |result: Result<(), TransportError>| {
            Self::settle(&this, &owned, request, result)
        });

        debug!(topic, ?request, "issue transport request");
        match request {
            Request::Subscribe => inner.subscriber.subscribe(&wire_topic, done),
            Request::Unsubscribe => inner.subscriber.unsubscribe(&wire_topic, done),
        }
    }

    fn settle(inner: &Arc<Self>, topic: &str, request: Request, result: Result<(), TransportError>) {
        let settlement = {
            let mut topics = inner.topics.lock();
            match request {
                Request::Subscribe => topics.finish_subscribe(topic, result.is_ok()),
                Request::Unsubscribe => topics.finish_unsubscribe(topic, result.is_ok()),
            }
        };

        debug!(
            topic,
            ?request,
            ok = result.is_ok(),
            waiters = settlement.waiters.len(),
            "transport request settled"
        );
        if let Err(source) = &result {
            let err = match request {
                Request::Subscribe => ExchangeError::Subscribe {
                    topic: topic.to_string(),
                    source: source.clone(),
                },
                Request::Unsubscribe => ExchangeError::Unsubscribe {
                    topic: topic.to_string(),
                    source: source.clone(),
                },
            };
            inner.errors.raise("pubsub", err);
        }

        inner.resolve(topic, settlement.waiters, result.map(|()| topic.to_string()));
        inner.resolve(topic, settlement.released, Ok(topic.to_string()));

        if let Some(next) = settlement.next {
            Self::issue(inner, topic, next);
        }
    }

    fn resolve(&self, topic: &str, waiters: Vec<Waiter>, outcome: Result<String, TransportError>) {
        for waiter in waiters {
            let outcome = outcome.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(move || waiter(outcome))) {
                let message = panic_message(panic);
                error!(topic, panic = %message, "subscription callback panicked");
                self.errors.raise(
                    "pubsub",
                    ExchangeError::Listener {
                        topic: topic.to_string(),
                        source: HandlerError::Panicked(message),
                    },
                );
            }
        }
    }

    fn on_transport_message(&self, raw_topic: &str, payload: &str) {
        let topic = raw_topic
            .strip_prefix(self.config.prefix.as_str())
            .unwrap_or(raw_topic);

        let message: Message = match codec::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.errors.raise("pubsub", ExchangeError::Codec(e));
                return;
            }
        };

        debug!(topic, message_id = %message.id, "on message");
        for listener in self.listeners.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(topic, &message))) {
                self.errors.raise(
                    "pubsub",
                    ExchangeError::Listener {
                        topic: topic.to_string(),
                        source: HandlerError::Panicked(panic_message(panic)),
                    },
                );
            }
        }
    }
}
