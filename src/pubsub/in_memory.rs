//! In-memory pub/sub transport for testing and single-process scenarios.
//!
//! An [`InMemoryBroker`] plays the role of the pub/sub service. Each
//! [`InMemoryTransport`] is one connection to it: publishes fan out to every
//! connection subscribed to the topic. Subscribe and unsubscribe either
//! complete inside the call ([`CompletionMode::Immediate`]) or are held
//! until the test resolves them ([`CompletionMode::Manual`]).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::{Completion, Receiver, Transport};
use crate::error::TransportError;
use crate::message::codec;
use crate::Message;

/// When subscribe and unsubscribe round trips complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete before `subscribe` / `unsubscribe` returns.
    #[default]
    Immediate,
    /// Hold each request until `complete_next` or `fail_next_pending`.
    Manual,
}

/// Kind of a transport round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Subscribe,
    Unsubscribe,
}

/// Shared in-memory pub/sub service.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    connections: Mutex<Vec<Weak<TransportInner>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a connection whose round trips complete immediately.
    pub fn connect(&self) -> InMemoryTransport {
        self.connect_with(CompletionMode::Immediate)
    }

    pub fn connect_with(&self, mode: CompletionMode) -> InMemoryTransport {
        let inner = Arc::new(TransportInner {
            broker: self.clone(),
            mode,
            state: Mutex::new(TransportState::default()),
        });
        let mut connections = self.inner.connections.lock();
        connections.retain(|conn| conn.strong_count() > 0);
        connections.push(Arc::downgrade(&inner));
        InMemoryTransport { inner }
    }

    /// Every publish seen by the broker as `(topic, payload)`, in order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.inner.published.lock().clone()
    }

    /// Published payloads decoded back into messages; undecodable ones are skipped.
    pub fn published_messages(&self) -> Vec<(String, Message)> {
        self.published()
            .into_iter()
            .filter_map(|(topic, payload)| {
                codec::decode::<Message>(&payload)
                    .ok()
                    .map(|message| (topic, message))
            })
            .collect()
    }

    fn deliver(&self, topic: &str, payload: &str) {
        self.inner
            .published
            .lock()
            .push((topic.to_string(), payload.to_string()));

        let receivers: Vec<Receiver> = self
            .inner
            .connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter_map(|conn| {
                let state = conn.state.lock();
                let receiver = state
                    .subscriptions
                    .contains(topic)
                    .then(|| state.receiver.clone())
                    .flatten();
                receiver
            })
            .collect();

        debug!(topic, receivers = receivers.len(), "broker fan-out");
        for receiver in receivers {
            receiver(topic, payload);
        }
    }
}

/// One connection to an [`InMemoryBroker`].
///
/// Clones share the same connection.
#[derive(Clone)]
pub struct InMemoryTransport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    broker: InMemoryBroker,
    mode: CompletionMode,
    state: Mutex<TransportState>,
}

#[derive(Default)]
struct TransportState {
    subscriptions: HashSet<String>,
    receiver: Option<Receiver>,
    pending: VecDeque<PendingRequest>,
    calls: HashMap<(Operation, String), usize>,
    failures: HashMap<(Operation, String), VecDeque<TransportError>>,
    publish_failure: Option<TransportError>,
}

struct PendingRequest {
    operation: Operation,
    topic: String,
    result: Result<(), TransportError>,
    done: Completion,
}

impl TransportState {
    fn apply(&mut self, operation: Operation, topic: &str, result: &Result<(), TransportError>) {
        if result.is_err() {
            return;
        }
        match operation {
            Operation::Subscribe => {
                self.subscriptions.insert(topic.to_string());
            }
            Operation::Unsubscribe => {
                self.subscriptions.remove(topic);
            }
        }
    }
}

impl InMemoryTransport {
    /// Make the next `operation` on `topic` fail with `err`.
    pub fn fail_on(&self, operation: Operation, topic: &str, err: TransportError) {
        self.inner
            .state
            .lock()
            .failures
            .entry((operation, topic.to_string()))
            .or_default()
            .push_back(err);
    }

    pub fn fail_next_subscribe(&self, topic: &str, err: TransportError) {
        self.fail_on(Operation::Subscribe, topic, err);
    }

    pub fn fail_next_unsubscribe(&self, topic: &str, err: TransportError) {
        self.fail_on(Operation::Unsubscribe, topic, err);
    }

    pub fn fail_next_publish(&self, err: TransportError) {
        self.inner.state.lock().publish_failure = Some(err);
    }

    pub fn subscribe_calls(&self, topic: &str) -> usize {
        self.calls(Operation::Subscribe, topic)
    }

    pub fn unsubscribe_calls(&self, topic: &str) -> usize {
        self.calls(Operation::Unsubscribe, topic)
    }

    fn calls(&self, operation: Operation, topic: &str) -> usize {
        self.inner
            .state
            .lock()
            .calls
            .get(&(operation, topic.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.state.lock().subscriptions.contains(topic)
    }

    /// Sorted list of topics this connection is subscribed to.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .inner
            .state
            .lock()
            .subscriptions
            .iter()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    /// Requests held in [`CompletionMode::Manual`], oldest first.
    pub fn pending(&self) -> Vec<(Operation, String)> {
        self.inner
            .state
            .lock()
            .pending
            .iter()
            .map(|req| (req.operation, req.topic.clone()))
            .collect()
    }

    /// Complete the oldest held request with its planned result.
    ///
    /// Returns `false` if nothing was pending.
    pub fn complete_next(&self) -> bool {
        self.resolve_next(None)
    }

    /// Complete the oldest held request with `err`.
    pub fn fail_next_pending(&self, err: TransportError) -> bool {
        self.resolve_next(Some(err))
    }

    /// Complete held requests until none remain, including any issued by
    /// the completions themselves. Returns how many were completed.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Hand a raw payload to this connection's receiver as if the broker
    /// delivered it, whether or not the topic is subscribed.
    pub fn inject(&self, topic: &str, payload: &str) {
        let receiver = self.inner.state.lock().receiver.clone();
        if let Some(receiver) = receiver {
            receiver(topic, payload);
        }
    }

    fn resolve_next(&self, failure: Option<TransportError>) -> bool {
        let (done, result) = {
            let mut state = self.inner.state.lock();
            let Some(request) = state.pending.pop_front() else {
                return false;
            };
            let result = match failure {
                Some(err) => Err(err),
                None => request.result,
            };
            state.apply(request.operation, &request.topic, &result);
            (request.done, result)
        };
        done(result);
        true
    }

    fn request(&self, operation: Operation, topic: &str, done: Completion) {
        let immediate = {
            let mut state = self.inner.state.lock();
            *state
                .calls
                .entry((operation, topic.to_string()))
                .or_default() += 1;

            let result = state
                .failures
                .get_mut(&(operation, topic.to_string()))
                .and_then(VecDeque::pop_front)
                .map_or(Ok(()), Err);

            match self.inner.mode {
                CompletionMode::Immediate => {
                    state.apply(operation, topic, &result);
                    Some((done, result))
                }
                CompletionMode::Manual => {
                    state.pending.push_back(PendingRequest {
                        operation,
                        topic: topic.to_string(),
                        result,
                        done,
                    });
                    None
                }
            }
        };

        debug!(topic, ?operation, mode = ?self.inner.mode, "transport request");
        if let Some((done, result)) = immediate {
            done(result);
        }
    }
}

impl Transport for InMemoryTransport {
    fn publish(&self, topic: &str, payload: String) -> Result<(), TransportError> {
        let failure = self.inner.state.lock().publish_failure.take();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.broker.deliver(topic, &payload);
        Ok(())
    }

    fn subscribe(&self, topic: &str, done: Completion) {
        self.request(Operation::Subscribe, topic, done);
    }

    fn unsubscribe(&self, topic: &str, done: Completion) {
        self.request(Operation::Unsubscribe, topic, done);
    }

    fn set_receiver(&self, receiver: Receiver) {
        self.inner.state.lock().receiver = Some(receiver);
    }
}
