//! Per-topic subscription state machine.
//!
//! One record per topic. Subscribe and unsubscribe are single-flight: at most
//! one transport request per topic is in flight. A caller arriving meanwhile
//! joins the latest pending request of its kind, or is queued behind a
//! request of the other kind, so the last caller's intent is what the topic
//! ends up in. The table only decides; the caller performs the transport
//! call and invokes the waiters, always after the lock is released.

use std::collections::{HashMap, VecDeque};

use crate::error::TransportError;

/// Callback resolved with the outcome of a subscribe or unsubscribe.
pub(crate) type Waiter = Box<dyn FnOnce(Result<String, TransportError>) + Send>;

/// Observable phase of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicPhase {
    Idle,
    Subscribing,
    Subscribed,
    Unsubscribing,
}

/// Transport request the caller must issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Subscribe,
    Unsubscribe,
}

/// Decision for a newly arrived caller.
pub(crate) enum Admission {
    /// Nothing to do at the transport; resolve these callers with success now.
    Ready(Vec<Waiter>),
    /// The caller is waiting on a request already in flight.
    Joined,
    /// The caller is waiting; issue this request.
    Issue(Request),
}

/// Result of settling an in-flight request.
pub(crate) struct Settlement {
    /// Callers of the settled request; they receive its outcome.
    pub waiters: Vec<Waiter>,
    /// Parked callers that no longer need a request; they receive success.
    pub released: Vec<Waiter>,
    /// Follow-up request for callers that were parked behind this one.
    pub next: Option<Request>,
}

/// Callers waiting on one transport request.
struct Batch {
    request: Request,
    waiters: Vec<Waiter>,
}

struct TopicState {
    /// Whether the transport subscription is established.
    subscribed: bool,
    in_flight: Option<Batch>,
    /// Requests to issue after `in_flight`, in arrival order.
    queued: VecDeque<Batch>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            subscribed: false,
            in_flight: None,
            queued: VecDeque::new(),
        }
    }

    fn phase(&self) -> TopicPhase {
        match (&self.in_flight, self.subscribed) {
            (Some(batch), _) if batch.request == Request::Subscribe => TopicPhase::Subscribing,
            (Some(_), _) => TopicPhase::Unsubscribing,
            (None, true) => TopicPhase::Subscribed,
            (None, false) => TopicPhase::Idle,
        }
    }

    /// Whether `request` would change nothing at the transport.
    fn satisfies(&self, request: Request) -> bool {
        match request {
            Request::Subscribe => self.subscribed,
            Request::Unsubscribe => !self.subscribed,
        }
    }

    fn is_vacant(&self) -> bool {
        !self.subscribed && self.in_flight.is_none() && self.queued.is_empty()
    }

    fn admit(&mut self, request: Request, waiter: Waiter) -> Admission {
        let Some(in_flight) = self.in_flight.as_mut() else {
            if self.satisfies(request) {
                return Admission::Ready(vec![waiter]);
            }
            self.in_flight = Some(Batch {
                request,
                waiters: vec![waiter],
            });
            return Admission::Issue(request);
        };

        // Join the latest pending request of the same kind; a request of the
        // other kind in between keeps its place.
        let last = self.queued.back_mut().unwrap_or(in_flight);
        if last.request == request {
            last.waiters.push(waiter);
        } else {
            self.queued.push_back(Batch {
                request,
                waiters: vec![waiter],
            });
        }
        Admission::Joined
    }

    fn settle(&mut self, request: Request, ok: bool) -> Settlement {
        let mut settlement = Settlement::empty();
        match self.in_flight.take() {
            Some(batch) if batch.request == request => settlement.waiters = batch.waiters,
            other => {
                self.in_flight = other;
                return settlement;
            }
        }
        if ok {
            self.subscribed = request == Request::Subscribe;
        }

        while let Some(batch) = self.queued.pop_front() {
            if self.satisfies(batch.request) {
                settlement.released.extend(batch.waiters);
                continue;
            }
            settlement.next = Some(batch.request);
            self.in_flight = Some(batch);
            break;
        }
        settlement
    }
}

#[derive(Default)]
pub(crate) struct TopicTable {
    topics: HashMap<String, TopicState>,
}

impl TopicTable {
    pub fn phase(&self, topic: &str) -> TopicPhase {
        self.topics
            .get(topic)
            .map_or(TopicPhase::Idle, TopicState::phase)
    }

    /// Topics whose transport subscription is established, unsubscribing included.
    pub fn subscribed(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .topics
            .iter()
            .filter(|(_, state)| state.subscribed)
            .map(|(topic, _)| topic.clone())
            .collect();
        topics.sort();
        topics
    }

    pub fn begin_subscribe(&mut self, topic: &str, waiter: Waiter) -> Admission {
        self.begin(topic, Request::Subscribe, waiter)
    }

    pub fn begin_unsubscribe(&mut self, topic: &str, waiter: Waiter) -> Admission {
        self.begin(topic, Request::Unsubscribe, waiter)
    }

    pub fn finish_subscribe(&mut self, topic: &str, ok: bool) -> Settlement {
        self.finish(topic, Request::Subscribe, ok)
    }

    pub fn finish_unsubscribe(&mut self, topic: &str, ok: bool) -> Settlement {
        self.finish(topic, Request::Unsubscribe, ok)
    }

    fn begin(&mut self, topic: &str, request: Request, waiter: Waiter) -> Admission {
        let state = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        let admission = state.admit(request, waiter);
        self.evict_if_vacant(topic);
        admission
    }

    fn finish(&mut self, topic: &str, request: Request, ok: bool) -> Settlement {
        let settlement = match self.topics.get_mut(topic) {
            Some(state) => state.settle(request, ok),
            None => Settlement::empty(),
        };
        self.evict_if_vacant(topic);
        settlement
    }

    fn evict_if_vacant(&mut self, topic: &str) {
        if self.topics.get(topic).is_some_and(TopicState::is_vacant) {
            self.topics.remove(topic);
        }
    }
}

impl Settlement {
    fn empty() -> Self {
        Self {
            waiters: Vec::new(),
            released: Vec::new(),
            next: None,
        }
    }
}
