//! Channel: a per-consumer handle on one topic.
//!
//! The first publish runs a subscribe handshake; publishes issued before it
//! completes are held and flushed in order once it succeeds. Removing the
//! last message listener, or calling [`Channel::close`], tears the channel
//! down and releases its exchange.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ChannelConfig, TeardownPolicy};
use crate::error::{panic_message, ExchangeError, HandlerError};
use crate::exchange::Exchange;
use crate::observers::{ErrorListener, ListenerId, Observers};
use crate::Message;

/// Callback receiving messages delivered on the channel's topic.
pub type ChannelListener = dyn Fn(&Message) + Send + Sync;

type Done = Box<dyn FnOnce(Result<(), ExchangeError>) + Send>;

/// Topic-scoped handle bound to one [`Exchange`].
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Registry entry that does not keep a channel alive.
#[derive(Clone)]
pub(crate) struct WeakChannel(Weak<ChannelInner>);

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.0.upgrade().map(|inner| Channel { inner })
    }

    pub fn is_alive(&self) -> bool {
        self.0.strong_count() > 0
    }

    pub fn points_to(&self, channel: &Channel) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&channel.inner))
    }
}

struct ChannelInner {
    topic: String,
    config: ChannelConfig,
    state: Mutex<ChannelState>,
    listeners: Observers<ChannelListener>,
    errors: Observers<ErrorListener>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    Idle,
    InFlight,
    Subscribed,
}

struct ChannelState {
    /// `None` once torn down
    exchange: Option<Exchange>,
    forwarder: Option<ListenerId>,
    handshake: Handshake,
    pending: Vec<Message>,
    waiters: Vec<Done>,
    closing: bool,
}

enum Step {
    Send(Exchange, Message),
    Wait,
    Handshake(Exchange),
}

impl Channel {
    pub fn new(topic: impl Into<String>, exchange: &Exchange) -> Self {
        Self::with_config(topic, exchange, ChannelConfig::default())
    }

    /// Bind to `exchange` and start forwarding its messages on `topic`.
    pub fn with_config(topic: impl Into<String>, exchange: &Exchange, config: ChannelConfig) -> Self {
        let inner = Arc::new(ChannelInner {
            topic: topic.into(),
            config,
            state: Mutex::new(ChannelState {
                exchange: Some(exchange.clone()),
                forwarder: None,
                handshake: Handshake::Idle,
                pending: Vec::new(),
                waiters: Vec::new(),
                closing: false,
            }),
            listeners: Observers::new(),
            errors: Observers::new(),
        });
        let forwarder = exchange.attach(&inner.topic, forwarder(&inner));
        inner.state.lock().forwarder = Some(forwarder);

        debug!(topic = %inner.topic, "new channel");
        Self { inner }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn config(&self) -> ChannelConfig {
        self.inner.config
    }

    /// Publish on this channel's topic, subscribing first if needed.
    ///
    /// Fails with [`ExchangeError::ChannelClosed`] after teardown; the same
    /// error is also raised as a notification.
    pub fn publish(&self, message: Message) -> Result<&Self, ExchangeError> {
        let mut state = self.inner.state.lock();
        let Some(exchange) = state.exchange.clone() else {
            drop(state);
            return Err(self.inner.closed());
        };

        let handshake = state.handshake;
        let step = match handshake {
            Handshake::Subscribed => Step::Send(exchange, message),
            Handshake::InFlight => {
                state.pending.push(message);
                Step::Wait
            }
            Handshake::Idle => {
                state.pending.push(message);
                state.handshake = Handshake::InFlight;
                Step::Handshake(exchange)
            }
        };
        let pending = state.pending.len();
        drop(state);

        match step {
            Step::Send(exchange, message) => {
                exchange.publish_to(&message, &self.inner.topic);
            }
            Step::Wait => debug!(topic = %self.inner.topic, pending, "publish waits for handshake"),
            Step::Handshake(exchange) => ChannelInner::handshake(&self.inner, exchange),
        }
        Ok(self)
    }

    /// Run the subscribe handshake without publishing.
    pub fn subscribe<F>(&self, done: F) -> &Self
    where
        F: FnOnce(Result<(), ExchangeError>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        let Some(exchange) = state.exchange.clone() else {
            drop(state);
            done(Err(self.inner.closed()));
            return self;
        };

        let handshake = state.handshake;
        match handshake {
            Handshake::Subscribed => {
                drop(state);
                done(Ok(()));
            }
            Handshake::InFlight => state.waiters.push(Box::new(done)),
            Handshake::Idle => {
                state.waiters.push(Box::new(done));
                state.handshake = Handshake::InFlight;
                drop(state);
                ChannelInner::handshake(&self.inner, exchange);
            }
        }
        self
    }

    pub fn on_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(listener))
    }

    /// Remove a message listener. Removing the last one tears the channel down.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let removed = self.inner.listeners.remove(id);
        if removed && self.inner.listeners.is_empty() {
            ChannelInner::teardown(&self.inner, Box::new(|_: Result<(), ExchangeError>| {}));
        }
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Tear down explicitly, whatever listeners remain.
    pub fn close<F>(&self, done: F) -> &Self
    where
        F: FnOnce(Result<(), ExchangeError>) + Send + 'static,
    {
        ChannelInner::teardown(&self.inner, Box::new(done));
        self
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

    /// Whether this channel's own handshake has completed.
    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().handshake == Handshake::Subscribed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().exchange.is_none()
    }

    /// Publishes held until the handshake succeeds.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn exchange(&self) -> Option<Exchange> {
        self.inner.state.lock().exchange.clone()
    }

    /// Whether two handles refer to the same channel.
    pub fn same_as(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakChannel {
        WeakChannel(Arc::downgrade(&self.inner))
    }
}

fn forwarder(
    inner: &Arc<ChannelInner>,
) -> impl Fn(&Message) -> Result<(), HandlerError> + Send + Sync + 'static {
    let weak = Arc::downgrade(inner);
    move |message: &Message| {
        if let Some(inner) = weak.upgrade() {
            inner.forward(message);
        }
        Ok(())
    }
}

impl ChannelInner {
    fn closed(&self) -> ExchangeError {
        let err = ExchangeError::ChannelClosed {
            topic: self.topic.clone(),
        };
        self.errors.raise("channel", err.clone());
        err
    }

    /// Report held publishes that will never be sent.
    fn discard(&self, count: usize) {
        if count > 0 {
            self.errors.raise(
                "channel",
                ExchangeError::PublishesDiscarded {
                    topic: self.topic.clone(),
                    count,
                },
            );
        }
    }

    fn forward(&self, message: &Message) {
        for listener in self.listeners.snapshot() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(message))) {
                self.errors.raise(
                    "channel",
                    ExchangeError::Listener {
                        topic: self.topic.clone(),
                        source: HandlerError::Panicked(panic_message(panic)),
                    },
                );
            }
        }
    }

    fn handshake(inner: &Arc<Self>, exchange: Exchange) {
        debug!(topic = %inner.topic, "channel handshake");
        let this = Arc::clone(inner);
        let flush_via = exchange.clone();
        exchange
            .pubsub()
            .subscribe(&inner.topic, move |result| this.on_handshake(&flush_via, result));
    }

    fn on_handshake(&self, exchange: &Exchange, result: Result<String, ExchangeError>) {
        match result {
            Ok(_) => {
                let (open, pending, waiters) = {
                    let mut state = self.state.lock();
                    let open = state.exchange.is_some() && !state.closing;
                    state.handshake = if open {
                        Handshake::Subscribed
                    } else {
                        Handshake::Idle
                    };
                    (
                        open,
                        mem::take(&mut state.pending),
                        mem::take(&mut state.waiters),
                    )
                };
                if !open {
                    // Closed while the handshake was in flight.
                    debug!(topic = %self.topic, "late handshake on closed channel");
                    self.discard(pending.len());
                    let err = ExchangeError::ChannelClosed {
                        topic: self.topic.clone(),
                    };
                    for waiter in waiters {
                        waiter(Err(err.clone()));
                    }
                    return;
                }
                debug!(topic = %self.topic, flushed = pending.len(), "channel subscribed");
                for message in &pending {
                    exchange.publish_to(message, &self.topic);
                }
                for waiter in waiters {
                    waiter(Ok(()));
                }
            }
            Err(source) => {
                let (pending, waiters) = {
                    let mut state = self.state.lock();
                    state.handshake = Handshake::Idle;
                    (state.pending.len(), mem::take(&mut state.waiters))
                };
                let err = ExchangeError::HandshakeFailed {
                    topic: self.topic.clone(),
                    pending,
                    source: Box::new(source),
                };
                self.errors.raise("channel", err.clone());
                for waiter in waiters {
                    waiter(Err(err.clone()));
                }
            }
        }
    }

    fn teardown(inner: &Arc<Self>, done: Done) {
        let mut state = inner.state.lock();
        let exchange = match state.exchange.clone() {
            Some(exchange) if !state.closing => exchange,
            _ => {
                drop(state);
                done(Ok(()));
                return;
            }
        };
        state.closing = true;
        let forwarder = state.forwarder.take();
        drop(state);

        debug!(topic = %inner.topic, "channel teardown");
        match forwarder {
            Some(id) => {
                let this = Arc::clone(inner);
                let owner = exchange.clone();
                exchange.unsubscribe(&inner.topic, id, move |result| {
                    this.on_teardown(&owner, result, done)
                });
            }
            None => inner.on_teardown(&exchange, Ok(inner.topic.clone()), done),
        }
    }

    fn on_teardown(
        self: &Arc<Self>,
        exchange: &Exchange,
        result: Result<String, ExchangeError>,
        done: Done,
    ) {
        let release = result.is_ok() || self.config.teardown == TeardownPolicy::ReleaseAlways;
        let discarded = {
            let mut state = self.state.lock();
            state.closing = false;
            if release {
                state.exchange = None;
                state.handshake = Handshake::Idle;
                mem::take(&mut state.pending).len()
            } else {
                0
            }
        };
        self.discard(discarded);

        if release {
            exchange.forget_channel(&Channel {
                inner: Arc::clone(self),
            });
        } else {
            let id = exchange.attach(&self.topic, forwarder(self));
            self.state.lock().forwarder = Some(id);
        }
        debug!(topic = %self.topic, ok = result.is_ok(), release, "channel teardown settled");

        if let Err(err) = &result {
            self.errors.raise("channel", err.clone());
        }
        done(result.map(|_| ()));
    }
}

impl Drop for ChannelInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let (Some(exchange), Some(id)) = (state.exchange.take(), state.forwarder.take()) {
            debug!(topic = %self.topic, "channel dropped");
            exchange.unsubscribe(&self.topic, id, |_| {});
        }
    }
}
