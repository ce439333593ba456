//! Explicit observer registries.
//!
//! Components expose typed `on_*` / `remove_*` operations backed by these
//! registries instead of a generic event emitter. Callbacks are cloned out of
//! the lock before they run, so a callback may register or remove observers
//! (including itself) without deadlocking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::ExchangeError;

/// Callback receiving error notifications.
pub type ErrorListener = dyn Fn(&ExchangeError) + Send + Sync;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Handle identifying one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a process-unique id.
    pub fn next() -> Self {
        ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered list of callbacks of one type.
pub struct Observers<F: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<F>)>>,
}

impl<F: ?Sized> Default for Observers<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> Observers<F> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, callback: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.entries.lock().push((id, callback));
        id
    }

    /// Remove a callback. Returns `false` if the id was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Callbacks in registration order.
    pub fn snapshot(&self) -> Vec<Arc<F>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Observers<ErrorListener> {
    /// Log an error and notify every error listener.
    pub(crate) fn raise(&self, component: &'static str, err: ExchangeError) {
        warn!(component, error = %err, listeners = self.len(), "error notification");
        self.notify(&err);
    }

    /// Notify without logging; for errors already logged where they arose.
    pub(crate) fn notify(&self, err: &ExchangeError) {
        for listener in self.snapshot() {
            listener(err);
        }
    }
}

/// Callbacks grouped by topic.
pub struct TopicListeners<F: ?Sized> {
    topics: Mutex<HashMap<String, Vec<(ListenerId, Arc<F>)>>>,
}

impl<F: ?Sized> Default for TopicListeners<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: ?Sized> TopicListeners<F> {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, topic: &str, callback: Arc<F>) -> ListenerId {
        let id = ListenerId::next();
        self.insert(topic, id, callback);
        id
    }

    /// Register under an id allocated earlier.
    pub fn insert(&self, topic: &str, id: ListenerId, callback: Arc<F>) {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, callback));
    }

    /// Remove a callback and return how many remain on the topic.
    pub fn remove(&self, topic: &str, id: ListenerId) -> usize {
        let mut topics = self.topics.lock();
        let remaining = match topics.get_mut(topic) {
            Some(entries) => {
                entries.retain(|(entry, _)| *entry != id);
                entries.len()
            }
            None => 0,
        };
        if remaining == 0 {
            topics.remove(topic);
        }
        remaining
    }

    pub fn snapshot(&self, topic: &str) -> Vec<Arc<F>> {
        self.topics
            .lock()
            .get(topic)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        topics.sort();
        topics
    }
}
