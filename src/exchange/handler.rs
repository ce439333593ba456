//! Handlers for messages coming off the queue.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::Exchange;
use crate::error::{panic_message, HandlerError};
use crate::observers::ListenerId;
use crate::Message;

/// Receives every ingested message.
///
/// The exchange is passed along so a handler can route the message onward,
/// typically by setting a target and publishing it again.
pub trait Handler: Send + Sync {
    fn handle(&self, message: Message, exchange: &Exchange) -> Result<(), HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Message, &Exchange) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: Message, exchange: &Exchange) -> Result<(), HandlerError> {
        self(message, exchange)
    }
}

pub type ActionHandler = dyn Fn(Message, &Exchange) -> Result<(), HandlerError> + Send + Sync;

/// Default handler: callbacks keyed by message action.
///
/// Every handler registered for an action runs, in registration order, even
/// when an earlier one fails; the failures are folded into one error.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Arc<Mutex<Vec<(ListenerId, String, Arc<ActionHandler>)>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, action: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(Message, &Exchange) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.entries
            .lock()
            .push((id, action.into(), Arc::new(handler)));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry, _, _)| *entry != id);
        entries.len() != before
    }

    pub fn count(&self, action: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|(_, registered, _)| registered == action)
            .count()
    }

    fn handlers_for(&self, action: &str) -> Vec<Arc<ActionHandler>> {
        self.entries
            .lock()
            .iter()
            .filter(|(_, registered, _)| registered == action)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }
}

impl Handler for HandlerRegistry {
    fn handle(&self, message: Message, exchange: &Exchange) -> Result<(), HandlerError> {
        let handlers = self.handlers_for(&message.action);
        if handlers.is_empty() {
            debug!(action = %message.action, message_id = %message.id, "no handler for action");
            return Ok(());
        }

        let mut failures = Vec::new();
        for handler in handlers {
            let delivered = message.clone();
            match catch_unwind(AssertUnwindSafe(|| handler(delivered, exchange))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => failures.push(err),
                Err(panic) => failures.push(HandlerError::Panicked(panic_message(panic))),
            }
        }

        match HandlerError::collect(failures) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
