use event_emitter_rs::EventEmitter;
use parking_lot::Mutex;
use tracing::debug;

use super::{Exchange, Handler};
use crate::error::HandlerError;
use crate::Message;

/// Handler that emits every ingested message as JSON text on an
/// `EventEmitter`, keyed by action.
///
/// For in-process consumers that only observe ingestion; listeners run on
/// the emitter's own threads and cannot route the message onward.
///
/// # Example
///
/// ```ignore
/// let handler = EmitterHandler::new();
/// handler.on("chat.say", |json| println!("said: {json}"));
/// exchange.set_handler(handler);
/// ```
pub struct EmitterHandler {
    emitter: Mutex<EventEmitter>,
}

impl Default for EmitterHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EmitterHandler {
    pub fn new() -> Self {
        Self::with_emitter(EventEmitter::new())
    }

    pub fn with_emitter(emitter: EventEmitter) -> Self {
        Self {
            emitter: Mutex::new(emitter),
        }
    }

    /// Register a listener for an action. Returns the emitter's listener id.
    pub fn on<F>(&self, action: &str, listener: F) -> String
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.emitter.lock().on(action, listener)
    }

    pub fn remove_listener(&self, id: &str) -> bool {
        self.emitter.lock().remove_listener(id).is_some()
    }
}

impl Handler for EmitterHandler {
    fn handle(&self, message: Message, _exchange: &Exchange) -> Result<(), HandlerError> {
        let json = serde_json::to_string(&message)?;
        debug!(action = %message.action, message_id = %message.id, "emit ingested message");
        self.emitter.lock().emit(&message.action, json);
        Ok(())
    }
}
