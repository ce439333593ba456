//! Error types for the exchange, its collaborators and consumers.
//!
//! Every error is `Clone`: a single transport outcome is delivered to every
//! caller coalesced onto the same in-flight request.

use thiserror::Error;

/// Failure reported by a pub/sub transport connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The transport refused the request.
    #[error("transport rejected request: {0}")]
    Rejected(String),
    /// The connection is gone.
    #[error("transport disconnected: {0}")]
    Disconnected(String),
}

/// Failure reported by the durable job queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The underlying store failed.
    #[error("queue store failed: {0}")]
    Store(String),
    /// The queue refused the work item.
    #[error("queue rejected job: {0}")]
    Rejected(String),
}

/// Failure encoding or decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(String),
    #[error("invalid utf-8 after percent-decoding: {0}")]
    Utf8(String),
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::Json(err.to_string())
    }
}

/// Failure raised by a message handler or topic listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Business logic rejected the message.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Message content could not be decoded into the handler's input type.
    #[error("decode failed: {0}")]
    Decode(String),
    /// The handler panicked; the payload is the panic message.
    #[error("handler panicked: {0}")]
    Panicked(String),
    /// More than one handler for the same action failed.
    #[error("{} handlers failed", .0.len())]
    Several(Vec<HandlerError>),
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::Decode(err.to_string())
    }
}

impl HandlerError {
    /// Fold a list of failures into one error, `None` if the list is empty.
    pub fn collect(mut failures: Vec<HandlerError>) -> Option<HandlerError> {
        match failures.len() {
            0 => None,
            1 => failures.pop(),
            _ => Some(HandlerError::Several(failures)),
        }
    }
}

/// Umbrella error surfaced through error notifications and operation callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExchangeError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("subscribe to {topic} failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error("unsubscribe from {topic} failed: {source}")]
    Unsubscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("handler for action {action} failed: {source}")]
    Handler {
        action: String,
        #[source]
        source: HandlerError,
    },
    #[error("listener on topic {topic} failed: {source}")]
    Listener {
        topic: String,
        #[source]
        source: HandlerError,
    },
    #[error("message {id} is published but has no target topic")]
    MissingTarget { id: String },
    #[error("channel {topic} is closed")]
    ChannelClosed { topic: String },
    #[error("channel {topic} closed with {count} publishes still held; they were not sent")]
    PublishesDiscarded { topic: String, count: usize },
    #[error("subscribe handshake for channel {topic} failed with {pending} publishes pending: {source}")]
    HandshakeFailed {
        topic: String,
        pending: usize,
        #[source]
        source: Box<ExchangeError>,
    },
}

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
