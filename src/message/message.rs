use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A unit of data routed by the exchange.
///
/// Serializes to a flat JSON object; that object is what the job queue stores
/// and what the transport carries (percent-encoded, see [`codec`](super::codec)).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message
    pub id: String,
    /// Routing key used to pick handlers during ingestion (e.g. "chat.say")
    pub action: String,
    /// Who produced the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Destination topic for fan-out once the message has been ingested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Application payload
    #[serde(default)]
    pub content: Value,
    pub created: DateTime<Utc>,
    /// Set when the message is handed to the job queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
    /// Id of a related message (e.g. the one this replies to)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Message {
    /// Create a message with a fresh id.
    pub fn new(action: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), action)
    }

    pub fn with_id(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            actor: None,
            target: None,
            content: Value::Null,
            created: Utc::now(),
            published: None,
            reference: None,
        }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Serialize `content` from any serde type.
    pub fn with_content_of<T: Serialize>(self, content: &T) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(content)?;
        Ok(self.with_content(value))
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    /// Decode `content` into a typed value.
    pub fn content_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.content)
    }

    pub fn set_target(&mut self, target: impl Into<String>) {
        self.target = Some(target.into());
    }

    pub fn is_published(&self) -> bool {
        self.published.is_some()
    }

    /// Stamp the message as handed to the job queue.
    pub fn mark_published(&mut self) {
        self.published = Some(Utc::now());
    }
}
