//! Exchange configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config.
//!
//! ```
//! use bus_exchange::{AckPolicy, ExchangeConfig};
//!
//! let config = ExchangeConfig::from_json_str(r#"{ "pubsub": { "prefix": "app:" } }"#).unwrap();
//! assert_eq!(config.pubsub.prefix, "app:");
//! assert_eq!(config.queue.ack, AckPolicy::Always);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Work type the exchange registers with the job queue.
pub const DEFAULT_WORK_TYPE: &str = "message";

/// What the queue adapter does with a job whose handlers failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// Acknowledge every job once dispatch returns, failed or not.
    #[default]
    Always,
    /// Acknowledge only when every observer succeeded; otherwise retry.
    OnSuccess,
}

/// What a channel does with its exchange when the teardown unsubscribe fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownPolicy {
    /// Release the exchange and registry entry whatever the outcome.
    #[default]
    ReleaseAlways,
    /// Keep the exchange so the channel can be reused or closed again.
    RetainOnFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub work_type: String,
    pub ack: AckPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            work_type: DEFAULT_WORK_TYPE.to_string(),
            ack: AckPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn with_work_type(mut self, work_type: impl Into<String>) -> Self {
        self.work_type = work_type.into();
        self
    }

    pub fn with_ack(mut self, ack: AckPolicy) -> Self {
        self.ack = ack;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Transport-side namespace shared by publishers and subscribers.
    pub prefix: String,
}

impl PubSubConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub teardown: TeardownPolicy,
}

impl ChannelConfig {
    pub fn with_teardown(mut self, teardown: TeardownPolicy) -> Self {
        self.teardown = teardown;
        self
    }
}

/// Configuration for a whole exchange stack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub queue: QueueConfig,
    pub pubsub: PubSubConfig,
    pub channel: ChannelConfig,
}

impl ExchangeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_pubsub(mut self, pubsub: PubSubConfig) -> Self {
        self.pubsub = pubsub;
        self
    }

    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }
}
