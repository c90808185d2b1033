//! Message types exchanged with the broker.
//!
//! These are the crate's own representations; backends convert to and from
//! their client library's types at the edge.

use std::collections::BTreeMap;

use bytes::Bytes;

/// AMQP delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Kept in memory only, lost on broker restart.
    Transient,
    /// Written to disk on durable queues.
    Persistent,
}

impl DeliveryMode {
    /// Wire value of the delivery mode.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Transient => 1,
            Self::Persistent => 2,
        }
    }

    /// Parse a wire value. Unknown values are treated as transient.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value == 2 {
            Self::Persistent
        } else {
            Self::Transient
        }
    }
}

/// Routing metadata of a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Channel-scoped delivery tag.
    pub delivery_tag: u64,
    /// Whether the message was delivered before.
    pub redelivered: bool,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key it was published with.
    pub routing_key: String,
}

/// Application-supplied message properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub reply_to: Option<String>,
    pub app_id: Option<String>,
    pub delivery_mode: Option<DeliveryMode>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    /// String-valued headers. Non-string header values are dropped on receive.
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// True when the message should survive a broker restart.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DeliveryMode::Persistent)
    }
}

/// A single consumed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub envelope: Envelope,
    pub properties: MessageProperties,
    pub payload: Bytes,
}

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub properties: MessageProperties,
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Create a message with the given payload and no properties.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            properties: MessageProperties::default(),
            payload: payload.into(),
        }
    }

    /// Set the content type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.properties.content_type = Some(content_type.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    /// Set the message id.
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    #[must_use]
    pub fn reply_to(mut self, queue: impl Into<String>) -> Self {
        self.properties.reply_to = Some(queue.into());
        self
    }

    /// Mark the message persistent.
    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.properties.delivery_mode = Some(DeliveryMode::Persistent);
        self
    }

    /// Add a string header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.headers.insert(key.into(), value.into());
        self
    }
}
