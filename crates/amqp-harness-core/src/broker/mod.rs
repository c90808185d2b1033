//! Broker sessions.
//!
//! This module provides:
//! - The [`Connector`] / [`BrokerSession`] / [`Subscription`] seam the harness
//!   is written against
//! - Message and delivery types
//! - The `lapin`-backed AMQP implementation

pub mod amqp;
pub mod message;

pub use amqp::{AmqpConnector, AmqpSession};
pub use message::{Delivery, DeliveryMode, Envelope, MessageProperties, OutboundMessage};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::BrokerResult;

/// Exchange type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Routes to every bound queue, ignoring the routing key.
    #[default]
    Fanout,
    /// Routes on exact routing key match.
    Direct,
    /// Routes on dotted-pattern match with `*` and `#` wildcards.
    Topic,
}

impl ExchangeKind {
    /// AMQP type name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

/// Declaration flags shared by exchanges and queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeclareOptions {
    /// Survive broker restart.
    pub durable: bool,
    /// Remove when no longer used.
    pub auto_delete: bool,
}

impl Default for DeclareOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
        }
    }
}

/// Opens sessions against a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new session. `label` names it in logs and errors.
    async fn connect(&self, label: &str) -> BrokerResult<Box<dyn BrokerSession>>;
}

/// An open logical connection to the broker.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Name of this session in logs.
    fn label(&self) -> &str;

    /// Whether the session can still be used.
    fn is_open(&self) -> bool;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()>;

    async fn declare_queue(&self, name: &str, options: DeclareOptions) -> BrokerResult<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    /// Delete a queue, returning the number of messages it still held.
    async fn delete_queue(&self, name: &str) -> BrokerResult<u32>;

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()>;

    /// Publish a message. Returns once the broker has accepted it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> BrokerResult<()>;

    /// Start an auto-ack consumer on `queue`.
    async fn subscribe(&self, queue: &str) -> BrokerResult<Box<dyn Subscription>>;

    /// Close the session.
    async fn close(&self) -> BrokerResult<()>;
}

/// A registered consumer.
///
/// Dropping a subscription does not deregister it; call [`Subscription::cancel`].
#[async_trait]
pub trait Subscription: Send {
    fn consumer_tag(&self) -> &str;

    fn queue(&self) -> &str;

    /// Wait for the next delivery. `None` means the consumer was shut down.
    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>>;

    /// Deregister the consumer.
    async fn cancel(self: Box<Self>) -> BrokerResult<()>;
}
