//! AMQP 0-9-1 sessions backed by `lapin`.
//!
//! Each session is one broker connection with one confirm-mode channel. A
//! channel-level error (404 on delete, 406 on redeclare) makes the broker
//! close the channel; the next operation transparently opens a new one as
//! long as the connection itself is still up.
//!
//! Consumers run with manual acks and a prefetch of one. A delivery is acked
//! when it is handed out, and cancelling a consumer requeues anything the
//! broker pushed after that.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRecoverOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};

use super::message::{Delivery, DeliveryMode, Envelope, MessageProperties, OutboundMessage};
use super::{BrokerSession, Connector, DeclareOptions, ExchangeKind, Subscription};

/// Reply code for a normal connection close.
const REPLY_SUCCESS: u16 = 200;

/// Unacked deliveries a consumer may hold.
const PREFETCH_COUNT: u16 = 1;

/// Opens [`AmqpSession`]s against a real broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: BrokerConfig,
}

impl AmqpConnector {
    /// Create a connector for the given broker configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    #[instrument(skip(self), fields(target = %self.config.display_target()))]
    async fn connect(&self, label: &str) -> BrokerResult<Box<dyn BrokerSession>> {
        let target = self.config.display_target();
        let properties = connection_properties(label);

        let connection = match timeout(
            self.config.connection_timeout(),
            Connection::connect(&self.config.uri(), properties),
        )
        .await
        {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                return Err(BrokerError::Connection {
                    target,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                return Err(BrokerError::ConnectTimeout {
                    target,
                    timeout_ms: self.config.connection_timeout_ms,
                })
            }
        };

        let channel = open_channel(&connection).await?;
        info!(session = label, "connected to broker");

        Ok(Box::new(AmqpSession {
            label: label.to_string(),
            connection,
            channel: Mutex::new(channel),
        }))
    }
}

/// Client properties naming the connection after the session label.
fn connection_properties(label: &str) -> ConnectionProperties {
    ConnectionProperties::default().with_connection_name(LongString::from(label))
}

async fn open_channel(connection: &Connection) -> BrokerResult<Channel> {
    let channel = connection.create_channel().await?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await?;
    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await?;
    Ok(channel)
}

/// A session on a real broker.
pub struct AmqpSession {
    label: String,
    connection: Connection,
    channel: Mutex<Channel>,
}

impl AmqpSession {
    /// Current channel, reopened if the broker closed it.
    async fn channel(&self) -> BrokerResult<Channel> {
        let mut channel = self.channel.lock().await;
        if !channel.status().connected() {
            if !self.connection.status().connected() {
                return Err(BrokerError::SessionClosed {
                    label: self.label.clone(),
                });
            }
            debug!(session = %self.label, "reopening closed channel");
            *channel = open_channel(&self.connection).await?;
        }
        Ok(channel.clone())
    }
}

#[async_trait]
impl BrokerSession for AmqpSession {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: DeclareOptions,
    ) -> BrokerResult<()> {
        let kind = match kind {
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        self.channel()
            .await?
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: DeclareOptions) -> BrokerResult<()> {
        self.channel()
            .await?
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    exclusive: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.channel()
            .await?
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> BrokerResult<u32> {
        let purged = self
            .channel()
            .await?
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;
        Ok(purged)
    }

    async fn delete_exchange(&self, name: &str) -> BrokerResult<()> {
        self.channel()
            .await?
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> BrokerResult<()> {
        let confirmation = self
            .channel()
            .await?
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                to_amqp_properties(&message.properties),
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(BrokerError::PublishNacked {
                exchange: exchange.to_string(),
            });
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> BrokerResult<Box<dyn Subscription>> {
        let channel = self.channel().await?;
        let consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag().as_str().to_string();
        debug!(session = %self.label, queue, consumer_tag = %consumer_tag, "consumer registered");

        Ok(Box::new(AmqpSubscription {
            channel,
            consumer,
            consumer_tag,
            queue: queue.to_string(),
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection.close(REPLY_SUCCESS, "OK").await?;
        info!(session = %self.label, "closed broker connection");
        Ok(())
    }
}

struct AmqpSubscription {
    channel: Channel,
    consumer: lapin::Consumer,
    consumer_tag: String,
    queue: String,
}

#[async_trait]
impl Subscription for AmqpSubscription {
    fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    fn queue(&self) -> &str {
        &self.queue
    }

    async fn next_delivery(&mut self) -> Option<BrokerResult<Delivery>> {
        let delivery = match self.consumer.next().await? {
            Ok(delivery) => delivery,
            Err(e) => return Some(Err(e.into())),
        };
        if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
            return Some(Err(e.into()));
        }
        Some(Ok(from_amqp_delivery(delivery)))
    }

    async fn cancel(self: Box<Self>) -> BrokerResult<()> {
        self.channel
            .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
            .await?;
        // Deliveries pushed but never handed out are still unacked.
        self.channel
            .basic_recover(BasicRecoverOptions { requeue: true })
            .await?;
        Ok(())
    }
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(v) = &properties.content_type {
        amqp = amqp.with_content_type(v.as_str().into());
    }
    if let Some(v) = &properties.content_encoding {
        amqp = amqp.with_content_encoding(v.as_str().into());
    }
    if let Some(v) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(v.as_str().into());
    }
    if let Some(v) = &properties.message_id {
        amqp = amqp.with_message_id(v.as_str().into());
    }
    if let Some(v) = &properties.reply_to {
        amqp = amqp.with_reply_to(v.as_str().into());
    }
    if let Some(v) = &properties.app_id {
        amqp = amqp.with_app_id(v.as_str().into());
    }
    if let Some(mode) = properties.delivery_mode {
        amqp = amqp.with_delivery_mode(mode.as_u8());
    }
    if let Some(ts) = properties.timestamp {
        amqp = amqp.with_timestamp(ts);
    }
    if !properties.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &properties.headers {
            table.insert(
                key.as_str().into(),
                AMQPValue::LongString(value.as_str().into()),
            );
        }
        amqp = amqp.with_headers(table);
    }
    amqp
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn header_strings(table: &FieldTable) -> BTreeMap<String, String> {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    MessageProperties {
        content_type: short(amqp.content_type()),
        content_encoding: short(amqp.content_encoding()),
        correlation_id: short(amqp.correlation_id()),
        message_id: short(amqp.message_id()),
        reply_to: short(amqp.reply_to()),
        app_id: short(amqp.app_id()),
        delivery_mode: (*amqp.delivery_mode()).map(DeliveryMode::from_u8),
        timestamp: *amqp.timestamp(),
        headers: amqp
            .headers()
            .as_ref()
            .map(header_strings)
            .unwrap_or_default(),
    }
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    Delivery {
        envelope: Envelope {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
        },
        properties: from_amqp_properties(&delivery.properties),
        payload: Bytes::from(delivery.data),
    }
}
