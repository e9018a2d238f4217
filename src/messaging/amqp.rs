//! # AMQP Transport
//!
//! Production transport speaking AMQP 0.9.1 via lapin. One connection plus
//! one logical channel per [`BrokerChannel`]; consumer streams are drained by
//! dedicated tasks so deliveries for one consumer stay in arrival order.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, QueueDeclareOptions,
};
use lapin::types::{FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::BrokerSettings;
use crate::messaging::errors::{MessagingError, MessagingResult};
use crate::messaging::message::{Acknowledger, ConsumerTag, Delivery, Envelope};
use crate::messaging::transport::{BrokerChannel, BrokerTransport, DeliverySink, LossCallback};

/// Transport factory for AMQP connections
#[derive(Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerTransport for AmqpTransport {
    async fn connect(&self, settings: &BrokerSettings) -> MessagingResult<Arc<dyn BrokerChannel>> {
        let url = settings.url();
        debug!(host = %settings.host, port = settings.port, "opening AMQP connection");

        let connection = Connection::connect(&url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                MessagingError::connection(format!(
                    "failed to connect to {}:{}: {e}",
                    settings.host, settings.port
                ))
            })?;
        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("failed to open channel: {e}"))
        })?;

        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            consumers: DashMap::new(),
        }))
    }
}

struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    consumers: DashMap<ConsumerTag, JoinHandle<()>>,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_queue(&self, queue: &str) -> MessagingResult<()> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "declare", e.to_string()))?;
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> MessagingResult<()> {
        let mut properties = BasicProperties::default();
        if let Some(correlation_id) = &envelope.correlation_id {
            properties = properties.with_correlation_id(ShortString::from(correlation_id.clone()));
        }
        if let Some(reply_to) = &envelope.reply_to {
            properties = properties.with_reply_to(ShortString::from(reply_to.clone()));
        }

        self.channel
            .basic_publish(
                "",
                &envelope.target_queue,
                BasicPublishOptions::default(),
                &envelope.payload,
                properties,
            )
            .await
            .map_err(|e| MessagingError::publish(&envelope.target_queue, e.to_string()))?
            .await
            .map_err(|e| MessagingError::publish(&envelope.target_queue, e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, queue: &str, sink: DeliverySink) -> MessagingResult<ConsumerTag> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::queue_operation(queue, "consume", e.to_string()))?;

        let tag = consumer.tag().as_str().to_string();
        let queue_name = queue.to_string();

        let handle = tokio::spawn(async move {
            while let Some(attempt) = consumer.next().await {
                match attempt {
                    Ok(delivery) => {
                        let lapin::message::Delivery {
                            data,
                            properties,
                            acker,
                            ..
                        } = delivery;
                        let delivery = Delivery {
                            queue: queue_name.clone(),
                            payload: data,
                            correlation_id: properties
                                .correlation_id()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                            reply_to: properties
                                .reply_to()
                                .as_ref()
                                .map(|s| s.as_str().to_string()),
                            acker: Arc::new(AmqpAcker { acker }),
                        };
                        sink(delivery).await;
                    }
                    Err(error) => {
                        warn!(queue = %queue_name, %error, "consumer stream error");
                        break;
                    }
                }
            }
            debug!(queue = %queue_name, "consumer stream ended");
        });

        self.consumers.insert(tag.clone(), handle);
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> MessagingResult<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| {
                MessagingError::queue_operation(consumer_tag, "cancel", e.to_string())
            })?;
        if let Some((_, handle)) = self.consumers.remove(consumer_tag) {
            handle.abort();
        }
        Ok(())
    }

    async fn close(&self) {
        let tags: Vec<ConsumerTag> = self
            .consumers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for tag in tags {
            if let Some((_, handle)) = self.consumers.remove(&tag) {
                handle.abort();
            }
        }

        if let Err(error) = self.channel.close(200, "shutdown").await {
            debug!(%error, "channel close reported an error");
        }
        if let Err(error) = self.connection.close(200, "shutdown").await {
            debug!(%error, "connection close reported an error");
        }
    }

    fn set_on_closed(&self, callback: LossCallback) {
        self.connection.on_error(move |error| {
            warn!(%error, "AMQP connection error");
            callback();
        });
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self, all_up_to: bool) -> MessagingResult<()> {
        self.acker
            .ack(BasicAckOptions {
                multiple: all_up_to,
            })
            .await
            .map_err(MessagingError::from)
    }

    async fn nack(&self, all_up_to: bool, requeue: bool) -> MessagingResult<()> {
        self.acker
            .nack(BasicNackOptions {
                multiple: all_up_to,
                requeue,
            })
            .await
            .map_err(MessagingError::from)
    }
}
