//! AMQP (RabbitMQ) broker.
//!
//! Each outbox topic is a durable topic exchange; the event type is the
//! routing key. Publisher confirms are enabled so `publish` only returns once
//! the broker acknowledged the message.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{info, warn};

use orderflow_events::Topic;

use super::{BrokerError, MessageBroker};

struct Link {
    connection: Connection,
    channel: Channel,
}

impl Link {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }
}

pub struct AmqpBroker {
    url: String,
    link: Mutex<Option<Link>>,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            link: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<Link, BrokerError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to connect: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to create channel: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to enable confirms: {e}")))?;

        for topic in Topic::ALL {
            channel
                .exchange_declare(
                    topic.as_str(),
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::Connection(format!("failed to declare exchange {topic}: {e}")))?;
        }

        Ok(Link { connection, channel })
    }
}

#[async_trait]
impl MessageBroker for AmqpBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(Link::is_open) {
            return Ok(());
        }
        *link = Some(self.open().await?);
        info!("connected to AMQP broker");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.link.lock().await.as_ref().is_some_and(Link::is_open)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let publish_error = |reason: String| BrokerError::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason,
        };

        let mut guard = self.link.lock().await;
        let Some(link) = guard.as_ref() else {
            return Err(BrokerError::NotConnected);
        };

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        let outcome = match link
            .channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, properties)
            .await
        {
            Ok(confirm) => confirm.await.map_err(|e| publish_error(e.to_string())),
            Err(e) => Err(publish_error(e.to_string())),
        };

        match outcome {
            Ok(Confirmation::Nack(_)) => Err(publish_error("broker nacked the message".to_string())),
            Ok(_) => Ok(()),
            Err(e) => {
                if !link.is_open() {
                    warn!(error = %e, "AMQP link lost, dropping it");
                    *guard = None;
                }
                Err(e)
            }
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let Some(link) = self.link.lock().await.take() else {
            return Ok(());
        };
        if let Err(e) = link.channel.close(200, "shutdown").await {
            warn!(error = %e, "failed to close AMQP channel");
        }
        link.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to close connection: {e}")))?;
        info!("AMQP connection closed");
        Ok(())
    }
}
