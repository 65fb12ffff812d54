//! AMQP transport.
//!
//! The gateway owns a headers exchange bound to the platform's upstream
//! exchange. Every session gets a channel and an exclusive, auto-delete
//! queue bound to the gateway exchange with `x-match=all` header filters.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, ExchangeBindOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    QueueDeleteOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Binding, BusConsumer, BusError, BusEvent, BusTransport};
use crate::config::BusConfig;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for BusError {
    fn from(e: lapin::Error) -> Self {
        match e {
            lapin::Error::InvalidConnectionState(_) | lapin::Error::InvalidChannelState(_) => Self::ConnectionLost,
            other => Self::Operation(other.to_string()),
        }
    }
}

/// One AMQP connection.
pub struct AmqpTransport {
    connection: Connection,
    exchange_name: String,
    upstream_exchange_name: String,
    lost: CancellationToken,
}

impl AmqpTransport {
    /// Connects to the broker described by `config`.
    pub async fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let connection = Connection::connect(&config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let lost = CancellationToken::new();
        let on_error = lost.clone();
        connection.on_error(move |e| {
            warn!(error = %e, "Bus connection lost");
            on_error.cancel();
        });

        info!(host = %config.host, port = config.port, "Connected to bus");

        Ok(Self {
            connection,
            exchange_name: config.exchange_name.clone(),
            upstream_exchange_name: config.upstream_exchange_name.clone(),
            lost,
        })
    }
}

fn headers_table(binding: &Binding) -> FieldTable {
    let mut table = FieldTable::default();
    table.insert("x-match".into(), AMQPValue::LongString("all".into()));
    for (key, value) in binding.headers() {
        table.insert(key.into(), AMQPValue::LongString(value.into()));
    }
    table
}

/// Keeps string-valued headers, which is all the platform sets.
fn delivery_to_event(delivery: Delivery) -> BusEvent {
    let mut headers = BTreeMap::new();
    if let Some(table) = delivery.properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }
    BusEvent::new(headers, delivery.data)
}

#[async_trait]
impl BusTransport for AmqpTransport {
    async fn initialize_exchanges(&self) -> Result<(), BusError> {
        let channel = self.connection.create_channel().await?;
        let durable = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        channel
            .exchange_declare(
                &self.upstream_exchange_name,
                ExchangeKind::Headers,
                durable,
                FieldTable::default(),
            )
            .await?;
        channel
            .exchange_declare(&self.exchange_name, ExchangeKind::Headers, durable, FieldTable::default())
            .await?;
        channel
            .exchange_bind(
                &self.exchange_name,
                &self.upstream_exchange_name,
                "",
                ExchangeBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            exchange = %self.exchange_name,
            upstream = %self.upstream_exchange_name,
            "Bus exchanges initialized"
        );

        if let Err(e) = channel.close(REPLY_SUCCESS, "exchanges initialized").await {
            debug!(error = %e, "Failed to close initialization channel");
        }
        Ok(())
    }

    async fn open_consumer(&self, events: mpsc::Sender<BusEvent>) -> Result<Box<dyn BusConsumer>, BusError> {
        let channel = self.connection.create_channel().await?;
        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        let queue_name = queue.name().as_str().to_string();

        let mut consumer = channel
            .basic_consume(
                &queue_name,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if events.send(delivery_to_event(delivery)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Bus consumer failed");
                        break;
                    }
                }
            }
        });

        debug!(queue = %queue_name, "Session queue declared");

        Ok(Box::new(AmqpConsumer {
            channel,
            queue_name,
            exchange_name: self.exchange_name.clone(),
            task,
        }))
    }

    fn connection_lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connection.close(REPLY_SUCCESS, "shutting down").await?;
        Ok(())
    }
}

struct AmqpConsumer {
    channel: Channel,
    queue_name: String,
    exchange_name: String,
    task: JoinHandle<()>,
}

#[async_trait]
impl BusConsumer for AmqpConsumer {
    async fn bind(&mut self, binding: &Binding) -> Result<(), BusError> {
        self.channel
            .queue_bind(
                &self.queue_name,
                &self.exchange_name,
                "",
                QueueBindOptions::default(),
                headers_table(binding),
            )
            .await?;
        debug!(queue = %self.queue_name, event = %binding.event_name, "Queue bound");
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BusError> {
        self.task.abort();
        self.channel
            .queue_delete(&self.queue_name, QueueDeleteOptions::default())
            .await?;
        self.channel.close(REPLY_SUCCESS, "session closed").await?;
        Ok(())
    }
}
