//! AMQP queues using [`lapin`].
//!
//! Every rank of a distributed group opens one [`AMQPConnection`] to the same
//! broker. Queues are declared non-durable and auto-delete: a group's
//! mailboxes only matter while the group is alive, and the broker drops them
//! once their consumer goes away, even if the consuming process crashed.
//!
//! ```no_run
//! use dapply::queue::{
//!     amqp::{AMQPConnection, AMQPConnectionOptions},
//!     Acker, Connection, Consumer, QueueHandle,
//! };
//! use dapply::serializer::Serializer;
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let connection = AMQPConnection::connect(AMQPConnectionOptions {
//!     uri: "amqp://localhost:5672",
//!     qos: None,
//!     serializer: Serializer::Cbor,
//! })
//! .await?;
//! let queue = connection.declare_queue("dapply.0.1").await?;
//! queue.publish(&42u64).await?;
//!
//! let mut stream = queue.declare_consumer("rank-1").await?.stream::<u64>().await?;
//! if let Some(message) = stream.next().await {
//!     let (value, acker) = message?;
//!     acker.ack().await?;
//!     assert_eq!(value, 42);
//! }
//! # Ok(())
//! # }
//! ```
use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;
use lapin::options::{QueueDeclareOptions, QueueDeleteOptions};
use pin_project::pin_project;
use tracing::instrument;

use super::{Acker, Connection, Consumer, QueueHandle};
use crate::serializer::{Serializable, Serializer};

/// Options for [`AMQPConnection::connect`].
pub struct AMQPConnectionOptions<'a> {
    /// The AMQP URI to connect to.
    pub uri: &'a str,
    /// Prefetch limit for consumers on this connection. Defaults to 64.
    /// See <https://www.rabbitmq.com/consumer-prefetch.html>
    pub qos: Option<u16>,
    pub serializer: Serializer,
}

/// A connection to an AMQP broker, with a single channel shared by every
/// queue handle derived from it.
#[derive(Clone, Debug)]
pub struct AMQPConnection {
    channel: lapin::Channel,
    connection: Arc<lapin::Connection>,
    serializer: Serializer,
}

impl AMQPConnection {
    #[instrument(skip_all, fields(uri = options.uri), level = "debug")]
    pub async fn connect(options: AMQPConnectionOptions<'_>) -> Result<Self> {
        let properties = lapin::ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);

        let connection = lapin::Connection::connect(options.uri, properties).await?;
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(options.qos.unwrap_or(64), Default::default())
            .await?;

        Ok(Self {
            channel,
            connection: Arc::new(connection),
            serializer: options.serializer,
        })
    }
}

#[async_trait]
impl Connection for AMQPConnection {
    type QueueHandle = AMQPQueueHandle;

    async fn close(&self) -> Result<()> {
        _ = self.channel.close(200, "Goodbye").await;
        _ = self.connection.close(200, "Goodbye").await;

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: false,
                    auto_delete: true,
                    ..Default::default()
                },
                Default::default(),
            )
            .await?;

        Ok(AMQPQueueHandle {
            channel: self.channel.clone(),
            name: name.to_string(),
            serializer: self.serializer,
        })
    }

    #[instrument(skip(self), level = "trace")]
    async fn delete_queue(&self, name: &str) -> Result<()> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await?;

        Ok(())
    }
}

/// A handle to a declared AMQP queue.
#[derive(Clone)]
pub struct AMQPQueueHandle {
    channel: lapin::Channel,
    name: String,
    serializer: Serializer,
}

#[async_trait]
impl QueueHandle for AMQPQueueHandle {
    type Consumer = AMQPConsumer;

    /// Publish through the default exchange and wait for the broker's
    /// confirmation.
    #[instrument(skip_all, fields(queue = %self.name), level = "trace")]
    async fn publish<T: Serializable>(&self, payload: &T) -> Result<()> {
        self.channel
            .basic_publish(
                "",
                &self.name,
                Default::default(),
                &self.serializer.to_bytes(payload)?,
                lapin::BasicProperties::default().with_delivery_mode(1),
            )
            .await?
            .await?;

        Ok(())
    }

    #[instrument(skip(self), level = "trace")]
    async fn declare_consumer(&self, consumer_name: &str) -> Result<Self::Consumer> {
        Ok(AMQPConsumer {
            channel: self.channel.clone(),
            queue_name: self.name.clone(),
            consumer_name: consumer_name.to_string(),
            serializer: self.serializer,
        })
    }
}

/// A consumer of an [`AMQPQueueHandle`].
#[derive(Clone)]
pub struct AMQPConsumer {
    channel: lapin::Channel,
    queue_name: String,
    consumer_name: String,
    serializer: Serializer,
}

#[async_trait]
impl Consumer for AMQPConsumer {
    type Acker = AMQPAcker;
    type Stream<T: Serializable> = AMQPConsumerStream<T>;

    #[instrument(skip(self), fields(queue = %self.queue_name), level = "trace")]
    async fn stream<T: Serializable>(self) -> Result<Self::Stream<T>> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_name,
                Default::default(),
                Default::default(),
            )
            .await?;

        Ok(AMQPConsumerStream {
            inner: consumer,
            serializer: self.serializer,
            _marker: std::marker::PhantomData,
        })
    }
}

/// Stream of decoded deliveries.
///
/// Delivery and decoding failures are surfaced as stream items rather than
/// skipped: a collective that silently loses a message would deadlock.
#[pin_project]
pub struct AMQPConsumerStream<T> {
    #[pin]
    inner: lapin::Consumer,
    serializer: Serializer,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Serializable> Stream for AMQPConsumerStream<T> {
    type Item = Result<(T, AMQPAcker)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(delivery))) => Poll::Ready(Some(
                this.serializer
                    .from_bytes(&delivery.data)
                    .map(|payload| (payload, AMQPAcker { delivery })),
            )),
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(err.into()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Acknowledges a single AMQP delivery.
#[derive(Debug)]
pub struct AMQPAcker {
    delivery: lapin::message::Delivery,
}

#[async_trait]
impl Acker for AMQPAcker {
    async fn ack(&self) -> Result<()> {
        Ok(self.delivery.ack(Default::default()).await?)
    }
}
