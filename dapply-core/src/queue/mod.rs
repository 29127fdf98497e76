//! Minimal ordered mailboxes.
//!
//! The queue-backed transport realises every collective as a set of
//! point-to-point messages, one queue per ordered `(sender, receiver)` pair.
//! All it needs from a queueing system is the ability to declare and delete
//! named queues, publish to them, and consume them in FIFO order. That is the
//! whole surface of this module; connection tuning and broker-specific
//! features stay inside the individual backends.
//!
//! Backends:
//! - [`in_memory`]: queues shared between tasks of one OS process. Used to
//!   emulate a process group in tests and demos.
//! - [`amqp`]: queues on an AMQP broker, for groups spanning OS processes or
//!   machines.

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use crate::serializer::Serializable;

/// Acknowledges a consumed message.
///
/// Brokers that track delivery (AMQP) redeliver unacknowledged messages;
/// in-memory queues consider a message delivered as soon as it is popped.
#[async_trait]
pub trait Acker: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;
}

#[async_trait]
impl<T: Acker + ?Sized> Acker for Box<T> {
    async fn ack(&self) -> Result<()> {
        (**self).ack().await
    }
}

/// Acker for backends without delivery tracking.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAcker;

#[async_trait]
impl Acker for NoopAcker {
    async fn ack(&self) -> Result<()> {
        Ok(())
    }
}

/// A connection to a queueing system.
///
/// Connections are cheap to clone; clones share the underlying queues.
#[async_trait]
pub trait Connection: Clone + Send + Sync + 'static {
    type QueueHandle: QueueHandle;

    /// Close the connection.
    async fn close(&self) -> Result<()>;

    /// Declare a queue.
    ///
    /// Declaration is idempotent: an existing queue of the same name is
    /// returned as is.
    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle>;

    /// Delete a queue and any messages still in it. Consumers of the queue
    /// see their stream end.
    async fn delete_queue(&self, name: &str) -> Result<()>;
}

/// A handle to a declared queue.
#[async_trait]
pub trait QueueHandle: Clone + Send + Sync + 'static {
    type Consumer: Consumer;

    /// Serialize `payload` and append it to the queue.
    async fn publish<T: Serializable>(&self, payload: &T) -> Result<()>;

    /// Declare a consumer of the queue.
    ///
    /// Messages are delivered in publication order as long as the queue has a
    /// single consumer.
    async fn declare_consumer(&self, consumer_name: &str) -> Result<Self::Consumer>;
}

/// A consumer of a queue, convertible into a stream of decoded messages.
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    type Acker: Acker;
    type Stream<T: Serializable>: Stream<Item = Result<(T, Self::Acker)>> + Send + Unpin + 'static;

    /// Start consuming, decoding every message as a `T`.
    async fn stream<T: Serializable>(self) -> Result<Self::Stream<T>>;
}

pub mod amqp;
pub mod in_memory;
