//! In-memory queues.
//!
//! Messages are kept serialized, as they would be on a broker, so that the
//! in-memory backend exercises exactly the same encode/decode path as a real
//! deployment. Every clone of an [`InMemoryConnection`] sees the same set of
//! queues, which is what lets a group of tokio tasks stand in for a group of
//! processes.
//!
//! ```
//! use dapply::queue::{Connection, Consumer, QueueHandle, in_memory::InMemoryConnection};
//! use dapply::serializer::Serializer;
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let connection = InMemoryConnection::new(Serializer::Cbor);
//! let queue = connection.declare_queue("greetings").await?;
//! queue.publish(&"hello".to_string()).await?;
//!
//! let mut stream = queue.declare_consumer("reader").await?.stream::<String>().await?;
//! let (message, _acker) = stream.next().await.unwrap()?;
//! assert_eq!(message, "hello");
//! # Ok(())
//! # }
//! ```
use std::{
    collections::VecDeque,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use futures::{ready, Stream};
use tokio::sync::Semaphore;
use tokio_util::sync::PollSemaphore;

use super::{Connection, Consumer, NoopAcker, QueueHandle};
use crate::serializer::{Serializable, Serializer};

/// A set of named in-memory queues.
#[derive(Clone)]
pub struct InMemoryConnection {
    queues: Arc<DashMap<String, InMemoryQueueHandle>>,
    serializer: Serializer,
}

impl InMemoryConnection {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            queues: Default::default(),
            serializer,
        }
    }

    /// Names of every queue currently declared, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    type QueueHandle = InMemoryQueueHandle;

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn declare_queue(&self, name: &str) -> Result<Self::QueueHandle> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => Ok(entry
                .insert(InMemoryQueueHandle::new(self.serializer))
                .clone()),
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<()> {
        if let Some((_, queue)) = self.queues.remove(name) {
            // Wake any consumer still parked on the queue so its stream ends.
            queue.available.close();
        }

        Ok(())
    }
}

/// A FIFO of serialized messages.
///
/// The semaphore holds one permit per queued message; consumers acquire a
/// permit before popping, so they park instead of spinning on an empty
/// queue.
#[derive(Clone)]
pub struct InMemoryQueueHandle {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
    available: Arc<Semaphore>,
    serializer: Serializer,
}

impl InMemoryQueueHandle {
    fn new(serializer: Serializer) -> Self {
        Self {
            messages: Default::default(),
            available: Arc::new(Semaphore::new(0)),
            serializer,
        }
    }
}

#[async_trait]
impl QueueHandle for InMemoryQueueHandle {
    type Consumer = InMemoryConsumer;

    async fn publish<T: Serializable>(&self, payload: &T) -> Result<()> {
        let bytes = self.serializer.to_bytes(payload)?;
        self.messages
            .lock()
            .map_err(|_| anyhow!("in-memory queue lock poisoned"))?
            .push_back(bytes);
        self.available.add_permits(1);

        Ok(())
    }

    async fn declare_consumer(&self, _consumer_name: &str) -> Result<Self::Consumer> {
        Ok(InMemoryConsumer {
            messages: self.messages.clone(),
            available: self.available.clone(),
            serializer: self.serializer,
        })
    }
}

/// A consumer of an [`InMemoryQueueHandle`].
pub struct InMemoryConsumer {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
    available: Arc<Semaphore>,
    serializer: Serializer,
}

#[async_trait]
impl Consumer for InMemoryConsumer {
    type Acker = NoopAcker;
    type Stream<T: Serializable> = InMemoryStream<T>;

    async fn stream<T: Serializable>(self) -> Result<Self::Stream<T>> {
        Ok(InMemoryStream {
            messages: self.messages,
            available: PollSemaphore::new(self.available),
            serializer: self.serializer,
            _marker: std::marker::PhantomData,
        })
    }
}

/// Stream of decoded messages from an in-memory queue.
///
/// Polling waits for a permit, then pops exactly one message. The stream
/// ends once the queue is deleted.
pub struct InMemoryStream<T> {
    messages: Arc<Mutex<VecDeque<Bytes>>>,
    available: PollSemaphore,
    serializer: Serializer,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Serializable> Stream for InMemoryStream<T> {
    type Item = Result<(T, NoopAcker)>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(permit) = ready!(this.available.poll_acquire(cx)) else {
            return Poll::Ready(None);
        };
        // The message is consumed; its permit must not return to the pool.
        permit.forget();

        let message = match this.messages.lock() {
            Ok(mut messages) => messages.pop_front(),
            Err(_) => return Poll::Ready(Some(Err(anyhow!("in-memory queue lock poisoned")))),
        };

        Poll::Ready(Some(match message {
            Some(bytes) => this
                .serializer
                .from_bytes(&bytes)
                .map(|payload| (payload, NoopAcker)),
            None => Err(anyhow!("queue permit acquired but no message was queued")),
        }))
    }
}
