//! [`Transport`] adapter for a transport selected at runtime.
//!
//! [`QueueTransport`] is generic over its queue connection, so a binary that
//! picks the connection from configuration cannot name the type at compile
//! time. [`DynamicTransport`] enumerates the available connections and
//! delegates to the selected one.
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::{QueueTransport, Transport};
use crate::{
    config::Config,
    group::ProcessGroup,
    packing::Layout,
    queue::{
        amqp::{AMQPConnection, AMQPConnectionOptions},
        in_memory::InMemoryConnection,
    },
    serializer::Serializer,
};

pub enum DynamicTransport {
    Amqp(QueueTransport<AMQPConnection>),
    InMemory(QueueTransport<InMemoryConnection>),
}

impl DynamicTransport {
    /// Endpoints for every rank of a group emulated inside this process,
    /// ordered by rank.
    pub fn in_memory_group(size: usize, group_key: &str, serializer: Serializer) -> Result<Vec<Self>> {
        Ok(QueueTransport::in_memory_group(size, group_key, serializer)?
            .into_iter()
            .map(Self::InMemory)
            .collect())
    }

    /// Connect this process's endpoint to the AMQP broker named by `config`.
    pub async fn amqp(config: &Config) -> Result<Self> {
        let uri = config
            .amqp_uri
            .as_deref()
            .context("an AMQP URI is required for the amqp transport")?;
        let rank = config
            .rank
            .context("a rank is required for the amqp transport")?;

        let connection = AMQPConnection::connect(AMQPConnectionOptions {
            uri,
            qos: None,
            serializer: Serializer::from(config),
        })
        .await
        .context("connecting to AMQP host")?;

        Ok(Self::Amqp(QueueTransport::new(
            connection,
            &config.group_key,
            rank,
            config.group_size,
        )?))
    }
}

#[async_trait]
impl Transport for DynamicTransport {
    async fn join(&mut self) -> Result<ProcessGroup> {
        match self {
            Self::Amqp(transport) => transport.join().await,
            Self::InMemory(transport) => transport.join().await,
        }
    }

    async fn leave(&mut self) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.leave().await,
            Self::InMemory(transport) => transport.leave().await,
        }
    }

    async fn reset(&mut self) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.reset().await,
            Self::InMemory(transport) => transport.reset().await,
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self {
            Self::Amqp(transport) => transport.close().await,
            Self::InMemory(transport) => transport.close().await,
        }
    }

    fn group(&self) -> Result<ProcessGroup> {
        match self {
            Self::Amqp(transport) => transport.group(),
            Self::InMemory(transport) => transport.group(),
        }
    }

    async fn broadcast(&mut self, payload: Option<Bytes>, root: usize) -> Result<Bytes> {
        match self {
            Self::Amqp(transport) => transport.broadcast(payload, root).await,
            Self::InMemory(transport) => transport.broadcast(payload, root).await,
        }
    }

    async fn scatter_varied(
        &mut self,
        send: Option<(Bytes, Layout)>,
        recv_len: usize,
        root: usize,
    ) -> Result<Bytes> {
        match self {
            Self::Amqp(transport) => transport.scatter_varied(send, recv_len, root).await,
            Self::InMemory(transport) => transport.scatter_varied(send, recv_len, root).await,
        }
    }

    async fn gather_varied(
        &mut self,
        local: Bytes,
        layout: Option<&Layout>,
        root: usize,
    ) -> Result<Option<Bytes>> {
        match self {
            Self::Amqp(transport) => transport.gather_varied(local, layout, root).await,
            Self::InMemory(transport) => transport.gather_varied(local, layout, root).await,
        }
    }
}
