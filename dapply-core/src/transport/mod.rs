//! Group transports.
//!
//! A [`Transport`] is this process's endpoint in a fixed-size group. It
//! provides the collective operations the apply protocol is written against:
//!
//! - [`broadcast`](Transport::broadcast): every process receives the root's
//!   payload.
//! - [`scatter`](Transport::scatter) /
//!   [`scatter_varied`](Transport::scatter_varied): the root splits one flat
//!   buffer between every process, by a uniform or per-rank [`Layout`].
//! - [`gather`](Transport::gather) / [`gather_varied`](Transport::gather_varied):
//!   the inverse; the root receives one flat buffer laid out by rank.
//!
//! Collectives are called by every process of the group, in the same order,
//! with agreeing shapes. The protocol modules guarantee the agreement; a
//! transport only checks what it can observe locally (buffer lengths against
//! layouts) and reports anything else as a [`TransportError`].
//!
//! The root's own share of a scatter or gather never leaves the process.
//!
//! Implementations:
//! - [`QueueTransport`]: collectives realised over ordered point-to-point
//!   queues, for any [`Connection`](crate::queue::Connection).
//! - [`DynamicTransport`]: a [`QueueTransport`] over a connection picked at
//!   runtime from [`Config`](crate::config::Config).
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::{group::ProcessGroup, packing::Layout};

mod dynamic;
mod queue;

pub use dynamic::DynamicTransport;
pub use queue::{Frame, QueueTransport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A frame from a different collective step arrived. Every process must
    /// call the same collectives in the same order.
    #[error("rank {peer} is out of step: expected a frame for step {expected}, got step {actual}")]
    OutOfStep {
        peer: usize,
        expected: u64,
        actual: u64,
    },
    #[error("connection to rank {peer} closed")]
    Disconnected { peer: usize },
    #[error("collective called outside a joined group")]
    NotJoined,
    #[error("endpoint has already joined its group")]
    AlreadyJoined,
    #[error("rank {rank} is not a member of a group of size {size}")]
    InvalidRank { rank: usize, size: usize },
    #[error("the root of a collective must supply its buffer")]
    MissingRootBuffer,
}

/// One process's endpoint in a group.
///
/// Methods take `&mut self`: a process runs a single collective at a time.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Join the group, returning this process's position in it.
    async fn join(&mut self) -> Result<ProcessGroup>;

    /// Leave the group. The endpoint may [`join`](Transport::join) again.
    async fn leave(&mut self) -> Result<()>;

    /// Leave the group after a failed round, discarding every frame still in
    /// flight. The endpoint may [`join`](Transport::join) again.
    ///
    /// A failed group cannot be resumed. The coordinator's reset tears down
    /// the group's mailboxes, which releases every worker still waiting on
    /// it with [`TransportError::Disconnected`] and leaves nothing behind for
    /// the next group formed under the same key.
    async fn reset(&mut self) -> Result<()>;

    /// Release the underlying connection. The endpoint is unusable afterwards.
    /// Closing the coordinator's endpoint tears down the group's mailboxes.
    async fn close(&mut self) -> Result<()>;

    /// The group this endpoint has joined.
    fn group(&self) -> Result<ProcessGroup>;

    /// Send `payload` from `root` to every process. The root passes
    /// `Some(payload)`, everyone else `None`; every process returns the
    /// root's payload.
    async fn broadcast(&mut self, payload: Option<Bytes>, root: usize) -> Result<Bytes>;

    /// Split a flat buffer held by `root` between every process.
    ///
    /// The root passes the buffer and its layout; every process, the root
    /// included, passes the length of the slice it expects and receives that
    /// slice.
    async fn scatter_varied(
        &mut self,
        send: Option<(Bytes, Layout)>,
        recv_len: usize,
        root: usize,
    ) -> Result<Bytes>;

    /// Concatenate every process's `local` buffer at `root`, in rank order.
    ///
    /// The root passes the layout it expects and receives the flat buffer;
    /// everyone else returns `None`.
    async fn gather_varied(
        &mut self,
        local: Bytes,
        layout: Option<&Layout>,
        root: usize,
    ) -> Result<Option<Bytes>>;

    /// [`scatter_varied`](Transport::scatter_varied) with `chunk_len` bytes
    /// for every process.
    async fn scatter(&mut self, send: Option<Bytes>, chunk_len: usize, root: usize) -> Result<Bytes> {
        let size = self.group()?.size();
        let send = send.map(|flat| (flat, Layout::uniform(size, chunk_len)));
        self.scatter_varied(send, chunk_len, root).await
    }

    /// [`gather_varied`](Transport::gather_varied) with `chunk_len` bytes from
    /// every process.
    async fn gather(&mut self, local: Bytes, chunk_len: usize, root: usize) -> Result<Option<Bytes>> {
        let layout = Layout::uniform(self.group()?.size(), chunk_len);
        self.gather_varied(local, Some(&layout), root).await
    }
}
