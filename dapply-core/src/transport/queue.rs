//! Collectives over point-to-point queues.
//!
//! Each ordered pair of ranks `(src, dst)` gets its own FIFO queue, named
//! `{group_key}.{src}.{dst}`. Queues are declared lazily, the first time a
//! rank sends to or receives from a peer, and their consumers are kept
//! across leave and re-join. The coordinator owns the group's queues: its
//! [`reset`](Transport::reset) and [`close`](Transport::close) delete all of
//! them, so a failed group leaves no stale frames behind.
//!
//! Every collective call takes the next value of the endpoint's step
//! counter, and every frame carries the sender's step. Since each process
//! runs the same collectives in the same order and each queue is FIFO, a frame
//! with the wrong step can only mean the group has diverged; it is reported
//! as [`TransportError::OutOfStep`].
use std::collections::{hash_map::Entry, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::{Transport, TransportError};
use crate::{
    group::ProcessGroup,
    packing::{Layout, ShapeError},
    queue::{in_memory::InMemoryConnection, Acker, Connection, Consumer, QueueHandle},
    serializer::Serializer,
};

/// The unit of transfer between two ranks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Collective step of the sender.
    pub seq: u64,
    pub payload: Bytes,
}

type Inbox = BoxStream<'static, Result<(Frame, Box<dyn Acker>)>>;

/// A [`Transport`] endpoint backed by a queue [`Connection`].
pub struct QueueTransport<C: Connection> {
    connection: C,
    group_key: String,
    member: ProcessGroup,
    joined: bool,
    step: u64,
    /// Number of resets so far. Keeps consumer tags unique per inbox.
    generation: u64,
    outboxes: HashMap<usize, C::QueueHandle>,
    inboxes: HashMap<usize, Inbox>,
}

impl<C: Connection> QueueTransport<C> {
    /// An endpoint for `rank` in a group of `size` processes sharing
    /// `group_key`.
    pub fn new(connection: C, group_key: &str, rank: usize, size: usize) -> Result<Self> {
        Ok(Self {
            connection,
            group_key: group_key.to_string(),
            member: ProcessGroup::new(rank, size)?,
            joined: false,
            step: 0,
            generation: 0,
            outboxes: HashMap::new(),
            inboxes: HashMap::new(),
        })
    }

    fn queue_name(&self, src: usize, dst: usize) -> String {
        format!("{}.{}.{}", self.group_key, src, dst)
    }

    /// Start a collective rooted at `root`, returning the group and the step
    /// the collective runs at.
    fn begin(&mut self, root: usize) -> Result<(ProcessGroup, u64)> {
        if !self.joined {
            return Err(TransportError::NotJoined.into());
        }
        if root >= self.member.size() {
            return Err(TransportError::InvalidRank {
                rank: root,
                size: self.member.size(),
            }
            .into());
        }

        let step = self.step;
        self.step += 1;
        Ok((self.member, step))
    }

    async fn send(&mut self, dst: usize, seq: u64, payload: Bytes) -> Result<()> {
        let name = self.queue_name(self.member.rank(), dst);
        let outbox = match self.outboxes.entry(dst) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.connection.declare_queue(&name).await?),
        };

        trace!(dst, seq, len = payload.len(), "send frame");
        outbox.publish(&Frame { seq, payload }).await
    }

    async fn recv(&mut self, src: usize, seq: u64) -> Result<Bytes> {
        let name = self.queue_name(src, self.member.rank());
        let consumer = format!(
            "{}.rank-{}.{}",
            self.group_key,
            self.member.rank(),
            self.generation
        );
        let inbox = match self.inboxes.entry(src) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(open_inbox(&self.connection, &name, &consumer).await?)
            }
        };

        let (frame, acker) = inbox
            .next()
            .await
            .ok_or(TransportError::Disconnected { peer: src })??;
        acker.ack().await?;
        trace!(src, seq = frame.seq, len = frame.payload.len(), "received frame");

        if frame.seq != seq {
            return Err(TransportError::OutOfStep {
                peer: src,
                expected: seq,
                actual: frame.seq,
            }
            .into());
        }

        Ok(frame.payload)
    }

    /// Drop every cached mailbox and, on the coordinator, delete every queue
    /// of the group.
    async fn discard(&mut self) -> Result<()> {
        self.joined = false;
        self.step = 0;
        self.generation += 1;
        self.outboxes.clear();
        self.inboxes.clear();

        if !self.member.is_coordinator() {
            return Ok(());
        }
        // Workers wake when their inbox from the coordinator goes away and may
        // rejoin at once, so those inboxes are deleted last.
        let rank = self.member.rank();
        let size = self.member.size();
        let inbound = (0..size)
            .filter(|&src| src != rank)
            .flat_map(|src| (0..size).filter(move |&dst| dst != src).map(move |dst| (src, dst)));
        let outbound = (0..size).filter(|&dst| dst != rank).map(|dst| (rank, dst));
        for (src, dst) in inbound.chain(outbound) {
            self.connection
                .delete_queue(&self.queue_name(src, dst))
                .await?;
        }
        debug!(group_key = %self.group_key, "deleted group queues");
        Ok(())
    }
}

async fn open_inbox<C: Connection>(connection: &C, name: &str, consumer: &str) -> Result<Inbox> {
    let stream = connection
        .declare_queue(name)
        .await?
        .declare_consumer(consumer)
        .await?
        .stream::<Frame>()
        .await?;

    Ok(stream
        .map(|item| item.map(|(frame, acker)| (frame, Box::new(acker) as Box<dyn Acker>)))
        .boxed())
}

fn check_len(expected: usize, actual: usize) -> Result<(), ShapeError> {
    if expected != actual {
        return Err(ShapeError::LengthMismatch { expected, actual });
    }
    Ok(())
}

fn check_layout(layout: &Layout, group: ProcessGroup) -> Result<(), ShapeError> {
    if layout.len() != group.size() {
        return Err(ShapeError::CountMismatch {
            expected: group.size(),
            actual: layout.len(),
        });
    }
    Ok(())
}

impl QueueTransport<InMemoryConnection> {
    /// Endpoints for every rank of a group emulated inside this process,
    /// ordered by rank.
    pub fn in_memory_group(size: usize, group_key: &str, serializer: Serializer) -> Result<Vec<Self>> {
        let connection = InMemoryConnection::new(serializer);
        (0..size)
            .map(|rank| Self::new(connection.clone(), group_key, rank, size))
            .collect()
    }
}

#[async_trait]
impl<C: Connection> Transport for QueueTransport<C> {
    #[instrument(skip(self), level = "debug")]
    async fn join(&mut self) -> Result<ProcessGroup> {
        if self.joined {
            return Err(TransportError::AlreadyJoined.into());
        }

        self.joined = true;
        self.step = 0;
        Ok(self.member)
    }

    #[instrument(skip(self), level = "debug")]
    async fn leave(&mut self) -> Result<()> {
        if !self.joined {
            return Err(TransportError::NotJoined.into());
        }

        self.joined = false;
        self.step = 0;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn reset(&mut self) -> Result<()> {
        self.discard().await
    }

    async fn close(&mut self) -> Result<()> {
        self.discard().await?;
        self.connection.close().await
    }

    fn group(&self) -> Result<ProcessGroup> {
        if !self.joined {
            return Err(TransportError::NotJoined.into());
        }
        Ok(self.member)
    }

    #[instrument(skip(self, payload), level = "trace")]
    async fn broadcast(&mut self, payload: Option<Bytes>, root: usize) -> Result<Bytes> {
        let (group, step) = self.begin(root)?;
        if group.rank() != root {
            return self.recv(root, step).await;
        }

        let payload = payload.ok_or(TransportError::MissingRootBuffer)?;
        for peer in (0..group.size()).filter(|&peer| peer != root) {
            self.send(peer, step, payload.clone()).await?;
        }

        Ok(payload)
    }

    #[instrument(skip(self, send), level = "trace")]
    async fn scatter_varied(
        &mut self,
        send: Option<(Bytes, Layout)>,
        recv_len: usize,
        root: usize,
    ) -> Result<Bytes> {
        let (group, step) = self.begin(root)?;
        if group.rank() != root {
            let chunk = self.recv(root, step).await?;
            check_len(recv_len, chunk.len())?;
            return Ok(chunk);
        }

        let (flat, layout) = send.ok_or(TransportError::MissingRootBuffer)?;
        check_layout(&layout, group)?;
        check_len(layout.total(), flat.len())?;

        for peer in (0..group.size()).filter(|&peer| peer != root) {
            let chunk = flat.slice(layout.range(peer)?);
            self.send(peer, step, chunk).await?;
        }

        let own = flat.slice(layout.range(root)?);
        check_len(recv_len, own.len())?;
        Ok(own)
    }

    #[instrument(skip(self, local), level = "trace")]
    async fn gather_varied(
        &mut self,
        local: Bytes,
        layout: Option<&Layout>,
        root: usize,
    ) -> Result<Option<Bytes>> {
        let (group, step) = self.begin(root)?;
        if group.rank() != root {
            self.send(root, step, local).await?;
            return Ok(None);
        }

        let layout = layout.ok_or(TransportError::MissingRootBuffer)?;
        check_layout(layout, group)?;

        let mut flat = BytesMut::with_capacity(layout.total());
        for peer in 0..group.size() {
            let chunk = if peer == root {
                local.clone()
            } else {
                self.recv(peer, step).await?
            };
            check_len(layout.count(peer)?, chunk.len())?;
            flat.extend_from_slice(&chunk);
        }

        Ok(Some(flat.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;

    use futures::future::try_join_all;

    use super::*;

    type Endpoint = QueueTransport<InMemoryConnection>;

    /// Run `f` on every rank of a fresh in-memory group, collecting results
    /// by rank.
    async fn run_group<F, Fut, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(Endpoint) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let endpoints = Endpoint::in_memory_group(size, "test", Serializer::Postcard).unwrap();
        try_join_all(endpoints.into_iter().map(|endpoint| tokio::spawn(f(endpoint))))
            .await
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn broadcast_reaches_every_rank() {
        let received = run_group(4, |mut endpoint| async move {
            let group = endpoint.join().await.unwrap();
            let payload = group
                .is_coordinator()
                .then(|| Bytes::from_static(b"hello"));
            endpoint.broadcast(payload, 0).await.unwrap()
        })
        .await;

        assert!(received.iter().all(|bytes| &bytes[..] == b"hello"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn scatter_then_gather_round_trips() {
        let counts = vec![2, 0, 3, 1];
        let layout = Layout::from_counts(counts.clone());

        let results = run_group(4, move |mut endpoint| {
            let layout = layout.clone();
            let counts = counts.clone();
            async move {
                let group = endpoint.join().await.unwrap();
                let rank = group.rank();
                let send = group
                    .is_coordinator()
                    .then(|| (Bytes::from_static(b"abcdef"), layout.clone()));
                let chunk = endpoint.scatter_varied(send, counts[rank], 0).await.unwrap();

                let upper = Bytes::from(chunk.to_ascii_uppercase());
                let gathered = endpoint
                    .gather_varied(upper, group.is_coordinator().then_some(&layout), 0)
                    .await
                    .unwrap();
                (chunk, gathered)
            }
        })
        .await;

        assert_eq!(&results[0].0[..], b"ab");
        assert_eq!(&results[1].0[..], b"");
        assert_eq!(&results[2].0[..], b"cde");
        assert_eq!(&results[3].0[..], b"f");
        assert_eq!(results[0].1.as_deref(), Some(&b"ABCDEF"[..]));
        assert!(results[1..].iter().all(|(_, gathered)| gathered.is_none()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn uniform_collectives_use_chunk_len() {
        let results = run_group(3, |mut endpoint| async move {
            let group = endpoint.join().await.unwrap();
            let send = group
                .is_coordinator()
                .then(|| Bytes::from_static(&[10, 11, 20, 21, 30, 31]));
            let chunk = endpoint.scatter(send, 2, 0).await.unwrap();
            endpoint.gather(chunk, 2, 0).await.unwrap()
        })
        .await;

        assert_eq!(results[0].as_deref(), Some(&[10, 11, 20, 21, 30, 31][..]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn diverging_ranks_are_out_of_step() {
        let results = run_group(2, |mut endpoint| async move {
            let group = endpoint.join().await.unwrap();
            if group.is_coordinator() {
                endpoint
                    .broadcast(Some(Bytes::from_static(b"first")), 0)
                    .await
                    .unwrap();
                endpoint
                    .broadcast(Some(Bytes::from_static(b"second")), 0)
                    .await
                    .unwrap();
                Ok(Bytes::new())
            } else {
                // Skip the first broadcast by spending step 0 on a gather.
                endpoint
                    .gather_varied(Bytes::new(), None, 0)
                    .await
                    .unwrap();
                endpoint.broadcast(None, 0).await
            }
        })
        .await;

        let err = results[1].as_ref().unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::OutOfStep {
                peer: 0,
                expected: 1,
                actual: 0
            })
        );
    }

    #[tokio::test]
    async fn collectives_require_join() {
        let mut endpoint = Endpoint::in_memory_group(1, "test", Serializer::Postcard)
            .unwrap()
            .remove(0);
        let err = endpoint.broadcast(Some(Bytes::new()), 0).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::NotJoined)
        );

        endpoint.join().await.unwrap();
        let err = endpoint.join().await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::AlreadyJoined)
        );

        let err = endpoint.broadcast(Some(Bytes::new()), 1).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransportError>(),
            Some(&TransportError::InvalidRank { rank: 1, size: 1 })
        );

        endpoint.leave().await.unwrap();
        assert!(endpoint.group().is_err());
        assert_eq!(endpoint.join().await.unwrap(), ProcessGroup::new(0, 1).unwrap());
    }

    #[tokio::test]
    async fn root_checks_layout_against_buffer() {
        let mut endpoint = Endpoint::in_memory_group(1, "test", Serializer::Postcard)
            .unwrap()
            .remove(0);
        endpoint.join().await.unwrap();

        let err = endpoint
            .scatter_varied(
                Some((Bytes::from_static(b"abc"), Layout::from_counts(vec![2]))),
                2,
                0,
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ShapeError>(),
            Some(&ShapeError::LengthMismatch {
                expected: 2,
                actual: 3
            })
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn coordinator_reset_clears_the_group() {
        let connection = InMemoryConnection::new(Serializer::Postcard);
        let mut coordinator = Endpoint::new(connection.clone(), "reset", 0, 2).unwrap();
        let mut worker = Endpoint::new(connection.clone(), "reset", 1, 2).unwrap();
        coordinator.join().await.unwrap();
        worker.join().await.unwrap();

        // A frame the coordinator never consumes, then a worker parked on a
        // broadcast that never comes.
        worker
            .gather_varied(Bytes::from_static(b"stale"), None, 0)
            .await
            .unwrap();
        let parked = tokio::spawn(async move {
            let result = worker.broadcast(None, 0).await;
            (worker, result)
        });
        while !connection.queue_names().contains(&"reset.0.1".to_string()) {
            tokio::task::yield_now().await;
        }

        coordinator.reset().await.unwrap();
        assert!(coordinator.group().is_err());
        let (mut worker, result) = parked.await.unwrap();
        assert_eq!(
            result.unwrap_err().downcast_ref::<TransportError>(),
            Some(&TransportError::Disconnected { peer: 0 })
        );
        assert!(connection.queue_names().is_empty());

        // The next group under the same key sees only its own frames.
        worker.reset().await.unwrap();
        coordinator.join().await.unwrap();
        worker.join().await.unwrap();
        worker
            .gather_varied(Bytes::from_static(b"fresh"), None, 0)
            .await
            .unwrap();
        let gathered = coordinator
            .gather_varied(Bytes::new(), Some(&Layout::from_counts(vec![0, 5])), 0)
            .await
            .unwrap();
        assert_eq!(gathered.as_deref(), Some(&b"fresh"[..]));
    }
}
