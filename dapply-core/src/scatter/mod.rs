//! Distribution of a task batch.
//!
//! The coordinator runs [`distribute`], every worker runs [`receive`]. The
//! two sides call the same collectives in the same order:
//!
//! 1. **Metadata**: broadcast a [`RoundHeader`] (function reference and task
//!    count), then the shared arguments verbatim. If the batch is empty, the
//!    round's distribution ends here on every process.
//! 2. **Shape**: scatter one task count per process, then scatter the byte
//!    size of every task, split by those counts.
//! 3. **Payload**: scatter the concatenated task payloads, split by the byte
//!    totals of each process's tasks.
//!
//! Every process ends up with a [`LocalShare`]: the contiguous run of tasks
//! it owns, ready to be sliced and executed. The coordinator's share is
//! looped back by the transport and never crosses the wire.
use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    group::{ProcessGroup, COORDINATOR},
    packing::{decode_sizes, encode_sizes, pack, unpack, ShapeError, SIZE_WIDTH},
    partition::{plan, Partition},
    serializer::Serializer,
    task::{FunctionRef, TaskBatch},
    transport::Transport,
};

/// The first message of every apply round.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RoundHeader {
    pub function: FunctionRef,
    /// Number of tasks in the whole batch.
    pub task_count: u64,
}

/// The tasks one process owns for a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalShare {
    function: FunctionRef,
    shared_args: Bytes,
    task_count: usize,
    sizes: Vec<usize>,
    flat: Bytes,
}

impl LocalShare {
    fn empty(function: FunctionRef, shared_args: Bytes, task_count: usize) -> Self {
        Self {
            function,
            shared_args,
            task_count,
            sizes: Vec::new(),
            flat: Bytes::new(),
        }
    }

    pub fn function(&self) -> &FunctionRef {
        &self.function
    }

    pub fn shared_args(&self) -> &Bytes {
        &self.shared_args
    }

    /// Number of tasks in the whole batch.
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Number of tasks owned by this process.
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// This process's task payloads, in task order.
    pub fn tasks(&self) -> Result<Vec<Bytes>, ShapeError> {
        unpack(self.flat.clone(), &self.sizes)
    }
}

fn task_count(header: &RoundHeader) -> Result<usize, ShapeError> {
    usize::try_from(header.task_count).map_err(|_| ShapeError::SizeOverflow(header.task_count))
}

/// Distribute `batch` over the group. Coordinator side.
///
/// Returns the round's partition together with the coordinator's own share.
#[instrument(skip_all, fields(group = %group, tasks = batch.len()), level = "debug")]
pub async fn distribute<T: Transport + ?Sized>(
    transport: &mut T,
    group: ProcessGroup,
    serializer: Serializer,
    batch: TaskBatch,
) -> Result<(Partition, LocalShare)> {
    let TaskBatch {
        function,
        shared_args,
        tasks,
    } = batch;

    let header = RoundHeader {
        function: function.clone(),
        task_count: tasks.len() as u64,
    };
    transport
        .broadcast(Some(serializer.to_bytes(&header)?), COORDINATOR)
        .await
        .context("broadcasting round header")?;
    transport
        .broadcast(Some(shared_args.clone()), COORDINATOR)
        .await
        .context("broadcasting shared arguments")?;

    let (flat, task_sizes) = pack(&tasks);
    drop(tasks);
    let partition = Partition::new(task_sizes, group.size());
    if partition.task_count() == 0 {
        return Ok((partition, LocalShare::empty(function, shared_args, 0)));
    }
    debug!(counts = ?partition.counts(), "partitioned batch");

    transport
        .scatter(Some(encode_sizes(partition.counts())), SIZE_WIDTH, COORDINATOR)
        .await
        .context("scattering task counts")?;

    let own_tasks = partition.task_range(COORDINATOR)?;
    let own_sizes = transport
        .scatter_varied(
            Some((
                encode_sizes(partition.task_sizes()),
                partition.task_layout().scaled(SIZE_WIDTH),
            )),
            own_tasks.len() * SIZE_WIDTH,
            COORDINATOR,
        )
        .await
        .context("scattering task sizes")?;

    let own_bytes = partition.byte_layout().count(COORDINATOR)?;
    let own_flat = transport
        .scatter_varied(
            Some((flat, partition.byte_layout().clone())),
            own_bytes,
            COORDINATOR,
        )
        .await
        .context("scattering task payloads")?;

    let share = LocalShare {
        function,
        shared_args,
        task_count: partition.task_count(),
        sizes: decode_sizes(own_sizes)?,
        flat: own_flat,
    };
    Ok((partition, share))
}

/// Receive this process's share of the round the coordinator is
/// distributing. Worker side.
#[instrument(skip_all, fields(group = %group), level = "debug")]
pub async fn receive<T: Transport + ?Sized>(
    transport: &mut T,
    group: ProcessGroup,
    serializer: Serializer,
) -> Result<LocalShare> {
    let header = transport
        .broadcast(None, COORDINATOR)
        .await
        .context("receiving round header")?;
    let header: RoundHeader = serializer
        .from_bytes(&header)
        .context("decoding round header")?;
    let shared_args = transport
        .broadcast(None, COORDINATOR)
        .await
        .context("receiving shared arguments")?;

    let task_count = task_count(&header)?;
    if task_count == 0 {
        return Ok(LocalShare::empty(header.function, shared_args, 0));
    }

    let count = transport
        .scatter(None, SIZE_WIDTH, COORDINATOR)
        .await
        .context("receiving task count")?;
    let count = decode_sizes(count)?.first().copied().unwrap_or_default();
    let expected = plan(task_count, group.size())[group.rank()];
    if count != expected {
        return Err(ShapeError::CountMismatch {
            expected,
            actual: count,
        }
        .into());
    }

    let sizes = transport
        .scatter_varied(None, count * SIZE_WIDTH, COORDINATOR)
        .await
        .context("receiving task sizes")?;
    let sizes = decode_sizes(sizes)?;

    let flat = transport
        .scatter_varied(None, sizes.iter().sum(), COORDINATOR)
        .await
        .context("receiving task payloads")?;

    debug!(count, bytes = flat.len(), "received share");
    Ok(LocalShare {
        function: header.function,
        shared_args,
        task_count,
        sizes,
        flat,
    })
}

#[cfg(test)]
mod tests {
    use futures::future::try_join_all;

    use super::*;
    use crate::{queue::in_memory::InMemoryConnection, transport::QueueTransport};

    fn batch(tasks: Vec<Bytes>) -> TaskBatch {
        TaskBatch::new(
            FunctionRef::named("echo", Serializer::Postcard),
            Bytes::from_static(b"shared"),
            tasks,
        )
    }

    /// Distribute `tasks` over a fresh group of `size`, returning every
    /// process's share by rank.
    async fn shares(size: usize, tasks: Vec<Bytes>) -> Vec<LocalShare> {
        let endpoints: Vec<QueueTransport<InMemoryConnection>> =
            QueueTransport::in_memory_group(size, "scatter", Serializer::Postcard).unwrap();
        let handles = endpoints.into_iter().map(|mut transport| {
            let tasks = tasks.clone();
            tokio::spawn(async move {
                let group = transport.join().await.unwrap();
                if group.is_coordinator() {
                    distribute(&mut transport, group, Serializer::Postcard, batch(tasks))
                        .await
                        .unwrap()
                        .1
                } else {
                    receive(&mut transport, group, Serializer::Postcard)
                        .await
                        .unwrap()
                }
            })
        });

        try_join_all(handles).await.unwrap()
    }

    fn numbered(n: usize) -> Vec<Bytes> {
        (0..n)
            .map(|i| Bytes::from(format!("task-{i}").repeat(i % 3)))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn shares_are_contiguous_runs_in_rank_order() {
        let tasks = numbered(10);
        let shares = shares(4, tasks.clone()).await;

        let counts: Vec<usize> = shares.iter().map(LocalShare::count).collect();
        assert_eq!(counts, vec![2, 3, 3, 2]);

        let reassembled: Vec<Bytes> = shares
            .iter()
            .flat_map(|share| share.tasks().unwrap())
            .collect();
        assert_eq!(reassembled, tasks);

        for share in &shares {
            assert_eq!(share.task_count(), 10);
            assert_eq!(&share.shared_args()[..], b"shared");
            assert_eq!(share.function().operation, "echo");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn fewer_tasks_than_processes() {
        let tasks = numbered(3);
        let shares = shares(5, tasks.clone()).await;

        let counts: Vec<usize> = shares.iter().map(LocalShare::count).collect();
        assert_eq!(counts, vec![0, 1, 1, 1, 0]);
        assert_eq!(shares[2].tasks().unwrap(), vec![tasks[1].clone()]);
        assert!(shares[4].tasks().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn empty_batch_stops_after_metadata() {
        let shares = shares(3, Vec::new()).await;
        for share in shares {
            assert_eq!(share.task_count(), 0);
            assert_eq!(share.count(), 0);
            assert_eq!(&share.shared_args()[..], b"shared");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn single_process_keeps_everything() {
        let tasks = numbered(4);
        let shares = shares(1, tasks.clone()).await;
        assert_eq!(shares[0].tasks().unwrap(), tasks);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn worker_checks_its_count_against_the_plan() {
        let mut endpoints =
            QueueTransport::in_memory_group(2, "scatter", Serializer::Postcard).unwrap();
        let mut worker = endpoints.pop().unwrap();
        let mut coordinator = endpoints.pop().unwrap();
        coordinator.join().await.unwrap();
        let group = worker.join().await.unwrap();

        // Four tasks over two ranks plan as [2, 2]; hand the worker only one.
        let header = RoundHeader {
            function: FunctionRef::named("echo", Serializer::Postcard),
            task_count: 4,
        };
        coordinator
            .broadcast(Some(Serializer::Postcard.to_bytes(&header).unwrap()), COORDINATOR)
            .await
            .unwrap();
        coordinator
            .broadcast(Some(Bytes::new()), COORDINATOR)
            .await
            .unwrap();
        coordinator
            .scatter(Some(encode_sizes(&[3, 1])), SIZE_WIDTH, COORDINATOR)
            .await
            .unwrap();

        let err = receive(&mut worker, group, Serializer::Postcard)
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ShapeError>(),
            Some(&ShapeError::CountMismatch {
                expected: 2,
                actual: 1
            })
        );
    }
}
