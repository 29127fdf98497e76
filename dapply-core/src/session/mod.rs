//! Session lifecycle.
//!
//! A [`Session`] is one process's membership in a group, driven through
//!
//! ```text
//! Uninitialized --join--> Ready --apply*--> Ready --finalize--> Uninitialized
//! ```
//!
//! The coordinator (rank 0) calls [`apply`](Session::apply) (or the typed
//! [`map`](Session::map)) as often as it likes, then
//! [`finalize`](Session::finalize), which tells every worker to leave.
//! Workers call [`serve`](Session::serve), which parks them on the command
//! channel and takes part in each round until the coordinator finalizes.
//!
//! ## Emulation
//!
//! [`Session::in_memory`] builds a group inside the current process and
//! spawns its workers as tokio tasks. The emulated workers re-join after
//! every `finalize`, so the coordinator session can join again, and are
//! aborted when the coordinator session is dropped.
//!
//! ```
//! use dapply::{RemoteExecute, operation::{Operation, Result}, session::Session};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct Square;
//!
//! impl Operation for Square {
//!     type Input = u64;
//!     type Shared = ();
//!     type Output = u64;
//!
//!     fn execute(&self, input: u64, _: &()) -> Result<u64> {
//!         Ok(input * input)
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut session = Session::in_memory(4).await?;
//! session.join().await?;
//! let squares = session.map(&Square, &(), 1..=10).await?;
//! assert_eq!(squares, vec![1, 4, 9, 16, 25, 36, 49, 64, 81, 100]);
//! session.finalize().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use anyhow::{bail, Result};
use bytes::Bytes;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::{
    command::{rendezvous, Command, CommandChannel},
    config::{self, Config},
    executor::{run_local, Executor, Registry},
    gather::{collect, submit},
    group::{GroupError, ProcessGroup},
    operation::Operation,
    scatter::{distribute, receive},
    serializer::Serializer,
    task::{decode_results, FunctionRef, TaskBatch},
    transport::{DynamicTransport, Transport},
};

const DEFAULT_GROUP_KEY: &str = "dapply";

/// Calls made in the wrong lifecycle state or by the wrong role.
///
/// These are detected locally, before any collective is entered, and leave
/// the session as it was.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has not joined a group")]
    Uninitialized,
    #[error("session has already joined a group")]
    AlreadyInitialized,
    #[error("only the coordinator can start an apply round")]
    NotCoordinator,
    #[error("only workers serve commands")]
    NotWorker,
}

enum State {
    Uninitialized,
    Ready {
        group: ProcessGroup,
        commands: CommandChannel,
    },
}

/// One process's membership in a group.
pub struct Session<T: Transport = DynamicTransport> {
    transport: T,
    executor: Arc<dyn Executor>,
    serializer: Serializer,
    state: State,
    emulator: Vec<JoinHandle<()>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, executor: Arc<dyn Executor>, serializer: Serializer) -> Self {
        Self {
            transport,
            executor,
            serializer,
            state: State::Uninitialized,
            emulator: Vec::new(),
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    /// Join the group. Returns once every member has joined.
    #[instrument(skip_all, level = "debug")]
    pub async fn join(&mut self) -> Result<ProcessGroup> {
        if matches!(self.state, State::Ready { .. }) {
            return Err(SessionError::AlreadyInitialized.into());
        }

        let group = self.transport.join().await?;
        if let Err(err) = rendezvous(&mut self.transport, group).await {
            return self.abandon(err).await;
        }

        self.state = State::Ready {
            group,
            commands: CommandChannel::new(group, self.serializer),
        };
        debug!(%group, "joined");
        Ok(group)
    }

    /// The group this session has joined.
    pub fn group(&self) -> Result<ProcessGroup> {
        match &self.state {
            State::Ready { group, .. } => Ok(*group),
            State::Uninitialized => Err(SessionError::Uninitialized.into()),
        }
    }

    /// Evaluate `function` over `tasks` across the group. Coordinator only.
    ///
    /// `results[i]` is the result of `tasks[i]`. Either every result is
    /// returned or the round fails as a whole. A failed round forfeits the
    /// group: the session is left uninitialized and must join again.
    #[instrument(skip_all, fields(operation = %function.operation, tasks = tasks.len()), level = "debug")]
    pub async fn apply(
        &mut self,
        function: FunctionRef,
        shared_args: Bytes,
        tasks: Vec<Bytes>,
    ) -> Result<Vec<Bytes>> {
        let group = self.group()?;
        if !group.is_coordinator() {
            return Err(SessionError::NotCoordinator.into());
        }

        let batch = TaskBatch::new(function, shared_args, tasks);
        match self.round(group, batch).await {
            Ok(results) => Ok(results),
            Err(err) => self.abandon(err).await,
        }
    }

    /// One apply round, coordinator side.
    async fn round(&mut self, group: ProcessGroup, batch: TaskBatch) -> Result<Vec<Bytes>> {
        let State::Ready { commands, .. } = &mut self.state else {
            return Err(SessionError::Uninitialized.into());
        };
        commands.issue(&mut self.transport, Command::Apply).await?;

        let (partition, share) = distribute(&mut self.transport, group, self.serializer, batch).await?;
        let own = run_local(
            self.executor.clone(),
            share.function().clone(),
            share.shared_args().clone(),
            share.tasks()?,
        )
        .await?;

        collect(&mut self.transport, group, &partition, own).await
    }

    /// Typed [`apply`](Self::apply) for a registered [`Operation`].
    pub async fn map<Op: Operation>(
        &mut self,
        op: &Op,
        shared: &Op::Shared,
        inputs: impl IntoIterator<Item = Op::Input>,
    ) -> Result<Vec<Op::Output>> {
        let batch = TaskBatch::typed(op, shared, inputs, self.serializer)?;
        let results = self
            .apply(batch.function, batch.shared_args, batch.tasks)
            .await?;
        decode_results(self.serializer, &results)
    }

    /// Take part in apply rounds until the coordinator finalizes. Workers
    /// only.
    ///
    /// Returns with the session back in the uninitialized state.
    #[instrument(skip_all, level = "debug")]
    pub async fn serve(&mut self) -> Result<()> {
        let State::Ready { group, commands } = &mut self.state else {
            return Err(SessionError::Uninitialized.into());
        };
        if group.is_coordinator() {
            return Err(SessionError::NotWorker.into());
        }
        let group = *group;

        loop {
            let command = match commands.next(&mut self.transport).await {
                Ok(command) => command,
                Err(err) => return self.abandon(err).await,
            };
            match command {
                Command::Apply => {
                    let round = serve_round(
                        &mut self.transport,
                        group,
                        self.serializer,
                        self.executor.clone(),
                    );
                    if let Err(err) = round.await {
                        return self.abandon(err).await;
                    }
                }
                Command::Terminate => break,
            }
        }

        self.transport.leave().await?;
        self.state = State::Uninitialized;
        debug!(%group, "left");
        Ok(())
    }

    /// Leave the group. On the coordinator, every worker is told to leave
    /// first.
    #[instrument(skip_all, level = "debug")]
    pub async fn finalize(&mut self) -> Result<()> {
        let State::Ready { group, commands } = &mut self.state else {
            return Err(SessionError::Uninitialized.into());
        };
        if group.is_coordinator() {
            commands.issue(&mut self.transport, Command::Terminate).await?;
        }

        self.transport.leave().await?;
        self.state = State::Uninitialized;
        Ok(())
    }

    /// Finalize if joined, then release the transport.
    pub async fn close(mut self) -> Result<()> {
        if matches!(self.state, State::Ready { .. }) {
            self.finalize().await?;
        }
        self.transport.close().await
    }

    /// Give up on the group after a failed round or rendezvous, returning
    /// `err`. The session is left uninitialized and may join again.
    async fn abandon<R>(&mut self, err: anyhow::Error) -> Result<R> {
        error!("group abandoned: {err:#}");
        if let Err(reset) = self.transport.reset().await {
            warn!("failed to reset transport: {reset:#}");
        }
        self.state = State::Uninitialized;
        Err(err)
    }
}

/// One apply round, worker side.
async fn serve_round<T: Transport + ?Sized>(
    transport: &mut T,
    group: ProcessGroup,
    serializer: Serializer,
    executor: Arc<dyn Executor>,
) -> Result<()> {
    let share = receive(transport, group, serializer).await?;
    let results = run_local(
        executor,
        share.function().clone(),
        share.shared_args().clone(),
        share.tasks()?,
    )
    .await?;
    submit(transport, group, share.task_count(), results).await
}

impl Session<DynamicTransport> {
    /// An emulated group of `group_size` processes running the operation
    /// registry, returning the coordinator's session.
    pub async fn in_memory(group_size: usize) -> Result<Self> {
        Self::in_memory_with(group_size, Arc::new(Registry), Serializer::default()).await
    }

    /// An emulated group of `group_size` processes running `executor`,
    /// returning the coordinator's session.
    pub async fn in_memory_with(
        group_size: usize,
        executor: Arc<dyn Executor>,
        serializer: Serializer,
    ) -> Result<Self> {
        Self::emulate(group_size, DEFAULT_GROUP_KEY, executor, serializer)
    }

    fn emulate(
        group_size: usize,
        group_key: &str,
        executor: Arc<dyn Executor>,
        serializer: Serializer,
    ) -> Result<Self> {
        let mut transports =
            DynamicTransport::in_memory_group(group_size, group_key, serializer)?.into_iter();
        let coordinator = transports.next().ok_or(GroupError::Empty)?;

        let emulator = transports
            .enumerate()
            .map(|(offset, transport)| {
                let mut worker = Session::new(transport, executor.clone(), serializer);
                let span = tracing::debug_span!("emulated_worker", rank = offset + 1);
                tokio::spawn(
                    async move {
                        loop {
                            let served = match worker.join().await {
                                Ok(_) => worker.serve().await,
                                Err(err) => Err(err),
                            };
                            // A failed group has already been reset; join the next one.
                            if let Err(err) = served {
                                debug!("emulated worker rejoining: {err:#}");
                            }
                        }
                    }
                    .instrument(span),
                )
            })
            .collect();

        let mut session = Session::new(coordinator, executor, serializer);
        session.emulator = emulator;
        Ok(session)
    }

    /// A session for the transport selected by `config`.
    ///
    /// With the in-memory transport, the whole group is emulated and the
    /// returned session is the coordinator's. With AMQP, the session is this
    /// process's endpoint at the configured rank.
    pub async fn from_config(config: &Config, executor: Arc<dyn Executor>) -> Result<Self> {
        let serializer = Serializer::from(config);
        match config.transport {
            config::Transport::InMemory => {
                Self::emulate(config.group_size, &config.group_key, executor, serializer)
            }
            config::Transport::Amqp => Ok(Self::new(
                DynamicTransport::amqp(config).await?,
                executor,
                serializer,
            )),
        }
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        for handle in self.emulator.drain(..) {
            handle.abort();
        }
    }
}

/// Join the group described by `config` as a worker and serve the operation
/// registry until the coordinator finalizes.
///
/// In-memory groups emulate their own workers, so this requires a
/// distributed transport.
pub async fn worker_loop(config: &Config) -> Result<()> {
    if config.transport == config::Transport::InMemory {
        bail!("the in-memory transport emulates its workers; run workers with a distributed transport");
    }

    let mut session = Session::from_config(config, Arc::new(Registry)).await?;
    let group = session.join().await?;
    info!(%group, "worker joined");

    session.serve().await?;
    info!(%group, "worker released");
    session.close().await
}
