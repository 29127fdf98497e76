//! Command channel.
//!
//! Workers spend their idle time parked on a broadcast receive, waiting for
//! the coordinator's next [`Command`]. Every worker observes the same command
//! sequence, in issuance order, because commands travel as broadcasts rooted
//! at the coordinator.
//!
//! Before any command is issued, [`rendezvous`] ensures the whole group is
//! present: every worker reports ready to the coordinator, and the
//! coordinator acknowledges once all of them have.
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    group::{ProcessGroup, COORDINATOR},
    packing::Layout,
    serializer::Serializer,
    session::SessionError,
    transport::Transport,
};

const READY: u8 = 0x01;

/// What the coordinator asks the group to do next.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Take part in one apply round.
    Apply,
    /// Leave the group.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No command has been issued or awaited yet.
    Idle,
    /// A worker waiting for, or handling, a command.
    Listening,
    /// The coordinator issuing commands.
    Dispatching,
    /// `Terminate` has been issued or observed. The channel is spent.
    Terminated,
}

/// One process's view of the command sequence.
#[derive(Debug)]
pub struct CommandChannel {
    group: ProcessGroup,
    serializer: Serializer,
    state: ChannelState,
}

impl CommandChannel {
    pub fn new(group: ProcessGroup, serializer: Serializer) -> Self {
        Self {
            group,
            serializer,
            state: ChannelState::Idle,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Broadcast `command` to every worker. Coordinator only.
    #[instrument(skip(self, transport), level = "debug")]
    pub async fn issue<T: Transport + ?Sized>(&mut self, transport: &mut T, command: Command) -> Result<()> {
        if !self.group.is_coordinator() {
            return Err(SessionError::NotCoordinator.into());
        }
        if self.state == ChannelState::Terminated {
            return Err(SessionError::Uninitialized.into());
        }

        self.state = ChannelState::Dispatching;
        let encoded = self.serializer.to_bytes(&command)?;
        transport
            .broadcast(Some(encoded), COORDINATOR)
            .await
            .context("broadcasting command")?;

        if command == Command::Terminate {
            self.state = ChannelState::Terminated;
        }
        Ok(())
    }

    /// Block until the coordinator issues the next command. Workers only.
    #[instrument(skip(self, transport), fields(group = %self.group), level = "debug")]
    pub async fn next<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<Command> {
        if self.group.is_coordinator() {
            return Err(SessionError::NotWorker.into());
        }
        if self.state == ChannelState::Terminated {
            return Err(SessionError::Uninitialized.into());
        }

        self.state = ChannelState::Listening;
        let encoded = transport
            .broadcast(None, COORDINATOR)
            .await
            .context("receiving command")?;
        let command = self
            .serializer
            .from_bytes::<Command>(&encoded)
            .context("decoding command")?;
        debug!(?command, "received command");

        if command == Command::Terminate {
            self.state = ChannelState::Terminated;
        }
        Ok(command)
    }
}

/// Wait until every member of the group has joined.
///
/// Called by every process right after the transport-level join.
#[instrument(skip(transport), level = "debug")]
pub async fn rendezvous<T: Transport + ?Sized>(transport: &mut T, group: ProcessGroup) -> Result<()> {
    if group.is_coordinator() {
        // One ready byte from every worker, none from the coordinator.
        let layout = Layout::from_counts(
            (0..group.size())
                .map(|rank| usize::from(rank != COORDINATOR))
                .collect(),
        );
        let markers = transport
            .gather_varied(Bytes::new(), Some(&layout), COORDINATOR)
            .await
            .context("collecting ready markers")?
            .unwrap_or_default();
        if markers.iter().any(|&marker| marker != READY) {
            bail!("unexpected ready marker from a worker: {markers:?}");
        }

        transport
            .broadcast(Some(Bytes::from_static(&[READY])), COORDINATOR)
            .await
            .context("acknowledging ready markers")?;
    } else {
        transport
            .gather_varied(Bytes::from_static(&[READY]), None, COORDINATOR)
            .await
            .context("reporting ready")?;

        let ack = transport
            .broadcast(None, COORDINATOR)
            .await
            .context("awaiting ready acknowledgement")?;
        if ack[..] != [READY] {
            bail!("unexpected ready acknowledgement: {ack:?}");
        }
    }

    debug!(%group, "group formed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use futures::future::try_join_all;

    use super::*;
    use crate::{queue::in_memory::InMemoryConnection, transport::QueueTransport};

    fn endpoints(size: usize) -> Vec<QueueTransport<InMemoryConnection>> {
        QueueTransport::in_memory_group(size, "command", Serializer::Postcard).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn workers_observe_commands_in_order() {
        let issued = vec![Command::Apply, Command::Apply, Command::Terminate];
        let handles = endpoints(3).into_iter().map(|mut transport| {
            let issued = issued.clone();
            tokio::spawn(async move {
                let group = transport.join().await.unwrap();
                rendezvous(&mut transport, group).await.unwrap();
                let mut channel = CommandChannel::new(group, Serializer::Postcard);

                let mut observed = Vec::new();
                if group.is_coordinator() {
                    for command in issued {
                        channel.issue(&mut transport, command).await.unwrap();
                    }
                } else {
                    loop {
                        let command = channel.next(&mut transport).await.unwrap();
                        observed.push(command);
                        if command == Command::Terminate {
                            break;
                        }
                    }
                }
                assert_eq!(channel.state(), ChannelState::Terminated);
                observed
            })
        });

        let observed = try_join_all(handles).await.unwrap();
        assert!(observed[0].is_empty());
        assert_eq!(observed[1], issued);
        assert_eq!(observed[2], issued);
    }

    #[tokio::test]
    async fn roles_are_enforced() {
        let mut transport = endpoints(1).remove(0);
        let group = transport.join().await.unwrap();
        rendezvous(&mut transport, group).await.unwrap();

        let mut channel = CommandChannel::new(group, Serializer::Postcard);
        let err = channel.next(&mut transport).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::NotWorker));

        let mut worker = CommandChannel::new(ProcessGroup::new(1, 2).unwrap(), Serializer::Postcard);
        let err = worker.issue(&mut transport, Command::Apply).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::NotCoordinator));
    }

    #[tokio::test]
    async fn terminated_channel_is_spent() {
        let mut transport = endpoints(1).remove(0);
        let group = transport.join().await.unwrap();
        let mut channel = CommandChannel::new(group, Serializer::Postcard);
        assert_eq!(channel.state(), ChannelState::Idle);

        channel.issue(&mut transport, Command::Terminate).await.unwrap();
        let err = channel.issue(&mut transport, Command::Apply).await.unwrap_err();
        assert_eq!(err.downcast_ref::<SessionError>(), Some(&SessionError::Uninitialized));
    }
}
