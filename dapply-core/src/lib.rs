#![cfg_attr(docsrs, feature(doc_cfg))]

//! A distributed apply primitive.
//!
//! `dapply` evaluates one function over a batch of inputs across a fixed
//! group of cooperating processes, in the manner of an MPI scatter/gather.
//! The coordinator (rank 0) splits the batch into contiguous, balanced runs,
//! every process evaluates its run, and the coordinator reassembles the
//! results in input order.
//!
//! Between rounds, workers are parked on a command channel, waiting for the
//! coordinator to start the next round or to release them.
//!
//! # How to use dapply
//!
//! ## Defining operations
//!
//! An [`Operation`](crate::operation::Operation) maps one input to one
//! output, given arguments shared by every task of a round. Deriving
//! [`RemoteExecute`] registers the type with the process-wide operation
//! registry, which lets any member of the group evaluate it from its name
//! and serialized value alone.
//!
//! ```
//! use dapply::{RemoteExecute, operation::{Operation, Result}};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct Scale;
//!
//! impl Operation for Scale {
//!     type Input = f64;
//!     type Shared = f64;
//!     type Output = f64;
//!
//!     fn execute(&self, input: f64, factor: &f64) -> Result<f64> {
//!         Ok(input * factor)
//!     }
//! }
//! ```
//!
//! ## Running a round
//!
//! ```
//! # use dapply::{RemoteExecute, operation::{Operation, Result}};
//! # use serde::{Deserialize, Serialize};
//! #
//! # #[derive(Serialize, Deserialize, RemoteExecute)]
//! # struct Scale;
//! #
//! # impl Operation for Scale {
//! #     type Input = f64;
//! #     type Shared = f64;
//! #     type Output = f64;
//! #
//! #     fn execute(&self, input: f64, factor: &f64) -> Result<f64> {
//! #         Ok(input * factor)
//! #     }
//! # }
//! use dapply::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Four emulated processes inside this one.
//!     let mut session = Session::in_memory(4).await?;
//!     session.join().await?;
//!
//!     let scaled = session.map(&Scale, &2.0, [1.0, 2.0, 3.0]).await?;
//!     assert_eq!(scaled, vec![2.0, 4.0, 6.0]);
//!
//!     session.finalize().await?;
//!     Ok(())
//! }
//! ```
//!
//! The untyped [`Session::apply`](crate::session::Session::apply) takes a
//! [`FunctionRef`](crate::task::FunctionRef) and opaque byte payloads, and
//! can be paired with any [`Executor`](crate::executor::Executor).
//!
//! ## Deployment
//!
//! With the AMQP transport, every rank is its own OS process, configured by
//! the same [`Config`](crate::config::Config). Rank 0 drives the rounds;
//! every other rank runs
//! [`worker_loop`](crate::session::worker_loop), which serves until rank 0
//! finalizes.
pub mod command;
pub mod config;
pub mod executor;
pub mod gather;
pub mod group;
pub mod operation;
pub mod packing;
pub mod partition;
pub mod queue;
pub mod scatter;
pub mod serializer;
pub mod session;
pub mod task;
pub mod transport;

pub use async_trait::async_trait;
pub use dapply_derive::RemoteExecute;
pub use tracing;

#[doc(hidden)]
pub mod __private {
    use bytes::Bytes;
    pub use linkme;

    use crate::{operation, serializer::Serializer};

    /// One registered operation.
    pub struct OperationEntry {
        pub name: &'static str,
        pub execute: fn(Serializer, &[u8], &[u8], Vec<Bytes>) -> operation::Result<Vec<Bytes>>,
    }

    /// Every operation linked into the binary.
    #[linkme::distributed_slice]
    pub static OPERATIONS: [OperationEntry];
}
