//! Remote operation traits.
//!
//! An [`Operation`] is the function half of an apply round: a serializable
//! value that maps one task input, together with the arguments shared by every
//! task of the round, to one output. Deriving
//! [`RemoteExecute`](crate::RemoteExecute) registers the type in the
//! process-wide operation registry, so that any process of the group can
//! evaluate it given only its name and serialized value (a
//! [`FunctionRef`](crate::task::FunctionRef)).
//!
//! # Usage
//!
//! ### Defining an [`Operation`]:
//!
//! ```
//! use dapply::{RemoteExecute, operation::{Operation, Result}};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct StringLength;
//!
//! impl Operation for StringLength {
//!     type Input = String;
//!     type Shared = ();
//!     type Output = usize;
//!
//!     fn execute(&self, input: Self::Input, _: &()) -> Result<Self::Output> {
//!         Ok(input.len())
//!     }
//! }
//! ```
//!
//! ### An [`Operation`] with constructor and shared arguments:
//!
//! Constructor arguments are fixed when the operation value is built; shared
//! arguments are supplied per round.
//!
//! ```
//! use dapply::{RemoteExecute, operation::{Operation, Result}};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct Affine(i64);
//!
//! impl Operation for Affine {
//!     type Input = i64;
//!     type Shared = i64;
//!     type Output = i64;
//!
//!     fn execute(&self, input: i64, offset: &i64) -> Result<i64> {
//!         Ok(self.0 * input + offset)
//!     }
//! }
//! ```
use std::fmt::Debug;

use bytes::Bytes;

use crate::serializer::{Serializable, Serializer};

/// An operation that is identifiable by name across every process of a
/// group.
///
/// Implemented by the [`RemoteExecute`](crate::RemoteExecute) derive macro.
pub trait RemoteExecute {
    /// Registry name, `module_path::TypeName`.
    const NAME: &'static str;
}

/// An operation that can be applied to every task of a batch.
pub trait Operation: RemoteExecute + Serializable {
    /// The per-task input.
    type Input: Serializable + Debug;
    /// Arguments shared by every task of a round.
    type Shared: Serializable + Debug;
    /// The per-task output.
    type Output: Serializable + Debug;

    /// Execute the operation on one task.
    fn execute(&self, input: Self::Input, shared: &Self::Shared) -> Result<Self::Output>;
}

fn decode<T: Serializable>(
    serializer: Serializer,
    operation: &str,
    what: &'static str,
    bytes: &[u8],
) -> Result<T> {
    serializer
        .from_bytes(bytes)
        .map_err(|err| OperationError::codec(operation, what, err))
}

/// Evaluate a registered operation over serialized tasks.
///
/// The operation and its shared arguments are decoded once; tasks are then
/// decoded, executed and re-encoded one at a time, in order. The first failing
/// task aborts the batch.
///
/// This is the function the [`RemoteExecute`](crate::RemoteExecute) derive
/// registers for each operation.
pub fn execute_erased<Op: Operation>(
    serializer: Serializer,
    operation: &[u8],
    shared: &[u8],
    tasks: Vec<Bytes>,
) -> Result<Vec<Bytes>> {
    let op: Op = decode(serializer, Op::NAME, "decode the operation", operation)?;
    let shared: Op::Shared = decode(serializer, Op::NAME, "decode shared arguments", shared)?;

    tasks
        .iter()
        .map(|task| {
            let input: Op::Input = decode(serializer, Op::NAME, "decode an input", task)?;
            tracing::trace!(operation = Op::NAME, ?input, "executing task");
            let output = op.execute(input, &shared)?;
            serializer
                .to_bytes(&output)
                .map_err(|err| OperationError::codec(Op::NAME, "encode an output", err))
        })
        .collect()
}

/// Marker types for [`Operation`]s.
pub mod marker {
    /// A [`Marker`] that can be used like [`Phantom`](std::marker::PhantomData)
    /// to force module inclusion of [`Operation`](super::Operation)
    /// implementations.
    #[derive(Clone, Copy)]
    pub struct Marker;
}

/// Generate an operation registry hook for external crates.
///
/// Operations defined in a crate that the worker binary never references
/// directly can be discarded by the linker, and with them their registry
/// entries. Calling the generated `register()` function from the binary keeps
/// the crate linked in.
///
/// ```
/// mod my_operations {
///     use dapply::{registry, RemoteExecute, operation::{Operation, Result}};
///     use serde::{Deserialize, Serialize};
///
///     #[derive(Serialize, Deserialize, RemoteExecute)]
///     pub struct Noop;
///
///     impl Operation for Noop {
///         type Input = ();
///         type Shared = ();
///         type Output = ();
///
///         fn execute(&self, _: (), _: &()) -> Result<()> {
///             Ok(())
///         }
///     }
///
///     registry!();
/// }
///
/// let _ = my_operations::register();
/// ```
#[macro_export]
macro_rules! registry {
    () => {
        /// Keep this crate's operations linked into the binary.
        #[inline(never)]
        pub fn register() -> ::dapply::operation::marker::Marker {
            ::dapply::operation::marker::Marker
        }
    };
}

mod error;
pub use error::*;
