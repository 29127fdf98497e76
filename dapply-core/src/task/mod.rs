//! Function references and task batches.
//!
//! A [`TaskBatch`] is the input of one apply round: which function to run
//! ([`FunctionRef`]), the arguments every task shares, and one opaque payload
//! per task. The protocol never looks inside any of these payloads; only the
//! [`Executor`](crate::executor::Executor) does.
use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    operation::Operation,
    serializer::{Serializable, Serializer},
};

/// An encoded reference to the function evaluated by an apply round.
///
/// For the default [`Registry`](crate::executor::Registry) executor,
/// `operation` is the registry name of an [`Operation`] type and `payload`
/// its serialized value. Custom executors are free to interpret both fields
/// however they like.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    /// Name the executor resolves the function by.
    pub operation: String,
    /// Serialized function value.
    pub payload: Bytes,
    /// Format of the payload, the shared arguments, every task input and
    /// every result.
    pub serializer: Serializer,
}

impl FunctionRef {
    /// Reference a registered [`Operation`] value.
    pub fn new<Op: Operation>(op: &Op, serializer: Serializer) -> Result<Self> {
        Ok(Self {
            operation: Op::NAME.to_string(),
            payload: serializer.to_bytes(op)?,
            serializer,
        })
    }

    /// Reference a function by name only, with no payload.
    pub fn named(operation: impl Into<String>, serializer: Serializer) -> Self {
        Self {
            operation: operation.into(),
            payload: Bytes::new(),
            serializer,
        }
    }
}

/// The input of one apply round.
///
/// The position of a payload in `tasks` is the task's identity: the result
/// of `tasks[i]` is returned at index `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBatch {
    pub function: FunctionRef,
    pub shared_args: Bytes,
    pub tasks: Vec<Bytes>,
}

impl TaskBatch {
    pub fn new(function: FunctionRef, shared_args: Bytes, tasks: Vec<Bytes>) -> Self {
        Self {
            function,
            shared_args,
            tasks,
        }
    }

    /// Encode a typed round for `op`.
    pub fn typed<Op: Operation>(
        op: &Op,
        shared: &Op::Shared,
        inputs: impl IntoIterator<Item = Op::Input>,
        serializer: Serializer,
    ) -> Result<Self> {
        let tasks = inputs
            .into_iter()
            .map(|input| serializer.to_bytes(&input))
            .collect::<Result<_>>()?;

        Ok(Self {
            function: FunctionRef::new(op, serializer)?,
            shared_args: serializer.to_bytes(shared)?,
            tasks,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Decode the results of a typed round.
pub fn decode_results<T: Serializable>(serializer: Serializer, results: &[Bytes]) -> Result<Vec<T>> {
    results
        .iter()
        .map(|bytes| serializer.from_bytes(bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{operation, operation::RemoteExecute as _, RemoteExecute};

    #[derive(Serialize, Deserialize, RemoteExecute, PartialEq, Debug)]
    #[dapply(internal)]
    struct Scale(u32);

    impl Operation for Scale {
        type Input = u32;
        type Shared = ();
        type Output = u32;

        fn execute(&self, input: u32, _: &()) -> operation::Result<u32> {
            Ok(self.0 * input)
        }
    }

    #[test]
    fn function_ref_names_the_operation() {
        let function = FunctionRef::new(&Scale(3), Serializer::Cbor).unwrap();
        assert_eq!(function.operation, Scale::NAME);
        assert_eq!(
            Serializer::Cbor.from_bytes::<Scale>(&function.payload).unwrap(),
            Scale(3)
        );
    }

    #[test]
    fn typed_batch_encodes_every_input() {
        let batch = TaskBatch::typed(&Scale(2), &(), [1, 2, 3], Serializer::Postcard).unwrap();
        assert_eq!(batch.len(), 3);
        let decoded: Vec<u32> = decode_results(Serializer::Postcard, &batch.tasks).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn function_ref_survives_the_wire() {
        let function = FunctionRef::named("echo", Serializer::Cbor);
        let bytes = Serializer::Postcard.to_bytes(&function).unwrap();
        assert_eq!(
            Serializer::Postcard.from_bytes::<FunctionRef>(&bytes).unwrap(),
            function
        );
    }
}
