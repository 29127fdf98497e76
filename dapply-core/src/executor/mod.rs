//! Local task execution.
//!
//! The protocol only ever moves opaque bytes. An [`Executor`] is the one
//! place where they are given meaning: it turns a function reference, the
//! round's shared arguments and a slice of task payloads into result
//! payloads.
//!
//! [`run_local`] is the adapter every process runs between the scatter and
//! gather phases. It evaluates the executor on a blocking thread and converts
//! panics into [`OperationError::Panicked`].
use std::{panic::AssertUnwindSafe, sync::Arc};

use anyhow::{Context, Result};
use bytes::Bytes;
use tracing::{debug, instrument};

use crate::{
    __private::OPERATIONS,
    operation::{self, OperationError},
    packing::ShapeError,
    task::FunctionRef,
};

/// Evaluates a function over a batch of encoded tasks.
pub trait Executor: Send + Sync + 'static {
    /// Evaluate `function` on every task, in order.
    ///
    /// Must return exactly one result per task.
    fn execute(
        &self,
        function: &FunctionRef,
        shared_args: &[u8],
        tasks: Vec<Bytes>,
    ) -> operation::Result<Vec<Bytes>>;
}

/// Executor for operations registered with
/// [`#[derive(RemoteExecute)]`](crate::RemoteExecute).
#[derive(Debug, Default, Clone, Copy)]
pub struct Registry;

impl Registry {
    /// Names of every operation linked into this binary.
    pub fn operations() -> impl Iterator<Item = &'static str> {
        OPERATIONS.iter().map(|entry| entry.name)
    }
}

impl Executor for Registry {
    fn execute(
        &self,
        function: &FunctionRef,
        shared_args: &[u8],
        tasks: Vec<Bytes>,
    ) -> operation::Result<Vec<Bytes>> {
        let entry = OPERATIONS
            .iter()
            .find(|entry| entry.name == function.operation)
            .ok_or_else(|| OperationError::Unknown(function.operation.clone()))?;

        (entry.execute)(function.serializer, &function.payload, shared_args, tasks)
    }
}

/// An [`Executor`] evaluating a closure once per task.
///
/// ```
/// use bytes::Bytes;
/// use dapply::{executor::{self, Executor}, serializer::Serializer, task::FunctionRef};
///
/// let upper = executor::from_fn(|_function, _shared, task: &[u8]| {
///     Ok(Bytes::from(task.to_ascii_uppercase()))
/// });
/// let function = FunctionRef::named("upper", Serializer::Postcard);
/// let results = upper
///     .execute(&function, &[], vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")])
///     .unwrap();
/// assert_eq!(results, vec![Bytes::from_static(b"AB"), Bytes::from_static(b"C")]);
/// ```
pub fn from_fn<F>(f: F) -> FnExecutor<F>
where
    F: Fn(&FunctionRef, &[u8], &[u8]) -> operation::Result<Bytes> + Send + Sync + 'static,
{
    FnExecutor(f)
}

/// See [`from_fn`].
pub struct FnExecutor<F>(F);

impl<F> Executor for FnExecutor<F>
where
    F: Fn(&FunctionRef, &[u8], &[u8]) -> operation::Result<Bytes> + Send + Sync + 'static,
{
    fn execute(
        &self,
        function: &FunctionRef,
        shared_args: &[u8],
        tasks: Vec<Bytes>,
    ) -> operation::Result<Vec<Bytes>> {
        tasks
            .iter()
            .map(|task| (self.0)(function, shared_args, task))
            .collect()
    }
}

/// Evaluate this process's share of a round.
///
/// With no local tasks the executor is not invoked. Otherwise it runs on a
/// blocking thread; a panic is reported as [`OperationError::Panicked`], and
/// a result count that differs from the task count as a
/// [`ShapeError::CountMismatch`].
#[instrument(skip_all, fields(operation = %function.operation, tasks = tasks.len()), level = "debug")]
pub async fn run_local(
    executor: Arc<dyn Executor>,
    function: FunctionRef,
    shared_args: Bytes,
    tasks: Vec<Bytes>,
) -> Result<Vec<Bytes>> {
    if tasks.is_empty() {
        return Ok(Vec::new());
    }

    let count = tasks.len();
    let results = tokio::task::spawn_blocking(move || {
        std::panic::catch_unwind(AssertUnwindSafe(|| {
            executor.execute(&function, &shared_args, tasks)
        }))
        .map_err(|payload| OperationError::panicked(&function.operation, payload))?
    })
    .await
    .context("joining executor thread")??;

    if results.len() != count {
        return Err(ShapeError::CountMismatch {
            expected: count,
            actual: results.len(),
        }
        .into());
    }

    debug!(count, "local tasks executed");
    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        operation::{Operation, RemoteExecute as _},
        serializer::Serializer,
        task::TaskBatch,
        RemoteExecute,
    };

    #[derive(Serialize, Deserialize, RemoteExecute)]
    #[dapply(internal)]
    struct Add;

    impl Operation for Add {
        type Input = i64;
        type Shared = i64;
        type Output = i64;

        fn execute(&self, input: i64, shared: &i64) -> operation::Result<i64> {
            Ok(input + shared)
        }
    }

    #[derive(Serialize, Deserialize, RemoteExecute)]
    #[dapply(internal)]
    struct Explode;

    impl Operation for Explode {
        type Input = ();
        type Shared = ();
        type Output = ();

        fn execute(&self, _: (), _: &()) -> operation::Result<()> {
            panic!("explode")
        }
    }

    #[test]
    fn registry_resolves_operations_by_name() {
        assert!(Registry::operations().any(|name| name == Add::NAME));

        let batch = TaskBatch::typed(&Add, &10, [1, 2, 3], Serializer::Postcard).unwrap();
        let results = Registry
            .execute(&batch.function, &batch.shared_args, batch.tasks)
            .unwrap();
        let results: Vec<i64> = crate::task::decode_results(Serializer::Postcard, &results).unwrap();
        assert_eq!(results, vec![11, 12, 13]);
    }

    #[test]
    fn unknown_operation() {
        let function = FunctionRef::named("no::such::Operation", Serializer::Postcard);
        let err = Registry
            .execute(&function, &[], vec![Bytes::new()])
            .unwrap_err();
        assert!(matches!(err, OperationError::Unknown(name) if name == "no::such::Operation"));
    }

    #[tokio::test]
    async fn empty_share_skips_the_executor() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let executor = from_fn(move |_, _, task| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Bytes::copy_from_slice(task))
        });

        let function = FunctionRef::named("echo", Serializer::Postcard);
        let results = run_local(Arc::new(executor), function, Bytes::new(), Vec::new())
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panics_become_operation_errors() {
        let batch = TaskBatch::typed(&Explode, &(), [()], Serializer::Postcard).unwrap();
        let err = run_local(Arc::new(Registry), batch.function, batch.shared_args, batch.tasks)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<OperationError>(),
            Some(OperationError::Panicked { message, .. }) if message == "explode"
        ));
    }

    struct Lossy;

    impl Executor for Lossy {
        fn execute(&self, _: &FunctionRef, _: &[u8], _: Vec<Bytes>) -> operation::Result<Vec<Bytes>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn result_count_is_checked() {
        let function = FunctionRef::named("lossy", Serializer::Postcard);
        let err = run_local(Arc::new(Lossy), function, Bytes::new(), vec![Bytes::new()])
            .await
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<ShapeError>(),
            Some(&ShapeError::CountMismatch {
                expected: 1,
                actual: 0
            })
        );
    }
}
