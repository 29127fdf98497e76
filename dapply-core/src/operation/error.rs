//! Operation error types.
//!
//! Apply rounds are all-or-nothing: there is no retry and no partial result.
//! An error raised while evaluating any task aborts the round on the process
//! that raised it. The variants below only distinguish *why* evaluation
//! failed, so callers can report something more useful than "the round
//! failed".
//!
//! ## Example
//!
//! An [`Operation`](crate::operation::Operation) rejecting its input:
//!
//! ```
//! use dapply::{
//!     RemoteExecute,
//!     executor::Registry,
//!     operation::{Operation, OperationError, Result},
//!     session::Session,
//!     serializer::Serializer,
//! };
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize, RemoteExecute)]
//! struct Sqrt;
//!
//! impl Operation for Sqrt {
//!     type Input = f64;
//!     type Shared = ();
//!     type Output = f64;
//!
//!     fn execute(&self, input: f64, _: &()) -> Result<f64> {
//!         if input < 0.0 {
//!             return Err(OperationError::msg("negative input"));
//!         }
//!         Ok(input.sqrt())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let mut session = Session::in_memory_with(1, Arc::new(Registry), Serializer::Postcard).await?;
//! session.join().await?;
//! let err = session.map(&Sqrt, &(), vec![4.0, -1.0]).await.unwrap_err();
//! assert!(matches!(
//!     err.downcast_ref::<OperationError>(),
//!     Some(OperationError::Failed(_))
//! ));
//! # Ok(())
//! # }
//! ```
use std::any::Any;

use thiserror::Error;

/// Why an operation could not produce its results.
#[derive(Error, Debug)]
pub enum OperationError {
    /// The function reference names an operation that is not linked into
    /// this binary.
    #[error("unknown operation `{0}`")]
    Unknown(String),
    /// A payload (the operation itself, its shared arguments, an input or
    /// an output) failed to encode or decode.
    #[error("failed to {what} for operation `{operation}`: {err}")]
    Codec {
        operation: String,
        what: &'static str,
        err: anyhow::Error,
    },
    /// The operation panicked. The panic is caught at the executor boundary.
    #[error("operation `{operation}` panicked: {message}")]
    Panicked { operation: String, message: String },
    /// The operation itself reported a failure.
    #[error("operation failed: {0}")]
    Failed(anyhow::Error),
}

impl OperationError {
    /// An operation failure with the given message.
    pub fn msg<M>(message: M) -> Self
    where
        M: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        Self::Failed(anyhow::Error::msg(message))
    }

    pub(crate) fn codec(operation: &str, what: &'static str, err: anyhow::Error) -> Self {
        Self::Codec {
            operation: operation.to_string(),
            what,
            err,
        }
    }

    pub(crate) fn panicked(operation: &str, payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(message) = payload.downcast_ref::<&str>() {
            (*message).to_string()
        } else if let Some(message) = payload.downcast_ref::<String>() {
            message.clone()
        } else {
            "<non-string panic payload>".to_string()
        };

        Self::Panicked {
            operation: operation.to_string(),
            message,
        }
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err)
    }
}

pub type Result<T> = std::result::Result<T, OperationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let err = OperationError::panicked("op", Box::new("boom"));
        assert_eq!(err.to_string(), "operation `op` panicked: boom");

        let err = OperationError::panicked("op", Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "operation `op` panicked: bang");

        let err = OperationError::panicked("op", Box::new(7u8));
        assert!(err.to_string().ends_with("<non-string panic payload>"));
    }

    #[test]
    fn anyhow_errors_are_failures() {
        fn fails() -> Result<()> {
            let inner: anyhow::Result<()> = Err(anyhow::anyhow!("nope"));
            inner?;
            Ok(())
        }

        assert!(matches!(fails(), Err(OperationError::Failed(_))));
        assert_eq!(OperationError::msg("bad").to_string(), "operation failed: bad");
    }
}
