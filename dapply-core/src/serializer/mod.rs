//! Encoding and decoding of everything that crosses the wire.
//!
//! The protocol itself only moves opaque byte payloads; this module is the
//! encode/decode pair that turns typed values (operations, task inputs, shared
//! arguments, results, and the protocol's own control messages) into those
//! payloads and back.
//!
//! # Examples
//!
//! ```rust
//! use dapply::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Point {
//!    x: i64,
//!    y: i64,
//! }
//!
//! let point = Point { x: 3, y: -4 };
//! let bytes = Serializer::Cbor.to_bytes(&point).unwrap();
//! assert_eq!(Serializer::Cbor.from_bytes::<Point>(&bytes).unwrap(), point);
//! ```

use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Shorthand for values that can be moved between processes.
///
/// Values are decoded into owned types and may be handed to blocking
/// executor threads, hence the `Send + Sync + 'static` requirements.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Wire formats supported by the crate.
///
/// A [`Serializer`] is carried inside every
/// [`FunctionRef`](crate::task::FunctionRef), so the processes of a group
/// agree on the format used for operation payloads without further
/// negotiation.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Encode `value` in this format.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?.into()),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf)?;
                Ok(buf.into())
            }
        }
    }

    /// Decode a value of type `T` from `bytes`.
    #[instrument(skip(bytes), fields(len = bytes.len()), level = "trace")]
    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<config::Serializer> for Serializer {
    fn from(serializer: config::Serializer) -> Self {
        match serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        config.serializer.into()
    }
}
