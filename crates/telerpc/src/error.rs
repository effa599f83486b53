//! # Error Definitions
//!
//! Two kinds of failure live here and must not be confused:
//!
//! - `Error`: something went wrong *locally* while building or reading a payload.
//! - `FailureInfo`: the *remote* reported that a call or stream failed. It travels
//!   on the wire inside `CallFailure` and `StreamClosed`.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::ids::StreamId;
use crate::signature::ParamKind;

/// Local encoding and decoding failures.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The underlying serde codec rejected the data.
    Serialization(String),
    /// Argument list length does not match the method signature.
    ArgumentCount { method: String, expected: usize, found: usize },
    /// An argument was given as a value where the signature declares a stream, or vice versa.
    ArgumentKind { method: String, index: usize, expected: ParamKind },
    /// The data references a stream that the payload does not describe.
    UnknownStream(StreamId),
    /// The payload describes a stream that the data never references.
    UnreferencedStream(StreamId),
    /// A handle-returning method produced something other than a service id.
    InvalidHandle(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialization(msg) => write!(f, "serialization failed: {}", msg),
            Self::ArgumentCount { method, expected, found } => {
                write!(f, "method '{}' takes {} arguments, got {}", method, expected, found)
            }
            Self::ArgumentKind { method, index, expected } => {
                write!(f, "method '{}' expects a {:?} at argument {}", method, expected, index)
            }
            Self::UnknownStream(id) => write!(f, "payload references undescribed {}", id),
            Self::UnreferencedStream(id) => write!(f, "payload describes unreferenced {}", id),
            Self::InvalidHandle(msg) => write!(f, "invalid handle: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// A specialized Result type for payload operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of a remote failure.
///
/// The runtime maps each kind onto a distinct caller-facing error, so the
/// classification has to survive the trip across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// An optimistic assumption made by the caller no longer holds.
    Conflict,
    /// The service exists but is not accepting calls yet.
    ServiceNotReady,
    /// No provider for the service could be found.
    UnresolvedService,
    /// The peer stopped the operation on purpose.
    Cancelled,
    /// Anything else; the message and details carry the story.
    Generic,
}

/// Structured failure reported by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    /// Free-form remote diagnostics (stack, error code, ...).
    pub details: Option<serde_json::Value>,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), details: None }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Generic, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Cancelled, message)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
