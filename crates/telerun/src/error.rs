//! # Caller-facing Errors
//!
//! Every way a call or stream can fail, as seen by the code that made it.
//!
//! `Error` is `Clone`: when an engine dies, the one cause is handed to every
//! pending call, every open stream and every gray-list waiter.

use std::fmt;
use std::time::Duration;

use telerpc::FailureInfo;
use telerpc::FailureKind;
use telerpc::RouteId;
use telerpc::ServiceId;

use crate::transport;

/// Why a connection went away.
#[derive(Debug, Clone)]
pub struct Disconnect {
    pub reason: String,
    pub cause: Option<Box<Error>>,
    /// Set once the owning scope has shut down. A terminal disconnection is never retried.
    pub terminal: bool,
}

#[derive(Debug, Clone)]
pub enum Error {
    /// The transport was lost, or the engine shut down.
    Disconnected(Disconnect),
    /// The call did not complete within its time bound.
    Timeout(Duration),
    /// The destination route is unreachable at the routing layer.
    RouteClosed(RouteId),
    /// The target service is not discoverable yet.
    UnresolvedService(FailureInfo),
    ServiceNotReady(FailureInfo),
    /// An assumption made by the caller was violated on the remote.
    Conflict(FailureInfo),
    /// The resource was used after it (or its owner) was released.
    ResourceConsumed(ServiceId),
    /// The remote producer stopped the stream on purpose.
    ProducerCancelled(Option<FailureInfo>),
    /// Generic call failure reported by the remote.
    Remote(FailureInfo),
    /// Generic stream failure reported by the remote.
    Stream(FailureInfo),
    Serialization(String),
    /// The peer broke the protocol, or local bookkeeping is inconsistent.
    Protocol(String),
}

/// How the resilience wrapper treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retry right away; the call primitives already wait for reconnection.
    Immediate,
    /// Retry with the fixed-then-exponential schedule.
    Backoff,
    /// Do not retry.
    Fatal,
}

impl Error {
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected(Disconnect { reason: reason.into(), cause: None, terminal: false })
    }

    pub fn disconnected_by(reason: impl Into<String>, cause: Error) -> Self {
        Self::Disconnected(Disconnect { reason: reason.into(), cause: Some(Box::new(cause)), terminal: false })
    }

    /// A disconnection that must not be retried, wrapping what caused it.
    pub fn poisoned(cause: Error) -> Self {
        Self::Disconnected(Disconnect {
            reason: "connection scope was shut down".into(),
            cause: Some(Box::new(cause)),
            terminal: true,
        })
    }

    /// Maps a remote call failure onto the matching error kind.
    pub fn from_call_failure(info: FailureInfo) -> Self {
        match info.kind {
            FailureKind::Conflict => Self::Conflict(info),
            FailureKind::ServiceNotReady => Self::ServiceNotReady(info),
            FailureKind::UnresolvedService => Self::UnresolvedService(info),
            FailureKind::Cancelled | FailureKind::Generic => Self::Remote(info),
        }
    }

    /// Maps the error carried by `StreamClosed` onto what a consumer sees.
    pub fn from_stream_failure(info: FailureInfo) -> Self {
        match info.kind {
            FailureKind::Cancelled => Self::ProducerCancelled(Some(info)),
            _ => Self::Stream(info),
        }
    }

    /// Disconnections and closed routes: the link, not the call, failed.
    pub fn is_disconnection(&self) -> bool {
        matches!(self, Self::Disconnected(_) | Self::RouteClosed(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected(d) if d.terminal)
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Disconnected(d) if d.terminal => RetryClass::Fatal,
            Self::Disconnected(_)
            | Self::RouteClosed(_)
            | Self::ServiceNotReady(_)
            | Self::ResourceConsumed(_) => RetryClass::Immediate,
            Self::UnresolvedService(_) => RetryClass::Backoff,
            _ => RetryClass::Fatal,
        }
    }

    /// The failure to report back over the wire when this error ends a stream locally.
    pub fn to_failure_info(&self) -> FailureInfo {
        match self {
            Self::ProducerCancelled(Some(info))
            | Self::Stream(info)
            | Self::Remote(info)
            | Self::Conflict(info)
            | Self::ServiceNotReady(info)
            | Self::UnresolvedService(info) => info.clone(),
            other => FailureInfo::generic(other.to_string()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected(d) => {
                write!(f, "Disconnected: {}", d.reason)?;
                if let Some(cause) = &d.cause {
                    write!(f, " ({})", cause)?;
                }
                Ok(())
            }
            Self::Timeout(after) => write!(f, "Call timed out after {:?}", after),
            Self::RouteClosed(route) => write!(f, "Route {} is closed", route),
            Self::UnresolvedService(info) => write!(f, "Unresolved service: {}", info.message),
            Self::ServiceNotReady(info) => write!(f, "Service not ready: {}", info.message),
            Self::Conflict(info) => write!(f, "Conflict: {}", info.message),
            Self::ResourceConsumed(service) => write!(f, "Resource {} was already consumed", service),
            Self::ProducerCancelled(Some(info)) => write!(f, "Producer cancelled the stream: {}", info.message),
            Self::ProducerCancelled(None) => write!(f, "Producer cancelled the stream"),
            Self::Remote(info) => write!(f, "Remote failure: {}", info),
            Self::Stream(info) => write!(f, "Stream failure: {}", info),
            Self::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Self::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Disconnected(Disconnect { cause: Some(cause), .. }) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<telerpc::Error> for Error {
    fn from(e: telerpc::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::disconnected(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
