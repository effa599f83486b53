//! # Protocol Messages
//!
//! Defines the envelope and the message set exchanged between a client and the
//! services behind its routes.
//!
//! ## Invariants
//! - Every message is addressed: `destination` is where it goes, `origin` is
//!   where a reply should come back to.
//! - Call messages are correlated by `RequestId`, stream messages by `StreamId`.
//!   Nothing else links two messages together.

use serde::Deserialize;
use serde::Serialize;

use crate::codec::Payload;
use crate::error::FailureInfo;
use crate::ids::CausalityToken;
use crate::ids::RequestId;
use crate::ids::RouteId;
use crate::ids::ServiceId;
use crate::ids::StreamId;

/// A routed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub destination: RouteId,
    pub origin: RouteId,
    pub message: Message,
}

impl Envelope {
    pub fn new(destination: RouteId, origin: RouteId, message: Message) -> Self {
        Self { destination, origin, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    CallRequest {
        request_id: RequestId,
        service: ServiceId,
        method: String,
        args: Payload,
        causality: Option<CausalityToken>,
    },
    CallResult {
        request_id: RequestId,
        result: Payload,
    },
    CallFailure {
        request_id: RequestId,
        error: FailureInfo,
    },
    /// The producer announces a stream before its first element.
    StreamInit {
        stream_id: StreamId,
    },
    StreamData {
        stream_id: StreamId,
        element: Payload,
    },
    /// The consumer grants `credit` more elements.
    StreamNext {
        stream_id: StreamId,
        credit: u32,
    },
    /// Either side ends the stream. `None` is a clean end.
    StreamClosed {
        stream_id: StreamId,
        error: Option<FailureInfo>,
    },
    /// Best-effort: the caller no longer wants the result.
    CancelCall {
        request_id: RequestId,
    },
    /// A remote resource was released and must not be used again.
    ResourceConsumed {
        service: ServiceId,
    },
}

impl Message {
    /// Short name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CallRequest { .. } => "CallRequest",
            Self::CallResult { .. } => "CallResult",
            Self::CallFailure { .. } => "CallFailure",
            Self::StreamInit { .. } => "StreamInit",
            Self::StreamData { .. } => "StreamData",
            Self::StreamNext { .. } => "StreamNext",
            Self::StreamClosed { .. } => "StreamClosed",
            Self::CancelCall { .. } => "CancelCall",
            Self::ResourceConsumed { .. } => "ResourceConsumed",
        }
    }

    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::CallRequest { request_id, .. }
            | Self::CallResult { request_id, .. }
            | Self::CallFailure { request_id, .. }
            | Self::CancelCall { request_id } => Some(*request_id),
            _ => None,
        }
    }

    pub fn stream_id(&self) -> Option<StreamId> {
        match self {
            Self::StreamInit { stream_id }
            | Self::StreamData { stream_id, .. }
            | Self::StreamNext { stream_id, .. }
            | Self::StreamClosed { stream_id, .. } => Some(*stream_id),
            _ => None,
        }
    }
}
