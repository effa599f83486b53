//! Work submitted to the engine from outside its own task.

use telerpc::Envelope;
use telerpc::FailureInfo;
use telerpc::RequestId;
use telerpc::ReturnKind;
use telerpc::ServiceId;
use telerpc::StreamId;
use telerpc::StreamRef;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::error::Result;
use crate::graylist::RouteWaiter;
use crate::interceptor::UnsentRequest;
use crate::proxy::Response;
use crate::stream::Source;

use super::EngineSnapshot;

/// A serialized call, ready to be registered and sent.
pub(crate) struct NewCall {
    pub request: UnsentRequest,
    pub returns: ReturnKind,
    pub dispose: bool,
    /// Effective prefetch for streams embedded in the result.
    pub prefetch: u32,
    pub sources: Vec<(StreamRef, Source)>,
    pub reply: oneshot::Sender<Result<Response>>,
    pub ack: oneshot::Sender<Registration>,
}

/// Answer to `Command::Register`.
pub(crate) enum Registration {
    /// The request is outstanding and queued for sending.
    Registered,
    /// The route is gray-listed. Nothing was registered; the sources come back.
    Gray {
        waiter: RouteWaiter,
        sources: Vec<(StreamRef, Source)>,
    },
}

pub(crate) enum Command {
    Register(Box<NewCall>),
    /// Completion of the write of a `CallRequest`.
    Sent { request_id: RequestId, result: std::result::Result<(), Error> },
    /// The caller stopped waiting.
    Cancel(RequestId),
    /// The caller received its response and still wants its streams.
    Resumed(RequestId),
    GrantCredit { stream_id: StreamId, credit: u32 },
    /// The consumer dropped its receiver before the stream ended.
    CloseInbound(StreamId),
    /// A producer loop ended: its source is exhausted, or an element failed to encode.
    StreamFinished { stream_id: StreamId, error: Option<FailureInfo> },
    Release(ServiceId),
    Inspect(oneshot::Sender<EngineSnapshot>),
}

/// An entry of the outgoing-message queue.
pub(crate) struct Outgoing {
    pub envelope: Envelope,
    /// Set for `CallRequest`s, whose write completion is reported back as `Command::Sent`.
    pub request: Option<RequestId>,
}

impl Outgoing {
    pub fn message(envelope: Envelope) -> Self {
        Self { envelope, request: None }
    }

    pub fn request(envelope: Envelope, request_id: RequestId) -> Self {
        Self { envelope, request: Some(request_id) }
    }
}
