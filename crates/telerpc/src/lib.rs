//! # TeleRPC
//!
//! The wire vocabulary shared by every telerun client: identifiers, message
//! envelopes, failure payloads, method signatures, and the serialization
//! contract used to turn argument lists and results into payloads.
//!
//! ## Philosophy
//!
//! - **Framing is someone else's problem**: messages are plain Rust values.
//!   A transport decides how (and whether) they become bytes.
//! - **Signatures drive encoding**: arguments are checked against a
//!   `MethodSignature` before they are put on the wire, so an arity or
//!   stream-position mistake fails locally instead of remotely.
//! - **Streams are references**: a payload never carries a live channel. It
//!   carries `StreamRef`s, and the runtime binds them to local buffers.

pub mod codec;
pub mod error;
pub mod ids;
pub mod message;
pub mod signature;

pub use codec::ArgSlot;
pub use codec::JsonSerialization;
pub use codec::Payload;
pub use codec::Serialization;
pub use codec::StreamRef;
pub use error::Error;
pub use error::FailureInfo;
pub use error::FailureKind;
pub use error::Result;
pub use ids::CausalityToken;
pub use ids::RequestId;
pub use ids::RouteId;
pub use ids::ServiceId;
pub use ids::StreamId;
pub use message::Envelope;
pub use message::Message;
pub use signature::ApiDescriptor;
pub use signature::DescriptorResolver;
pub use signature::MethodSignature;
pub use signature::ParamKind;
pub use signature::ReturnKind;
pub use signature::DISPOSE_METHOD;

#[cfg(test)]
mod tests;
