//! # telerun
//!
//! Client runtime for `telerpc`: turns calls into wire messages over a
//! reconnecting transport, and wire messages back into results, stream
//! elements and typed failures.
//!
//! Layers, outermost first:
//!
//! - `durable` retries transient failures.
//! - `reachability::Client` waits for (or fails fast without) a live connection.
//! - `supervisor::Supervisor` reconnects and publishes the current connection.
//! - `engine::Engine` is the protocol state machine of one connection.

pub mod config;
pub mod context;
pub mod durable;
pub mod engine;
pub mod error;
pub mod graylist;
pub mod interceptor;
pub mod mock_transport;
pub mod proxy;
pub mod reachability;
pub mod resources;
pub mod stream;
pub mod supervisor;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::ClientConfig;
pub use config::DurablePolicy;
pub use config::EngineConfig;
pub use context::CallContext;
pub use context::PrefetchStrategy;
pub use context::ReconnectStrategy;
pub use durable::durable;
pub use engine::Argument;
pub use engine::Call;
pub use engine::Engine;
pub use engine::EngineSnapshot;
pub use error::Error;
pub use error::Result;
pub use error::RetryClass;
pub use proxy::RemoteObject;
pub use proxy::RemoteResource;
pub use proxy::Response;
pub use reachability::Client;
pub use stream::Decoded;
pub use stream::StreamReceiver;
pub use stream::StreamSender;
pub use supervisor::ConnectionStatus;
pub use supervisor::Supervisor;
