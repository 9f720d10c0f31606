//! Core of the voice link: per-connection streaming sessions between a
//! client and a hosted conversational service.
//!
//! Nothing in this crate touches the network. The upstream service is
//! reached through [`bridge::ServiceBridge`] and the client through
//! [`transport::ClientTransport`]; concrete implementations live in the
//! `gemini-realtime` crate and the API service.

pub mod bridge;
pub mod buffer;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod functions;
pub mod lifecycle;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use bridge::{AudioFormat, BridgeFactory, BridgeResponse, ResponseStream, ServiceBridge};
pub use error::{BridgeError, SessionError};
pub use lifecycle::TransportState;
pub use registry::ConnectionRegistry;
pub use session::{Session, SessionConfig, SessionStatus};
pub use transport::{ClientId, ClientTransport};
