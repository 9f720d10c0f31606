//! Client identity and the outbound half of a client connection.

use crate::error::TransportError;
use crate::protocol::ServerMessage;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

/// Opaque identity of one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// A fresh `client_<uuid>` id.
    pub fn generate() -> Self {
        Self(format!("client_{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Write side of a client connection. Framing and the read side belong to
/// whoever accepted the connection.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Whether the connection can still be written to.
    fn is_open(&self) -> bool;

    /// Sends one text frame.
    async fn send(&self, text: &str) -> Result<(), TransportError>;

    /// Closes the connection. Idempotent.
    async fn close(&self);
}

/// Serializes `message` and sends it as one text frame.
pub async fn send_message(
    transport: &dyn ClientTransport,
    message: &ServerMessage,
) -> Result<(), TransportError> {
    let text = serde_json::to_string(message).map_err(|e| TransportError::Send(e.to_string()))?;
    transport.send(&text).await
}
