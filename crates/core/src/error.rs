//! Error types shared across the core crate.
//!
//! Each boundary gets its own enum so callers can tell a transient failure
//! (one chunk, one message) apart from one that ends a session.

use thiserror::Error;

/// Failures reported by a [`crate::bridge::ServiceBridge`].
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An operation required an open upstream connection.
    #[error("Not connected to the upstream service")]
    NotConnected,

    /// The upstream connection failed or was dropped.
    #[error("Upstream connection error: {0}")]
    Connection(String),

    /// A single outbound message could not be written.
    #[error("Failed to send to upstream: {0}")]
    Send(String),

    /// A single upstream message could not be decoded.
    #[error("Failed to decode upstream message: {0}")]
    Decode(String),

    /// The response stream was already handed out for this connection.
    #[error("Response stream is unavailable")]
    StreamUnavailable,
}

impl BridgeError {
    /// Whether the failure is confined to one item. Anything else on the
    /// response stream means the upstream connection is gone.
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Decode(_) | BridgeError::Send(_))
    }
}

/// Failures reported by a [`crate::transport::ClientTransport`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,
    #[error("Failed to send to client: {0}")]
    Send(String),
}

/// Failures raised by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The bridge could not be opened; the session never reached `ready`.
    #[error("Session startup failed: {0}")]
    StartupFailure(String),

    #[error("Session was already started or stopped")]
    AlreadyStarted,

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Failures raised by the connection registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client '{0}' is already registered")]
    AlreadyRegistered(String),
    #[error("Client '{0}' is not registered")]
    NotRegistered(String),
    #[error("Client '{0}' already has a session attached")]
    SessionAlreadyAttached(String),
    #[error("Connection limit of {0} reached")]
    AtCapacity(usize),
}

/// Malformed inbound client messages. Reported to the sending client only.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid JSON format: {0}")]
    InvalidJson(String),
    #[error("Message has no 'type' field")]
    MissingType,
    #[error("Message type '{0}' is not supported")]
    UnknownType(String),
    #[error("Invalid payload for '{kind}': {reason}")]
    InvalidPayload { kind: String, reason: String },
    #[error("Audio data is not valid hex: {0}")]
    InvalidAudioHex(String),
}

impl ProtocolError {
    /// Short machine-readable label used in the `error` field sent to clients.
    pub fn label(&self) -> &'static str {
        match self {
            ProtocolError::InvalidJson(_) => "Invalid JSON format",
            ProtocolError::MissingType => "Missing message type",
            ProtocolError::UnknownType(_) => "Unknown message type",
            ProtocolError::InvalidPayload { .. } => "Invalid message payload",
            ProtocolError::InvalidAudioHex(_) => "Invalid audio data",
        }
    }
}

/// Failures converting an upstream audio chunk for the client.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Audio chunk has an odd number of bytes ({0})")]
    OddLength(usize),
    #[error("Resampling failed: {0}")]
    Resample(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_and_send_errors_are_transient() {
        assert!(BridgeError::Decode("bad json".into()).is_transient());
        assert!(BridgeError::Send("broken pipe".into()).is_transient());
        assert!(!BridgeError::Connection("reset".into()).is_transient());
        assert!(!BridgeError::NotConnected.is_transient());
    }

    #[test]
    fn protocol_error_labels_and_messages() {
        let err = ProtocolError::UnknownType("dance".into());
        assert_eq!(err.label(), "Unknown message type");
        assert_eq!(err.to_string(), "Message type 'dance' is not supported");
    }
}
