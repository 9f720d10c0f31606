//! JSON messages exchanged with the client.
//!
//! Every text frame is a JSON object routed on its `type` field. Binary
//! frames carry raw PCM16 audio and have no envelope.

use crate::error::ProtocolError;
use crate::lifecycle::TransportState;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Seconds since the Unix epoch, as sent in `timestamp` fields.
pub fn timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

// --- Client -> server ---

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    TextInput {
        #[serde(default)]
        text: String,
    },
    Config {
        #[serde(default = "empty_object")]
        config: Value,
    },
    StatusRequest,
    Ping,
    RtviMessage {
        #[serde(default = "empty_object")]
        rtvi_data: Value,
    },
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

const CLIENT_MESSAGE_TYPES: [&str; 5] =
    ["text_input", "config", "status_request", "ping", "rtvi_message"];

impl ClientMessage {
    /// Parses one text frame, telling malformed JSON, a missing or unknown
    /// `type`, and a bad payload apart.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_string(),
            None => return Err(ProtocolError::MissingType),
        };
        if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            reason: e.to_string(),
        })
    }
}

/// The nested command carried by an `rtvi_message`.
#[derive(Debug, Clone, PartialEq)]
pub enum RtviCommand {
    ClientReady,
    /// Decoded from the hex `audio_data` field. May be empty.
    AudioInput(Bytes),
    TransportState(Option<String>),
    /// Any other nested type. Acknowledged without action.
    Other(Option<String>),
}

impl RtviCommand {
    pub fn parse(rtvi_data: &Value) -> Result<Self, ProtocolError> {
        let kind = rtvi_data.get("type").and_then(Value::as_str);
        let command = match kind {
            Some("client_ready") => RtviCommand::ClientReady,
            Some("audio_input") => {
                let encoded = rtvi_data
                    .get("audio_data")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let decoded = hex::decode(encoded)
                    .map_err(|e| ProtocolError::InvalidAudioHex(e.to_string()))?;
                RtviCommand::AudioInput(Bytes::from(decoded))
            }
            Some("transport_state") => RtviCommand::TransportState(
                rtvi_data
                    .get("state")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            ),
            other => RtviCommand::Other(other.map(str::to_string)),
        };
        Ok(command)
    }

    /// The nested `type`, echoed back in `rtvi_message_received`.
    pub fn event_type(&self) -> Option<&str> {
        match self {
            RtviCommand::ClientReady => Some("client_ready"),
            RtviCommand::AudioInput(_) => Some("audio_input"),
            RtviCommand::TransportState(_) => Some("transport_state"),
            RtviCommand::Other(kind) => kind.as_deref(),
        }
    }
}

// --- Server -> client ---

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    ConnectionEstablished {
        client_id: String,
        message: String,
    },
    #[serde(rename = "transport-state-changed")]
    TransportStateChanged {
        state: TransportState,
        previous_state: TransportState,
    },
    AudioOutput {
        /// Base64 PCM16.
        data: String,
        format: String,
        sample_rate: u32,
    },
    TextOutput {
        data: String,
    },
    TurnComplete,
    RtviEvent {
        event: String,
        data: Value,
    },
    Error {
        error: String,
        message: String,
    },
    TextReceived {
        text: String,
        timestamp: f64,
    },
    ConfigUpdated {
        config: Value,
        message: String,
    },
    StatusResponse {
        status: Value,
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
    RtviMessageReceived {
        event_type: Option<String>,
        timestamp: f64,
    },
}

impl ServerMessage {
    pub fn audio_output(pcm: &[u8], sample_rate: u32) -> Self {
        ServerMessage::AudioOutput {
            data: BASE64.encode(pcm),
            format: "pcm".to_string(),
            sample_rate,
        }
    }

    pub fn error(error: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Reply sent to a client whose frame could not be parsed.
    pub fn protocol_error(err: &ProtocolError) -> Self {
        Self::error(err.label(), err.to_string())
    }

    /// The `type` tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionEstablished { .. } => "connection_established",
            ServerMessage::TransportStateChanged { .. } => "transport-state-changed",
            ServerMessage::AudioOutput { .. } => "audio_output",
            ServerMessage::TextOutput { .. } => "text_output",
            ServerMessage::TurnComplete => "turn_complete",
            ServerMessage::RtviEvent { .. } => "rtvi_event",
            ServerMessage::Error { .. } => "error",
            ServerMessage::TextReceived { .. } => "text_received",
            ServerMessage::ConfigUpdated { .. } => "config_updated",
            ServerMessage::StatusResponse { .. } => "status_response",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::RtviMessageReceived { .. } => "rtvi_message_received",
        }
    }
}
