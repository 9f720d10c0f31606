//! Routes inbound client frames to the session.
//!
//! Replies are returned to the caller rather than queued on the session, so
//! a reply always goes back to the client that asked.

use crate::protocol::{ClientMessage, RtviCommand, ServerMessage, timestamp};
use crate::session::Session;
use bytes::Bytes;
use tracing::{debug, info, warn};

/// Handles one parsed client message and returns the reply, if any.
pub async fn dispatch(session: &Session, message: ClientMessage) -> Option<ServerMessage> {
    match message {
        ClientMessage::TextInput { text } => {
            if text.is_empty() {
                return None;
            }
            match session.process_text_input(&text).await {
                Ok(true) => Some(ServerMessage::TextReceived {
                    text,
                    timestamp: timestamp(),
                }),
                Ok(false) => None,
                Err(e) => {
                    warn!(error = %e, "Failed to forward text input");
                    Some(ServerMessage::error("bridge_error", e.to_string()))
                }
            }
        }
        ClientMessage::Config { config } => {
            info!(config = %config, "Configuration update requested");
            Some(ServerMessage::ConfigUpdated {
                config,
                message: "Configuration updated successfully".to_string(),
            })
        }
        ClientMessage::StatusRequest => {
            let status = serde_json::to_value(session.get_status().await).unwrap_or_default();
            Some(ServerMessage::StatusResponse {
                status,
                timestamp: timestamp(),
            })
        }
        ClientMessage::Ping => Some(ServerMessage::Pong {
            timestamp: timestamp(),
        }),
        ClientMessage::RtviMessage { rtvi_data } => {
            let command = match RtviCommand::parse(&rtvi_data) {
                Ok(command) => command,
                Err(e) => {
                    warn!(error = %e, "Rejected RTVI message");
                    return Some(ServerMessage::protocol_error(&e));
                }
            };
            let event_type = command.event_type().map(str::to_string);
            match command {
                RtviCommand::ClientReady => session.handle_client_ready().await,
                RtviCommand::AudioInput(chunk) => {
                    if !chunk.is_empty() {
                        session.process_audio_input(chunk).await;
                    }
                }
                RtviCommand::TransportState(state) => {
                    info!(state = ?state, "Client reported transport state");
                }
                RtviCommand::Other(kind) => {
                    debug!(kind = ?kind, "Unhandled RTVI message type");
                }
            }
            Some(ServerMessage::RtviMessageReceived {
                event_type,
                timestamp: timestamp(),
            })
        }
    }
}

/// Parses and handles one text frame. Malformed frames get an error reply
/// and leave the session untouched.
pub async fn handle_text_frame(session: &Session, text: &str) -> Option<ServerMessage> {
    match ClientMessage::parse(text) {
        Ok(message) => dispatch(session, message).await,
        Err(e) => {
            warn!(error = %e, "Rejected client message");
            Some(ServerMessage::protocol_error(&e))
        }
    }
}

/// Binary frames are raw audio. They are never acknowledged: at one frame
/// every few tens of milliseconds an `audio_received` reply per frame would
/// compete with `audio_output` for the client's socket. Clients read
/// progress from `audio_chunks_received` in the session status instead.
pub async fn handle_binary_frame(session: &Session, data: Bytes) {
    session.process_audio_input(data).await;
}
