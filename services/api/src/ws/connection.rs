//! Lifecycle of one client WebSocket: admission, session startup, the read
//! loop and teardown.

use super::transport::WsTransport;
use crate::{audio_utils, state::AppState};
use anyhow::Context;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{StreamExt, stream::SplitStream};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use voicelink_core::bridge::AudioFormat;
use voicelink_core::dispatch::{handle_binary_frame, handle_text_frame};
use voicelink_core::error::RegistryError;
use voicelink_core::functions::{FormFunctions, FunctionExecutor};
use voicelink_core::protocol::ServerMessage;
use voicelink_core::session::{Session, SessionConfig};
use voicelink_core::transport::{ClientId, ClientTransport, send_message};

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

#[instrument(name = "ws_connection", skip_all, fields(client_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = ClientId::generate();
    tracing::Span::current().record("client_id", client_id.as_str());

    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WsTransport::new(sink));

    match state
        .registry
        .register(client_id.clone(), transport.clone())
        .await
    {
        Ok(()) => {}
        Err(RegistryError::AtCapacity(max_connections)) => {
            warn!(max_connections, "Connection limit reached, refusing client");
            let refusal = ServerMessage::error("connection_limit", "Server is at capacity");
            if let Err(e) = send_message(transport.as_ref(), &refusal).await {
                debug!(error = %e, "Could not deliver refusal");
            }
            transport.close().await;
            return;
        }
        Err(e) => {
            error!(error = %e, "Failed to register client");
            transport.close().await;
            return;
        }
    }
    info!("Client connected");

    match start_session(&state, &client_id, transport.clone()).await {
        Ok(session) => {
            read_frames(&session, &transport, &mut stream).await;
        }
        Err(e) => {
            error!(error = ?e, "Session did not start");
        }
    }

    state.registry.unregister(&client_id).await;
    info!("Client disconnected");
}

/// Builds the session for a registered client, greets the client and opens
/// the upstream.
async fn start_session(
    state: &AppState,
    client_id: &ClientId,
    transport: Arc<WsTransport>,
) -> anyhow::Result<Arc<Session>> {
    let functions: Arc<dyn FunctionExecutor> = Arc::new(FormFunctions::new());
    let bridge = state.bridge_factory.create(functions.declarations());
    let converter = audio_utils::converter_for(state.config.output_sample_rate)
        .context("Failed to build audio converter")?;
    let config = SessionConfig {
        input_format: AudioFormat::pcm16(state.config.input_sample_rate),
        ..SessionConfig::default()
    };
    let session = Session::new(
        client_id.clone(),
        transport.clone(),
        bridge,
        functions,
        converter,
        config,
    );
    state
        .registry
        .attach_session(client_id, session.clone())
        .await?;

    let greeting = ServerMessage::ConnectionEstablished {
        client_id: client_id.to_string(),
        message: "Connected to voice session".to_string(),
    };
    send_message(transport.as_ref(), &greeting)
        .await
        .context("Failed to greet client")?;

    session.initialize().await?;
    Ok(session)
}

/// Feeds client frames to the session until either side goes away.
async fn read_frames(
    session: &Session,
    transport: &WsTransport,
    stream: &mut SplitStream<WebSocket>,
) {
    loop {
        tokio::select! {
            _ = session.closed() => {
                info!("Session ended, closing connection");
                break;
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = handle_text_frame(session, text.as_str()).await {
                        if let Err(e) = send_message(transport, &reply).await {
                            warn!(error = %e, "Failed to reply to client");
                            break;
                        }
                    }
                }
                Some(Ok(Message::Binary(data))) => handle_binary_frame(session, data).await,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    info!("Client closed the connection");
                    transport.mark_closed();
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Error receiving from client WebSocket");
                    transport.mark_closed();
                    break;
                }
            }
        }
    }
}
