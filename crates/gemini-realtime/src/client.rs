//! [`ServiceBridge`] over the Gemini Live WebSocket API.

use crate::config::GeminiConfig;
use crate::types::{
    Blob, ClientContent, ClientMessage, Content, FunctionResponse, GenerationConfig, Part,
    PrebuiltVoiceConfig, RealtimeInput, ResponseModality, ServerMessage, Setup, SpeechConfig,
    Tool, ToolResponse, VoiceConfig,
};
use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures::StreamExt;
use futures_util::SinkExt;
use futures_util::stream::{SplitSink, SplitStream};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};
use voicelink_core::bridge::{
    AudioFormat, BridgeFactory, BridgeResponse, ResponseStream, ServiceBridge,
};
use voicelink_core::error::BridgeError;
use voicelink_core::functions::FunctionDeclaration;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Call ids of function calls still waiting for a result, per function name.
type PendingCalls = Arc<Mutex<HashMap<String, VecDeque<String>>>>;

/// Gemini Live outputs 24 kHz PCM16 unless it says otherwise.
const DEFAULT_OUTPUT_MIME: &str = "audio/pcm;rate=24000";

pub struct GeminiLiveBridge {
    config: Arc<GeminiConfig>,
    declarations: Vec<FunctionDeclaration>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    reader: Mutex<Option<WsReader>>,
    connected: Arc<AtomicBool>,
    pending_calls: PendingCalls,
}

impl GeminiLiveBridge {
    pub fn new(config: Arc<GeminiConfig>, declarations: Vec<FunctionDeclaration>) -> Self {
        Self {
            config,
            declarations,
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            pending_calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn setup_message(&self) -> ClientMessage {
        let tools = if self.declarations.is_empty() {
            Vec::new()
        } else {
            vec![Tool {
                function_declarations: self.declarations.clone(),
            }]
        };
        ClientMessage::Setup(Setup {
            model: self.config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.config.voice.clone(),
                        },
                    },
                }),
            },
            system_instruction: Some(Content {
                role: None,
                parts: vec![Part {
                    text: self.config.system_instruction.clone(),
                }],
            }),
            tools,
        })
    }

    /// Opens the socket and completes the setup handshake.
    async fn open(&self) -> anyhow::Result<(WsWriter, WsReader)> {
        let (ws_stream, _) = connect_async(self.config.url())
            .await
            .context("Failed to connect to Gemini Live WebSocket")?;
        let (mut writer, mut reader) = ws_stream.split();

        let setup = serde_json::to_string(&self.setup_message())?;
        writer
            .send(Message::Text(setup.into()))
            .await
            .context("Failed to send setup message")?;

        tokio::time::timeout(self.config.setup_timeout, wait_for_setup(&mut reader))
            .await
            .context("Timed out waiting for setupComplete")??;
        Ok((writer, reader))
    }

    async fn send(&self, message: &ClientMessage) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let text = serde_json::to_string(message).map_err(|e| BridgeError::Send(e.to_string()))?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(BridgeError::NotConnected)?;
        writer
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| BridgeError::Send(e.to_string()))
    }
}

enum Frame<'a> {
    Payload(&'a [u8]),
    Closed,
    Ignored,
}

/// Gemini sends its JSON in binary frames as often as in text frames.
fn classify(message: &Message) -> Frame<'_> {
    match message {
        Message::Text(text) => Frame::Payload(text.as_bytes()),
        Message::Binary(data) => Frame::Payload(data),
        Message::Close(_) => Frame::Closed,
        _ => Frame::Ignored,
    }
}

async fn wait_for_setup(reader: &mut WsReader) -> anyhow::Result<()> {
    while let Some(message) = reader.next().await {
        let message = message.context("Gemini Live connection failed during setup")?;
        match classify(&message) {
            Frame::Payload(payload) => match serde_json::from_slice::<ServerMessage>(payload) {
                Ok(parsed) if parsed.setup_complete.is_some() => {
                    info!("Gemini Live setup complete");
                    return Ok(());
                }
                Ok(parsed) => warn!(message = ?parsed, "Unexpected message during setup"),
                Err(e) => warn!(error = %e, "Unreadable message during setup"),
            },
            Frame::Closed => bail!("Gemini Live closed the connection during setup: {message:?}"),
            Frame::Ignored => {}
        }
    }
    bail!("Gemini Live connection ended during setup")
}

fn remember_calls(pending: &PendingCalls, message: &ServerMessage) {
    let Some(tool_call) = &message.tool_call else {
        return;
    };
    let mut pending = pending.lock();
    for call in &tool_call.function_calls {
        if let Some(id) = &call.id {
            pending
                .entry(call.name.clone())
                .or_default()
                .push_back(id.clone());
        }
    }
}

/// Maps one server message to the responses it carries, in order: model
/// parts, then function calls, then the turn marker.
pub fn translate(message: ServerMessage) -> Vec<Result<BridgeResponse, BridgeError>> {
    let mut responses = Vec::new();
    let mut turn_complete = false;

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    responses.push(
                        BASE64
                            .decode(blob.data.as_bytes())
                            .map(|data| BridgeResponse::Audio {
                                data: Bytes::from(data),
                                mime_type: blob
                                    .mime_type
                                    .unwrap_or_else(|| DEFAULT_OUTPUT_MIME.to_string()),
                            })
                            .map_err(|e| BridgeError::Decode(format!("inline audio: {e}"))),
                    );
                }
                if let Some(text) = part.text.filter(|text| !text.is_empty()) {
                    responses.push(Ok(BridgeResponse::Text(text)));
                }
            }
        }
        if content.interrupted == Some(true) {
            debug!("Model turn interrupted");
        }
        turn_complete = content.turn_complete == Some(true);
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            responses.push(Ok(BridgeResponse::FunctionCall {
                name: call.name,
                arguments: call.args.unwrap_or_else(|| json!({})),
            }));
        }
    }

    if message.go_away.is_some() {
        warn!("Gemini Live announced it will close the connection");
    }
    if turn_complete {
        responses.push(Ok(BridgeResponse::TurnComplete));
    }
    responses
}

#[async_trait]
impl ServiceBridge for GeminiLiveBridge {
    async fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }
        match self.open().await {
            Ok((writer, reader)) => {
                *self.writer.lock().await = Some(writer);
                *self.reader.lock() = Some(reader);
                self.connected.store(true, Ordering::SeqCst);
                info!(model = %self.config.model, "Connected to Gemini Live");
                true
            }
            Err(e) => {
                error!(error = ?e, "Failed to connect to Gemini Live");
                false
            }
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.reader.lock().take();
        self.pending_calls.lock().clear();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.close().await {
                debug!(error = %e, "Gemini Live socket was already closed");
            }
            info!("Disconnected from Gemini Live");
        }
    }

    async fn send_audio(&self, chunk: Bytes, format: &AudioFormat) -> Result<(), BridgeError> {
        self.send(&ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                mime_type: format.mime_type(),
                data: BASE64.encode(&chunk),
            },
        }))
        .await
    }

    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), BridgeError> {
        self.send(&ClientMessage::ClientContent(ClientContent {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part {
                    text: text.to_string(),
                }],
            }],
            turn_complete,
        }))
        .await
    }

    async fn send_function_result(&self, name: &str, result: Value) -> Result<(), BridgeError> {
        let id = self
            .pending_calls
            .lock()
            .get_mut(name)
            .and_then(VecDeque::pop_front);
        if id.is_none() {
            warn!(function = name, "No pending call id for function result");
        }
        self.send(&ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![FunctionResponse {
                id,
                name: name.to_string(),
                response: result,
            }],
        }))
        .await
    }

    async fn receive(&self) -> Result<ResponseStream, BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let reader = self
            .reader
            .lock()
            .take()
            .ok_or(BridgeError::StreamUnavailable)?;
        let pending = self.pending_calls.clone();
        let connected = self.connected.clone();

        let stream = futures::stream::unfold(Some(reader), move |state| {
            let pending = pending.clone();
            let connected = connected.clone();
            async move {
                let mut reader = state?;
                loop {
                    let message = match reader.next().await {
                        Some(Ok(message)) => message,
                        Some(Err(e)) => {
                            connected.store(false, Ordering::SeqCst);
                            let lost = Err(BridgeError::Connection(e.to_string()));
                            return Some((vec![lost], None));
                        }
                        None => {
                            connected.store(false, Ordering::SeqCst);
                            info!("Gemini Live stream ended");
                            return None;
                        }
                    };
                    let items = match classify(&message) {
                        Frame::Payload(payload) => {
                            match serde_json::from_slice::<ServerMessage>(payload) {
                                Ok(parsed) => {
                                    remember_calls(&pending, &parsed);
                                    translate(parsed)
                                }
                                Err(e) => vec![Err(BridgeError::Decode(e.to_string()))],
                            }
                        }
                        Frame::Closed => {
                            connected.store(false, Ordering::SeqCst);
                            info!(frame = ?message, "Gemini Live closed the connection");
                            return None;
                        }
                        Frame::Ignored => continue,
                    };
                    if !items.is_empty() {
                        return Some((items, Some(reader)));
                    }
                }
            }
        })
        .flat_map(futures::stream::iter);

        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Creates one [`GeminiLiveBridge`] per session.
pub struct GeminiBridgeFactory {
    config: Arc<GeminiConfig>,
}

impl GeminiBridgeFactory {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl BridgeFactory for GeminiBridgeFactory {
    fn create(&self, functions: Vec<FunctionDeclaration>) -> Arc<dyn ServiceBridge> {
        Arc::new(GeminiLiveBridge::new(self.config.clone(), functions))
    }
}
