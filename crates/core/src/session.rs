//! One client's streaming session.
//!
//! A session owns the client transport's write side, one bridge to the
//! upstream service and three tasks:
//!
//! * ingress: client audio from the ingress buffer to the bridge,
//! * egress: bridge responses to client messages and events,
//! * writer: drains the outbound buffer to the transport, in order.
//!
//! The tasks share nothing but the two bounded buffers, the bridge and the
//! cancellation token. Everything a session sends to the client on its own
//! initiative goes through the outbound buffer, which drops the oldest
//! message when the client falls behind.

use crate::bridge::{AudioFormat, BridgeResponse, ResponseStream, ServiceBridge};
use crate::buffer::{AudioBuffer, BoundedBuffer, EGRESS_CAPACITY, INGRESS_CAPACITY};
use crate::convert::AudioConverter;
use crate::error::{BridgeError, SessionError};
use crate::events::{Event, EventBus, EventHandler, EventKind, SessionEvent};
use crate::functions::FunctionExecutor;
use crate::lifecycle::TransportState;
use crate::metrics::{LATENCY_WINDOW, SessionMetrics};
use crate::protocol::ServerMessage;
use crate::transport::{ClientId, ClientTransport, send_message};
use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

/// Runtime knobs of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Format of the audio the client sends, forwarded as-is to the bridge.
    pub input_format: AudioFormat,
    pub ingress_capacity: usize,
    pub egress_capacity: usize,
    pub latency_window: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_format: AudioFormat::pcm16(16_000),
            ingress_capacity: INGRESS_CAPACITY,
            egress_capacity: EGRESS_CAPACITY,
            latency_window: LATENCY_WINDOW,
        }
    }
}

/// Point-in-time view of a session, safe to serialize for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub client_id: ClientId,
    pub state: TransportState,
    pub is_running: bool,
    pub bridge_connected: bool,
    pub audio_chunks_received: u64,
    pub audio_chunks_sent: u64,
    pub audio_chunks_dropped: u64,
    pub processing_errors: u64,
    pub buffer_size: usize,
    pub outbound_buffer_size: usize,
    pub avg_response_time_ms: f64,
    pub latency_samples: usize,
    pub is_bot_speaking: bool,
    pub functions: Value,
}

pub struct Session {
    id: ClientId,
    config: SessionConfig,
    transport: Arc<dyn ClientTransport>,
    bridge: Arc<dyn ServiceBridge>,
    functions: Arc<dyn FunctionExecutor>,
    converter: Mutex<Box<dyn AudioConverter>>,
    output_format: AudioFormat,
    state: Mutex<TransportState>,
    ingress: AudioBuffer,
    outbound: Arc<BoundedBuffer<ServerMessage>>,
    bus: EventBus,
    metrics: SessionMetrics,
    bot_speaking: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    /// Set while `connect()` is in flight; the bridge is then closed by
    /// `initialize` instead of `stop`.
    connecting: AtomicBool,
    bridge_closed: AtomicBool,
    /// Stops the session tasks.
    cancel: CancellationToken,
    /// Fires once the session is finished, whether stopped or failed.
    terminated: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Serializes outbound flushes so messages never interleave.
    flush_lock: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(
        id: ClientId,
        transport: Arc<dyn ClientTransport>,
        bridge: Arc<dyn ServiceBridge>,
        functions: Arc<dyn FunctionExecutor>,
        converter: Box<dyn AudioConverter>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let output_format = converter.output_format();
        Arc::new(Self {
            id,
            transport,
            bridge,
            functions,
            converter: Mutex::new(converter),
            output_format,
            state: Mutex::new(TransportState::Disconnected),
            ingress: AudioBuffer::new(config.ingress_capacity),
            outbound: Arc::new(BoundedBuffer::new(config.egress_capacity)),
            bus: EventBus::new(),
            metrics: SessionMetrics::new(config.latency_window),
            bot_speaking: AtomicBool::new(false),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            bridge_closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            terminated: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            config,
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn state(&self) -> TransportState {
        *self.state.lock()
    }

    /// The session's event bus, for collaborators that want to observe it.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// Resolves once the session has been stopped or has failed on its own.
    pub async fn closed(&self) {
        self.terminated.cancelled().await
    }

    /// Moves to `next` if the lifecycle allows it and announces the change.
    async fn transition(&self, next: TransportState) -> bool {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if !previous.can_transition_to(next) {
                debug!(from = %previous, to = %next, "Ignoring transition");
                return false;
            }
            *state = next;
            previous
        };
        info!(from = %previous, to = %next, "Session state changed");
        self.bus
            .publish(SessionEvent::TransportStateChanged {
                state: next,
                previous,
            })
            .await;
        true
    }

    /// Forwards the client-facing events to the outbound buffer.
    fn wire_client_events(&self) {
        let forwarder: Arc<dyn EventHandler> = Arc::new(ClientForwarder {
            outbound: self.outbound.clone(),
        });
        for kind in [
            EventKind::TransportStateChanged,
            EventKind::Error,
            EventKind::ClientReady,
            EventKind::BotSpeaking,
            EventKind::FunctionCall,
        ] {
            self.bus.subscribe(kind, forwarder.clone());
        }
    }

    /// Opens the bridge and starts the session tasks.
    ///
    /// On failure the session ends in `error`, the client has been told why
    /// and no task is left running. A `stop()` that lands first wins: the
    /// session stays `disconnected` and no error is reported.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), SessionError> {
        if self.stopped.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        self.wire_client_events();
        self.transition(TransportState::Connecting).await;

        self.connecting.store(true, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            self.connecting.store(false, Ordering::SeqCst);
            self.close_bridge().await;
            return Err(stopped_during_startup());
        }
        let connected = self.bridge.connect().await;
        self.connecting.store(false, Ordering::SeqCst);
        if self.stopped.load(Ordering::SeqCst) {
            // stop() left the bridge to us while connect() was in flight.
            self.close_bridge().await;
            return Err(stopped_during_startup());
        }
        if !connected {
            return Err(self
                .abort_startup("Failed to connect to the upstream service".to_string())
                .await);
        }
        self.transition(TransportState::Connected).await;

        let responses = match self.bridge.receive().await {
            Ok(responses) => responses,
            Err(e) => return Err(self.abort_startup(e.to_string()).await),
        };

        {
            let mut tasks = self.tasks.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                return Err(stopped_during_startup());
            }
            let span = info_span!("session_tasks", client_id = %self.id);
            tasks.extend([
                tokio::spawn(self.clone().run_ingress().instrument(span.clone())),
                tokio::spawn(self.clone().run_egress(responses).instrument(span.clone())),
                tokio::spawn(self.clone().run_writer().instrument(span)),
            ]);
        }

        self.transition(TransportState::Ready).await;
        info!("Session started");
        Ok(())
    }

    async fn abort_startup(&self, reason: String) -> SessionError {
        error!(reason = %reason, "Session startup failed");
        if !self.stopped.load(Ordering::SeqCst) {
            self.transition(TransportState::Error).await;
            self.bus
                .publish(SessionEvent::Error {
                    error: "startup_failure".to_string(),
                    message: reason.clone(),
                })
                .await;
            self.flush_outbound().await;
        }
        self.close_bridge().await;
        self.terminated.cancel();
        SessionError::StartupFailure(reason)
    }

    /// Tears the session down. Safe to call any number of times.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping session");
        self.transition(TransportState::Disconnected).await;
        self.cancel.cancel();
        self.terminated.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
        if !self.connecting.load(Ordering::SeqCst) {
            self.close_bridge().await;
        }

        let discarded = self.ingress.clear() + self.outbound.clear();
        self.bot_speaking.store(false, Ordering::SeqCst);
        self.bus.clear();
        debug!(discarded, "Session stopped");
    }

    async fn close_bridge(&self) {
        if self.bridge_closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bridge.disconnect().await;
        debug!("Bridge closed");
    }

    /// Queues one chunk of client audio for the bridge. Ignored unless the
    /// session is ready. Every accepted chunk is counted, including chunks
    /// later evicted by newer ones.
    pub async fn process_audio_input(&self, chunk: Bytes) {
        if self.state() != TransportState::Ready {
            trace!(size = chunk.len(), "Dropping audio, session not ready");
            return;
        }
        self.metrics.chunk_received();
        self.metrics.mark_user_audio(Instant::now());
        let size = chunk.len();
        if self.ingress.push(chunk).is_some() {
            self.metrics.chunk_dropped();
            debug!("Ingress buffer full, dropped oldest chunk");
        }
        self.bus
            .publish(SessionEvent::AudioInput {
                size,
                sample_rate: self.config.input_format.sample_rate,
            })
            .await;
    }

    /// Sends `text` to the bridge as a completed user turn. Returns
    /// `Ok(false)` without touching the bridge unless the session is ready.
    pub async fn process_text_input(&self, text: &str) -> Result<bool, BridgeError> {
        if self.state() != TransportState::Ready {
            debug!("Ignoring text input, session not ready");
            return Ok(false);
        }
        self.bridge.send_text(text, true).await?;
        debug!(chars = text.len(), "Text turn sent");
        Ok(true)
    }

    pub async fn handle_client_ready(&self) {
        if self.state() == TransportState::Connected {
            self.transition(TransportState::Ready).await;
        }
        info!("Client ready");
        self.bus.publish(SessionEvent::ClientReady).await;
    }

    pub async fn get_status(&self) -> SessionStatus {
        let state = self.state();
        SessionStatus {
            client_id: self.id.clone(),
            state,
            is_running: matches!(state, TransportState::Connected | TransportState::Ready),
            bridge_connected: self.bridge.is_connected(),
            audio_chunks_received: self.metrics.received(),
            audio_chunks_sent: self.metrics.sent(),
            audio_chunks_dropped: self.metrics.dropped(),
            processing_errors: self.metrics.processing_errors(),
            buffer_size: self.ingress.len(),
            outbound_buffer_size: self.outbound.len(),
            avg_response_time_ms: self.metrics.avg_response_time_ms(),
            latency_samples: self.metrics.latency_samples(),
            is_bot_speaking: self.bot_speaking.load(Ordering::SeqCst),
            functions: self.functions.status().await,
        }
    }

    fn enqueue(&self, message: ServerMessage) {
        if let Some(evicted) = self.outbound.push(message) {
            debug!(dropped = evicted.kind(), "Outbound buffer full, dropped oldest message");
        }
    }

    /// Writes everything currently buffered to the transport.
    async fn flush_outbound(&self) {
        let _guard = self.flush_lock.lock().await;
        while let Some(message) = self.outbound.try_pop() {
            if !self.transport.is_open() {
                trace!(kind = message.kind(), "Transport closed, discarding message");
                continue;
            }
            if let Err(e) = send_message(self.transport.as_ref(), &message).await {
                warn!(kind = message.kind(), error = %e, "Failed to send message to client");
            }
        }
    }

    async fn run_ingress(self: Arc<Self>) {
        debug!("Ingress loop started");
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                chunk = self.ingress.pop() => chunk,
            };
            let size = chunk.len();
            match self
                .bridge
                .send_audio(chunk, &self.config.input_format)
                .await
            {
                Ok(()) => {
                    self.metrics.chunk_sent();
                    trace!(size, "Audio chunk forwarded");
                }
                Err(e) => {
                    self.metrics.processing_error();
                    warn!(error = %e, "Failed to forward audio chunk");
                }
            }
        }
        debug!("Ingress loop stopped");
    }

    async fn run_egress(self: Arc<Self>, mut responses: ResponseStream) {
        debug!("Egress loop started");
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = responses.next() => item,
            };
            match item {
                Some(Ok(response)) => {
                    if let Err(e) = self.handle_response(response).await {
                        self.metrics.processing_error();
                        warn!(error = ?e, "Failed to process upstream response");
                    }
                }
                Some(Err(e)) if e.is_transient() => {
                    self.metrics.processing_error();
                    warn!(error = %e, "Skipping upstream message");
                }
                Some(Err(e)) => {
                    self.fail_upstream(e.to_string()).await;
                    break;
                }
                None => {
                    self.fail_upstream("Upstream response stream ended".to_string())
                        .await;
                    break;
                }
            }
        }
        debug!("Egress loop stopped");
    }

    async fn handle_response(&self, response: BridgeResponse) -> anyhow::Result<()> {
        match response {
            BridgeResponse::Audio { data, mime_type } => {
                let converted = self
                    .converter
                    .lock()
                    .convert(&data)
                    .with_context(|| format!("converting {mime_type} audio"))?;
                if let Some(latency) = self.metrics.record_response(Instant::now()) {
                    trace!(latency_ms = latency.as_millis() as u64, "Response latency");
                }
                if !self.bot_speaking.swap(true, Ordering::SeqCst) {
                    self.bus.publish(SessionEvent::BotSpeaking(true)).await;
                }
                let sample_rate = self.output_format.sample_rate;
                self.enqueue(ServerMessage::audio_output(&converted, sample_rate));
                self.bus
                    .publish(SessionEvent::AudioOutput {
                        data: converted,
                        sample_rate,
                    })
                    .await;
            }
            BridgeResponse::Text(text) => {
                self.bus
                    .publish(SessionEvent::BotTranscription {
                        text: text.clone(),
                        is_final: false,
                    })
                    .await;
                self.enqueue(ServerMessage::TextOutput { data: text });
            }
            BridgeResponse::FunctionCall { name, arguments } => {
                info!(function = %name, "Upstream requested a function call");
                let result = self.functions.execute(&name, &arguments).await;
                let sent = self
                    .bridge
                    .send_function_result(&name, result.clone())
                    .await;
                self.bus
                    .publish(SessionEvent::FunctionCall {
                        name: name.clone(),
                        arguments,
                        result,
                    })
                    .await;
                sent.with_context(|| format!("returning the result of '{name}'"))?;
            }
            BridgeResponse::TurnComplete => {
                self.bot_speaking.store(false, Ordering::SeqCst);
                self.bus.publish(SessionEvent::BotSpeaking(false)).await;
                self.enqueue(ServerMessage::TurnComplete);
            }
        }
        Ok(())
    }

    /// The upstream is gone. Reported to the client once, after which the
    /// session waits to be torn down by its owner.
    async fn fail_upstream(&self, reason: String) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        error!(reason = %reason, "Lost connection to the upstream service");
        self.transition(TransportState::Error).await;
        self.bus
            .publish(SessionEvent::Error {
                error: "upstream_lost".to_string(),
                message: reason,
            })
            .await;
        self.flush_outbound().await;
        self.terminated.cancel();
    }

    async fn run_writer(self: Arc<Self>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.outbound.ready() => self.flush_outbound().await,
            }
        }
        debug!("Writer loop stopped");
    }
}

fn stopped_during_startup() -> SessionError {
    SessionError::StartupFailure("Session stopped during startup".to_string())
}

/// Turns client-facing events into outbound messages.
struct ClientForwarder {
    outbound: Arc<BoundedBuffer<ServerMessage>>,
}

#[async_trait]
impl EventHandler for ClientForwarder {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        let kind = event.kind();
        let message = match &event.payload {
            SessionEvent::TransportStateChanged { state, previous } => {
                ServerMessage::TransportStateChanged {
                    state: *state,
                    previous_state: *previous,
                }
            }
            SessionEvent::Error { error, message } => ServerMessage::error(error, message),
            SessionEvent::ClientReady => ServerMessage::RtviEvent {
                event: kind.as_str().to_string(),
                data: json!({}),
            },
            SessionEvent::BotSpeaking(speaking) => ServerMessage::RtviEvent {
                event: kind.as_str().to_string(),
                data: json!({ "speaking": speaking }),
            },
            SessionEvent::FunctionCall {
                name,
                arguments,
                result,
            } => ServerMessage::RtviEvent {
                event: kind.as_str().to_string(),
                data: json!({ "name": name, "arguments": arguments, "result": result }),
            },
            other => anyhow::bail!("no client message for {} events", other.kind().as_str()),
        };
        if let Some(evicted) = self.outbound.push(message) {
            debug!(dropped = evicted.kind(), "Outbound buffer full, dropped oldest message");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MockServiceBridge;
    use crate::convert::Passthrough;
    use crate::error::ConversionError;
    use crate::functions::{FormFunctions, MockFunctionExecutor};
    use crate::testutil::{BridgeCall, RecordingTransport, ScriptedBridge, eventually};
    use mockall::predicate;
    use tokio::sync::Notify;

    fn session_with(
        transport: Arc<RecordingTransport>,
        bridge: Arc<ScriptedBridge>,
        functions: Arc<dyn FunctionExecutor>,
    ) -> Arc<Session> {
        Session::new(
            ClientId::from("client_test"),
            transport,
            bridge,
            functions,
            Box::new(Passthrough::new(AudioFormat::pcm16(24_000))),
            SessionConfig::default(),
        )
    }

    async fn ready_session() -> (Arc<Session>, Arc<RecordingTransport>, Arc<ScriptedBridge>) {
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::new();
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(FormFunctions::new()));
        session.initialize().await.unwrap();
        // connecting, connected, ready
        eventually(|| transport.types().len() == 3).await;
        (session, transport, bridge)
    }

    #[tokio::test]
    async fn initialize_walks_the_happy_path() {
        let (session, transport, bridge) = ready_session().await;

        assert_eq!(session.state(), TransportState::Ready);
        let states: Vec<_> = transport
            .messages()
            .iter()
            .map(|m| m["state"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(states, vec!["connecting", "connected", "ready"]);
        assert_eq!(bridge.calls(), vec![BridgeCall::Connect]);

        assert!(matches!(
            session.initialize().await,
            Err(SessionError::AlreadyStarted)
        ));
        session.stop().await;
    }

    #[tokio::test]
    async fn refused_connect_is_a_startup_failure() {
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::refusing();
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(FormFunctions::new()));

        let result = session.initialize().await;

        assert!(matches!(result, Err(SessionError::StartupFailure(_))));
        assert_eq!(session.state(), TransportState::Error);
        assert!(session.tasks.lock().await.is_empty());
        assert_eq!(
            transport.types(),
            vec!["transport-state-changed", "transport-state-changed", "error"]
        );
        assert_eq!(transport.messages()[2]["error"], "startup_failure");
        tokio::time::timeout(std::time::Duration::from_secs(1), session.closed())
            .await
            .unwrap();

        session.stop().await;
        assert_eq!(session.state(), TransportState::Disconnected);
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 1);
    }

    #[tokio::test]
    async fn refused_connect_closes_a_mocked_bridge_once() {
        let transport = RecordingTransport::new();
        let mut bridge = MockServiceBridge::new();
        bridge.expect_connect().times(1).returning(|| false);
        bridge.expect_disconnect().times(1).returning(|| ());
        bridge.expect_receive().never();
        let session = Session::new(
            ClientId::from("client_mock"),
            transport.clone(),
            Arc::new(bridge),
            Arc::new(FormFunctions::new()),
            Box::new(Passthrough::new(AudioFormat::pcm16(24_000))),
            SessionConfig::default(),
        );

        let result = session.initialize().await;

        assert!(matches!(result, Err(SessionError::StartupFailure(_))));
        assert_eq!(transport.messages()[2]["error"], "startup_failure");
        // A second teardown must not reach the bridge again.
        session.stop().await;
        assert_eq!(session.state(), TransportState::Disconnected);
    }

    /// Starts `initialize` in the background and waits until it is parked
    /// inside `connect()`.
    async fn initialize_in_background(
        session: &Arc<Session>,
        bridge: &ScriptedBridge,
    ) -> tokio::task::JoinHandle<Result<(), SessionError>> {
        let starting = {
            let session = session.clone();
            tokio::spawn(async move { session.initialize().await })
        };
        eventually(|| bridge.calls() == vec![BridgeCall::Connect]).await;
        starting
    }

    #[tokio::test]
    async fn stop_during_refused_connect_stays_disconnected() {
        let gate = Arc::new(Notify::new());
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::gated_refusing(gate.clone());
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(FormFunctions::new()));
        let starting = initialize_in_background(&session, &bridge).await;

        session.stop().await;
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 0);
        gate.notify_one();
        let result = starting.await.unwrap();

        assert!(matches!(result, Err(SessionError::StartupFailure(_))));
        assert_eq!(session.state(), TransportState::Disconnected);
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 1);
        assert!(!transport.types().contains(&"error".to_string()));
    }

    #[tokio::test]
    async fn stop_during_accepted_connect_closes_the_bridge_once() {
        let gate = Arc::new(Notify::new());
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::gated(gate.clone());
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(FormFunctions::new()));
        let starting = initialize_in_background(&session, &bridge).await;

        session.stop().await;
        gate.notify_one();
        let result = starting.await.unwrap();

        assert!(matches!(result, Err(SessionError::StartupFailure(_))));
        assert_eq!(session.state(), TransportState::Disconnected);
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 1);
        assert!(!bridge.is_connected());
        assert!(session.tasks.lock().await.is_empty());

        session.stop().await;
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 1);
    }

    #[tokio::test]
    async fn text_while_connecting_is_a_silent_no_op() {
        let gate = Arc::new(Notify::new());
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::gated(gate.clone());
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(FormFunctions::new()));

        let starting = {
            let session = session.clone();
            tokio::spawn(async move { session.initialize().await })
        };
        eventually(|| session.state() == TransportState::Connecting).await;

        assert!(!session.process_text_input("hello").await.unwrap());
        assert_eq!(bridge.calls(), vec![BridgeCall::Connect]);

        gate.notify_one();
        starting.await.unwrap().unwrap();
        session.stop().await;
    }

    #[tokio::test]
    async fn audio_is_forwarded_in_arrival_order() {
        let (session, _transport, bridge) = ready_session().await;

        for chunk in [&b"A1"[..], b"B2", b"C3"] {
            session.process_audio_input(Bytes::copy_from_slice(chunk)).await;
        }
        eventually(|| bridge.audio_sent().len() == 3).await;

        assert_eq!(
            bridge.audio_sent(),
            vec![
                Bytes::from_static(b"A1"),
                Bytes::from_static(b"B2"),
                Bytes::from_static(b"C3")
            ]
        );
        let status = session.get_status().await;
        assert_eq!(status.audio_chunks_received, 3);
        assert_eq!(status.audio_chunks_sent, 3);
        session.stop().await;
    }

    #[tokio::test]
    async fn failed_audio_send_is_counted_and_forwarding_continues() {
        let (session, _transport, bridge) = ready_session().await;
        bridge.fail_audio(1);

        session.process_audio_input(Bytes::from_static(b"A1")).await;
        session.process_audio_input(Bytes::from_static(b"B2")).await;
        eventually(|| session.metrics.processing_errors() == 1 && bridge.audio_sent().len() == 1)
            .await;

        assert_eq!(bridge.audio_sent(), vec![Bytes::from_static(b"B2")]);
        let status = session.get_status().await;
        assert_eq!(status.state, TransportState::Ready);
        assert_eq!(status.audio_chunks_received, 2);
        assert_eq!(status.audio_chunks_sent, 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn audio_before_ready_is_not_counted() {
        let transport = RecordingTransport::new();
        let session = session_with(transport, ScriptedBridge::new(), Arc::new(FormFunctions::new()));
        session.process_audio_input(Bytes::from_static(b"xx")).await;
        let status = session.get_status().await;
        assert_eq!(status.audio_chunks_received, 0);
        assert_eq!(status.buffer_size, 0);
    }

    #[tokio::test]
    async fn responses_reach_the_client_in_upstream_order() {
        let (session, transport, bridge) = ready_session().await;

        bridge.respond(Ok(BridgeResponse::Audio {
            data: Bytes::from_static(&[0, 1]),
            mime_type: "audio/pcm;rate=24000".into(),
        }));
        eventually(|| transport.types().len() == 5).await;
        bridge.respond(Ok(BridgeResponse::Text("hi there".into())));
        eventually(|| transport.types().len() == 6).await;
        bridge.respond(Ok(BridgeResponse::TurnComplete));
        eventually(|| transport.types().len() == 8).await;

        let messages = transport.messages();
        let tail: Vec<_> = messages[3..].iter().map(|m| m["type"].clone()).collect();
        assert_eq!(
            tail,
            vec![
                "rtvi_event",
                "audio_output",
                "text_output",
                "rtvi_event",
                "turn_complete"
            ]
        );
        assert_eq!(messages[3]["data"]["speaking"], true);
        assert_eq!(messages[4]["sample_rate"], 24_000);
        assert_eq!(messages[5]["data"], "hi there");
        assert_eq!(messages[6]["data"]["speaking"], false);
        assert!(!session.get_status().await.is_bot_speaking);
        session.stop().await;
    }

    #[tokio::test]
    async fn function_result_is_returned_before_the_next_read() {
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::new();
        let mut functions = MockFunctionExecutor::new();
        functions
            .expect_execute()
            .with(predicate::eq("open_form"), predicate::always())
            .times(1)
            .returning(|_, _| json!({"success": true}));
        let session = session_with(transport.clone(), bridge.clone(), Arc::new(functions));
        session.initialize().await.unwrap();

        bridge.respond(Ok(BridgeResponse::FunctionCall {
            name: "open_form".into(),
            arguments: json!({}),
        }));
        bridge.respond(Ok(BridgeResponse::Text("done".into())));
        eventually(|| transport.types().contains(&"text_output".to_string())).await;

        let reads_and_results: Vec<_> = bridge
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BridgeCall::Read(_) | BridgeCall::FunctionResult(..)))
            .collect();
        assert_eq!(
            reads_and_results,
            vec![
                BridgeCall::Read("function_call"),
                BridgeCall::FunctionResult("open_form".into(), json!({"success": true})),
                BridgeCall::Read("text"),
            ]
        );
        let function_events = transport
            .messages()
            .into_iter()
            .filter(|m| m["event"] == "function-call")
            .count();
        assert_eq!(function_events, 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn malformed_upstream_item_does_not_end_the_session() {
        let (session, transport, bridge) = ready_session().await;

        bridge.respond(Err(BridgeError::Decode("garbage".into())));
        bridge.respond(Ok(BridgeResponse::Audio {
            data: Bytes::from_static(&[1, 2, 3]),
            mime_type: "audio/pcm".into(),
        }));
        bridge.respond(Ok(BridgeResponse::Text("still here".into())));
        eventually(|| transport.types().contains(&"text_output".to_string())).await;

        let status = session.get_status().await;
        assert_eq!(status.state, TransportState::Ready);
        assert_eq!(status.processing_errors, 2);
        session.stop().await;
    }

    #[tokio::test]
    async fn lost_upstream_is_reported_once_then_torn_down() {
        let (session, transport, bridge) = ready_session().await;

        bridge.hang_up();
        tokio::time::timeout(std::time::Duration::from_secs(1), session.closed())
            .await
            .unwrap();

        assert_eq!(session.state(), TransportState::Error);
        let errors: Vec<_> = transport
            .messages()
            .into_iter()
            .filter(|m| m["type"] == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"], "upstream_lost");

        session.stop().await;
        assert_eq!(session.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (session, _transport, bridge) = ready_session().await;
        session.process_audio_input(Bytes::from_static(b"zz")).await;

        session.stop().await;
        session.stop().await;

        assert_eq!(session.state(), TransportState::Disconnected);
        assert_eq!(bridge.count(|c| *c == BridgeCall::Disconnect), 1);
        let status = session.get_status().await;
        assert_eq!(status.buffer_size, 0);
        assert_eq!(status.outbound_buffer_size, 0);
        assert_eq!(session.events().handler_count(EventKind::Error), 0);
    }

    #[tokio::test]
    async fn client_ready_is_announced() {
        let (session, transport, _bridge) = ready_session().await;
        session.handle_client_ready().await;
        eventually(|| transport.types().len() == 4).await;
        assert_eq!(transport.messages()[3]["event"], "client-ready");
        session.stop().await;
    }

    struct Failing;

    impl AudioConverter for Failing {
        fn convert(&mut self, _chunk: &[u8]) -> Result<Bytes, ConversionError> {
            Err(ConversionError::Resample("broken".into()))
        }

        fn output_format(&self) -> AudioFormat {
            AudioFormat::pcm16(24_000)
        }
    }

    #[tokio::test]
    async fn conversion_failure_is_counted_and_skipped() {
        let transport = RecordingTransport::new();
        let bridge = ScriptedBridge::new();
        let session = Session::new(
            ClientId::from("client_conv"),
            transport.clone(),
            bridge.clone(),
            Arc::new(FormFunctions::new()),
            Box::new(Failing),
            SessionConfig::default(),
        );
        session.initialize().await.unwrap();

        bridge.respond(Ok(BridgeResponse::Audio {
            data: Bytes::from_static(&[0, 0]),
            mime_type: "audio/pcm".into(),
        }));
        bridge.respond(Ok(BridgeResponse::TurnComplete));
        eventually(|| transport.types().contains(&"turn_complete".to_string())).await;

        assert!(!transport.types().contains(&"audio_output".to_string()));
        assert_eq!(session.get_status().await.processing_errors, 1);
        session.stop().await;
    }
}
