//! Hand-written doubles for loop-ordering tests, where a mock's
//! expectations would hide the interleaving being checked.

use crate::bridge::{AudioFormat, BridgeResponse, ResponseStream, ServiceBridge};
use crate::error::{BridgeError, TransportError};
use crate::transport::ClientTransport;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCall {
    Connect,
    Disconnect,
    Audio(Bytes),
    Text(String, bool),
    FunctionResult(String, Value),
    /// An item was handed to the reader of the response stream.
    Read(&'static str),
}

type Scripted = Result<BridgeResponse, BridgeError>;

pub struct ScriptedBridge {
    connect_result: bool,
    connect_gate: Option<Arc<Notify>>,
    connected: AtomicBool,
    failing_audio: AtomicUsize,
    calls: Arc<Mutex<Vec<BridgeCall>>>,
    script_tx: Mutex<Option<mpsc::UnboundedSender<Scripted>>>,
    script_rx: Mutex<Option<mpsc::UnboundedReceiver<Scripted>>>,
}

impl ScriptedBridge {
    pub fn new() -> Arc<Self> {
        Self::build(true, None)
    }

    /// `connect()` reports failure.
    pub fn refusing() -> Arc<Self> {
        Self::build(false, None)
    }

    /// `connect()` waits until `gate` is notified.
    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Self::build(true, Some(gate))
    }

    /// `connect()` waits until `gate` is notified, then reports failure.
    pub fn gated_refusing(gate: Arc<Notify>) -> Arc<Self> {
        Self::build(false, Some(gate))
    }

    fn build(connect_result: bool, connect_gate: Option<Arc<Notify>>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            connect_result,
            connect_gate,
            connected: AtomicBool::new(false),
            failing_audio: AtomicUsize::new(0),
            calls: Arc::new(Mutex::new(Vec::new())),
            script_tx: Mutex::new(Some(tx)),
            script_rx: Mutex::new(Some(rx)),
        })
    }

    /// The next `count` audio sends fail without being recorded.
    pub fn fail_audio(&self, count: usize) {
        self.failing_audio.store(count, Ordering::SeqCst);
    }

    /// Queues one item on the response stream.
    pub fn respond(&self, item: Scripted) {
        if let Some(tx) = self.script_tx.lock().as_ref() {
            let _ = tx.send(item);
        }
    }

    /// Ends the response stream, as if the upstream went away.
    pub fn hang_up(&self) {
        self.script_tx.lock().take();
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, matches: impl Fn(&BridgeCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|call| matches(call)).count()
    }

    pub fn audio_sent(&self) -> Vec<Bytes> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                BridgeCall::Audio(chunk) => Some(chunk.clone()),
                _ => None,
            })
            .collect()
    }
}

fn response_kind(item: &Scripted) -> &'static str {
    match item {
        Ok(BridgeResponse::Audio { .. }) => "audio",
        Ok(BridgeResponse::Text(_)) => "text",
        Ok(BridgeResponse::FunctionCall { .. }) => "function_call",
        Ok(BridgeResponse::TurnComplete) => "turn_complete",
        Err(_) => "error",
    }
}

#[async_trait]
impl ServiceBridge for ScriptedBridge {
    async fn connect(&self) -> bool {
        self.calls.lock().push(BridgeCall::Connect);
        if let Some(gate) = &self.connect_gate {
            gate.notified().await;
        }
        self.connected.store(self.connect_result, Ordering::SeqCst);
        self.connect_result
    }

    async fn disconnect(&self) {
        self.calls.lock().push(BridgeCall::Disconnect);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_audio(&self, chunk: Bytes, _format: &AudioFormat) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let failing = self
            .failing_audio
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::Send("scripted audio failure".to_string()));
        }
        self.calls.lock().push(BridgeCall::Audio(chunk));
        Ok(())
    }

    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), BridgeError> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        self.calls
            .lock()
            .push(BridgeCall::Text(text.to_string(), turn_complete));
        Ok(())
    }

    async fn send_function_result(&self, name: &str, result: Value) -> Result<(), BridgeError> {
        self.calls
            .lock()
            .push(BridgeCall::FunctionResult(name.to_string(), result));
        Ok(())
    }

    async fn receive(&self) -> Result<ResponseStream, BridgeError> {
        let rx = self
            .script_rx
            .lock()
            .take()
            .ok_or(BridgeError::StreamUnavailable)?;
        let calls = self.calls.clone();
        let stream = futures::stream::unfold((rx, calls), |(mut rx, calls)| async move {
            let item = rx.recv().await?;
            calls.lock().push(BridgeCall::Read(response_kind(&item)));
            Some((item, (rx, calls)))
        });
        Ok(stream.boxed())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct RecordingTransport {
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            open: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    /// A transport whose peer already went away.
    pub fn closed() -> Arc<Self> {
        let transport = Self::new();
        transport.open.store(false, Ordering::SeqCst);
        transport
    }

    pub fn messages(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }

    /// The `type` of every message sent so far.
    pub fn types(&self) -> Vec<String> {
        self.messages()
            .iter()
            .map(|message| message["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientTransport for RecordingTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Yields to the runtime until `check` holds, failing the test after a
/// second.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 1s"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
