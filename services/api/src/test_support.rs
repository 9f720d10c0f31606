//! In-process doubles for exercising the server without the real upstream.

use crate::{config::Config, state::AppState};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::Level;
use voicelink_core::bridge::{AudioFormat, BridgeFactory, BridgeResponse, ResponseStream, ServiceBridge};
use voicelink_core::error::BridgeError;
use voicelink_core::functions::FunctionDeclaration;
use voicelink_core::registry::ConnectionRegistry;

/// Replies to every text turn with `echo: <text>` followed by a turn marker.
pub struct EchoBridge {
    accept: bool,
    connected: AtomicBool,
    tx: mpsc::UnboundedSender<Result<BridgeResponse, BridgeError>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Result<BridgeResponse, BridgeError>>>>,
}

impl EchoBridge {
    pub fn new(accept: bool) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            accept,
            connected: AtomicBool::new(false),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl ServiceBridge for EchoBridge {
    async fn connect(&self) -> bool {
        self.connected.store(self.accept, Ordering::SeqCst);
        self.accept
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_audio(&self, _chunk: Bytes, _format: &AudioFormat) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn send_text(&self, text: &str, _turn_complete: bool) -> Result<(), BridgeError> {
        let _ = self.tx.send(Ok(BridgeResponse::Text(format!("echo: {text}"))));
        let _ = self.tx.send(Ok(BridgeResponse::TurnComplete));
        Ok(())
    }

    async fn send_function_result(&self, _name: &str, _result: Value) -> Result<(), BridgeError> {
        Ok(())
    }

    async fn receive(&self) -> Result<ResponseStream, BridgeError> {
        let rx = self.rx.lock().take().ok_or(BridgeError::StreamUnavailable)?;
        Ok(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub struct EchoFactory {
    pub accept: bool,
}

impl BridgeFactory for EchoFactory {
    fn create(&self, _functions: Vec<FunctionDeclaration>) -> Arc<dyn ServiceBridge> {
        Arc::new(EchoBridge::new(self.accept))
    }
}

pub fn test_config(max_connections: usize) -> Config {
    Config {
        bind_address: "127.0.0.1:0".parse().expect("valid address"),
        gemini_api_key: "test-key".to_string(),
        gemini_model: "models/test".to_string(),
        gemini_voice: "Aoede".to_string(),
        gemini_endpoint: "ws://127.0.0.1:1".to_string(),
        system_prompt_path: None,
        input_sample_rate: 16_000,
        output_sample_rate: 24_000,
        max_connections,
        log_level: Level::INFO,
    }
}

pub fn test_state(max_connections: usize, accept: bool) -> Arc<AppState> {
    Arc::new(AppState {
        registry: Arc::new(ConnectionRegistry::with_limit(max_connections)),
        bridge_factory: Arc::new(EchoFactory { accept }),
        config: Arc::new(test_config(max_connections)),
    })
}
