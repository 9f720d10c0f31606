//! Write half of an axum WebSocket, exposed to the core as a client transport.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, stream::SplitSink};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;
use voicelink_core::error::TransportError;
use voicelink_core::transport::ClientTransport;

pub struct WsTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    open: AtomicBool,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
            open: AtomicBool::new(true),
        }
    }

    /// Marks the socket closed without writing a close frame, for when the
    /// client has already gone away.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(Message::Text(text.to_owned().into())).await {
            self.mark_closed();
            return Err(TransportError::Send(e.to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(error = %e, "Socket was already closed");
        }
    }
}
