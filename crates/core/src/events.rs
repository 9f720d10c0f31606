//! Typed publish/subscribe bus for session events.
//!
//! Event kinds form a closed set, and each kind has exactly one payload
//! variant in [`SessionEvent`]. Handlers are invoked sequentially, in
//! registration order, on the publisher's own task. A failing handler is
//! logged and counted but never stops the handlers after it.

use crate::lifecycle::TransportState;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    TransportStateChanged,
    ClientReady,
    AudioInput,
    AudioOutput,
    BotTranscription,
    BotSpeaking,
    FunctionCall,
    Error,
}

impl EventKind {
    /// Wire name used in `rtvi_event` messages.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::TransportStateChanged => "transport-state-changed",
            EventKind::ClientReady => "client-ready",
            EventKind::AudioInput => "audio-input",
            EventKind::AudioOutput => "audio-output",
            EventKind::BotTranscription => "bot-transcription",
            EventKind::BotSpeaking => "bot-speaking",
            EventKind::FunctionCall => "function-call",
            EventKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    TransportStateChanged {
        state: TransportState,
        previous: TransportState,
    },
    ClientReady,
    AudioInput {
        size: usize,
        sample_rate: u32,
    },
    AudioOutput {
        data: Bytes,
        sample_rate: u32,
    },
    BotTranscription {
        text: String,
        is_final: bool,
    },
    BotSpeaking(bool),
    FunctionCall {
        name: String,
        arguments: Value,
        result: Value,
    },
    Error {
        error: String,
        message: String,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::TransportStateChanged { .. } => EventKind::TransportStateChanged,
            SessionEvent::ClientReady => EventKind::ClientReady,
            SessionEvent::AudioInput { .. } => EventKind::AudioInput,
            SessionEvent::AudioOutput { .. } => EventKind::AudioOutput,
            SessionEvent::BotTranscription { .. } => EventKind::BotTranscription,
            SessionEvent::BotSpeaking(_) => EventKind::BotSpeaking,
            SessionEvent::FunctionCall { .. } => EventKind::FunctionCall,
            SessionEvent::Error { .. } => EventKind::Error,
        }
    }
}

/// A published event: the typed payload plus the time it was published.
#[derive(Debug, Clone)]
pub struct Event {
    pub payload: SessionEvent,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(payload: SessionEvent) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self)(event.clone()).await
    }
}

/// Registration is not deduplicated: subscribing the same handler twice
/// delivers every event to it twice.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<HashMap<EventKind, Vec<Arc<dyn EventHandler>>>>,
    handler_errors: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        self.handlers.write().entry(kind).or_default().push(handler);
    }

    /// Delivers `payload` to every handler registered for its kind. Events
    /// published before a handler subscribed are never replayed to it.
    pub async fn publish(&self, payload: SessionEvent) {
        let event = Event::new(payload);
        let kind = event.kind();
        let handlers = match self.handlers.read().get(&kind) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                self.handler_errors.fetch_add(1, Ordering::Relaxed);
                warn!(event = kind.as_str(), error = ?e, "event handler failed");
            }
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Total handler failures since the bus was created.
    pub fn handler_errors(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}
