//! Contract for the hosted streaming conversational service.
//!
//! The session only ever sees this trait; the concrete upstream (Gemini Live,
//! a test double) lives elsewhere.

use crate::error::BridgeError;
use crate::functions::FunctionDeclaration;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::sync::Arc;

#[cfg(test)]
use mockall::automock;

/// Describes raw audio handed to the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Mono 16-bit little-endian PCM at `sample_rate`.
    pub fn pcm16(sample_rate: u32) -> Self {
        Self {
            encoding: "pcm".to_string(),
            sample_rate,
            channels: 1,
        }
    }

    pub fn mime_type(&self) -> String {
        format!("audio/{};rate={}", self.encoding, self.sample_rate)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16(16_000)
    }
}

/// One item from the upstream reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeResponse {
    Audio { data: Bytes, mime_type: String },
    Text(String),
    /// The upstream wants a function executed. Its result must be sent back
    /// with [`ServiceBridge::send_function_result`] before the next item is
    /// read.
    FunctionCall { name: String, arguments: Value },
    TurnComplete,
}

/// Upstream replies. The stream ending, or yielding a non-transient error,
/// means the connection is lost.
pub type ResponseStream = BoxStream<'static, Result<BridgeResponse, BridgeError>>;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceBridge: Send + Sync {
    /// Opens the upstream session. Authentication and network failures are
    /// reported as `false`, never as a panic or error.
    async fn connect(&self) -> bool;

    /// Idempotent; safe on a bridge that is closed or was never opened.
    async fn disconnect(&self);

    /// Fire-and-forget. Fails only when the bridge is not connected or the
    /// write itself fails.
    async fn send_audio(&self, chunk: Bytes, format: &AudioFormat) -> Result<(), BridgeError>;

    /// Submits a user text turn. `turn_complete` asks the upstream to reply.
    async fn send_text(&self, text: &str, turn_complete: bool) -> Result<(), BridgeError>;

    /// Returns the result of a function call into the same turn.
    async fn send_function_result(&self, name: &str, result: Value) -> Result<(), BridgeError>;

    /// Hands out the reply stream. Available once per connection; it can
    /// only be restarted by reconnecting.
    async fn receive(&self) -> Result<ResponseStream, BridgeError>;

    fn is_connected(&self) -> bool;
}

/// Builds one bridge per session, advertising the functions that session
/// can execute.
pub trait BridgeFactory: Send + Sync {
    fn create(&self, functions: Vec<FunctionDeclaration>) -> Arc<dyn ServiceBridge>;
}
