//! Gemini Live implementation of the voice link's service bridge.

pub mod client;
pub mod config;
pub mod types;

pub use client::{GeminiBridgeFactory, GeminiLiveBridge};
pub use config::GeminiConfig;
