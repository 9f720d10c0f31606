//! Voice Link API Library Crate
//!
//! Everything the HTTP/WebSocket service needs: configuration, shared state,
//! management handlers, the WebSocket endpoint, audio resampling and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;

#[cfg(test)]
mod test_support;
