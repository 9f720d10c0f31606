use crate::config::Config;
use std::sync::Arc;
use voicelink_core::bridge::BridgeFactory;
use voicelink_core::registry::ConnectionRegistry;

/// Shared state handed to every handler and WebSocket connection.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub bridge_factory: Arc<dyn BridgeFactory>,
    pub config: Arc<Config>,
}
