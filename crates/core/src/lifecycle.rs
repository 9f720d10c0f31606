//! Session lifecycle states and the transitions allowed between them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a session, as reported to the client in
/// `transport-state-changed` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Error,
}

impl TransportState {
    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// `disconnected -> connecting -> connected -> ready`, any state may fail
    /// into `error`, and `error` only leads to `disconnected`. Teardown may
    /// move any live state to `disconnected`.
    pub fn can_transition_to(self, next: TransportState) -> bool {
        use TransportState::*;
        match (self, next) {
            (current, target) if current == target => false,
            (Error, Disconnected) => true,
            (Error, _) => false,
            (_, Error) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Ready) => true,
            (Connecting | Connected | Ready, Disconnected) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportState::Disconnected => "disconnected",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Ready => "ready",
            TransportState::Error => "error",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
