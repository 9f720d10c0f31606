//! Request and response bodies of the management API, documented with `utoipa`.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use voicelink_core::registry::{BroadcastReport, ConnectionInfo};
use voicelink_core::session::SessionStatus;

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct HealthResponse {
    #[schema(example = "healthy")]
    pub status: String,
}

/// One live client connection.
#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ConnectionDetail {
    #[schema(example = "client_4f1c2a9e8b7d4c3fa1e2d3c4b5a69788")]
    pub client_id: String,
    pub transport_open: bool,
    /// Session snapshot; absent while the session is still being created.
    #[schema(value_type = Option<Object>)]
    pub status: Option<SessionStatus>,
}

impl From<ConnectionInfo> for ConnectionDetail {
    fn from(info: ConnectionInfo) -> Self {
        Self {
            client_id: info.client_id.to_string(),
            transport_open: info.transport_open,
            status: info.status,
        }
    }
}

#[derive(Serialize, ToSchema, Debug, Clone)]
pub struct ConnectionsResponse {
    pub active_connections: usize,
    pub connections: Vec<ConnectionDetail>,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct BroadcastResponse {
    pub message: String,
    /// Clients a delivery was attempted to.
    pub recipients: usize,
    pub delivered: usize,
    /// Clients that could not be reached and were disconnected.
    pub torn_down: Vec<String>,
}

impl From<BroadcastReport> for BroadcastResponse {
    fn from(report: BroadcastReport) -> Self {
        Self {
            message: format!("Message broadcast to {} connections", report.attempted),
            recipients: report.attempted,
            delivered: report.delivered,
            torn_down: report.torn_down.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub message: String,
}
