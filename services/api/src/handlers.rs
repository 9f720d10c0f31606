//! Axum handlers for the management API.
//!
//! Every handler is documented with `utoipa` so the OpenAPI document stays
//! in step with the routes.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::Value;
use std::sync::Arc;
use tracing::error;
use voicelink_core::transport::ClientId;

use crate::{
    models::{
        BroadcastResponse, ConnectionDetail, ConnectionsResponse, ErrorResponse, HealthResponse,
    },
    state::AppState,
};

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Process liveness. Says nothing about individual sessions.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is running", body = HealthResponse)
    )
)]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
    })
}

/// List every live connection with its session snapshot.
#[utoipa::path(
    get,
    path = "/ws/connections",
    responses(
        (status = 200, description = "Active connections", body = ConnectionsResponse)
    )
)]
pub async fn list_connections(State(state): State<Arc<AppState>>) -> Json<ConnectionsResponse> {
    let connections: Vec<ConnectionDetail> = state
        .registry
        .connections()
        .await
        .into_iter()
        .map(ConnectionDetail::from)
        .collect();
    Json(ConnectionsResponse {
        active_connections: connections.len(),
        connections,
    })
}

/// Get one connection by client id.
#[utoipa::path(
    get,
    path = "/ws/connections/{client_id}",
    responses(
        (status = 200, description = "Connection details", body = ConnectionDetail),
        (status = 404, description = "Connection not found", body = ErrorResponse)
    ),
    params(
        ("client_id" = String, Path, description = "Client ID")
    )
)]
pub async fn get_connection(
    State(state): State<Arc<AppState>>,
    Path(client_id): Path<String>,
) -> Result<Json<ConnectionDetail>, ApiError> {
    let id = ClientId::from(client_id);
    state
        .registry
        .connections()
        .await
        .into_iter()
        .find(|info| info.client_id == id)
        .map(|info| Json(ConnectionDetail::from(info)))
        .ok_or_else(|| ApiError::NotFound(format!("Connection {id} not found")))
}

/// Send an arbitrary JSON message to every connected client.
#[utoipa::path(
    post,
    path = "/ws/broadcast",
    request_body(content = serde_json::Value, description = "Message forwarded verbatim to every client"),
    responses(
        (status = 200, description = "Broadcast attempted", body = BroadcastResponse),
        (status = 400, description = "Empty message", body = ErrorResponse)
    )
)]
pub async fn broadcast_message(
    State(state): State<Arc<AppState>>,
    Json(message): Json<Value>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    if message.is_null() {
        return Err(ApiError::BadRequest(
            "Broadcast message must not be null".to_string(),
        ));
    }
    let report = state.registry.broadcast(&message).await;
    Ok(Json(BroadcastResponse::from(report)))
}
