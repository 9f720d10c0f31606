//! Axum router: management API, WebSocket endpoint and OpenAPI docs.

use crate::{
    handlers,
    models::{
        BroadcastResponse, ConnectionDetail, ConnectionsResponse, ErrorResponse, HealthResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_connections,
        handlers::get_connection,
        handlers::broadcast_message,
    ),
    components(
        schemas(HealthResponse, ConnectionDetail, ConnectionsResponse, BroadcastResponse, ErrorResponse)
    ),
    tags(
        (name = "Voice Link API", description = "Connection management for the real-time voice bridge")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/ws/connections", get(handlers::list_connections))
        .route(
            "/ws/connections/{client_id}",
            get(handlers::get_connection),
        )
        .route("/ws/broadcast", post(handlers::broadcast_message))
        .route("/ws", get(ws_handler))
        .with_state(app_state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_lists_management_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        for expected in [
            "/health",
            "/ws/connections",
            "/ws/connections/{client_id}",
            "/ws/broadcast",
        ] {
            assert!(
                paths.iter().any(|p| p.as_str() == expected),
                "missing {expected} in {paths:?}"
            );
        }
    }
}
