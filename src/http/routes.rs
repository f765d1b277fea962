//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::info;

use crate::app::AppState;
use crate::http::middleware::ws_auth;
use crate::rooms::RoomError;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;
use crate::ws::protocol::RoomSummary;

/// Upper bound for a REST request
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let rest_routes = Router::new()
        .route("/health", get(health_handler))
        .route("/rooms", get(list_rooms_handler).post(create_room_handler))
        .route(
            "/rooms/:name",
            get(get_room_handler).delete(delete_room_handler),
        )
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT));

    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), ws_auth));

    Router::new()
        .merge(rest_routes)
        .merge(ws_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(cors),
        )
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_rooms: usize,
    seated_players: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_rooms: state.registry.active_rooms(),
        seated_players: state.registry.seated_players(),
    })
}

// ============================================================================
// Room endpoints
// ============================================================================

#[derive(Serialize)]
struct RoomListResponse {
    rooms: Vec<RoomSummary>,
}

async fn list_rooms_handler(State(state): State<AppState>) -> Json<RoomListResponse> {
    Json(RoomListResponse {
        rooms: state.registry.list_rooms(),
    })
}

#[derive(Deserialize)]
struct CreateRoomRequest {
    room_name: String,
    #[serde(default)]
    username: Option<String>,
}

async fn create_room_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomSummary>), AppError> {
    let handle = state.registry.create_room(&req.room_name, req.username)?;
    info!(room = %handle.name, "Room created over HTTP");
    Ok((StatusCode::CREATED, Json(handle.summary())))
}

async fn get_room_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<RoomSummary>, AppError> {
    Ok(Json(state.registry.get_room(&name)?.summary()))
}

async fn delete_room_handler(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry.close_room(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<RoomError> for AppError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::DuplicateName(_) => AppError::Conflict(err.to_string()),
            RoomError::NotFound(_) => AppError::NotFound(err.to_string()),
            RoomError::InvalidName => AppError::BadRequest(err.to_string()),
            RoomError::Closed(_) => AppError::Internal(err.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
