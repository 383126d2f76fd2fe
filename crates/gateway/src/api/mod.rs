pub mod environments;
pub mod secrets;
pub mod sessions;
pub mod ws;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use serde::Serialize;
use serde_json::json;

use ar_domain::error::Error;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        // Health probe (public, plain liveness, no envelope)
        .route("/health", get(health))
        // Sessions
        .route("/api/sessions", post(sessions::create_session))
        .route("/api/sessions", get(sessions::list_sessions))
        .route("/api/sessions/:id", get(sessions::get_session))
        .route("/api/sessions/:id", delete(sessions::delete_session))
        .route("/api/sessions/:id/activate", post(sessions::activate_session))
        .route("/api/sessions/:id/archive", post(sessions::archive_session))
        .route("/api/sessions/:id/events", get(sessions::session_events))
        .route("/api/sessions/:id/logs", get(sessions::session_logs))
        // WebSocket attach
        .route("/ws/sessions/:id", get(ws::session_ws))
        // Secrets admin
        .route("/api/secrets", get(secrets::list_secrets))
        .route("/api/secrets", put(secrets::upsert_secret))
        .route("/api/secrets/:id", delete(secrets::delete_secret))
        // Environments admin
        .route("/api/environments", get(environments::list_environments))
        .route("/api/environments", post(environments::upsert_environment))
        .route("/api/environments/:id", get(environments::get_environment))
        .route("/api/environments/:id", put(environments::upsert_environment_by_id))
        .route("/api/environments/:id", delete(environments::delete_environment))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Success envelope: `{ "data": ..., "error": null }`.
pub fn ok<T: Serialize>(data: T) -> Json<serde_json::Value> {
    Json(json!({ "data": data, "error": null }))
}

/// Error half of the envelope, with the HTTP class per error kind.
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Validation(_) | Error::Json(_) => (StatusCode::BAD_REQUEST, "validation"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            Error::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            Error::Provisioning(_) => (StatusCode::BAD_GATEWAY, "sandbox_provisioning"),
            Error::Channel(_) | Error::ChannelClosed => {
                (StatusCode::BAD_GATEWAY, "sandbox_channel")
            }
            Error::KeyUnavailable(_) | Error::AuthFailure => {
                (StatusCode::INTERNAL_SERVER_ERROR, "crypto")
            }
            Error::Journal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "journal"),
            Error::Store(_) | Error::Config(_) | Error::Io(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        let body = Json(json!({
            "data": null,
            "error": { "kind": kind, "message": self.0.to_string() },
        }));
        (status, body).into_response()
    }
}
