//! Session CRUD, activation, archive, and journal replay endpoints.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use ar_domain::error::Error;
use ar_domain::session::{Session, SessionMode, SessionStatus};

use crate::api::{ok, ApiResult};
use crate::state::AppState;

fn ws_endpoint(session_id: &str) -> String {
    format!("/ws/sessions/{session_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct CreateSessionBody {
    pub mode: String,
    #[serde(default)]
    pub environment_id: Option<String>,
    #[serde(default)]
    pub repository_url: Option<String>,
    #[serde(default)]
    pub repository_branch: Option<String>,
}

/// Create a session and kick off sandbox provisioning in the background.
/// The response reports `creating`; poll `GET /api/sessions/:id` or attach
/// over WebSocket to observe the transition to `active`.
pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionBody>,
) -> ApiResult<Json<Value>> {
    let mode = SessionMode::parse(&body.mode)?;

    // Code sessions resolve their environment now so a bad reference fails
    // the request instead of the background activation.
    let environment_id = match (&body.environment_id, mode) {
        (Some(id), _) => {
            state.store.get_environment(id)?;
            Some(id.clone())
        }
        (None, SessionMode::Code) => state
            .store
            .get_default_environment()?
            .map(|env| env.id),
        (None, SessionMode::Chat) => None,
    };

    let id = uuid::Uuid::new_v4().to_string();
    let dirs = state.manager.session_dirs(&id)?;
    let now = Utc::now();
    let session = Session {
        id: id.clone(),
        mode,
        status: SessionStatus::Creating,
        repository_url: body.repository_url,
        repository_branch: body.repository_branch,
        workspace_path: Some(dirs.workspace.to_string_lossy().into_owned()),
        last_activity_at: now,
        sandbox_type: None,
        sandbox_id: None,
        data_dir: dirs.root.to_string_lossy().into_owned(),
        environment_id,
        created_at: now,
        updated_at: now,
    };
    state.store.create_session(&session)?;
    tracing::info!(session_id = %id, mode = %mode.as_str(), "session created");

    // Provision without blocking the request; failures land the session in
    // `error`, which activate reports.
    let hub = state.hubs.get_or_create(&id);
    tokio::spawn(async move {
        if let Err(e) = hub.activate().await {
            tracing::error!(session_id = %hub.session_id(), error = %e, "background activation failed");
        }
    });

    Ok(ok(json!({
        "id": id,
        "status": SessionStatus::Creating,
        "wsEndpoint": ws_endpoint(&id),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions, GET /api/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let sessions = state.store.list_sessions()?;
    Ok(ok(sessions))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.store.get_session(&id)?;
    Ok(ok(session))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/:id/activate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn activate_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    // Existence first, so activation of a deleted session is a clean 404.
    state.store.get_session(&id)?;
    let hub = state.hubs.get_or_create(&id);
    let info = hub.activate().await?;
    Ok(ok(json!({
        "sessionId": info.session_id,
        "status": info.status,
        "lastSeq": info.last_seq,
        "sandboxStatus": info.sandbox_status,
        "wsEndpoint": ws_endpoint(&id),
    })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /api/sessions/:id/archive, DELETE /api/sessions/:id
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Soft delete: cancel the hub, close the channel, terminate the sandbox.
/// The row and its journal stay queryable.
pub async fn archive_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.store.update_session_status(&id, SessionStatus::Archived)?;

    if let Some(hub) = state.hubs.get(&id) {
        hub.shutdown().await;
    }
    let env_cfg = session
        .environment_id
        .as_deref()
        .and_then(|eid| state.store.get_environment(eid).ok());
    if let Err(e) = state.manager.terminate_session(&session, env_cfg.as_ref()).await {
        tracing::warn!(session_id = %id, error = %e, "sandbox terminate during archive failed");
    }
    tracing::info!(session_id = %id, "session archived");
    Ok(ok(json!({ "id": id, "status": SessionStatus::Archived })))
}

pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.store.get_session(&id)?;

    if let Some(hub) = state.hubs.remove(&id) {
        hub.shutdown().await;
    }
    let env_cfg = session
        .environment_id
        .as_deref()
        .and_then(|eid| state.store.get_environment(eid).ok());
    if let Err(e) = state.manager.terminate_session(&session, env_cfg.as_ref()).await {
        tracing::warn!(session_id = %id, error = %e, "sandbox terminate during delete failed");
    }
    state.manager.forget_session(&id);
    state.store.delete_session(&id)?;
    tracing::info!(session_id = %id, "session deleted");
    Ok(ok(json!({ "id": id, "deleted": true })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions/:id/events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const DEFAULT_EVENT_LIMIT: usize = 100;
const MAX_EVENT_LIMIT: usize = 1_000;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default, rename = "afterSeq")]
    pub after_seq: i64,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Replay events strictly after `afterSeq`, ascending, at most `limit`.
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Value>> {
    state.store.get_session(&id)?;
    if query.after_seq < 0 {
        return Err(Error::Validation("afterSeq must be >= 0".into()).into());
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .min(MAX_EVENT_LIMIT);

    let (events, last_seq) = state.store.events_after(&id, query.after_seq, limit)?;
    let events: Vec<Value> = events
        .iter()
        .map(|e| ar_protocol::event_frame(&e.payload, e.seq))
        .collect();
    Ok(ok(json!({ "events": events, "lastSeq": last_seq })))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /api/sessions/:id/logs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot of the session's recent sandbox stderr (debug surface).
pub async fn session_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.get_session(&id)?;
    Ok(ok(json!({ "lines": state.manager.logs(&id) })))
}
