//! Secrets admin surface. Values go in; only metadata ever comes back out.

use axum::extract::{Path, State};
use axum::response::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use ar_domain::session::SecretKind;

use crate::api::{ok, ApiResult};
use crate::state::AppState;

pub async fn list_secrets(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let secrets = state.store.list_secrets()?;
    Ok(ok(secrets))
}

#[derive(Debug, Deserialize)]
pub struct UpsertSecretBody {
    pub id: String,
    pub kind: String,
    pub value: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Create or replace a secret, then refresh the manager's snapshot so the
/// *next* sandbox creation picks it up. Running sandboxes keep the env
/// they were started with.
pub async fn upsert_secret(
    State(state): State<AppState>,
    Json(body): Json<UpsertSecretBody>,
) -> ApiResult<Json<Value>> {
    let kind = SecretKind::parse(&body.kind)?;
    state
        .store
        .upsert_secret(&state.crypto, kind, &body.id, &body.value, body.enabled)?;
    state
        .manager
        .set_secrets(state.store.secrets_as_env(&state.crypto)?);
    tracing::info!(secret_id = %body.id, kind = %kind.as_str(), "secret upserted");
    Ok(ok(json!({ "id": body.id })))
}

pub async fn delete_secret(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_secret(&id)?;
    state
        .manager
        .set_secrets(state.store.secrets_as_env(&state.crypto)?);
    tracing::info!(secret_id = %id, "secret deleted");
    Ok(ok(json!({ "id": id, "deleted": true })))
}
