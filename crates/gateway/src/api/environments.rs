//! Environment config admin surface.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{json, Value};

use ar_domain::error::Error;
use ar_domain::session::EnvironmentConfig;

use crate::api::{ok, ApiResult};
use crate::state::AppState;

pub async fn list_environments(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let environments = state.store.list_environments()?;
    Ok(ok(environments))
}

pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let environment = state.store.get_environment(&id)?;
    Ok(ok(environment))
}

pub async fn upsert_environment(
    State(state): State<AppState>,
    Json(env): Json<EnvironmentConfig>,
) -> ApiResult<Json<Value>> {
    validate(&state, &env)?;
    state.store.upsert_environment(&env)?;
    tracing::info!(environment_id = %env.id, sandbox_type = %env.sandbox_type.as_str(), "environment upserted");
    Ok(ok(json!({ "id": env.id })))
}

pub async fn upsert_environment_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut env): Json<EnvironmentConfig>,
) -> ApiResult<Json<Value>> {
    env.id = id;
    validate(&state, &env)?;
    state.store.upsert_environment(&env)?;
    Ok(ok(json!({ "id": env.id })))
}

pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.store.delete_environment(&id)?;
    Ok(ok(json!({ "id": id, "deleted": true })))
}

fn validate(state: &AppState, env: &EnvironmentConfig) -> ApiResult<()> {
    if env.id.trim().is_empty() {
        return Err(Error::Validation("environment id must not be empty".into()).into());
    }
    if let Some(secret_id) = &env.secret_id {
        if !state.store.secret_exists(secret_id)? {
            return Err(Error::Validation(format!(
                "environment references unknown secret {secret_id}"
            ))
            .into());
        }
    }
    Ok(())
}
