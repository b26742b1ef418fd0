use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use super::{validate_rollout_percentage, UpdateFlagRequest};
use crate::state::AppState;
use crate::store::{FlagUpdate, StoreError};

/// Update a feature flag. The store invalidates the cached record before
/// the response is sent, so the next read observes the new state.
pub async fn update(
    State(state): State<AppState>,
    Path((project_id, environment, key)): Path<(Uuid, String, String)>,
    Json(payload): Json<UpdateFlagRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    if let Some(percentage) = payload.rollout_percentage {
        validate_rollout_percentage(percentage).map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    }

    let update = FlagUpdate {
        enabled: payload.enabled,
        rollout_percentage: payload.rollout_percentage,
        targeting: payload.targeting,
        variants: payload.variants,
        default_variant_id: payload.default_variant_id,
        off_variant_id: payload.off_variant_id,
    };

    let flag = state
        .flags
        .update_flag(project_id, &environment, &key, update)
        .await
        .map_err(internal_error)?;

    match flag {
        Some(flag) => Ok(Json(flag)),
        None => Err((StatusCode::NOT_FOUND, "Flag not found".to_string())),
    }
}

/// Toggle a flag's enabled state
pub async fn toggle(
    State(state): State<AppState>,
    Path((project_id, environment, key)): Path<(Uuid, String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let flag = state
        .flags
        .toggle_flag(project_id, &environment, &key)
        .await
        .map_err(internal_error)?;

    match flag {
        Some(flag) => Ok(Json(flag)),
        None => Err((StatusCode::NOT_FOUND, "Flag not found".to_string())),
    }
}

/// Delete a feature flag
pub async fn delete(
    State(state): State<AppState>,
    Path((project_id, environment, key)): Path<(Uuid, String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let deleted = state
        .flags
        .delete_flag(project_id, &environment, &key)
        .await
        .map_err(internal_error)?;

    if !deleted {
        return Err((StatusCode::NOT_FOUND, "Flag not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

/// Bulk-populate the cache for a project/environment. Optional
/// optimization; lookups are correct without it.
pub async fn warm(
    State(state): State<AppState>,
    Path((project_id, environment)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let warmed = state
        .flags
        .warm_cache(project_id, &environment)
        .await
        .map_err(internal_error)?;

    Ok(Json(json!({ "warmed": warmed })))
}

fn internal_error(e: StoreError) -> (StatusCode, String) {
    error!(error = %e, "flag store operation failed");
    (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string())
}
