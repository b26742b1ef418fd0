use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;
use sqlx::PgPool;
use tracing::{debug, error};
use uuid::Uuid;

use super::{EvaluateRequest, FlagsQuery, DEFAULT_ENVIRONMENT};
use crate::evaluation::{evaluate_with_default, EvaluationResult};
use crate::routes::sdk_auth::SdkProject;
use crate::sdk::EvaluationEvent;
use crate::state::AppState;

/// Evaluate a single flag for a user.
///
/// The flag comes through the cache-aside store; a missing flag is a
/// normal outcome (`FLAG_NOT_FOUND` with HTTP 200), never a bare 404.
pub async fn evaluate(
    State(state): State<AppState>,
    SdkProject(project_id): SdkProject,
    Json(request): Json<EvaluateRequest>,
) -> Result<impl IntoResponse, (StatusCode, Json<serde_json::Value>)> {
    let flag_key = match request.flag_key.as_deref() {
        Some(key) if !key.is_empty() => key,
        _ => return Err(bad_request("flag_key is required")),
    };
    let user_id = match request.user_id.as_deref() {
        Some(id) if !id.is_empty() => id,
        _ => return Err(bad_request("user_id is required")),
    };
    let environment = request
        .environment
        .as_deref()
        .unwrap_or(DEFAULT_ENVIRONMENT);

    let flag = state
        .flags
        .get_flag(project_id, environment, flag_key)
        .await
        .map_err(|e| {
            error!(error = %e, flag = flag_key, "failed to load flag");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "enabled": false, "error": "failed to load flag" })),
            )
        })?;

    let result = match &flag {
        Some(flag) => evaluate_with_default(flag, user_id, request.default.as_ref()),
        None => EvaluationResult::not_found(request.default.as_ref()),
    };

    record_event(
        state.db.clone(),
        project_id,
        EvaluationEvent {
            flag_key: flag_key.to_string(),
            result: result.enabled,
            user_id: user_id.to_string(),
            environment: environment.to_string(),
            latency_ms: None,
        },
        Some(result.reason.code()),
    );

    Ok(Json(result))
}

/// Full flag set for a project/environment, consumed by sync clients.
pub async fn list_flags(
    State(state): State<AppState>,
    SdkProject(project_id): SdkProject,
    Query(query): Query<FlagsQuery>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let environment = query.environment.as_deref().unwrap_or(DEFAULT_ENVIRONMENT);

    let flags = state
        .flags
        .list_flags(project_id, environment)
        .await
        .map_err(|e| {
            error!(error = %e, "failed to list flags");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to fetch flags".to_string(),
            )
        })?;

    Ok(Json(flags))
}

/// Accepts an analytics event from a sync client. Callers fire and forget,
/// so the response carries no body worth inspecting.
pub async fn ingest_event(
    State(state): State<AppState>,
    SdkProject(project_id): SdkProject,
    Json(event): Json<EvaluationEvent>,
) -> impl IntoResponse {
    record_event(state.db.clone(), project_id, event, None);
    StatusCode::ACCEPTED
}

/// Detached analytics insert. Failures are logged and dropped; recording
/// must never add latency or a failure mode to the evaluation path.
fn record_event(pool: PgPool, project_id: Uuid, event: EvaluationEvent, reason: Option<&str>) {
    let reason = reason.map(str::to_string);
    tokio::spawn(async move {
        let outcome = sqlx::query(
            r#"
            INSERT INTO flag_events (project_id, flag_key, user_id, environment, result, reason, latency_ms)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(project_id)
        .bind(&event.flag_key)
        .bind(&event.user_id)
        .bind(&event.environment)
        .bind(event.result)
        .bind(reason)
        .bind(event.latency_ms.map(|ms| ms as i64))
        .execute(&pool)
        .await;

        if let Err(e) = outcome {
            debug!(error = %e, flag = %event.flag_key, "dropped analytics event");
        }
    });
}

fn bad_request(message: &str) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "enabled": false, "error": message })),
    )
}
