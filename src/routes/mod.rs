use axum::{
    middleware,
    routing::{get, post, put},
    Extension, Router,
};

mod flags;
mod health;
mod sdk;
pub mod sdk_auth;

pub use health::health;

use crate::state::AppState;

pub fn routes(state: &AppState) -> Router<AppState> {
    let sdk_router = Router::new()
        .route("/evaluate", post(sdk::routes::evaluate))
        .route("/flags", get(sdk::routes::list_flags))
        .route("/events", post(sdk::routes::ingest_event))
        .layer(middleware::from_fn(sdk_auth::require_sdk_key))
        .layer(Extension(state.db.clone()));

    let flag_router = Router::new().route(
        "/{key}",
        put(flags::routes::update).delete(flags::routes::delete),
    )
    .route("/{key}/toggle", post(flags::routes::toggle));

    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .nest("/sdk", sdk_router)
        .nest(
            "/api/projects/{project_id}/environments/{environment}/flags",
            flag_router,
        )
        .route(
            "/api/projects/{project_id}/environments/{environment}/cache/warm",
            post(flags::routes::warm),
        )
}

async fn root() -> &'static str {
    "flagpole is running"
}
