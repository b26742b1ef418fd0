use sqlx::PgPool;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use flagpole::config::Config;
use flagpole::routes;
use flagpole::state::AppState;
use flagpole::store::{FlagStore, PgFlagRepository};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();

    let db = PgPool::connect(&config.database_url)
        .await
        .expect("Error connecting DB");

    sqlx::migrate!()
        .run(&db)
        .await
        .expect("Error running migrations");

    let flags = FlagStore::new(Arc::new(PgFlagRepository::new(db.clone())), config.cache_ttl);
    let state = AppState { db, flags };

    let app = routes::routes(&state)
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.addr()).await.unwrap();

    tracing::info!(addr = %config.addr(), "server listening");

    axum::serve(listener, app).await.unwrap();
}
