mod config;
mod db;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use services::session::PgIdentityLookup;
use services::snapshot::PgSnapshotStore;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = config::RelayConfig::from_env();
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");

    let pool = db::init_pool(&database_url)
        .await
        .expect("database init failed");

    let identities = Arc::new(PgIdentityLookup::new(pool.clone()));
    let snapshots = Arc::new(PgSnapshotStore::new(pool));
    let state = state::AppState::new(config, identities, snapshots);

    // Spawn background presence sweeper.
    let _sweeper = services::relay::spawn_presence_sweeper(
        state.relay.clone(),
        config.heartbeat_interval,
        config.presence_stale_after(),
    );

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .expect("failed to bind");

    tracing::info!(port = config.port, "relay listening");
    axum::serve(listener, app).await.expect("server failed");
}
