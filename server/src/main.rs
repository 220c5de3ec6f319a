mod config;
mod db;
mod error;
mod routes;
mod services;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = config::RelayConfig::from_env()?;
    let port = config.port;

    let pool = db::init_pool(&config).await?;
    let store = Arc::new(services::message::PgMessageStore::new(pool.clone()));
    let state = state::AppState::new(store, config);

    let _sweeper = services::typing::spawn_typing_sweeper(state.clone());
    let _feed = services::changefeed::spawn_listener(state.clone(), &pool).await?;

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;

    tracing::info!(%port, "chat relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
