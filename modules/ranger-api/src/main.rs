mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ranger_common::Config;
use ranger_store::{IncidentStore, PgStore};
use routes::{build_router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ranger=info".parse()?))
        .init();

    let config = Config::api_from_env();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    let pg = PgStore::new(pool);
    pg.migrate().await?;
    let store: Arc<dyn IncidentStore> = Arc::new(pg);

    let state = AppState {
        store,
        region: config.region.clone(),
    };

    let addr = format!("{}:{}", config.api_host, config.api_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = addr.as_str(), "Read API listening");

    axum::serve(listener, build_router(state)).await?;
    Ok(())
}
