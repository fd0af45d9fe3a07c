use std::sync::Arc;

use axum::{Json, Router, routing::get};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use abilityflow::AppCore;
use abilityflow::external::InMemoryObjectStore;

const DEFAULT_DB_PATH: &str = "abilityflow.redb";
const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Serialize)]
struct Health {
    status: String,
}

async fn health() -> Json<Health> {
    Json(Health {
        status: "abilityflow is working!".to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let db_path = std::env::var("ABILITYFLOW_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
    let core = Arc::new(AppCore::new(&db_path, Arc::new(InMemoryObjectStore::new())).await?);

    let app = Router::new().route("/health", get(health)).with_state(core);

    let bind = std::env::var("ABILITYFLOW_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("abilityflow running on http://{bind}");

    axum::serve(listener, app).await?;
    Ok(())
}
