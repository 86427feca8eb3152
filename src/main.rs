//! Gateway process entry point: loads the routing configuration document,
//! wires up the dispatch engine, and serves the HTTP front door.

use std::sync::Arc;

use llm_gateway_core::api::{self, AppState};
use llm_gateway_core::{Gateway, GatewayConfigDocument};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_gateway_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = std::env::var("GATEWAY_CONFIG_PATH").unwrap_or_else(|_| "gateway.yaml".to_string());
    info!(path = %config_path, "loading gateway configuration");
    let doc = GatewayConfigDocument::from_file(&config_path)?;

    let gateway = Gateway::from_config(&doc).await?;
    let state = Arc::new(AppState { router: gateway.router, events: gateway.events, contexts: gateway.contexts });

    let addr = std::env::var("GATEWAY_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "gateway listening");

    axum::serve(listener, api::serve(state)).await?;

    Ok(())
}
