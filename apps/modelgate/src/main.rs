use std::path::PathBuf;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use modelgate_common::ProxyConfig;
use modelgate_core::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = PathBuf::from(
        std::env::var("MODELGATE_CONFIG").unwrap_or_else(|_| "modelgate.yaml".to_string()),
    );
    let config = match ProxyConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            warn!(
                path = %config_path.display(),
                error = %err,
                "proxy configuration unavailable, serving with no providers"
            );
            ProxyConfig::default()
        }
    };
    for provider in &config.providers {
        info!(
            provider = %provider.name,
            mappings = provider.model_mappings.len(),
            "provider configured"
        );
    }

    let state = AppState::new(&config, config_path)?;
    let app = axum::Router::new()
        .merge(modelgate_router::proxy_router(state.clone()))
        .nest("/api/admin", modelgate_router::admin_router(state.clone()));

    let port = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000);
    let bind = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        %bind,
        providers = config.providers.len(),
        max_retries = state.runtime().max_retries,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    state.manager().stop();
    info!("manager stopped, exiting");
    Ok(())
}
