use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use agora_core::users::InMemoryUserStore;
use agora_core::{AppState, CoreConfig};

mod cli;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agora=info")),
        )
        .init();

    let args = cli::Args::parse();
    let mut config = config::Config::load(&args.config)?;

    // CLI --bind overrides config file
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }

    let users = Arc::new(InMemoryUserStore::new());
    let state = AppState::new(
        CoreConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            auth_policy: config.auth.policy,
            ring_timeout: Duration::from_secs(config.calls.ring_timeout_secs),
            offline_grace: Duration::from_millis(config.presence.offline_grace_ms),
            call_retention: Duration::from_secs(config.calls.retention_secs),
        },
        users,
    );

    let app = agora_ws::gateway_router().with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind_address).await?;
    tracing::info!(
        bind = %config.server.bind_address,
        policy = ?config.auth.policy,
        "agora gateway listening"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down (ctrl-c)...");
        })
        .await?;

    Ok(())
}
