// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sessiond::clock::SystemClock;
use sessiond::config::Config;
use sessiond::registry::Registry;
use sessiond::transport::build_router;
use sessiond::transport::state::AppState;

/// Initialize tracing from config. Uses `try_init` so it's safe to call
/// more than once (e.g. from tests that also start a server).
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let result = match config.log_format.as_str() {
        "json" => tracing_subscriber::fmt().with_env_filter(filter).json().try_init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

#[tokio::main]
async fn main() {
    let config = Config::parse();

    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }

    init_tracing(&config);

    if let Err(e) = run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let registry = Registry::new(config.sessions_dir.clone(), config.limits.clone(), Arc::new(SystemClock));
    let state = AppState {
        registry,
        config: Arc::new(config),
    };

    let router = build_router(state.clone());
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("sessiond listening on {}", listener.local_addr()?);

    {
        let sd = shutdown.clone();
        tokio::spawn(async move {
            let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
            let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();
            tokio::select! {
                _ = async {
                    if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGTERM"),
                _ = async {
                    if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
                } => info!("received SIGINT"),
            }
            sd.cancel();
        });
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}
