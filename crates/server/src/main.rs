use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use panel_api::PanelContext;
use reconciler::StateReconciler;
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use transport::TransportMode;

mod api;
mod app_state;
mod config;

use api::build_router;
use app_state::AppState;
use config::{load_settings, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings().context("failed to load panel settings")?;
    settings.validate()?;

    let state = build_state(&settings).await?;
    let app = build_router(Arc::new(state.clone()), settings.max_body_bytes);

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind_addr '{}'", settings.bind_addr))?;
    info!(%addr, mode = ?settings.transport.mode, "lamp panel listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.api.reconciler.shutdown();
    state.api.reconciler.transport().close().await;
    info!("lamp panel stopped");
    Ok(())
}

/// Opens the database, connects the configured transport and starts
/// reconciling its observations.
async fn build_state(settings: &Settings) -> anyhow::Result<AppState> {
    let storage = Storage::new(&settings.database_url)
        .await
        .map_err(|error| {
            error!(
                database_url = %settings.database_url,
                error = %format!("{error:#}"),
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;

    let transport =
        transport::connect(&settings.transport).context("failed to start lamp transport")?;
    let reconciler = StateReconciler::new(
        transport,
        &settings.transport.registry(),
        settings.reconciler(),
    );
    reconciler.start();

    // Direct mode only learns state by asking; probe once so lamps do not
    // start out unknown.
    if settings.transport.mode == TransportMode::Direct {
        match reconciler.refresh().await {
            Ok(applied) => info!(applied, "read initial lamp states"),
            Err(err) => warn!(%err, "initial lamp probe failed; states stay unknown"),
        }
    }

    Ok(AppState {
        api: PanelContext::new(storage, reconciler, settings.access()),
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
