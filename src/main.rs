use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::{AppConfig, Command};
use models::sync::{BatchCursor, SyncMode};
use services::{
    batch_engine::spawn_scheduled,
    object_store::ReqwestTransport,
    progress::{RunState, SyncRunner},
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    // --- Logging setup ---
    let default_level = if cfg.enable_debug_logging { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("Starting media-offload with config: {:?}", cfg);

    // --- Ensure uploads directory exists ---
    if !cfg.uploads_dir.exists() {
        fs::create_dir_all(&cfg.uploads_dir)
            .with_context(|| format!("creating {}", cfg.uploads_dir.display()))?;
        tracing::info!("Created uploads directory at {}", cfg.uploads_dir.display());
    }

    let db = db::connect(&cfg.database_url).await?;
    db::run_migrations(&db).await?;

    if let Command::Migrate = command {
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    let transport = Arc::new(ReqwestTransport::new()?);
    let state = AppState::new(&cfg, db, transport);

    match command {
        Command::Serve => serve(cfg, state).await,
        Command::Sync {
            mode,
            batch_size,
            delay_ms,
            regenerate_metadata,
        } => sync(state, mode, batch_size, delay_ms, regenerate_metadata).await,
        Command::TestConnection => {
            state.offloader.test_connection().await?;
            tracing::info!("Connection to the object store succeeded.");
            Ok(())
        }
        Command::Migrate => Ok(()),
    }
}

async fn serve(cfg: AppConfig, state: AppState) -> Result<()> {
    let shutdown = CancellationToken::new();
    let scheduler = cfg
        .auto_sync
        .enabled
        .then(|| spawn_scheduled(state.engine.clone(), cfg.auto_sync.clone(), shutdown.clone()));

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    Ok(())
}

async fn sync(
    state: AppState,
    mode: SyncMode,
    batch_size: i64,
    delay_ms: u64,
    regenerate_metadata: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping after the current batch");
            on_interrupt.cancel();
        }
    });

    let runner = SyncRunner::new(state.engine.clone(), Duration::from_millis(delay_ms), cancel);
    let report = runner
        .run(
            BatchCursor::new(batch_size, mode).with_anchor(chrono::Utc::now().timestamp_millis()),
            regenerate_metadata,
            |progress, result| {
                for outcome in &result.outcomes {
                    tracing::debug!(id = outcome.id, kind = ?outcome.kind, "{}", outcome.message);
                }
                tracing::info!(
                    batch = progress.batches,
                    processed = progress.processed,
                    remaining = result.total_remaining,
                    "{:.1}% synced",
                    progress.percentage()
                );
            },
        )
        .await;

    match report.state {
        RunState::Completed | RunState::Stopped => Ok(()),
        RunState::Errored(reason) => anyhow::bail!("sync stopped: {}", reason),
    }
}
