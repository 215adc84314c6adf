use db::{DBService, MigrationError};
use server::{
    AppState,
    config::{ConfigError, ServerConfig},
    file_logging, routes,
    state::StateError,
};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum FeedbackHubError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Sqlx(#[from] SqlxError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    State(#[from] StateError),
}

#[tokio::main]
async fn main() -> Result<(), FeedbackHubError> {
    // Load .env file if present (for development)
    dotenvy::dotenv().ok();

    // The guard must outlive the server so buffered file logs are flushed
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _file_log_guard = file_logging::init_logging(&log_level);

    let config = ServerConfig::from_env()?;
    let db = DBService::new(&config.database_url).await?;
    let applied = db.run_migrations(&config.migrations_dir).await?;
    if !applied.is_empty() {
        tracing::info!(count = applied.len(), "Applied migrations: {}", applied.join(", "));
    }

    tracing::info!(
        providers = ?config.configured_providers(),
        public_base_url = %config.public_base_url,
        "Integration providers configured"
    );

    let cancel = CancellationToken::new();
    let bind_address = config.bind_address();
    let state = AppState::new(db, config, cancel.clone())?;

    match state.processor.resume_pending().await {
        Ok(0) => {}
        Ok(count) => tracing::info!("Resumed {} pending integration events", count),
        Err(e) => tracing::warn!("Failed to resume pending integration events: {}", e),
    }

    let health_monitor = state.health.clone().spawn(cancel.clone());

    let app = routes::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Server running on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stops the health monitor and drops pending retry timers; unfinished
    // events are picked up by resume_pending on the next start
    cancel.cancel();
    if let Err(e) = health_monitor.await {
        tracing::warn!("Health monitor task ended abnormally: {}", e);
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
            } else {
                tracing::error!("Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
    }

    tracing::info!("Shutdown signal received");
}
