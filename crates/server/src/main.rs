use anyhow::Context;
use db::DBService;
use server::{AppState, config::BrokerConfig, file_logging};
use services::services::session_sweeper::spawn_session_sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (for development)
    dotenvy::dotenv().ok();

    // The guard must live until exit so buffered file logs are flushed
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let _file_log_guard = file_logging::init_logging(&log_level);

    let config = BrokerConfig::from_env()
        .inspect_err(|e| tracing::error!("Invalid configuration: {}", e))
        .context("loading configuration")?;
    config.log_summary();

    // Blocks startup until the chosen engine is connected and migrated
    let db = DBService::select_and_activate(&config.database)
        .await
        .inspect_err(|e| tracing::error!("Failed to activate identity store: {}", e))
        .context("activating identity store")?;

    let host = config.host.clone();
    let port = config.port;
    let state = AppState::new(config, db).context("wiring services")?;

    let sweeper = spawn_session_sweeper(state.sessions().clone(), Some(state.oauth()), None);

    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding {host}:{port}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        engine = %state.db.engine(),
        "Server running on http://{}",
        local_addr
    );

    axum::serve(listener, server::app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    perform_cleanup_actions(&state).await;

    Ok(())
}

pub async fn shutdown_signal() {
    // Always wait for Ctrl+C
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
}

pub async fn perform_cleanup_actions(state: &AppState) {
    tracing::info!(
        live_sessions = state.sessions().len(),
        "Shutting down, closing identity store"
    );
    state.store().close().await;
}
