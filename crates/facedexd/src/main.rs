use anyhow::{Context, Result};
use facedex_core::OnnxEmbedder;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod chat;
mod config;
mod engine;
mod error;
mod routes;
mod store;

use config::{Config, StoreBackend};
use store::{EmbeddingStore, MemoryStore, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facedexd starting");

    let config = Config::load().context("loading configuration")?;
    tracing::info!(
        bind = %config.bind,
        store = ?config.store,
        model_dir = %config.model_dir.display(),
        threshold = config.match_threshold,
        policy = %config.match_policy,
        "configuration loaded"
    );

    // Load models synchronously (fail-fast)
    let embedder = OnnxEmbedder::load(&config.model_dir, config.detection_threshold)
        .with_context(|| format!("loading models from {}", config.model_dir.display()))?;
    let engine = engine::spawn_engine(embedder)?;

    let store: Arc<dyn EmbeddingStore> = match config.store {
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&config.db_path, engine.dimension())
                .await
                .with_context(|| format!("opening {}", config.db_path.display()))?;
            tracing::info!(path = %config.db_path.display(), "sqlite store opened");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            tracing::warn!("using in-memory store; registrations are lost on restart");
            Arc::new(MemoryStore::new(engine.dimension()))
        }
    };
    tracing::info!(identities = store.count().await?, "store ready");

    let state = routes::AppState {
        store,
        engine,
        policy: config.match_policy,
        threshold: config.match_threshold,
    };
    let app = routes::router(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;
    tracing::info!(addr = %config.bind, "facedexd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facedexd shutting down");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
