use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use turbo_cache_gateway::{
    api,
    config::{Config, StorageBackend},
    object_store as obj, AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    match log_format.to_lowercase().as_str() {
        "gcp" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_stackdriver::layer())
                .init();
        }
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_span_list(false),
                )
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
        }
    }

    info!(version = env!("CARGO_PKG_VERSION"), "turbo-cache-gateway starting");
    api::capture_panic_backtraces();

    // Load configuration
    let config = Config::load()?;
    info!(tokens = config.turbo_tokens.len(), "Loaded configuration");

    // Initialize object store backend
    let object_store: Arc<dyn obj::ObjectStore> = match config.storage.backend {
        StorageBackend::Local => {
            let store = obj::LocalStore::new(&config.storage.local_storage_path)?;
            info!(
                "Using local storage backend at: {}",
                store.base_path().display()
            );
            Arc::new(store)
        }
        StorageBackend::Gcs => {
            let store = obj::GcsStore::new(&config.storage.gcs).await?;
            info!(
                "Using GCS storage backend at: {}",
                config.storage.gcs.endpoint
            );
            Arc::new(store)
        }
        StorageBackend::S3 => {
            let store = obj::S3Store::new(&config.storage).await?;
            info!(
                region = %config.storage.s3.region,
                endpoint = ?config.storage.s3.endpoint,
                "Using S3 storage backend"
            );
            Arc::new(store)
        }
    };

    // Create shared state
    let state = Arc::new(AppState::new(config.clone(), object_store));

    // Build and start the HTTP server
    let app = api::create_router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&config.listen_address).await?;
    info!("Listening on: {}", config.listen_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
