use anyhow::{Context, Result};
use axum::Router;
use services::{
    blob_store::FsBlobStore,
    instrumentation::TracingInstrumentation,
    metadata_cache::{InMemoryMetadataCache, MetadataCache, RedisMetadataCache},
    metadata_store::SqliteMetadataStore,
    storage_service::StorageService,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;
    let pipeline = cfg.pipeline()?;

    tracing::info!("Starting segment-store with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing database url `{}`", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    let metadata = SqliteMetadataStore::new(db);

    // --- Handle migration mode ---
    if migrate {
        let applied = metadata.migrate().await?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(());
    }

    // --- Metadata cache ---
    let cache: Arc<dyn MetadataCache> = match &cfg.redis_url {
        Some(url) => {
            tracing::info!("Using Redis metadata cache");
            Arc::new(
                RedisMetadataCache::connect(url)
                    .await
                    .context("connecting to redis")?,
            )
        }
        None => {
            tracing::info!(
                "Using in-process metadata cache ({} entries)",
                cfg.cache_capacity
            );
            Arc::new(InMemoryMetadataCache::new(cfg.cache_capacity()?))
        }
    };

    // --- Initialize core service ---
    let blobs = FsBlobStore::new(&cfg.storage_dir);
    tracing::info!("Blob store rooted at {}", blobs.base_path().display());
    let storage = StorageService::new(
        Arc::new(blobs),
        Arc::new(metadata),
        cache,
        Arc::new(TracingInstrumentation),
        pipeline,
    );

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(storage);

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {}", e);
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
    tracing::info!("Shutdown signal received");
}
