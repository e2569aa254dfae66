use anyhow::Context;
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

use crate::config::ServerConfig;
use crate::handlers;
use crate::middleware::{signature, timing};
use crate::service::MetricService;
use crate::storage::{self, backup, Backup, PersistenceMode};

/// Shared application state available to every handler via `State<Arc<AppState>>`.
pub struct AppState {
    /// Merge/query facade over the configured backend.
    pub service: MetricService,

    /// Shared HMAC key; `None` disables signature checks and response signing.
    pub signing_key: Option<String>,

    /// Reject mismatched signatures instead of only logging them.
    pub strict_signature: bool,
}

impl AppState {
    pub fn new(service: MetricService) -> Self {
        Self {
            service,
            signing_key: None,
            strict_signature: false,
        }
    }

    pub fn with_signing_key(mut self, key: Option<String>, strict: bool) -> Self {
        self.signing_key = key.filter(|k| !k.is_empty());
        self.strict_signature = strict;
        self
    }
}

/// Builds the full Axum `Router` with all routes and middleware.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // ── Overview / health ───────────────────────────────────
        .route("/", get(handlers::status::index))
        .route("/ping", get(handlers::status::ping))
        // ── Updates ─────────────────────────────────────────────
        .route("/update/", post(handlers::update::update_json))
        .route(
            "/update/:kind/:name/:value",
            post(handlers::update::update_uri),
        )
        .route("/updates/", post(handlers::update::update_batch))
        // ── Queries ─────────────────────────────────────────────
        .route("/value/", post(handlers::value::value_json))
        .route("/value/:kind/:name", get(handlers::value::value_uri))
        // ── Signature check sits inside (de)compression ─────────
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            signature::signature_middleware,
        ))
        .with_state(state)
        // ── Global middleware (applied bottom-up) ───────────────
        .layer(CompressionLayer::new())
        .layer(RequestDecompressionLayer::new())
        .layer(axum_mw::from_fn(timing::timing_middleware))
}

// ─── Lifecycle ───────────────────────────────────────────────────

/// Open the store, restore, serve until `token` is cancelled, then drain
/// HTTP and write the final export. Both shutdown steps are bounded by
/// the configured shutdown timeout.
pub async fn run(
    config: ServerConfig,
    listener: TcpListener,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let storage_config = config.storage();
    let store = tokio::task::spawn_blocking(move || storage::open(&storage_config))
        .await?
        .context("opening metric store")?;

    let mode = config.persistence();
    let backup = mode
        .exports_to_file()
        .then(|| Arc::new(Backup::new(&config.file_storage_path)));
    let service = MetricService::new(store.clone(), backup.clone(), mode);

    if config.restore_from_file() {
        match service.restore().await {
            Ok(n) => tracing::info!(records = n, path = %config.file_storage_path.display(), "restored backup"),
            Err(e) => tracing::error!(error = %e, "restore failed, starting empty"),
        }
    }

    let exporter = match (mode, &backup) {
        (PersistenceMode::Periodic(every), Some(backup)) => Some(tokio::spawn(backup::run_periodic(
            backup.clone(),
            store.clone(),
            every,
            token.clone(),
        ))),
        _ => None,
    };

    let state = Arc::new(
        AppState::new(service.clone())
            .with_signing_key(config.signing_key().map(str::to_string), config.strict_signature),
    );
    let app = create_router(state);

    tracing::info!(
        addr = %listener.local_addr()?,
        backend = store.name(),
        ?mode,
        "server listening"
    );

    let shutdown = token.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    let finished_early = tokio::select! {
        joined = &mut server => Some(joined),
        _ = token.cancelled() => None,
    };
    let limit = config.shutdown_limit();
    let outcome = match finished_early {
        Some(joined) => {
            token.cancel();
            flatten(joined)
        }
        None => match tokio::time::timeout(limit, &mut server).await {
            Ok(joined) => flatten(joined),
            Err(_) => {
                tracing::warn!(?limit, "HTTP drain timed out, aborting open connections");
                server.abort();
                Ok(())
            }
        },
    };

    if let Some(exporter) = exporter {
        if let Err(e) = exporter.await {
            tracing::error!(error = %e, "periodic exporter failed");
        }
    }

    if mode.exports_to_file() {
        match tokio::time::timeout(limit, service.export()).await {
            Ok(Ok(n)) => tracing::info!(records = n, "final export written"),
            Ok(Err(e)) => tracing::error!(error = %e, "final export failed"),
            Err(_) => tracing::error!(?limit, "final export timed out"),
        }
    }

    tracing::info!("server stopped");
    outcome
}

fn flatten(joined: Result<std::io::Result<()>, JoinError>) -> anyhow::Result<()> {
    joined?.context("HTTP server failed")
}
