//! api-server — HTTP API for the URL shortener.
//!
//! - Auth: API keys sent in the `Authorization` header (bare or `Bearer`).
//!   A "Root User" admin key is bootstrapped from `ROOT_USER_KEY`.
//! - Storage: SQLite (default, file at `DB_PATH`) or in-memory.
//! - Expiration: a background sweeper retires expired and stale links.
//!
//! Run:
//! ```bash
//! ROOT_USER_KEY=change-me cargo run -p api-server
//!
//! # JSON logs, throwaway storage
//! LOG_FORMAT=json STORAGE_PROVIDER=memory ROOT_USER_KEY=dev cargo run -p api-server
//! ```
//!
//! Configuration: See `config.rs` for all environment variables. A `.env`
//! file in the working directory is loaded first when present.

mod api;
mod config;
mod error;
mod store;
mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use domain::expiry::{ExpirationSweeper, SWEEP_INTERVAL};
use domain::keys::Bootstrap;
use domain::SystemClock;
use tokio::signal;
use tokio::sync::watch;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::store::{SharedStore, Store};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // Load and validate config first (fail fast on misconfiguration)
    let cfg = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(&cfg);
    cfg.warn_if_insecure();

    let store: SharedStore = match Store::from_config(&cfg) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(err = %e, path = %cfg.db_path.display(), "failed to open storage");
            std::process::exit(1);
        }
    };
    info!(storage = store.kind(), "storage ready");

    let state = api::AppState::new(store.clone(), cfg.public_site_host.clone());
    match state.keys.bootstrap_root(cfg.root_user_key.as_deref()) {
        Ok(Bootstrap::Created) => info!("root user key created"),
        Ok(Bootstrap::Existing) => info!("root user key present"),
        Err(e) => {
            error!(err = %e, "root user bootstrap failed; set ROOT_USER_KEY");
            std::process::exit(1);
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Arc::new(ExpirationSweeper::new(store, SystemClock));
    let sweeper_task = tokio::spawn(worker::run_sweeper(sweeper, SWEEP_INTERVAL, shutdown_rx));

    let app = with_layers(api::router(state), cfg.cors_allow_origin.clone());

    let addr: SocketAddr = ([0, 0, 0, 0], cfg.port).into();
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, err = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    info!(%addr, "api-server listening");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;
    if let Err(e) = served {
        error!(err = %e, "server error");
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_task.await {
        error!(err = %e, "expiration sweeper task failed");
    }
    info!("api-server stopped");
}

/// Request ids, per-request spans and CORS around the API router.
fn with_layers(router: Router, cors_origin: HeaderValue) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    // CORS - already validated in Config::from_env()
    let cors = if cors_origin == HeaderValue::from_static("*") {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(AllowOrigin::list([cors_origin]))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                axum::http::header::AUTHORIZATION,
                axum::http::header::CONTENT_TYPE,
            ])
    };

    router
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = %request_id,
                )
            }),
        )
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(cors)
}

fn init_tracing(cfg: &config::Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match cfg.log_format {
        config::LogFormat::Json => {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_target(true)
                        .with_timer(fmt::time::SystemTime)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
        config::LogFormat::Pretty => {
            registry
                .with(
                    fmt::layer()
                        .pretty()
                        .with_target(true)
                        .with_writer(std::io::stdout),
                )
                .init();
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(err = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(err = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
