//! HTTP server: shared context, router assembly, and lifecycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::config::Config;
use crate::media::{self, MediaCache, StreamContext};
use crate::streaming::{self, ClientRouter};

pub mod error;
pub mod routes_files;

pub use error::AppError;

/// Shared application context handed to every handler.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub context: Arc<StreamContext>,
    pub media: Arc<MediaCache>,
    pub router: Arc<ClientRouter>,
}

impl AppContext {
    pub fn new(config: Config) -> Self {
        let context = StreamContext::from_config(&config);
        let media = media::new_media_cache(context.clone());
        let router = ClientRouter::new(media.clone(), config.max_client_number);
        Self {
            config: Arc::new(config),
            context,
            media,
            router,
        }
    }
}

/// Create the Axum router with all routes.
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_check))
        .route("/browse/", get(routes_files::browse_root))
        .route("/browse/*dir", get(routes_files::browse))
        .route("/raw/*file", get(routes_files::raw_file))
        .route("/thumbnail/*file", get(routes_files::thumbnail))
        .merge(streaming::streaming_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server and run until a shutdown signal arrives. The
/// segment cache is removed on the way out.
pub async fn start_server(config: Config) -> Result<()> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    if config.debug {
        tracing::info!(?config, "effective configuration");
    }
    let ctx = AppContext::new(config);
    let cache_root = ctx.context.cache_root.clone();

    let app = create_router(ctx);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Removing segment cache at {}", cache_root.display());
    if let Err(e) = tokio::fs::remove_dir_all(&cache_root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove segment cache: {e}");
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
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
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.root_path = PathBuf::from("/tmp");
        config
    }

    #[tokio::test]
    async fn router_builds_with_default_context() {
        let ctx = AppContext::new(test_config());
        let _router = create_router(ctx);
    }

    #[tokio::test]
    async fn context_wires_buffer_lengths() {
        let ctx = AppContext::new(test_config());
        assert_eq!(ctx.context.min_buffer, 30.0);
        assert_eq!(ctx.context.max_buffer, 60.0);
    }
}
