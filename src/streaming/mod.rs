//! HLS streaming: client session routing and the HTTP handlers that drive
//! the transcoding engine.

pub mod hls;
pub mod sessions;

pub use sessions::ClientRouter;

use axum::{
    routing::{delete, get},
    Router,
};

use crate::server::AppContext;

/// Streaming routes: the probe endpoint, playlists, segments, and client
/// deregistration.
pub fn streaming_routes() -> Router<AppContext> {
    Router::new()
        .route("/media/*file", get(hls::media_info))
        .route("/:session/", delete(hls::deregister_client))
        .route("/:session/*rest", get(hls::hls_request))
}
