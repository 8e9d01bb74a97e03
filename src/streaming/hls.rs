//! HLS streaming handlers.
//!
//! URL surface (the `:session` component is `<type>.<client-id>`):
//!
//! - `GET /media/*file` - probe a file and report playback info
//! - `GET /:session/*file/master.m3u8` - master playlist
//! - `GET /:session/*file/quality-<q>.m3u8` - variant playlist (routes the
//!   client onto that quality's backend)
//! - `GET /:session/*file/<q>.<hex-index>.ts` - segment bytes; the index is
//!   1-based hex
//! - `DELETE /hls.<client>/` - deregister a client

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use tokio_util::io::ReaderStream;

use crate::error::Error;
use crate::media::{MediaKey, MediaKind};
use crate::server::{AppContext, AppError};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
const SEGMENT_CONTENT_TYPE: &str = "video/mp2t";

/// Probe a file and report `{type, maybeNativelySupported, bufferLength}`.
///
/// Probe failures are reported in-band as an `{error}` body so the web UI
/// can render them.
pub async fn media_info(
    State(ctx): State<AppContext>,
    Path(file): Path<String>,
) -> Response {
    match probe_media(&ctx, &file).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => {
            tracing::warn!(%file, "media probe failed: {e}");
            Json(json!({ "error": e.to_string() })).into_response()
        }
    }
}

async fn probe_media(ctx: &AppContext, file: &str) -> crate::error::Result<serde_json::Value> {
    let source = ctx.context.resolve_source(file)?;
    let init = ctx.context.prober.probe_init(&source).await?;
    let native = !ctx.context.no_short_circuit && init.maybe_natively_supported();
    Ok(json!({
        "type": init.kind.as_str(),
        "maybeNativelySupported": native,
        "bufferLength": ctx.context.min_buffer,
    }))
}

/// Master playlist, variant playlist, or segment, depending on the last
/// path component.
pub async fn hls_request(
    State(ctx): State<AppContext>,
    Path((session, rest)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let (kind, client) = parse_session(&session)
        .ok_or_else(|| Error::Validation(format!("malformed session: {session}")))?;
    let (file, action) = rest
        .rsplit_once('/')
        .ok_or_else(|| Error::Validation(format!("missing media path: {rest}")))?;
    let key = MediaKey::new(kind, file);

    if action == "master.m3u8" {
        let descriptor = ctx.router.descriptor(key).await.map_err(AppError::shared)?;
        return Ok(playlist_response(descriptor.master_manifest()));
    }

    if let Some(quality) = parse_variant_name(action) {
        // The variant request is what first binds the client to a quality.
        ctx.router.route(client, key.clone(), quality).await?;
        let descriptor = ctx.router.descriptor(key).await.map_err(AppError::shared)?;
        return Ok(playlist_response(descriptor.variant_manifest(quality)?));
    }

    if let Some((quality, index)) = parse_segment_name(action) {
        let backend = ctx.router.route(client, key, quality).await?;
        let path = backend.serve_segment(client, index).await?;
        return segment_response(&path).await;
    }

    Err(Error::not_found("resource", action).into())
}

/// Deregister a client from its current backend.
pub async fn deregister_client(
    State(ctx): State<AppContext>,
    Path(session): Path<String>,
) -> Result<Response, AppError> {
    let client = session
        .strip_prefix("hls.")
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Validation(format!("malformed session: {session}")))?;

    let known = ctx.router.deregister(client);
    tracing::debug!(client, known, "client deregistered");
    Ok(StatusCode::OK.into_response())
}

fn playlist_response(manifest: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, PLAYLIST_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        manifest,
    )
        .into_response()
}

async fn segment_response(path: &std::path::Path) -> Result<Response, AppError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::Internal(format!("produced segment unreadable: {e}")))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| Error::Internal(format!("produced segment unreadable: {e}")))?
        .len();

    let body = Body::from_stream(ReaderStream::new(file));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, SEGMENT_CONTENT_TYPE)
        .header(header::CONTENT_LENGTH, size.to_string())
        .header(header::CACHE_CONTROL, "max-age=3600")
        .body(body)
        .map_err(|e| Error::Internal(e.to_string()).into())
}

/// Split the `<type>.<client>` session component.
fn parse_session(session: &str) -> Option<(MediaKind, &str)> {
    let (kind, client) = session.split_once('.')?;
    if client.is_empty() {
        return None;
    }
    Some((MediaKind::parse(kind)?, client))
}

/// Extract the quality from a `quality-<q>.m3u8` component.
fn parse_variant_name(name: &str) -> Option<&str> {
    let quality = name.strip_prefix("quality-")?.strip_suffix(".m3u8")?;
    (!quality.is_empty()).then_some(quality)
}

/// Parse a `<quality>.<hex-index>.ts` segment name into the quality and a
/// 0-based segment index. The on-wire index is 1-based.
fn parse_segment_name(name: &str) -> Option<(&str, usize)> {
    let stem = name.strip_suffix(".ts")?;
    let (quality, hex_index) = stem.rsplit_once('.')?;
    if quality.is_empty() {
        return None;
    }
    let index = usize::from_str_radix(hex_index, 16).ok()?;
    index.checked_sub(1).map(|i| (quality, i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_parsing() {
        assert_eq!(
            parse_session("video.abc123"),
            Some((MediaKind::Video, "abc123"))
        );
        assert_eq!(parse_session("audio.x"), Some((MediaKind::Audio, "x")));
        // Client ids may themselves contain dots.
        assert_eq!(
            parse_session("video.a.b"),
            Some((MediaKind::Video, "a.b"))
        );
        assert_eq!(parse_session("hls.abc"), None);
        assert_eq!(parse_session("video."), None);
        assert_eq!(parse_session("video"), None);
    }

    #[test]
    fn variant_name_parsing() {
        assert_eq!(parse_variant_name("quality-720p.m3u8"), Some("720p"));
        assert_eq!(parse_variant_name("quality-audio.m3u8"), Some("audio"));
        assert_eq!(parse_variant_name("quality-.m3u8"), None);
        assert_eq!(parse_variant_name("master.m3u8"), None);
        assert_eq!(parse_variant_name("quality-720p.ts"), None);
    }

    #[test]
    fn segment_name_parsing() {
        assert_eq!(parse_segment_name("720p.1.ts"), Some(("720p", 0)));
        // Hex, 1-based: 0x1a = 26 on the wire, segment 25 internally.
        assert_eq!(parse_segment_name("720p.1a.ts"), Some(("720p", 25)));
        assert_eq!(parse_segment_name("audio.ff.ts"), Some(("audio", 254)));
        // Index 0 is invalid on a 1-based wire format.
        assert_eq!(parse_segment_name("720p.0.ts"), None);
        assert_eq!(parse_segment_name("720p.xyz.ts"), None);
        assert_eq!(parse_segment_name("720p.1.m3u8"), None);
        assert_eq!(parse_segment_name(".1.ts"), None);
    }
}
