//! Directory browsing, raw file serving, and thumbnails.
//!
//! These sit next to the streaming engine: the web UI browses the media
//! tree, plays natively-supported files straight from `/raw/`, and decorates
//! listings with `/thumbnail/` frames.

use std::io::SeekFrom;
use std::path::Path as FsPath;

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use crate::av::ToolCommand;
use crate::error::Error;
use crate::server::{AppContext, AppError};

#[derive(Debug, Serialize)]
struct DirEntryInfo {
    name: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// List the media root.
pub async fn browse_root(State(ctx): State<AppContext>) -> Result<Json<serde_json::Value>, AppError> {
    browse_dir(&ctx, "").await
}

/// List a subdirectory of the media root.
pub async fn browse(
    State(ctx): State<AppContext>,
    Path(dir): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    browse_dir(&ctx, &dir).await
}

async fn browse_dir(ctx: &AppContext, rel: &str) -> Result<Json<serde_json::Value>, AppError> {
    let path = ctx.context.resolve_source(rel)?;
    let mut read_dir = tokio::fs::read_dir(&path)
        .await
        .map_err(|_| Error::not_found("directory", rel))?;

    let mut entries: Vec<DirEntryInfo> = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .map_err(|e| Error::Internal(format!("directory read failed: {e}")))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        entries.push(DirEntryInfo {
            name,
            kind: if is_dir { "directory" } else { "file" },
        });
    }

    // Directories first, then case-insensitive by name.
    entries.sort_by(|a, b| {
        (a.kind != "directory")
            .cmp(&(b.kind != "directory"))
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });

    Ok(Json(json!({ "path": rel, "entries": entries })))
}

/// Serve a media file directly, with HTTP Range support.
pub async fn raw_file(
    State(ctx): State<AppContext>,
    Path(file): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let path = ctx.context.resolve_source(&file)?;

    let metadata = tokio::fs::metadata(&path)
        .await
        .map_err(|_| Error::not_found("file", &file))?;
    if !metadata.is_file() {
        return Err(Error::not_found("file", &file).into());
    }
    let file_size = metadata.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| parse_range_header(s, file_size));

    let content_type = content_type_for(&path);

    match range {
        Some((start, end)) => {
            let length = end - start + 1;

            let mut f = File::open(&path)
                .await
                .map_err(|_| Error::not_found("file", &file))?;
            f.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| Error::Internal(format!("seek failed: {e}")))?;

            let body = Body::from_stream(ReaderStream::new(f.take(length)));
            Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, length.to_string())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, file_size),
                )
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| Error::Internal(e.to_string()).into())
        }
        None => {
            let f = File::open(&path)
                .await
                .map_err(|_| Error::not_found("file", &file))?;
            let body = Body::from_stream(ReaderStream::new(f));
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CONTENT_LENGTH, file_size.to_string())
                .header(header::ACCEPT_RANGES, "bytes")
                .body(body)
                .map_err(|e| Error::Internal(e.to_string()).into())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ThumbnailQuery {
    /// Timestamp to grab the frame from, in seconds.
    at: Option<f64>,
}

/// Extract a single scaled JPEG frame with ffmpeg.
pub async fn thumbnail(
    State(ctx): State<AppContext>,
    Path(file): Path<String>,
    Query(query): Query<ThumbnailQuery>,
) -> Result<Response, AppError> {
    let path = ctx.context.resolve_source(&file)?;
    let at = query.at.unwrap_or(10.0).max(0.0);

    let args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-ss".into(),
        format!("{at:.3}"),
        "-i".into(),
        path.to_string_lossy().into_owned(),
        "-frames:v".into(),
        "1".into(),
        "-vf".into(),
        "scale=320:-2".into(),
        "-f".into(),
        "mjpeg".into(),
        "pipe:1".into(),
    ];
    let mut cmd = ToolCommand::new(ctx.config.ffmpeg_path());
    cmd.args(args);

    let output = cmd.execute().await?;
    if output.stdout.is_empty() {
        return Err(Error::tool("ffmpeg", "no frame produced").into());
    }

    Ok((
        [
            (header::CONTENT_TYPE, "image/jpeg"),
            (header::CACHE_CONTROL, "max-age=3600"),
        ],
        output.stdout,
    )
        .into_response())
}

/// Parse an HTTP Range header of the forms `bytes=0-499`, `bytes=500-`, and
/// `bytes=-500`.
fn parse_range_header(header: &str, file_size: u64) -> Option<(u64, u64)> {
    let header = header.strip_prefix("bytes=")?;

    let (start, end) = header.split_once('-')?;
    let (start, end) = (start.trim(), end.trim());

    match (start.is_empty(), end.is_empty()) {
        // bytes=-500: last 500 bytes
        (true, false) => {
            let suffix_len: u64 = end.parse().ok()?;
            let start = file_size.saturating_sub(suffix_len);
            Some((start, file_size.checked_sub(1)?))
        }
        // bytes=500-: from 500 to end
        (false, true) => {
            let start: u64 = start.parse().ok()?;
            if start >= file_size {
                return None;
            }
            Some((start, file_size - 1))
        }
        // bytes=0-499
        (false, false) => {
            let start: u64 = start.parse().ok()?;
            let end: u64 = end.parse().ok()?;
            if start >= file_size {
                return None;
            }
            let end = end.min(file_size - 1);
            if start > end {
                return None;
            }
            Some((start, end))
        }
        (true, true) => None,
    }
}

/// Content type from the file extension.
fn content_type_for(path: &FsPath) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" | "m2ts" => "video/mp2t",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_full_range() {
        assert_eq!(parse_range_header("bytes=0-499", 1000), Some((0, 499)));
    }

    #[test]
    fn range_header_open_end() {
        assert_eq!(parse_range_header("bytes=500-", 1000), Some((500, 999)));
    }

    #[test]
    fn range_header_suffix() {
        assert_eq!(parse_range_header("bytes=-200", 1000), Some((800, 999)));
    }

    #[test]
    fn range_header_clamps_end() {
        assert_eq!(parse_range_header("bytes=0-2000", 1000), Some((0, 999)));
    }

    #[test]
    fn range_header_rejects_bad_input() {
        assert_eq!(parse_range_header("bytes=1500-", 1000), None);
        assert_eq!(parse_range_header("bytes=-", 1000), None);
        assert_eq!(parse_range_header("bytes=abc-def", 1000), None);
        assert_eq!(parse_range_header("octets=0-10", 1000), None);
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for(FsPath::new("a/b.mp4")), "video/mp4");
        assert_eq!(content_type_for(FsPath::new("a/b.MKV")), "video/x-matroska");
        assert_eq!(content_type_for(FsPath::new("song.flac")), "audio/flac");
        assert_eq!(
            content_type_for(FsPath::new("noext")),
            "application/octet-stream"
        );
    }
}
