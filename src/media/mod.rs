//! Media descriptors, segmentation, and the per-quality transcoding
//! backends.

pub mod backend;
pub mod descriptor;
pub mod manifest;
pub mod planner;
pub mod presets;

pub use backend::QualityBackend;
pub use descriptor::MediaDescriptor;

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;

use crate::av::encoder::{EncoderLauncher, FfmpegLauncher};
use crate::av::probe::Prober;
use crate::config::{Config, MEDIA_CACHE_CAPACITY};
use crate::error::{Error, Result};
use crate::lru::AsyncLru;

/// Whether a media file is served as video or audio-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Parse the `:type` URL component.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "video" => Some(MediaKind::Video),
            "audio" => Some(MediaKind::Audio),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache key for one media descriptor: kind plus root-relative path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaKey {
    pub kind: MediaKind,
    pub path: String,
}

impl MediaKey {
    pub fn new(kind: MediaKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Shared runtime context for the streaming engine.
pub struct StreamContext {
    pub root_path: PathBuf,
    pub cache_root: PathBuf,
    /// Minimum buffered lookahead per client, in seconds.
    pub min_buffer: f64,
    /// Buffered lookahead at which encoders stop, in seconds.
    pub max_buffer: f64,
    pub no_short_circuit: bool,
    pub prober: Prober,
    pub launcher: Arc<dyn EncoderLauncher>,
}

impl StreamContext {
    pub fn from_config(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            root_path: config.root_path.clone(),
            cache_root: config.cache_root(),
            min_buffer: config.buffer_length,
            max_buffer: config.max_buffer_length(),
            no_short_circuit: config.no_short_circuit,
            prober: Prober::new(config.ffprobe_path()),
            launcher: Arc::new(FfmpegLauncher::new(config.ffmpeg_path())),
        })
    }

    /// Resolve a root-relative media path, rejecting traversal.
    pub fn resolve_source(&self, relative: &str) -> Result<PathBuf> {
        resolve_media_path(&self.root_path, relative)
    }
}

/// Join `relative` onto `root`, refusing absolute paths and parent
/// components.
pub fn resolve_media_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return Err(Error::Forbidden(format!(
            "absolute paths are not served: {relative}"
        )));
    }
    for component in rel.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(Error::Forbidden(format!(
                    "path escapes media root: {relative}"
                )))
            }
        }
    }
    Ok(root.join(rel))
}

/// The two-level cache of media descriptors.
pub type MediaCache = AsyncLru<MediaKey, MediaDescriptor>;

/// Build the media descriptor cache: descriptors probe on construction and
/// tear down their backends and scratch directory on eviction.
pub fn new_media_cache(context: Arc<StreamContext>) -> Arc<MediaCache> {
    AsyncLru::new(
        MEDIA_CACHE_CAPACITY,
        {
            let context = context.clone();
            move |key: MediaKey| {
                let context = context.clone();
                async move {
                    MediaDescriptor::open(context, key)
                        .await
                        .map(Arc::new)
                        .map_err(Arc::new)
                }
                .boxed()
            }
        },
        |key: MediaKey, descriptor: Arc<MediaDescriptor>| {
            async move {
                tracing::debug!(media = %key.path, "evicting media descriptor");
                descriptor.destruct().await;
            }
            .boxed()
        },
    )
}
