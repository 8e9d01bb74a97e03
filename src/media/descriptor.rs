//! Media descriptors.
//!
//! A [`MediaDescriptor`] is the probed identity of one media file: its
//! duration, dimensions, segmentation plan, and applicable quality presets.
//! It lazily owns one [`QualityBackend`] per requested preset and a scratch
//! directory (named by the MD5 of the absolute source path) that all of its
//! backends write segments into. Descriptors are constructed through the
//! media cache and destructed on eviction, which tears down the backends and
//! removes the scratch directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use md5::{Digest, Md5};
use parking_lot::Mutex;

use crate::av::probe::{AudioProbe, VideoProbe};
use crate::error::{Error, Result};
use crate::media::backend::QualityBackend;
use crate::media::manifest;
use crate::media::planner::{
    plan_segments_default, DEFAULT_SEGMENT_LENGTH, DEFAULT_SEGMENT_OFFSET,
};
use crate::media::presets::{applicable_presets, Preset, AUDIO_PRESET};
use crate::media::{MediaKey, MediaKind, StreamContext};

/// One probed media file and its per-quality backends.
pub struct MediaDescriptor {
    context: Arc<StreamContext>,
    kind: MediaKind,
    source: PathBuf,
    out_dir: PathBuf,
    duration: f64,
    dimensions: Option<(u32, u32)>,
    breakpoints: Arc<Vec<f64>>,
    presets: Vec<&'static Preset>,
    backends: Mutex<HashMap<&'static str, Arc<QualityBackend>>>,
}

impl MediaDescriptor {
    /// Probe `key` under the context's media root and build a descriptor.
    pub async fn open(context: Arc<StreamContext>, key: MediaKey) -> Result<Self> {
        let source = context.resolve_source(&key.path)?;
        match key.kind {
            MediaKind::Video => {
                let probe = context.prober.probe_video(&source).await?;
                Self::from_video_probe(context, source, probe).await
            }
            MediaKind::Audio => {
                let probe = context.prober.probe_audio(&source).await?;
                Self::from_audio_probe(context, source, probe).await
            }
        }
    }

    /// Build a video descriptor from an already-parsed probe.
    pub async fn from_video_probe(
        context: Arc<StreamContext>,
        source: PathBuf,
        probe: VideoProbe,
    ) -> Result<Self> {
        let breakpoints = plan_segments_default(&probe.iframes, probe.duration);
        let presets = applicable_presets(probe.width, probe.height);
        Self::assemble(
            context,
            MediaKind::Video,
            source,
            probe.duration,
            Some((probe.width, probe.height)),
            breakpoints,
            presets,
        )
        .await
    }

    /// Build an audio descriptor from an already-parsed probe.
    pub async fn from_audio_probe(
        context: Arc<StreamContext>,
        source: PathBuf,
        probe: AudioProbe,
    ) -> Result<Self> {
        let breakpoints = plan_segments_default(&[], probe.duration);
        Self::assemble(
            context,
            MediaKind::Audio,
            source,
            probe.duration,
            None,
            breakpoints,
            vec![&AUDIO_PRESET],
        )
        .await
    }

    async fn assemble(
        context: Arc<StreamContext>,
        kind: MediaKind,
        source: PathBuf,
        duration: f64,
        dimensions: Option<(u32, u32)>,
        breakpoints: Vec<f64>,
        presets: Vec<&'static Preset>,
    ) -> Result<Self> {
        let absolute = tokio::fs::canonicalize(&source)
            .await
            .unwrap_or_else(|_| source.clone());
        let digest = Md5::digest(absolute.to_string_lossy().as_bytes());
        let out_dir = context.cache_root.join(hex::encode(digest));
        tokio::fs::create_dir_all(&out_dir).await?;

        tracing::info!(
            source = %source.display(),
            %kind,
            duration,
            segments = breakpoints.len() - 1,
            out_dir = %out_dir.display(),
            "media descriptor ready"
        );

        Ok(Self {
            context,
            kind,
            source,
            out_dir,
            duration,
            dimensions,
            breakpoints: Arc::new(breakpoints),
            presets,
            backends: Mutex::new(HashMap::new()),
        })
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn breakpoints(&self) -> &Arc<Vec<f64>> {
        &self.breakpoints
    }

    pub fn out_dir(&self) -> &PathBuf {
        &self.out_dir
    }

    /// Quality presets applicable to this source, descending by resolution.
    pub fn presets(&self) -> &[&'static Preset] {
        &self.presets
    }

    /// The master playlist. For audio media this is the single variant
    /// playlist verbatim.
    pub fn master_manifest(&self) -> String {
        match (self.kind, self.dimensions) {
            (MediaKind::Video, Some((width, height))) => {
                manifest::master_playlist(&self.presets, width, height)
            }
            _ => manifest::variant_playlist(
                &self.breakpoints,
                AUDIO_PRESET.name,
                DEFAULT_SEGMENT_LENGTH + DEFAULT_SEGMENT_OFFSET,
            ),
        }
    }

    /// The variant playlist for one quality.
    pub fn variant_manifest(&self, quality: &str) -> Result<String> {
        let preset = self.find_preset(quality)?;
        Ok(manifest::variant_playlist(
            &self.breakpoints,
            preset.name,
            DEFAULT_SEGMENT_LENGTH + DEFAULT_SEGMENT_OFFSET,
        ))
    }

    /// The backend for one quality, constructed lazily.
    pub fn backend(&self, quality: &str) -> Result<Arc<QualityBackend>> {
        let preset = self.find_preset(quality)?;

        let mut backends = self.backends.lock();
        if let Some(backend) = backends.get(preset.name) {
            return Ok(backend.clone());
        }

        let backend = QualityBackend::new(
            self.source.clone(),
            self.out_dir.clone(),
            preset,
            self.kind,
            self.dimensions,
            self.breakpoints.clone(),
            self.context.min_buffer,
            self.context.max_buffer,
            self.context.launcher.clone(),
        );
        backends.insert(preset.name, backend.clone());
        Ok(backend)
    }

    fn find_preset(&self, quality: &str) -> Result<&'static Preset> {
        self.presets
            .iter()
            .find(|p| p.name == quality)
            .copied()
            .ok_or_else(|| {
                Error::Internal(format!(
                    "quality {quality} not available for {}",
                    self.source.display()
                ))
            })
    }

    /// Tear down all backends, then remove the scratch directory.
    pub async fn destruct(&self) {
        let backends: Vec<_> = self.backends.lock().drain().map(|(_, b)| b).collect();
        for backend in backends {
            backend.destroy().await;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&self.out_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    out_dir = %self.out_dir.display(),
                    "failed to remove scratch directory: {e}"
                );
            }
        }
    }
}
