//! ffmpeg encoder invocations.
//!
//! Builds the segmenting ffmpeg command line for a run of segments and
//! spawns it as a [`Subprocess`]. The launcher sits behind a trait so the
//! backend state machine can be driven by scripted processes in tests.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::av::command::ToolCommand;
use crate::av::process::Subprocess;
use crate::error::Result;
use crate::media::presets::Preset;
use crate::media::MediaKind;

/// Encoders are allowed to run for a long movie in real time, but not
/// forever.
const ENCODER_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

/// Description of one encoder run: produce segments `start..end` of the
/// source, aligned to the given breakpoints.
#[derive(Debug)]
pub struct EncodeJob<'a> {
    pub source: &'a Path,
    pub out_dir: &'a Path,
    pub preset: &'static Preset,
    pub kind: MediaKind,
    /// Source dimensions, used to orient the scale filter.
    pub dimensions: Option<(u32, u32)>,
    /// Full breakpoint vector for the media.
    pub breakpoints: &'a [f64],
    /// First segment index to produce.
    pub start: usize,
    /// One past the last segment index to produce.
    pub end: usize,
}

impl EncodeJob<'_> {
    /// On-disk name of segment `index` under this preset.
    pub fn segment_file_name(preset: &Preset, index: usize) -> String {
        format!("{}-{:05}.ts", preset.name, index)
    }
}

/// Spawns encoder processes for segment runs.
pub trait EncoderLauncher: Send + Sync {
    fn launch(&self, job: &EncodeJob<'_>) -> Result<Arc<Subprocess>>;
}

/// The production launcher: shells out to ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: std::path::PathBuf,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: std::path::PathBuf) -> Self {
        Self { ffmpeg_path }
    }
}

impl EncoderLauncher for FfmpegLauncher {
    fn launch(&self, job: &EncodeJob<'_>) -> Result<Arc<Subprocess>> {
        let mut cmd = ToolCommand::new(self.ffmpeg_path.clone());
        cmd.args(encode_args(job));
        cmd.timeout(ENCODER_TIMEOUT);
        tracing::debug!(
            source = %job.source.display(),
            preset = job.preset.name,
            start = job.start,
            end = job.end,
            "launching encoder"
        );
        cmd.stream()
    }
}

/// Build the full ffmpeg argument list for an encode job.
///
/// The command seeks to the run's first breakpoint, forces key frames on
/// every interior breakpoint, and uses the segment muxer to emit one
/// MPEG-TS file per segment, reporting each finished file on stdout.
pub fn encode_args(job: &EncodeJob<'_>) -> Vec<String> {
    let bp = job.breakpoints;
    let mut args: Vec<String> = Vec::new();

    // Seeking to 0 trips a negative-seek quirk in some demuxers; omit it.
    if job.start > 0 {
        args.push("-ss".into());
        args.push(format_time(bp[job.start]));
    }
    args.push("-i".into());
    args.push(job.source.to_string_lossy().into_owned());
    args.push("-to".into());
    args.push(format_time(bp[job.end]));
    args.push("-copyts".into());

    let cut_times: Vec<String> = bp[job.start + 1..=job.end]
        .iter()
        .map(|t| format_time(*t))
        .collect();
    let cut_list = cut_times.join(",");

    match job.kind {
        MediaKind::Video => {
            args.push("-force_key_frames".into());
            args.push(cut_list.clone());

            let scale = match job.dimensions {
                Some((w, h)) if w < h => format!("scale={}:-2", job.preset.resolution),
                _ => format!("scale=-2:{}", job.preset.resolution),
            };
            args.extend([
                "-vf".into(),
                scale,
                "-c:v".into(),
                "libx264".into(),
                "-preset".into(),
                "veryfast".into(),
                "-b:v".into(),
                format!("{}k", job.preset.video_bitrate),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", job.preset.audio_bitrate),
                "-ac".into(),
                "2".into(),
            ]);
        }
        MediaKind::Audio => {
            args.extend([
                "-vn".into(),
                "-c:a".into(),
                "aac".into(),
                "-b:a".into(),
                format!("{}k", job.preset.audio_bitrate),
                "-ac".into(),
                "2".into(),
            ]);
        }
    }

    args.extend([
        "-f".into(),
        "segment".into(),
        "-segment_time_delta".into(),
        "0.2".into(),
        "-segment_format".into(),
        "mpegts".into(),
        "-segment_times".into(),
        cut_list,
        "-segment_start_number".into(),
        job.start.to_string(),
        "-segment_list_type".into(),
        "flat".into(),
        "-segment_list".into(),
        "pipe:1".into(),
    ]);

    args.push(
        job.out_dir
            .join(format!("{}-%05d.ts", job.preset.name))
            .to_string_lossy()
            .into_owned(),
    );

    args
}

fn format_time(t: f64) -> String {
    format!("{t:.6}")
}
