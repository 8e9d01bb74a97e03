//! ffprobe-backed media probing.
//!
//! Shells out to `ffprobe -v error ... -of json` and maps the JSON output
//! into the small structs the streaming engine needs: duration, dimensions
//! and I-frame timestamps for video; duration and bit rate for audio; and a
//! coarse stream inventory for the initialization endpoint.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::av::command::ToolCommand;
use crate::error::{Error, Result};
use crate::media::MediaKind;

/// Probes are given 30 seconds before they are killed.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Sources at or below this duration are rejected as unusable.
const MIN_USABLE_DURATION: f64 = 0.5;

/// Video stream codecs that are really embedded cover art.
const COVER_ART_CODECS: &[&str] = &["mjpeg", "png", "bmp", "gif"];

/// Result of a video probe.
#[derive(Debug, Clone)]
pub struct VideoProbe {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    /// I-frame presentation timestamps, ascending.
    pub iframes: Vec<f64>,
}

/// Result of an audio probe.
#[derive(Debug, Clone)]
pub struct AudioProbe {
    pub duration: f64,
    pub bit_rate: Option<u64>,
}

/// Result of the initialization probe: enough to classify the file and
/// derive the native-playback hint.
#[derive(Debug, Clone)]
pub struct InitProbe {
    pub kind: MediaKind,
    pub format_name: String,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
}

impl InitProbe {
    /// Whether a browser is likely to play the raw file without HLS.
    ///
    /// Derived from container and codecs; advisory only.
    pub fn maybe_natively_supported(&self) -> bool {
        let container_ok = self.format_name.contains("mp4") || self.format_name.contains("webm");
        if !container_ok {
            return false;
        }

        let video_ok = match self.video_codec.as_deref() {
            Some(codec) => matches!(codec, "h264" | "vp8" | "vp9" | "av1"),
            None => true,
        };
        let audio_ok = match self.audio_codec.as_deref() {
            Some(codec) => matches!(codec, "aac" | "mp3" | "vorbis" | "opus"),
            None => true,
        };

        video_ok && audio_ok
    }
}

/// A prober backed by the `ffprobe` CLI.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_path: PathBuf,
}

impl Prober {
    /// Create a new prober using the given ffprobe path.
    pub fn new(ffprobe_path: PathBuf) -> Self {
        Self { ffprobe_path }
    }

    /// Probe a video source: duration, dimensions, and I-frame timestamps.
    pub async fn probe_video(&self, path: &Path) -> Result<VideoProbe> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v",
            "error",
            "-skip_frame",
            "nokey",
            "-show_entries",
            "frame=pkt_pts_time",
            "-show_entries",
            "format=duration",
            "-show_entries",
            "stream=duration,width,height",
            "-select_streams",
            "v",
            "-of",
            "json",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());
        cmd.timeout(PROBE_TIMEOUT);

        let output = cmd.execute().await?;
        parse_video_probe(&output.stdout_utf8())
    }

    /// Probe an audio source: duration and bit rate.
    pub async fn probe_audio(&self, path: &Path) -> Result<AudioProbe> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "stream=duration,bit_rate",
            "-select_streams",
            "a",
            "-of",
            "json",
        ]);
        cmd.arg(path.to_string_lossy().as_ref());
        cmd.timeout(PROBE_TIMEOUT);

        let output = cmd.execute().await?;
        parse_audio_probe(&output.stdout_utf8())
    }

    /// Initialization probe: classify the file as video or audio and expose
    /// container/codec names.
    pub async fn probe_init(&self, path: &Path) -> Result<InitProbe> {
        let mut cmd = ToolCommand::new(self.ffprobe_path.clone());
        cmd.args(["-v", "error", "-show_format", "-show_streams", "-of", "json"]);
        cmd.arg(path.to_string_lossy().as_ref());
        cmd.timeout(PROBE_TIMEOUT);

        let output = cmd.execute().await?;
        parse_init_probe(&output.stdout_utf8())
    }
}

// ---------------------------------------------------------------------------
// JSON structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ProbeDoc {
    #[serde(default)]
    frames: Vec<ProbeFrame>,
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFrame {
    // Older ffprobe calls this pkt_pts_time, newer builds pts_time.
    pkt_pts_time: Option<String>,
    pts_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    duration: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_doc(json: &str) -> Result<ProbeDoc> {
    serde_json::from_str(json).map_err(|e| Error::Probe(format!("ffprobe JSON parse error: {e}")))
}

fn parse_f64(s: &Option<String>) -> Option<f64> {
    s.as_deref().and_then(|s| s.parse::<f64>().ok())
}

fn resolve_duration(doc: &ProbeDoc) -> Result<f64> {
    let duration = doc
        .format
        .as_ref()
        .and_then(|f| parse_f64(&f.duration))
        .or_else(|| doc.streams.iter().find_map(|s| parse_f64(&s.duration)))
        .ok_or_else(|| Error::Probe("no duration reported".into()))?;

    if duration <= MIN_USABLE_DURATION {
        return Err(Error::Probe(format!(
            "unusable media: duration {duration:.3}s"
        )));
    }
    Ok(duration)
}

fn parse_video_probe(json: &str) -> Result<VideoProbe> {
    let doc = parse_doc(json)?;
    let duration = resolve_duration(&doc)?;

    let (width, height) = doc
        .streams
        .iter()
        .find_map(|s| s.width.zip(s.height))
        .ok_or_else(|| Error::Probe("no video dimensions reported".into()))?;

    let mut iframes: Vec<f64> = doc
        .frames
        .iter()
        .filter_map(|f| parse_f64(&f.pkt_pts_time).or_else(|| parse_f64(&f.pts_time)))
        .filter(|t| t.is_finite())
        .collect();
    iframes.sort_by(|a, b| a.total_cmp(b));

    Ok(VideoProbe {
        duration,
        width,
        height,
        iframes,
    })
}

fn parse_audio_probe(json: &str) -> Result<AudioProbe> {
    let doc = parse_doc(json)?;
    let duration = resolve_duration(&doc)?;

    let bit_rate = doc
        .streams
        .iter()
        .find_map(|s| s.bit_rate.as_deref().and_then(|b| b.parse::<u64>().ok()));

    Ok(AudioProbe { duration, bit_rate })
}

fn parse_init_probe(json: &str) -> Result<InitProbe> {
    let doc = parse_doc(json)?;

    let format_name = doc
        .format
        .as_ref()
        .and_then(|f| f.format_name.clone())
        .unwrap_or_default();

    let video_codec = doc.streams.iter().find_map(|s| {
        if s.codec_type.as_deref() != Some("video") {
            return None;
        }
        let codec = s.codec_name.as_deref()?;
        if COVER_ART_CODECS.contains(&codec) {
            return None;
        }
        Some(codec.to_string())
    });

    let audio_codec = doc.streams.iter().find_map(|s| {
        (s.codec_type.as_deref() == Some("audio")).then(|| s.codec_name.clone().unwrap_or_default())
    });

    let kind = if video_codec.is_some() {
        MediaKind::Video
    } else if audio_codec.is_some() {
        MediaKind::Audio
    } else {
        return Err(Error::Probe("no playable streams".into()));
    };

    Ok(InitProbe {
        kind,
        format_name,
        video_codec,
        audio_codec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIDEO_JSON: &str = r#"{
        "frames": [
            {"pkt_pts_time": "0.000000"},
            {"pkt_pts_time": "3.003000"},
            {"pkt_pts_time": "6.006000"}
        ],
        "streams": [
            {"width": 1920, "height": 1080, "duration": "31.021000"}
        ],
        "format": {"duration": "31.021000"}
    }"#;

    #[test]
    fn video_probe_parses_frames_and_dimensions() {
        let probe = parse_video_probe(VIDEO_JSON).unwrap();
        assert_eq!(probe.width, 1920);
        assert_eq!(probe.height, 1080);
        assert!((probe.duration - 31.021).abs() < 1e-9);
        assert_eq!(probe.iframes.len(), 3);
        assert!((probe.iframes[1] - 3.003).abs() < 1e-9);
    }

    #[test]
    fn video_probe_accepts_new_style_pts_time() {
        let json = r#"{
            "frames": [{"pts_time": "0.0"}, {"pts_time": "2.5"}],
            "streams": [{"width": 640, "height": 480, "duration": "10.0"}],
            "format": {"duration": "10.0"}
        }"#;
        let probe = parse_video_probe(json).unwrap();
        assert_eq!(probe.iframes, vec![0.0, 2.5]);
    }

    #[test]
    fn video_probe_falls_back_to_stream_duration() {
        let json = r#"{
            "frames": [],
            "streams": [{"width": 640, "height": 480, "duration": "12.0"}],
            "format": {}
        }"#;
        let probe = parse_video_probe(json).unwrap();
        assert_eq!(probe.duration, 12.0);
    }

    #[test]
    fn too_short_media_is_rejected() {
        let json = r#"{
            "frames": [],
            "streams": [{"width": 640, "height": 480}],
            "format": {"duration": "0.4"}
        }"#;
        let err = parse_video_probe(json).unwrap_err();
        assert!(matches!(err, Error::Probe(_)));
        assert!(err.to_string().contains("unusable"));
    }

    #[test]
    fn audio_probe_parses_bit_rate() {
        let json = r#"{
            "streams": [{"duration": "240.5", "bit_rate": "320000"}],
            "format": {}
        }"#;
        let probe = parse_audio_probe(json).unwrap();
        assert_eq!(probe.duration, 240.5);
        assert_eq!(probe.bit_rate, Some(320_000));
    }

    #[test]
    fn init_probe_classifies_video() {
        let json = r#"{
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"},
            "streams": [
                {"codec_type": "video", "codec_name": "h264"},
                {"codec_type": "audio", "codec_name": "aac"}
            ]
        }"#;
        let probe = parse_init_probe(json).unwrap();
        assert_eq!(probe.kind, MediaKind::Video);
        assert!(probe.maybe_natively_supported());
    }

    #[test]
    fn init_probe_ignores_cover_art() {
        let json = r#"{
            "format": {"format_name": "mp3"},
            "streams": [
                {"codec_type": "video", "codec_name": "mjpeg"},
                {"codec_type": "audio", "codec_name": "mp3"}
            ]
        }"#;
        let probe = parse_init_probe(json).unwrap();
        assert_eq!(probe.kind, MediaKind::Audio);
        assert!(!probe.maybe_natively_supported());
    }

    #[test]
    fn init_probe_hevc_is_not_native() {
        let json = r#"{
            "format": {"format_name": "mov,mp4,m4a,3gp,3g2,mj2"},
            "streams": [{"codec_type": "video", "codec_name": "hevc"}]
        }"#;
        let probe = parse_init_probe(json).unwrap();
        assert!(!probe.maybe_natively_supported());
    }

    #[test]
    fn init_probe_rejects_streamless_files() {
        let json = r#"{"format": {"format_name": "data"}, "streams": []}"#;
        assert!(parse_init_probe(json).is_err());
    }
}
