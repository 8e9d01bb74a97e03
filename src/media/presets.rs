//! Quality presets.
//!
//! A fixed, descending-by-resolution preset ladder for video sources plus a
//! single preset for audio-only media. A preset's `resolution` is the target
//! length of the *shorter* video side; sources are matched on the same axis.

/// One transcoding quality: name, target resolution, and bitrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    /// Target length of the shorter side in pixels; 0 for audio.
    pub resolution: u32,
    /// Video bitrate in kbps; 0 for audio.
    pub video_bitrate: u32,
    /// Audio bitrate in kbps.
    pub audio_bitrate: u32,
}

/// Video preset ladder, descending by resolution.
pub const VIDEO_PRESETS: &[Preset] = &[
    Preset {
        name: "1080p",
        resolution: 1080,
        video_bitrate: 5000,
        audio_bitrate: 192,
    },
    Preset {
        name: "720p",
        resolution: 720,
        video_bitrate: 2800,
        audio_bitrate: 128,
    },
    Preset {
        name: "480p",
        resolution: 480,
        video_bitrate: 1400,
        audio_bitrate: 128,
    },
    Preset {
        name: "360p",
        resolution: 360,
        video_bitrate: 800,
        audio_bitrate: 96,
    },
];

/// The single preset used for audio-only media.
pub const AUDIO_PRESET: Preset = Preset {
    name: "audio",
    resolution: 0,
    video_bitrate: 0,
    audio_bitrate: 128,
};

impl Preset {
    /// HLS `BANDWIDTH` attribute: total bitrate plus 5% overhead, in bits
    /// per second, rounded up.
    pub fn bandwidth(&self) -> u64 {
        ((self.video_bitrate + self.audio_bitrate) as f64 * 1.05 * 1000.0).ceil() as u64
    }

    /// Output dimensions for a source of `width`x`height`: the shorter side
    /// becomes `self.resolution`, the longer side scales proportionally,
    /// rounded to the nearest pixel.
    pub fn scaled_resolution(&self, width: u32, height: u32) -> (u32, u32) {
        if width >= height {
            let scaled = (width as f64 * self.resolution as f64 / height as f64).round() as u32;
            (scaled, self.resolution)
        } else {
            let scaled = (height as f64 * self.resolution as f64 / width as f64).round() as u32;
            (self.resolution, scaled)
        }
    }
}

/// The presets applicable to a video source of the given dimensions: every
/// preset not exceeding the source's shorter side, or the smallest preset if
/// the source is smaller than all of them.
pub fn applicable_presets(width: u32, height: u32) -> Vec<&'static Preset> {
    let shorter = width.min(height);
    let fitting: Vec<&'static Preset> = VIDEO_PRESETS
        .iter()
        .filter(|p| p.resolution <= shorter)
        .collect();

    if fitting.is_empty() {
        vec![VIDEO_PRESETS.last().expect("preset ladder is non-empty")]
    } else {
        fitting
    }
}

/// Look up a video preset by name.
pub fn find_video_preset(name: &str) -> Option<&'static Preset> {
    VIDEO_PRESETS.iter().find(|p| p.name == name)
}
