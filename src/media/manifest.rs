//! HLS playlist generation.

use std::fmt::Write;

use crate::media::presets::Preset;

/// Playlists use the platform line separator.
const NEWLINE: &str = if cfg!(windows) { "\r\n" } else { "\n" };

/// Generate the master playlist for a video source: one
/// `#EXT-X-STREAM-INF` entry per applicable preset, descending by
/// resolution, each pointing at its variant playlist.
pub fn master_playlist(presets: &[&'static Preset], width: u32, height: u32) -> String {
    let mut out = String::new();

    write!(out, "#EXTM3U{NEWLINE}").unwrap();
    for preset in presets {
        let (w, h) = preset.scaled_resolution(width, height);
        write!(
            out,
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{},NAME={}{NEWLINE}",
            preset.bandwidth(),
            w,
            h,
            preset.name
        )
        .unwrap();
        write!(out, "quality-{}.m3u8{NEWLINE}", preset.name).unwrap();
    }

    out
}

/// Generate the variant playlist for one preset: one `#EXTINF` entry per
/// planned segment, with segment URIs of the form
/// `<preset>.<hex 1-based index>.ts`.
pub fn variant_playlist(breakpoints: &[f64], preset_name: &str, target_duration: f64) -> String {
    let mut out = String::new();

    write!(out, "#EXTM3U{NEWLINE}").unwrap();
    write!(out, "#EXT-X-PLAYLIST-TYPE:VOD{NEWLINE}").unwrap();
    write!(out, "#EXT-X-TARGETDURATION:{target_duration}{NEWLINE}").unwrap();
    write!(out, "#EXT-X-VERSION:4{NEWLINE}").unwrap();
    write!(out, "#EXT-X-MEDIA-SEQUENCE:0{NEWLINE}").unwrap();

    for (i, pair) in breakpoints.windows(2).enumerate() {
        let length = pair[1] - pair[0];
        write!(out, "#EXTINF:{length:.3},{NEWLINE}").unwrap();
        write!(out, "{preset_name}.{:x}.ts{NEWLINE}", i + 1).unwrap();
    }

    write!(out, "#EXT-X-ENDLIST{NEWLINE}").unwrap();

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::presets::applicable_presets;

    #[test]
    fn master_lists_presets_descending() {
        let presets = applicable_presets(1920, 1080);
        let m3u8 = master_playlist(&presets, 1920, 1080);

        assert!(m3u8.starts_with("#EXTM3U"));
        let p1080 = m3u8.find("NAME=1080p").unwrap();
        let p360 = m3u8.find("NAME=360p").unwrap();
        assert!(p1080 < p360);
        assert!(m3u8.contains("RESOLUTION=1920x1080"));
        assert!(m3u8.contains("RESOLUTION=640x360"));
        assert!(m3u8.contains("quality-720p.m3u8"));
    }

    #[test]
    fn master_bandwidth_includes_overhead() {
        let presets = applicable_presets(640, 360);
        let m3u8 = master_playlist(&presets, 640, 360);
        // 360p: (800 + 96) * 1.05 * 1000
        assert!(m3u8.contains("BANDWIDTH=940800"));
    }

    #[test]
    fn variant_format_exact() {
        let breakpoints = [0.0, 3.5, 7.0, 9.5];
        let m3u8 = variant_playlist(&breakpoints, "720p", 4.75);

        let expected = "\
#EXTM3U
#EXT-X-PLAYLIST-TYPE:VOD
#EXT-X-TARGETDURATION:4.75
#EXT-X-VERSION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:3.500,
720p.1.ts
#EXTINF:3.500,
720p.2.ts
#EXTINF:2.500,
720p.3.ts
#EXT-X-ENDLIST
"
        .replace('\n', NEWLINE);
        assert_eq!(m3u8, expected);
    }

    #[test]
    fn variant_segment_indices_are_hex() {
        let breakpoints: Vec<f64> = (0..=30).map(|i| i as f64 * 3.5).collect();
        let m3u8 = variant_playlist(&breakpoints, "audio", 4.75);
        // Segment 26 (1-based) renders as hex 1a.
        assert!(m3u8.contains("audio.1a.ts"));
        assert!(!m3u8.contains("audio.26.ts"));
    }
}
