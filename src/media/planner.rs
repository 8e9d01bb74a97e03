//! Segmentation planning.
//!
//! Turns a source's I-frame timestamps and duration into a vector of segment
//! boundaries ("breakpoints"). Boundaries snap to I-frames where possible so
//! ffmpeg can cut without re-seeking past a GOP, and long I-frame gaps are
//! subdivided evenly so no segment exceeds the tolerated maximum.

/// Default target segment length in seconds.
pub const DEFAULT_SEGMENT_LENGTH: f64 = 3.5;

/// Default tolerance around the target length.
pub const DEFAULT_SEGMENT_OFFSET: f64 = 1.25;

/// Compute segment boundaries for a source.
///
/// The result always starts at `0.0` and ends at `duration`, strictly
/// increasing. Every gap is at most `target + tolerance`; gaps are at least
/// `target - tolerance` except possibly the final one, which may absorb a
/// trailing remainder shorter than the minimum.
pub fn plan_segments(iframes: &[f64], duration: f64, target: f64, tolerance: f64) -> Vec<f64> {
    let min_seg = target - tolerance;
    let max_seg = target + tolerance;

    let mut out = vec![0.0];
    let mut last = 0.0_f64;

    for &t in iframes.iter().chain(std::iter::once(&duration)) {
        let gap = t - last;
        if gap < min_seg {
            // Too close to the previous boundary; coalesce.
            continue;
        } else if gap < max_seg {
            out.push(t);
            last = t;
        } else {
            // Subdivide the long gap evenly, then land exactly on `t` to
            // avoid accumulating float error.
            let k = (gap / target).ceil() as usize;
            let width = gap / k as f64;
            for j in 1..k {
                out.push(last + width * j as f64);
            }
            out.push(t);
            last = t;
        }
    }

    // Normalize the tail so the plan ends exactly at `duration`. When the
    // final candidate was coalesced away, this replaces the last boundary
    // with `duration`; if the merged segment would exceed the maximum, a
    // midpoint keeps it in bounds.
    if out.len() > 1 {
        out.pop();
    }
    let prev = *out.last().expect("plan always contains the origin");
    if duration - prev > max_seg {
        out.push((prev + duration) / 2.0);
    }
    out.push(duration);

    out
}

/// [`plan_segments`] with the default target and tolerance.
pub fn plan_segments_default(iframes: &[f64], duration: f64) -> Vec<f64> {
    plan_segments(iframes, duration, DEFAULT_SEGMENT_LENGTH, DEFAULT_SEGMENT_OFFSET)
}
