//! Queries against the source video, done once at generation time.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use regex::Regex;
use tracing::{debug, info};

use crate::tools::require;

fn ffprobe_stream_entry(input: &Path, extra: &[&str], entry: &str) -> Result<String> {
    let ffprobe = require("ffprobe")?;
    let out = Command::new(ffprobe)
        .args(["-v", "error", "-select_streams", "v:0"])
        .args(extra)
        .args(["-show_entries", entry, "-of", "csv=p=0"])
        .arg(input)
        .output()
        .context("failed to run ffprobe")?;
    if !out.status.success() {
        bail!(
            "ffprobe failed on {}: {}",
            input.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Video frame count from the container's packets, without decoding.
pub fn count_frames(input: &Path) -> Result<u64> {
    let text = ffprobe_stream_entry(input, &["-count_packets"], "stream=nb_read_packets")?;
    let frames = text
        .trim_end_matches(',')
        .parse::<u64>()
        .with_context(|| format!("ffprobe reported {text:?} packets for {}", input.display()))?;
    debug!(frames, input = %input.display(), "counted frames");
    Ok(frames)
}

pub fn frame_rate(input: &Path) -> Result<f64> {
    let text = ffprobe_stream_entry(input, &[], "stream=r_frame_rate")?;
    parse_frame_rate(&text)
        .with_context(|| format!("ffprobe reported frame rate {text:?} for {}", input.display()))
}

/// `"24000/1001"` or `"25"`.
pub fn parse_frame_rate(text: &str) -> Option<f64> {
    let text = text.trim().trim_end_matches(',');
    let rate = match text.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.parse().ok()?;
            let den: f64 = den.parse().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => text.parse().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}

/// Timestamps (seconds) of frames `showinfo` printed.
pub fn parse_scene_times(stderr: &str) -> Vec<f64> {
    let Ok(pattern) = Regex::new(r"Parsed_showinfo.*\bpts_time:\s*(-?[0-9.]+)") else {
        return Vec::new();
    };
    stderr
        .lines()
        .filter_map(|line| pattern.captures(line))
        .filter_map(|c| c.get(1)?.as_str().parse().ok())
        .collect()
}

/// Frame numbers for scene-change timestamps: positive, strictly increasing.
pub fn times_to_frames(times: &[f64], fps: f64) -> Vec<u64> {
    let mut frames: Vec<u64> = Vec::with_capacity(times.len());
    for &t in times {
        let frame = (t * fps).round();
        if frame < 1.0 {
            continue;
        }
        let frame = frame as u64;
        if frames.last().is_some_and(|&last| frame <= last) {
            continue;
        }
        frames.push(frame);
    }
    frames
}

/// Runs ffmpeg's scene-change filter over the first video stream.
pub fn detect_scenes(input: &Path, threshold: f64) -> Result<Vec<u64>> {
    let fps = frame_rate(input)?;
    let ffmpeg = require("ffmpeg")?;
    info!(input = %input.display(), threshold, "detecting scene changes; this decodes the whole video");

    let filter = format!("select='gt(scene,{threshold})',showinfo");
    let out = Command::new(ffmpeg)
        .args(["-hide_banner", "-nostdin", "-i"])
        .arg(input)
        .args(["-map", "0:v:0", "-vf", filter.as_str(), "-f", "null", "-"])
        .output()
        .context("failed to run ffmpeg scene detection")?;
    let stderr = String::from_utf8_lossy(&out.stderr);
    if !out.status.success() {
        bail!(
            "ffmpeg scene detection failed on {}: {}",
            input.display(),
            stderr.lines().last().unwrap_or_default()
        );
    }

    let frames = times_to_frames(&parse_scene_times(&stderr), fps);
    info!(scenes = frames.len(), "scene detection finished");
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rates_parse() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("25\n"), Some(25.0));
        let ntsc = parse_frame_rate("24000/1001").unwrap();
        assert!((ntsc - 23.976).abs() < 0.001);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("N/A"), None);
    }

    #[test]
    fn showinfo_lines_yield_timestamps() {
        let stderr = "\
[Parsed_showinfo_1 @ 0x55] config in time_base: 1/1000, frame_rate: 25/1
[Parsed_showinfo_1 @ 0x55] n:   0 pts:   4000 pts_time:4       duration: 40 fmt:yuv420p
[Parsed_showinfo_1 @ 0x55] n:   1 pts:  10480 pts_time:10.48   duration: 40 fmt:yuv420p
frame=    2 fps=0.0 q=-0.0 Lsize=N/A time=00:00:10.48
";
        assert_eq!(parse_scene_times(stderr), vec![4.0, 10.48]);
    }

    #[test]
    fn timestamps_become_valid_split_frames() {
        let frames = times_to_frames(&[0.0, 0.01, 4.0, 4.01, 10.48, 9.0], 25.0);
        assert_eq!(frames, vec![100, 262]);
        assert!(crate::splits::validate(&frames, Some(300)).is_ok());
    }
}
