use std::path::Path;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::SplitSource;
use crate::paths::MAX_SEGMENTS;
use crate::probe;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("split point #{position} is '{token}', expected a frame number")]
    Malformed { position: usize, token: String },

    #[error("split point #{position} is frame 0; the first segment always starts at frame 0")]
    Zero { position: usize },

    #[error("split points must be strictly increasing, but #{position} ({frame}) follows {previous}")]
    NotIncreasing {
        position: usize,
        previous: u64,
        frame: u64,
    },

    #[error("split point #{position} ({frame}) is past the last frame (input has {total} frames)")]
    OutOfRange {
        position: usize,
        frame: u64,
        total: u64,
    },

    #[error("{segments} segments requested; at most {} can be named", MAX_SEGMENTS)]
    TooManySegments { segments: usize },

    #[error("cannot cut {frames} frames into {segments} even segments")]
    UnevenRequest { frames: u64, segments: usize },
}

/// Frame numbers at which segments 1.. begin, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitPoints(Vec<u64>);

impl SplitPoints {
    /// Checks ordering, range and segment budget before accepting the list.
    pub fn new(points: Vec<u64>, total_frames: Option<u64>) -> Result<Self, SplitError> {
        validate(&points, total_frames)?;
        Ok(Self(points))
    }

    pub fn frames(&self) -> &[u64] {
        &self.0
    }

    pub fn segment_count(&self) -> usize {
        self.0.len() + 1
    }

    /// One line, comma separated, as read by [`parse_csv`].
    pub fn to_csv(&self) -> String {
        self.0
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn validate(points: &[u64], total_frames: Option<u64>) -> Result<(), SplitError> {
    let segments = points.len() + 1;
    if segments > MAX_SEGMENTS {
        return Err(SplitError::TooManySegments { segments });
    }

    let mut previous = 0u64;
    for (i, &frame) in points.iter().enumerate() {
        let position = i + 1;
        if frame == 0 {
            return Err(SplitError::Zero { position });
        }
        if i > 0 && frame <= previous {
            return Err(SplitError::NotIncreasing {
                position,
                previous,
                frame,
            });
        }
        if let Some(total) = total_frames {
            if frame >= total {
                return Err(SplitError::OutOfRange {
                    position,
                    frame,
                    total,
                });
            }
        }
        previous = frame;
    }
    Ok(())
}

/// Parses `"100,250,400"`. Whitespace and a trailing newline are tolerated; an empty file
/// means "no splits".
pub fn parse_csv(text: &str) -> Result<Vec<u64>, SplitError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    trimmed
        .split(',')
        .enumerate()
        .map(|(i, token)| {
            let token = token.trim();
            token.parse::<u64>().map_err(|_| SplitError::Malformed {
                position: i + 1,
                token: token.to_string(),
            })
        })
        .collect()
}

/// Split points cutting `total_frames` into `segments` near-equal runs.
pub fn even_splits(total_frames: u64, segments: usize) -> Result<Vec<u64>, SplitError> {
    if segments == 0 || segments as u64 > total_frames {
        return Err(SplitError::UnevenRequest {
            frames: total_frames,
            segments,
        });
    }
    if segments > MAX_SEGMENTS {
        return Err(SplitError::TooManySegments { segments });
    }

    let n = segments as u64;
    Ok((1..n).map(|i| total_frames * i / n).collect())
}

pub fn read_file(path: &Path) -> Result<Vec<u64>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read split file {}", path.display()))?;
    let points =
        parse_csv(&text).with_context(|| format!("malformed split file {}", path.display()))?;
    Ok(points)
}

pub fn write_file(path: &Path, points: &SplitPoints) -> Result<()> {
    std::fs::write(path, format!("{}\n", points.to_csv()))
        .with_context(|| format!("failed to write split file {}", path.display()))
}

/// Produces validated split points for `input` from the configured source.
///
/// An existing split file wins over scene detection and is range checked when the frame count
/// can be probed. Detected scenes are written back so the next run skips detection.
pub fn resolve(source: &SplitSource, input: &Path) -> Result<SplitPoints> {
    match source {
        SplitSource::Even { segments } => {
            let total = probe::count_frames(input)?;
            let points = even_splits(total, *segments)?;
            info!(segments, total_frames = total, "cutting evenly");
            Ok(SplitPoints::new(points, Some(total))?)
        }
        SplitSource::File { path, .. } if path.exists() => {
            let points = read_file(path)?;
            let total = match probe::count_frames(input) {
                Ok(total) => Some(total),
                Err(err) => {
                    warn!("skipping range check of {}: {err:#}", path.display());
                    None
                }
            };
            let points = SplitPoints::new(points, total)
                .with_context(|| format!("invalid split file {}", path.display()))?;
            info!(
                file = %path.display(),
                segments = points.segment_count(),
                "using existing split points"
            );
            Ok(points)
        }
        SplitSource::File {
            path,
            scene_threshold,
        } => {
            let total = probe::count_frames(input)?;
            let frames = probe::detect_scenes(input, *scene_threshold)?;
            let frames: Vec<u64> = frames.into_iter().filter(|&f| f < total).collect();
            let points = SplitPoints::new(frames, Some(total))?;
            write_file(path, &points)?;
            info!(
                file = %path.display(),
                segments = points.segment_count(),
                "saved detected split points"
            );
            Ok(points)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parses_with_whitespace_and_newline() {
        assert_eq!(parse_csv("100, 250,400\n").unwrap(), vec![100, 250, 400]);
        assert_eq!(parse_csv("\n").unwrap(), Vec::<u64>::new());
        assert_eq!(
            parse_csv("100,abc").unwrap_err(),
            SplitError::Malformed {
                position: 2,
                token: "abc".into()
            }
        );
        assert!(matches!(
            parse_csv("100,,200"),
            Err(SplitError::Malformed { position: 2, .. })
        ));
    }

    #[test]
    fn validation_rejects_bad_orderings() {
        assert!(validate(&[], None).is_ok());
        assert!(validate(&[100, 250], Some(300)).is_ok());

        assert_eq!(validate(&[0, 10], None), Err(SplitError::Zero { position: 1 }));
        assert_eq!(
            validate(&[100, 100], None),
            Err(SplitError::NotIncreasing {
                position: 2,
                previous: 100,
                frame: 100
            })
        );
        assert_eq!(
            validate(&[250, 100], None),
            Err(SplitError::NotIncreasing {
                position: 2,
                previous: 250,
                frame: 100
            })
        );
        assert_eq!(
            validate(&[100, 300], Some(300)),
            Err(SplitError::OutOfRange {
                position: 2,
                frame: 300,
                total: 300
            })
        );
    }

    #[test]
    fn validation_caps_segment_count() {
        let points: Vec<u64> = (1..=MAX_SEGMENTS as u64).collect();
        assert_eq!(
            validate(&points, None),
            Err(SplitError::TooManySegments {
                segments: MAX_SEGMENTS + 1
            })
        );
        assert!(validate(&points[..MAX_SEGMENTS - 1], None).is_ok());
    }

    #[test]
    fn even_splits_cover_the_whole_input() {
        assert_eq!(even_splits(1000, 4).unwrap(), vec![250, 500, 750]);
        assert_eq!(even_splits(10, 3).unwrap(), vec![3, 6]);
        assert!(even_splits(1000, 1).unwrap().is_empty());
        assert!(even_splits(5, 0).is_err());
        assert!(even_splits(2, 3).is_err());

        let points = even_splits(997, 7).unwrap();
        assert!(validate(&points, Some(997)).is_ok());
    }

    #[test]
    fn written_files_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.mkv.csv");
        let points = SplitPoints::new(vec![24, 96], None).unwrap();
        write_file(&path, &points).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "24,96\n");
        assert_eq!(read_file(&path).unwrap(), vec![24, 96]);

        std::fs::write(&path, "24,x").unwrap();
        let err = read_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("'x'"), "{err:#}");
    }

    #[test]
    fn csv_roundtrips_through_split_points() {
        let points = SplitPoints::new(vec![12, 40, 41], Some(50)).unwrap();
        assert_eq!(points.to_csv(), "12,40,41");
        assert_eq!(points.segment_count(), 4);
        assert_eq!(parse_csv(&points.to_csv()).unwrap(), points.frames());

        let whole = SplitPoints::new(Vec::new(), Some(50)).unwrap();
        assert_eq!(whole.segment_count(), 1);
        assert!(whole.frames().is_empty());
        assert_eq!(whole.to_csv(), "");
    }
}
