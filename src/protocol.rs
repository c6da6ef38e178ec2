// Progress line format, one record per line:
//   <segment>\t<frames>   frames encoded so far, non-decreasing per segment
//   <segment>\tdone       terminal marker, nothing follows for that segment
use std::fmt;

pub const DONE: &str = "done";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    Frames(u64),
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub segment: String,
    pub event: ProgressEvent,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("progress line has no tab separator: {0:?}")]
    MissingSeparator(String),
    #[error("progress line has an empty segment id: {0:?}")]
    EmptySegment(String),
    #[error("progress line has neither a frame count nor 'done': {0:?}")]
    BadEvent(String),
}

impl ProgressRecord {
    pub fn frames(segment: impl Into<String>, frames: u64) -> Self {
        Self {
            segment: segment.into(),
            event: ProgressEvent::Frames(frames),
        }
    }

    pub fn done(segment: impl Into<String>) -> Self {
        Self {
            segment: segment.into(),
            event: ProgressEvent::Done,
        }
    }

    /// The record as one newline-terminated line, ready for a single `write`.
    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.event {
            ProgressEvent::Frames(n) => write!(f, "{}\t{}", self.segment, n),
            ProgressEvent::Done => write!(f, "{}\t{}", self.segment, DONE),
        }
    }
}

pub fn parse_line(line: &str) -> Result<ProgressRecord, ProtocolError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (segment, value) = line
        .split_once('\t')
        .ok_or_else(|| ProtocolError::MissingSeparator(line.to_string()))?;

    let segment = segment.trim();
    if segment.is_empty() {
        return Err(ProtocolError::EmptySegment(line.to_string()));
    }

    let value = value.trim();
    let event = if value == DONE {
        ProgressEvent::Done
    } else {
        value
            .parse::<u64>()
            .map(ProgressEvent::Frames)
            .map_err(|_| ProtocolError::BadEvent(line.to_string()))?
    };

    Ok(ProgressRecord {
        segment: segment.to_string(),
        event,
    })
}

/// Streaming splitter for encoder status output.
///
/// Encoders redraw their status line with `\r` (ffmpeg) or backspaces (SVT-AV1), so every
/// one of `\n`, `\r` and `\x08` ends a line. Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<String>) {
        for &b in bytes {
            if matches!(b, b'\n' | b'\r' | 0x08) {
                self.flush_into(out);
            } else {
                self.buf.push(b);
            }
        }
    }

    /// Emits whatever is buffered, for end of input.
    pub fn finish(&mut self, out: &mut Vec<String>) {
        self.flush_into(out);
    }

    fn flush_into(&mut self, out: &mut Vec<String>) {
        if self.buf.is_empty() {
            return;
        }
        let line = String::from_utf8_lossy(&self.buf).trim().to_string();
        self.buf.clear();
        if !line.is_empty() {
            out.push(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_parse_into_records() {
        assert_eq!(
            parse_line("00003\t120\n").unwrap(),
            ProgressRecord::frames("00003", 120)
        );
        assert_eq!(parse_line("00003\tdone").unwrap(), ProgressRecord::done("00003"));
        assert_eq!(
            ProgressRecord::frames("00001", 7).to_line(),
            "00001\t7\n".to_string()
        );
        assert_eq!(ProgressRecord::done("00001").to_line(), "00001\tdone\n");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(matches!(
            parse_line("00003 120"),
            Err(ProtocolError::MissingSeparator(_))
        ));
        assert!(matches!(parse_line("\t120"), Err(ProtocolError::EmptySegment(_))));
        assert!(matches!(
            parse_line("00003\t-4"),
            Err(ProtocolError::BadEvent(_))
        ));
        assert!(matches!(
            parse_line("00003\tfinished"),
            Err(ProtocolError::BadEvent(_))
        ));
    }

    #[test]
    fn splitter_handles_redraws_and_partial_chunks() {
        let mut splitter = LineSplitter::new();
        let mut out = Vec::new();

        splitter.push(b"frame=   10 fps=0.0\rframe=  2", &mut out);
        assert_eq!(out, vec!["frame=   10 fps=0.0".to_string()]);

        splitter.push(b"0 fps=9.5\r\n\x08\x08Encoding frame 3", &mut out);
        splitter.finish(&mut out);
        assert_eq!(
            out,
            vec![
                "frame=   10 fps=0.0".to_string(),
                "frame=  20 fps=9.5".to_string(),
                "Encoding frame 3".to_string(),
            ]
        );
    }
}
