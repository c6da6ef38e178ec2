//! The `segmake report` side of the progress FIFO: turns one encoder's status output into
//! protocol lines.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

use crate::encoder::ProgressFormat;
use crate::protocol::{LineSplitter, ProgressRecord};

const DONE_ATTEMPTS: usize = 40;
const DONE_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Pulls the running frame counter out of one status line.
pub struct FrameExtractor {
    pattern: Regex,
    format: ProgressFormat,
}

impl FrameExtractor {
    pub fn new(format: ProgressFormat) -> Result<Self> {
        let pattern = match format {
            ProgressFormat::Ffmpeg => r"frame=\s*(\d+)",
            ProgressFormat::Svt => r"Encoding frame\s+(\d+)",
        };
        let pattern = Regex::new(pattern).context("invalid frame pattern")?;
        Ok(Self { pattern, format })
    }

    pub fn frames(&self, line: &str) -> Option<u64> {
        self.pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Whether a non-progress line is worth passing through to the user.
    fn is_chatter(&self, line: &str) -> bool {
        match self.format {
            ProgressFormat::Ffmpeg => false,
            ProgressFormat::Svt => line.starts_with("Svt[info]"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Sent,
    Dropped,
}

/// Lazily connected, never-blocking writer for the progress FIFO.
pub struct SinkWriter {
    path: PathBuf,
    file: Option<File>,
}

#[cfg(unix)]
fn open_sink(path: &Path) -> io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    // Fails with ENXIO instead of blocking when no aggregator holds the read end.
    OpenOptions::new()
        .append(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(path)
}

#[cfg(not(unix))]
fn open_sink(path: &Path) -> io::Result<File> {
    OpenOptions::new().append(true).open(path)
}

impl SinkWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    fn connect(&mut self) -> Option<&mut File> {
        if self.file.is_none() {
            match open_sink(&self.path) {
                Ok(file) => self.file = Some(file),
                Err(err) => {
                    debug!(sink = %self.path.display(), %err, "progress sink not available");
                    return None;
                }
            }
        }
        self.file.as_mut()
    }

    /// One attempt at writing `line` with a single `write` call.
    fn try_send(&mut self, line: &str) -> Result<Delivery, io::ErrorKind> {
        let Some(file) = self.connect() else {
            return Ok(Delivery::Dropped);
        };
        match file.write(line.as_bytes()) {
            Ok(n) if n == line.len() => Ok(Delivery::Sent),
            Ok(_) => {
                self.file = None;
                Ok(Delivery::Dropped)
            }
            Err(err) => {
                // EPIPE: the aggregator went away. Reconnect on the next line.
                self.file = None;
                Err(err.kind())
            }
        }
    }

    fn send(&mut self, record: &ProgressRecord) -> Delivery {
        self.try_send(&record.to_line()).unwrap_or(Delivery::Dropped)
    }

    /// Like [`SinkWriter::send`], but waits out a full pipe for a while.
    fn send_final(&mut self, record: &ProgressRecord) -> Delivery {
        let line = record.to_line();
        for _ in 0..DONE_ATTEMPTS {
            match self.try_send(&line) {
                Ok(delivery) => return delivery,
                Err(io::ErrorKind::WouldBlock) => thread::sleep(DONE_RETRY_DELAY),
                Err(_) => return Delivery::Dropped,
            }
        }
        Delivery::Dropped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub last_frames: Option<u64>,
    pub sent: usize,
    pub dropped: usize,
    pub forwarded: usize,
    pub done_sent: bool,
}

/// Relays `input` (an encoder's stderr) to `sink` as protocol lines for `segment`, passing
/// every other line through to `diag`. Progress loss is never an error.
pub fn relay<R: Read, W: Write>(
    segment: &str,
    extractor: &FrameExtractor,
    sink: &mut SinkWriter,
    mut input: R,
    mut diag: W,
) -> Result<ReportSummary> {
    let mut summary = ReportSummary::default();
    let mut splitter = LineSplitter::new();
    let mut lines = Vec::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("failed to read encoder output"),
        };
        splitter.push(&buf[..n], &mut lines);
        handle_lines(segment, extractor, sink, &mut diag, &mut lines, &mut summary)?;
    }
    splitter.finish(&mut lines);
    handle_lines(segment, extractor, sink, &mut diag, &mut lines, &mut summary)?;

    summary.done_sent = sink.send_final(&ProgressRecord::done(segment)) == Delivery::Sent;
    Ok(summary)
}

fn handle_lines<W: Write>(
    segment: &str,
    extractor: &FrameExtractor,
    sink: &mut SinkWriter,
    diag: &mut W,
    lines: &mut Vec<String>,
    summary: &mut ReportSummary,
) -> Result<()> {
    for line in lines.drain(..) {
        match extractor.frames(&line) {
            Some(frames) => {
                if summary.last_frames.is_some_and(|last| frames <= last) {
                    continue;
                }
                summary.last_frames = Some(frames);
                match sink.send(&ProgressRecord::frames(segment, frames)) {
                    Delivery::Sent => summary.sent += 1,
                    Delivery::Dropped => summary.dropped += 1,
                }
            }
            None if extractor.is_chatter(&line) => {}
            None => {
                writeln!(diag, "{line}").context("failed to forward encoder output")?;
                summary.forwarded += 1;
            }
        }
    }
    Ok(())
}

/// Entry point for `segmake report`: stdin to FIFO, diagnostics to stderr.
pub fn run_report(segment: &str, format: ProgressFormat, sink: &Path) -> Result<ReportSummary> {
    anyhow::ensure!(
        !segment.is_empty() && !segment.contains(['\t', '\n', '\r']),
        "segment id {segment:?} cannot be written to the progress protocol"
    );
    let extractor = FrameExtractor::new(format)?;
    let mut writer = SinkWriter::new(sink);
    let summary = relay(
        segment,
        &extractor,
        &mut writer,
        io::stdin().lock(),
        io::stderr().lock(),
    )?;
    debug!(
        segment,
        sent = summary.sent,
        dropped = summary.dropped,
        forwarded = summary.forwarded,
        done = summary.done_sent,
        "progress relay finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::parse_line;

    fn relay_to_file(
        format: ProgressFormat,
        input: &[u8],
    ) -> (ReportSummary, Vec<ProgressRecord>, String) {
        let dir = tempfile::tempdir().unwrap();
        let sink_path = dir.path().join("sink.log");
        std::fs::write(&sink_path, "").unwrap();

        let extractor = FrameExtractor::new(format).unwrap();
        let mut sink = SinkWriter::new(&sink_path);
        let mut diag = Vec::new();
        let summary = relay("00004", &extractor, &mut sink, input, &mut diag).unwrap();

        let records = std::fs::read_to_string(&sink_path)
            .unwrap()
            .lines()
            .map(|l| parse_line(l).unwrap())
            .collect();
        (summary, records, String::from_utf8(diag).unwrap())
    }

    #[test]
    fn ffmpeg_status_becomes_monotonic_records() {
        let input = b"Input #0, matroska\rframe=   10 fps=0.0 q=28.0\rframe=   25 fps=24\r\
frame=   25 fps=24\rframe=   20 fps=24\rframe=   40 fps=25\n[libx265] warning: odd thing\n";
        let (summary, records, diag) = relay_to_file(ProgressFormat::Ffmpeg, input);

        assert_eq!(
            records,
            vec![
                ProgressRecord::frames("00004", 10),
                ProgressRecord::frames("00004", 25),
                ProgressRecord::frames("00004", 40),
                ProgressRecord::done("00004"),
            ]
        );
        assert!(summary.done_sent);
        assert_eq!(summary.last_frames, Some(40));
        assert!(diag.contains("Input #0, matroska"));
        assert!(diag.contains("[libx265] warning: odd thing"));
        assert!(!diag.contains("frame="));
    }

    #[test]
    fn svt_backspace_redraws_are_split() {
        let input = b"Svt[info]: preset 8\nEncoding frame    12 1.2 kbps\x08\x08\x08\x08Encoding frame    30 1.3 kbps\x08\x08Svt[error]: out of memory\n";
        let (_, records, diag) = relay_to_file(ProgressFormat::Svt, input);

        assert_eq!(
            records,
            vec![
                ProgressRecord::frames("00004", 12),
                ProgressRecord::frames("00004", 30),
                ProgressRecord::done("00004"),
            ]
        );
        assert!(!diag.contains("Svt[info]"));
        assert!(diag.contains("Svt[error]: out of memory"));
    }

    #[test]
    fn missing_sink_drops_progress_without_failing() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FrameExtractor::new(ProgressFormat::Ffmpeg).unwrap();
        let mut sink = SinkWriter::new(dir.path().join("absent.fifo"));
        let summary = relay(
            "00000",
            &extractor,
            &mut sink,
            &b"frame=1\rframe=2\r"[..],
            io::sink(),
        )
        .unwrap();

        assert_eq!(summary.sent, 0);
        assert_eq!(summary.dropped, 2);
        assert!(!summary.done_sent);
    }

    #[test]
    fn tabs_in_segment_ids_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_report("a\tb", ProgressFormat::Ffmpeg, &dir.path().join("x")).unwrap_err();
        assert!(err.to_string().contains("segment id"));
    }

    #[cfg(unix)]
    #[test]
    fn fifo_without_reader_never_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("progress.fifo");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let extractor = FrameExtractor::new(ProgressFormat::Ffmpeg).unwrap();
        let mut sink = SinkWriter::new(&fifo);
        let summary = relay("00001", &extractor, &mut sink, &b"frame=5\r"[..], io::sink()).unwrap();
        assert_eq!(summary.dropped, 1);
        assert!(!summary.done_sent);
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_writers_feed_one_aggregator() {
        use crate::aggregate::{run_aggregator, AggregatorConfig, FinishReason};
        use crate::progress::{ProgressConfig, ProgressMode};

        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("progress.fifo");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let config = AggregatorConfig {
            sink: fifo.clone(),
            total_frames: 1_000_000,
            segments: 3,
            tempdir: None,
            watch_pid: None,
            progress: ProgressConfig::new(ProgressMode::Quiet),
        };
        let aggregator = thread::spawn(move || run_aggregator(&config));

        let writers: Vec<_> = (0..3)
            .map(|i| {
                let fifo = fifo.clone();
                thread::spawn(move || {
                    let extractor = FrameExtractor::new(ProgressFormat::Ffmpeg).unwrap();
                    let input: Vec<u8> = (1..=50)
                        .flat_map(|n| format!("frame={}\r", n * 2).into_bytes())
                        .collect();
                    // Keep retrying until the aggregator has the read end open.
                    loop {
                        let mut sink = SinkWriter::new(&fifo);
                        let summary = relay(
                            &format!("{i:05}"),
                            &extractor,
                            &mut sink,
                            &input[..],
                            io::sink(),
                        )
                        .unwrap();
                        if summary.done_sent {
                            break;
                        }
                        thread::sleep(Duration::from_millis(20));
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        let summary = aggregator.join().unwrap().unwrap();
        assert_eq!(summary.reason, Some(FinishReason::AllSegmentsDone));
        assert_eq!(summary.segments_done, 3);
        assert_eq!(summary.malformed_lines, 0);
    }
}
