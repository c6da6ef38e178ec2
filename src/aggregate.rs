//! The `segmake progress` side of the progress FIFO: folds per-segment reports into one
//! frame total and decides when the run is over.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use crate::paths::{segment_indices, Ext, SegmentIndex, Stage, TempLayout};
use crate::progress::{ProgressConfig, ProgressDisplay};
use crate::protocol::{self, LineSplitter, ProgressEvent, ProgressRecord};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    AllSegmentsDone,
    FrameTotalReached,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::AllSegmentsDone => "all-segments-done",
            FinishReason::FrameTotalReached => "frame-total-reached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ignored {
    /// Count lower than one already seen for the segment.
    Regressed,
    Unchanged,
    AfterDone,
    DuplicateDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Advanced { delta: u64, frames: u64 },
    Finished,
    Ignored(Ignored),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct SegmentProgress {
    frames: u64,
    done: bool,
}

/// Per-segment bookkeeping. Ids outside `0..expected` are tracked but never count toward
/// completion.
#[derive(Debug, Clone)]
pub struct Tracker {
    expected: usize,
    total_frames: u64,
    cumulative: u64,
    done_expected: usize,
    segments: BTreeMap<String, SegmentProgress>,
}

impl Tracker {
    pub fn new(expected: usize, total_frames: u64) -> Self {
        Self {
            expected,
            total_frames,
            cumulative: 0,
            done_expected: 0,
            segments: BTreeMap::new(),
        }
    }

    fn is_expected(&self, segment: &str) -> bool {
        SegmentIndex::parse_stem(segment).is_some_and(|i| i.0 < self.expected)
    }

    /// Marks a segment finished before any report arrives, crediting `frames`.
    pub fn credit_completed(&mut self, index: SegmentIndex, frames: u64) {
        let stem = index.stem();
        let record = ProgressRecord::frames(stem.clone(), frames);
        self.apply(&record);
        self.apply(&ProgressRecord::done(stem));
    }

    pub fn apply(&mut self, record: &ProgressRecord) -> Applied {
        let expected = self.is_expected(&record.segment);
        let entry = self.segments.entry(record.segment.clone()).or_default();
        if entry.done {
            return Applied::Ignored(match record.event {
                ProgressEvent::Done => Ignored::DuplicateDone,
                ProgressEvent::Frames(_) => Ignored::AfterDone,
            });
        }

        match record.event {
            ProgressEvent::Frames(frames) => {
                if frames < entry.frames {
                    return Applied::Ignored(Ignored::Regressed);
                }
                let delta = frames - entry.frames;
                if delta == 0 {
                    return Applied::Ignored(Ignored::Unchanged);
                }
                entry.frames = frames;
                self.cumulative = self.cumulative.saturating_add(delta);
                Applied::Advanced { delta, frames }
            }
            ProgressEvent::Done => {
                entry.done = true;
                if expected {
                    self.done_expected += 1;
                }
                Applied::Finished
            }
        }
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        if self.done_expected >= self.expected {
            Some(FinishReason::AllSegmentsDone)
        } else if self.total_frames > 0 && self.cumulative >= self.total_frames {
            Some(FinishReason::FrameTotalReached)
        } else {
            None
        }
    }

    pub fn cumulative_frames(&self) -> u64 {
        self.cumulative
    }

    pub fn done_segments(&self) -> usize {
        self.done_expected
    }

    pub fn expected_segments(&self) -> usize {
        self.expected
    }
}

/// Why reading stopped before the run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The watched process (the `make` that launched us) exited.
    WatcherExited,
    /// The FIFO disappeared, usually through `make clean`.
    SinkRemoved,
}

impl Interruption {
    pub fn as_str(self) -> &'static str {
        match self {
            Interruption::WatcherExited => "make-exited",
            Interruption::SinkRemoved => "sink-removed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub sink: PathBuf,
    pub total_frames: u64,
    pub segments: usize,
    pub tempdir: Option<PathBuf>,
    /// Stop once this process is gone.
    pub watch_pid: Option<u32>,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone)]
pub struct AggregateSummary {
    pub reason: Option<FinishReason>,
    pub interrupted: Option<Interruption>,
    pub segments_done: usize,
    pub segments: usize,
    pub frames: u64,
    pub total_frames: u64,
    pub malformed_lines: usize,
    pub elapsed: Duration,
    pub avg_fps: f64,
    pub warning_count: usize,
}

impl AggregateSummary {
    pub fn outcome(&self) -> &'static str {
        match (self.reason, self.interrupted) {
            (Some(reason), _) => reason.as_str(),
            (None, Some(why)) => why.as_str(),
            (None, None) => "incomplete",
        }
    }
}

/// Split checkpoint counts for every segment that has one.
pub fn split_frame_counts(tempdir: &Path, segments: usize) -> BTreeMap<String, u64> {
    let layout = TempLayout::from_dir(tempdir);
    segment_indices(segments)
        .filter_map(|idx| {
            let text =
                std::fs::read_to_string(layout.segment_path(Stage::Split, idx, Ext::FrameCount))
                    .ok()?;
            Some((idx.stem(), text.trim().parse::<u64>().ok()?))
        })
        .collect()
}

/// Credits segments whose encode already exists with their split frame count, or 0.
pub fn credit_existing(tracker: &mut Tracker, tempdir: &Path, counts: &BTreeMap<String, u64>) -> usize {
    let layout = TempLayout::from_dir(tempdir);
    let mut credited = 0;
    for idx in segment_indices(tracker.expected_segments()) {
        if !layout.segment_path(Stage::Encode, idx, Ext::Mkv).is_file() {
            continue;
        }
        let frames = counts.get(&idx.stem()).copied().unwrap_or(0);
        tracker.credit_completed(idx, frames);
        credited += 1;
    }
    credited
}

fn is_fifo(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata(path)
            .map(|m| m.file_type().is_fifo())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        false
    }
}

/// Signal 0 probes for existence without touching the process.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    !matches!(kill(Pid::from_raw(raw), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

fn interruption(config: &AggregatorConfig) -> Option<Interruption> {
    if !config.sink.exists() {
        return Some(Interruption::SinkRemoved);
    }
    match config.watch_pid {
        Some(pid) if !process_alive(pid) => Some(Interruption::WatcherExited),
        _ => None,
    }
}

/// Tracker plus display, fed one line at a time.
struct Feed {
    tracker: Tracker,
    display: ProgressDisplay,
    malformed: usize,
}

impl Feed {
    fn finished(&self) -> bool {
        self.tracker.finish_reason().is_some()
    }

    fn line(&mut self, line: &str) {
        // Lines after the finish are drained unread.
        if line.trim().is_empty() || self.finished() {
            return;
        }
        let record = match protocol::parse_line(line) {
            Ok(record) => record,
            Err(err) => {
                self.malformed += 1;
                self.display.warn(format!("skipping progress line: {err}"));
                return;
            }
        };
        match self.tracker.apply(&record) {
            Applied::Advanced { delta, frames } => {
                self.display.advance(&record.segment, frames, delta)
            }
            Applied::Finished => self
                .display
                .finish_segment(&record.segment, self.tracker.done_segments()),
            Applied::Ignored(why) => {
                debug!(segment = %record.segment, ?why, "progress line ignored")
            }
        }
    }
}

fn read_file_once(path: &Path, feed: &mut Feed) -> Result<()> {
    let file = File::open(path)
        .with_context(|| format!("failed to open progress sink {}", path.display()))?;
    for line in BufReader::new(file).lines() {
        let line =
            line.with_context(|| format!("failed to read progress sink {}", path.display()))?;
        feed.line(&line);
    }
    Ok(())
}

#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pumped {
    /// No writer is attached.
    Eof,
    /// Writers are attached but nothing is buffered.
    Empty,
}

/// Feeds everything currently buffered in the FIFO.
#[cfg(unix)]
fn pump(
    fifo: &mut File,
    splitter: &mut LineSplitter,
    feed: &mut Feed,
) -> std::io::Result<Pumped> {
    use std::io::{ErrorKind, Read};

    let mut buf = [0u8; 4096];
    let mut lines = Vec::new();
    loop {
        match fifo.read(&mut buf) {
            Ok(0) => return Ok(Pumped::Eof),
            Ok(n) => {
                splitter.push(&buf[..n], &mut lines);
                for line in lines.drain(..) {
                    feed.line(&line);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(Pumped::Empty),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Polls a non-blocking read end until the run finishes and no writer is left, or until
/// something outside says the run is over.
#[cfg(unix)]
fn follow_fifo(config: &AggregatorConfig, feed: &mut Feed) -> Result<Option<Interruption>> {
    use std::os::unix::fs::OpenOptionsExt;

    let read_context = || format!("failed to read progress sink {}", config.sink.display());
    let mut fifo = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(nix::libc::O_NONBLOCK)
        .open(&config.sink)
        .with_context(|| format!("failed to open progress sink {}", config.sink.display()))?;
    let mut splitter = LineSplitter::new();

    loop {
        let pumped = pump(&mut fifo, &mut splitter, feed).with_context(read_context)?;
        if pumped == Pumped::Eof && feed.finished() {
            return Ok(None);
        }
        if let Some(why) = interruption(config) {
            // Lines written just before the stop still count.
            pump(&mut fifo, &mut splitter, feed).with_context(read_context)?;
            return Ok((!feed.finished()).then_some(why));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(not(unix))]
fn follow_fifo(config: &AggregatorConfig, feed: &mut Feed) -> Result<Option<Interruption>> {
    read_file_once(&config.sink, feed).map(|()| None)
}

/// Reads progress lines from `config.sink` until the run finishes, then drains whatever
/// writers are still attached. A FIFO is polled and survives writers coming and going; any
/// other file is read once.
pub fn run_aggregator(config: &AggregatorConfig) -> Result<AggregateSummary> {
    let mut tracker = Tracker::new(config.segments, config.total_frames);
    let counts = match &config.tempdir {
        Some(dir) => split_frame_counts(dir, config.segments),
        None => BTreeMap::new(),
    };
    let credited = match &config.tempdir {
        Some(dir) => credit_existing(&mut tracker, dir, &counts),
        None => 0,
    };

    let display = ProgressDisplay::new(config.total_frames, config.segments, counts, config.progress);
    if credited > 0 {
        display.credit(tracker.cumulative_frames(), tracker.done_segments());
        display.note(format!("{credited} segment(s) already encoded"));
    }

    let mut feed = Feed {
        tracker,
        display,
        malformed: 0,
    };
    let interrupted = if feed.finished() {
        None
    } else if is_fifo(&config.sink) {
        follow_fifo(config, &mut feed)?
    } else {
        read_file_once(&config.sink, &mut feed)?;
        None
    };

    let reason = feed.tracker.finish_reason();
    let message = match (reason, interrupted) {
        (Some(r), _) => format!("finished ({})", r.as_str()),
        (None, Some(why)) => format!("stopped early ({})", why.as_str()),
        (None, None) => "progress input ended early".to_string(),
    };
    let Feed {
        tracker,
        display,
        malformed,
    } = feed;
    let stats = display.close(&message);

    Ok(AggregateSummary {
        reason,
        interrupted,
        segments_done: tracker.done_segments(),
        segments: tracker.expected_segments(),
        frames: tracker.cumulative_frames(),
        total_frames: config.total_frames,
        malformed_lines: malformed,
        elapsed: stats.elapsed,
        avg_fps: stats.avg_fps,
        warning_count: stats.warning_count,
    })
}
