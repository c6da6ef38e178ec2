//! Terminal display for one `segmake progress` run: an overall frame bar with a segment
//! counter, one row per segment being encoded, and an idle warning when frames stop arriving.

use clap::ValueEnum;
use indicatif::{HumanCount, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Encoding segments named in a plain progress line before it says `+N`.
const PLAIN_ROWS_NAMED: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedProgressMode {
    Rich,
    Plain,
    Quiet,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// No new frames for this long while segments are still open raises a warning.
    pub idle_threshold: Duration,
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            mode: ProgressMode::Auto,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(2),
            tty_override: None,
        }
    }
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    pub fn resolve_mode(self) -> ResolvedProgressMode {
        let tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        match (self.mode, tty) {
            (ProgressMode::Auto, true) | (ProgressMode::Rich, _) => ResolvedProgressMode::Rich,
            (ProgressMode::Auto, false) | (ProgressMode::Plain, _) => ResolvedProgressMode::Plain,
            (ProgressMode::Quiet, _) => ResolvedProgressMode::Quiet,
        }
    }
}

/// Totals handed back when the display closes.
#[derive(Debug, Clone, Copy)]
pub struct DisplayStats {
    pub elapsed: Duration,
    pub avg_fps: f64,
    pub warning_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowState {
    Encoding,
    Done,
}

#[derive(Debug, Clone)]
struct SegmentRow {
    frames: u64,
    /// Frames in the split segment, when its checkpoint was readable at start-up.
    expected: Option<u64>,
    state: RowState,
}

/// Exponentially smoothed frames-per-second; segments report in bursts.
#[derive(Debug)]
struct RateMeter {
    sampled_at: Instant,
    sampled_frames: u64,
    fps: f64,
}

impl RateMeter {
    fn new(now: Instant) -> Self {
        Self {
            sampled_at: now,
            sampled_frames: 0,
            fps: 0.0,
        }
    }

    fn observe(&mut self, now: Instant, frames: u64) {
        let dt = now.duration_since(self.sampled_at).as_secs_f64();
        if dt < 0.5 {
            return;
        }
        let current = frames.saturating_sub(self.sampled_frames) as f64 / dt;
        self.fps = if self.fps <= f64::EPSILON {
            current
        } else {
            self.fps * 0.7 + current * 0.3
        };
        self.sampled_at = now;
        self.sampled_frames = frames;
    }
}

#[derive(Debug)]
struct Board {
    started: Instant,
    total_frames: u64,
    frames: u64,
    segments: usize,
    segments_done: usize,
    expected: BTreeMap<String, u64>,
    rows: BTreeMap<String, SegmentRow>,
    last_frame_at: Instant,
    last_idle_warn: Option<Instant>,
    last_plain_line: Option<Instant>,
    rate: RateMeter,
    warnings: usize,
}

impl Board {
    fn new(
        total_frames: u64,
        segments: usize,
        expected: BTreeMap<String, u64>,
        now: Instant,
    ) -> Self {
        Self {
            started: now,
            total_frames,
            frames: 0,
            segments,
            segments_done: 0,
            expected,
            rows: BTreeMap::new(),
            last_frame_at: now,
            last_idle_warn: None,
            last_plain_line: None,
            rate: RateMeter::new(now),
            warnings: 0,
        }
    }

    /// Returns the row when this is the segment's first report.
    fn advance(&mut self, segment: &str, frames: u64, delta: u64, now: Instant) -> Option<&SegmentRow> {
        self.frames = self.frames.saturating_add(delta);
        self.last_frame_at = now;
        self.rate.observe(now, self.frames);

        let mut opened = false;
        let expected = self.expected.get(segment).copied();
        let row = self.rows.entry(segment.to_string()).or_insert_with(|| {
            opened = true;
            SegmentRow {
                frames: 0,
                expected,
                state: RowState::Encoding,
            }
        });
        row.frames = frames;
        opened.then_some(&*row)
    }

    fn credit(&mut self, frames: u64, segments_done: usize) {
        self.frames = self.frames.saturating_add(frames);
        // Credited frames are not encode throughput.
        self.rate.sampled_frames = self.frames;
        self.segments_done = segments_done;
    }

    fn finish_segment(&mut self, segment: &str, segments_done: usize) {
        self.segments_done = segments_done;
        if let Some(row) = self.rows.get_mut(segment) {
            row.state = RowState::Done;
        }
    }

    fn encoding(&self) -> impl Iterator<Item = &str> {
        self.rows
            .iter()
            .filter(|(_, row)| row.state == RowState::Encoding)
            .map(|(id, _)| id.as_str())
    }

    fn fps(&self, now: Instant) -> f64 {
        if self.rate.fps > 0.1 {
            self.rate.fps
        } else {
            average_rate(self.frames, now.duration_since(self.started))
        }
    }

    fn eta(&self, now: Instant) -> Option<Duration> {
        compute_eta(self.total_frames, self.frames, self.fps(now))
    }

    fn is_complete(&self) -> bool {
        self.segments_done >= self.segments
            || (self.total_frames > 0 && self.frames >= self.total_frames)
    }

    /// How long frames have been missing, once per `threshold` while the run is open.
    fn idle_warning(&mut self, now: Instant, threshold: Duration) -> Option<Duration> {
        if self.is_complete() {
            return None;
        }
        let idle = now.duration_since(self.last_frame_at);
        if idle < threshold {
            return None;
        }
        if self
            .last_idle_warn
            .is_some_and(|at| now.duration_since(at) < threshold)
        {
            return None;
        }
        self.last_idle_warn = Some(now);
        Some(idle)
    }

    fn plain_due(&mut self, now: Instant, interval: Duration) -> bool {
        let due = self
            .last_plain_line
            .map_or(true, |at| now.duration_since(at) >= interval);
        if due {
            self.last_plain_line = Some(now);
        }
        due
    }

    fn encoding_summary(&self) -> String {
        let open: Vec<&str> = self.encoding().collect();
        if open.is_empty() {
            return "-".to_string();
        }
        let mut text = open
            .iter()
            .take(PLAIN_ROWS_NAMED)
            .copied()
            .collect::<Vec<_>>()
            .join(",");
        if open.len() > PLAIN_ROWS_NAMED {
            text.push_str(&format!(",+{}", open.len() - PLAIN_ROWS_NAMED));
        }
        text
    }

    fn plain_line(&self, now: Instant) -> String {
        let pct = if self.total_frames == 0 {
            0.0
        } else {
            self.frames as f64 * 100.0 / self.total_frames as f64
        };
        format!(
            "[PROGRESS] segments={}/{} frames={} / {} ({:.1}%) rate={} ETA={} elapsed={} encoding={}",
            self.segments_done,
            self.segments,
            HumanCount(self.frames),
            HumanCount(self.total_frames),
            pct,
            format_rate(self.fps(now)),
            format_eta(self.eta(now)),
            format_duration(now.duration_since(self.started)),
            self.encoding_summary(),
        )
    }
}

struct RichRows {
    multi: MultiProgress,
    overall: ProgressBar,
    segments: Mutex<BTreeMap<String, ProgressBar>>,
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

impl RichRows {
    fn new(total_frames: u64, segments: usize) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(ProgressBar::new(total_frames.max(1)));
        overall.set_style(style(
            "{spinner:.green} [{elapsed_precise}] {wide_bar:.cyan/blue} {human_pos}/{human_len} frames | {prefix} | {msg}",
        ));
        overall.set_prefix(format!("0/{segments} segments"));
        overall.enable_steady_tick(Duration::from_millis(120));
        Self {
            multi,
            overall,
            segments: Mutex::new(BTreeMap::new()),
        }
    }

    fn open_row(&self, segment: &str, row: &SegmentRow) {
        let bar = match row.expected {
            Some(len) => {
                let bar = self.multi.add(ProgressBar::new(len.max(1)));
                bar.set_style(style("  {prefix:.bold} {bar:30.magenta/blue} {pos}/{len} frames"));
                bar
            }
            None => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(style("  {spinner:.magenta} {prefix:.bold} {pos} frames"));
                bar
            }
        };
        bar.set_prefix(segment.to_string());
        bar.set_position(row.frames);
        lock(&self.segments).insert(segment.to_string(), bar);
    }

    fn update_row(&self, segment: &str, frames: u64) {
        if let Some(bar) = lock(&self.segments).get(segment) {
            bar.set_position(frames);
        }
    }

    fn close_row(&self, segment: &str) {
        if let Some(bar) = lock(&self.segments).remove(segment) {
            bar.finish_and_clear();
        }
    }

    fn refresh(&self, board: &Board, now: Instant) {
        self.overall.set_position(board.frames.min(board.total_frames.max(1)));
        self.overall
            .set_prefix(format!("{}/{} segments", board.segments_done, board.segments));
        self.overall.set_message(format!(
            "{} ETA={}",
            format_rate(board.fps(now)),
            format_eta(board.eta(now))
        ));
    }

    fn close(&self, board: &Board, now: Instant, message: &str) {
        for (_, bar) in std::mem::take(&mut *lock(&self.segments)) {
            bar.finish_and_clear();
        }
        self.overall
            .set_prefix(format!("{}/{} segments", board.segments_done, board.segments));
        self.overall.finish_with_message(format!(
            "{message} | {} avg",
            format_rate(average_rate(board.frames, now.duration_since(board.started)))
        ));
    }
}

struct Shared {
    mode: ResolvedProgressMode,
    config: ProgressConfig,
    board: Mutex<Board>,
    rich: Option<RichRows>,
    stop: AtomicBool,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn emit(&self, level: &str, message: &str) {
        let line = format!("[{level}] progress: {message}");
        match (self.mode, &self.rich) {
            (ResolvedProgressMode::Quiet, _) => {}
            (ResolvedProgressMode::Rich, Some(rich)) => {
                if rich.multi.println(&line).is_err() {
                    eprintln!("{line}");
                }
            }
            _ => eprintln!("{line}"),
        }
    }

    fn tick(&self) {
        if self.mode == ResolvedProgressMode::Quiet {
            return;
        }
        let now = Instant::now();
        let (plain, idle) = {
            let mut board = lock(&self.board);
            let frames = board.frames;
            board.rate.observe(now, frames);
            if let Some(rich) = &self.rich {
                rich.refresh(&board, now);
            }
            let plain = (self.mode == ResolvedProgressMode::Plain
                && board.plain_due(now, self.config.plain_interval))
            .then(|| board.plain_line(now));
            let idle = board
                .idle_warning(now, self.config.idle_threshold)
                .map(|idle| {
                    board.warnings += 1;
                    format!(
                        "no frames for {}s while encoding {}; an encode may be stuck",
                        idle.as_secs(),
                        board.encoding_summary()
                    )
                });
            (plain, idle)
        };
        if let Some(line) = plain {
            eprintln!("{line}");
        }
        if let Some(message) = idle {
            self.emit("WARN", &message);
        }
    }

    fn close(&self, message: Option<&str>) -> DisplayStats {
        let now = Instant::now();
        let board = lock(&self.board);
        let stats = DisplayStats {
            elapsed: now.duration_since(board.started),
            avg_fps: average_rate(board.frames, now.duration_since(board.started)),
            warning_count: board.warnings,
        };
        if self.closed.swap(true, Ordering::Relaxed) {
            return stats;
        }
        match self.mode {
            ResolvedProgressMode::Quiet => {}
            ResolvedProgressMode::Plain => {
                eprintln!("{}", board.plain_line(now));
                if let Some(message) = message {
                    eprintln!("[DONE] progress: {message}");
                }
            }
            ResolvedProgressMode::Rich => {
                if let Some(rich) = &self.rich {
                    rich.close(&board, now, message.unwrap_or("stopped"));
                }
            }
        }
        stats
    }
}

/// Live view of one run. Updates come from the reading thread; a ticker thread refreshes
/// rates, prints plain lines and raises idle warnings.
pub struct ProgressDisplay {
    shared: Arc<Shared>,
    ticker: Option<JoinHandle<()>>,
}

impl ProgressDisplay {
    /// `expected` maps segment stems to their split frame counts where known.
    pub fn new(
        total_frames: u64,
        segments: usize,
        expected: BTreeMap<String, u64>,
        config: ProgressConfig,
    ) -> Self {
        let mode = config.resolve_mode();
        let rich = (mode == ResolvedProgressMode::Rich).then(|| RichRows::new(total_frames, segments));
        let shared = Arc::new(Shared {
            mode,
            config,
            board: Mutex::new(Board::new(total_frames, segments, expected, Instant::now())),
            rich,
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let ticker = (mode != ResolvedProgressMode::Quiet).then(|| {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                while !shared.stop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(500));
                    shared.tick();
                }
            })
        });
        Self { shared, ticker }
    }

    /// Segments that were finished before this run started.
    pub fn credit(&self, frames: u64, segments_done: usize) {
        lock(&self.shared.board).credit(frames, segments_done);
    }

    pub fn advance(&self, segment: &str, frames: u64, delta: u64) {
        let mut board = lock(&self.shared.board);
        let opened = board.advance(segment, frames, delta, Instant::now()).cloned();
        if let Some(rich) = &self.shared.rich {
            if let Some(row) = opened {
                rich.open_row(segment, &row);
            }
            rich.update_row(segment, frames);
        }
    }

    pub fn finish_segment(&self, segment: &str, segments_done: usize) {
        let line = {
            let mut board = lock(&self.shared.board);
            board.finish_segment(segment, segments_done);
            let now = Instant::now();
            if let Some(rich) = &self.shared.rich {
                rich.close_row(segment);
                rich.refresh(&board, now);
            }
            (self.shared.mode == ResolvedProgressMode::Plain).then(|| {
                board.last_plain_line = Some(now);
                board.plain_line(now)
            })
        };
        if let Some(line) = line {
            eprintln!("{line}");
        }
    }

    pub fn note(&self, message: impl AsRef<str>) {
        self.shared.emit("INFO", message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        lock(&self.shared.board).warnings += 1;
        self.shared.emit("WARN", message.as_ref());
    }

    pub fn close(mut self, message: &str) -> DisplayStats {
        self.stop_ticker();
        self.shared.close(Some(message))
    }

    fn stop_ticker(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.ticker.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ProgressDisplay {
    fn drop(&mut self) {
        self.stop_ticker();
        self.shared.close(None);
    }
}

fn average_rate(frames: u64, elapsed: Duration) -> f64 {
    frames as f64 / elapsed.as_secs_f64().max(1e-6)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

pub fn format_rate(fps: f64) -> String {
    if fps <= 0.1 {
        "0 fps".to_string()
    } else {
        format!("{fps:.1} fps")
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map_or_else(|| "--:--".to_string(), format_duration)
}

fn compute_eta(total_frames: u64, frames: u64, fps: f64) -> Option<Duration> {
    if fps <= 0.1 || frames >= total_frames {
        return None;
    }
    Some(Duration::from_secs_f64(
        total_frames.saturating_sub(frames) as f64 / fps,
    ))
}
