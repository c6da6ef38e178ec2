use std::fmt;
use std::path::{Path, PathBuf};

/// Highest number of segments a layout can name without breaking lexical ordering.
pub const MAX_SEGMENTS: usize = 100_000;

/// Directory a per-segment artifact lives in under the temp root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Split,
    Encode,
    Check,
}

impl Stage {
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Split => "split",
            Stage::Encode => "encode",
            Stage::Check => "check",
        }
    }
}

/// File kind of a per-segment artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ext {
    Mkv,
    FrameCount,
    Match,
}

impl Ext {
    pub fn as_str(self) -> &'static str {
        match self {
            Ext::Mkv => "mkv",
            Ext::FrameCount => "fc",
            Ext::Match => "match",
        }
    }
}

/// Zero-based position of a segment in the source video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentIndex(pub usize);

impl SegmentIndex {
    /// Five-digit stem used in every per-segment file name, e.g. `00042`.
    pub fn stem(self) -> String {
        format!("{:05}", self.0)
    }

    pub fn parse_stem(stem: &str) -> Option<Self> {
        if stem.len() != 5 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok().map(SegmentIndex)
    }
}

impl fmt::Display for SegmentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05}", self.0)
    }
}

/// Maps `(stage, index, ext)` onto `{root}/{stage}/{index:05}.{ext}`.
///
/// The root is kept as a plain string so the same layout can be rooted at a real directory
/// (run-time helpers) or at a make variable reference such as `$(tempdir)` (generator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempLayout {
    root: String,
}

impl TempLayout {
    pub fn new(root: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self { root }
    }

    pub fn from_dir(dir: &Path) -> Self {
        Self::new(dir.to_string_lossy().into_owned())
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn stage_dir(&self, stage: Stage) -> String {
        format!("{}/{}", self.root, stage.dir_name())
    }

    pub fn segment(&self, stage: Stage, index: SegmentIndex, ext: Ext) -> String {
        format!("{}/{}.{}", self.stage_dir(stage), index.stem(), ext.as_str())
    }

    /// Pattern-rule form of [`TempLayout::segment`], with `%` standing in for the stem.
    pub fn pattern(&self, stage: Stage, ext: Ext) -> String {
        format!("{}/%.{}", self.stage_dir(stage), ext.as_str())
    }

    /// Recipe form of [`TempLayout::segment`], with make's `$*` standing in for the stem.
    pub fn stem_ref(&self, stage: Stage, ext: Ext) -> String {
        format!("{}/$*.{}", self.stage_dir(stage), ext.as_str())
    }

    pub fn file(&self, name: &str) -> String {
        format!("{}/{}", self.root, name)
    }

    pub fn segment_path(&self, stage: Stage, index: SegmentIndex, ext: Ext) -> PathBuf {
        PathBuf::from(self.segment(stage, index, ext))
    }
}

/// Indices `0..count` in segment order.
pub fn segment_indices(count: usize) -> impl Iterator<Item = SegmentIndex> {
    (0..count).map(SegmentIndex)
}
