use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

use crate::encoder::{EncoderKind, EncoderVariant};
use crate::tools::folder_basename;

pub const DEFAULT_OUTPUT: &str = "output.mkv";
pub const DEFAULT_MAKEFILE: &str = "Makefile";
pub const DEFAULT_SCENE_THRESHOLD: f64 = 0.4;
pub const DEFAULT_FFMPEG_COMMAND: &str = "ffmpeg -hide_banner -nostdin -y -loglevel warning";
pub const DEFAULT_FFPROBE_COMMAND: &str = "ffprobe -v error";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("input {} does not exist", .0.display())]
    InputMissing(PathBuf),

    #[error("input {} is not a regular file", .0.display())]
    InputNotAFile(PathBuf),

    #[error("{what} {} would overwrite the input", .path.display())]
    Collision { what: &'static str, path: PathBuf },

    #[error("{first} and {second} are the same path ({})", .path.display())]
    SamePath {
        first: &'static str,
        second: &'static str,
        path: PathBuf,
    },

    #[error("{what} path {path:?} contains {ch:?}; only letters, digits and . _ - / + @ are allowed in paths embedded in the Makefile")]
    UnsafePath {
        what: &'static str,
        path: PathBuf,
        ch: char,
    },

    #[error("{what} path {path:?} may not start with '-'")]
    LeadingDash { what: &'static str, path: PathBuf },

    #[error("tempdir {} contains the {what} ({}); `make clean` would delete it", .tempdir.display(), .path.display())]
    TempdirContains {
        what: &'static str,
        tempdir: PathBuf,
        path: PathBuf,
    },

    #[error("--splits must be at least 1")]
    ZeroSplits,

    #[error("scene threshold {0} is outside (0, 1)")]
    SceneThreshold(f64),
}

/// Characters make, bash and ffmpeg's option and filter parsers all pass through untouched.
fn is_safe_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | '+' | '@')
}

pub fn check_path_safe(what: &'static str, path: &Path) -> Result<(), ConfigError> {
    let text = path.to_string_lossy();
    if let Some(ch) = text.chars().find(|&c| !is_safe_char(c)) {
        return Err(ConfigError::UnsafePath {
            what,
            path: path.to_path_buf(),
            ch,
        });
    }
    if text.starts_with('-') {
        return Err(ConfigError::LeadingDash {
            what,
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

pub fn path_is_make_safe(path: &Path) -> bool {
    check_path_safe("path", path).is_ok()
}

/// Purely lexical normalization: drops `.` components and folds `dir/..`.
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn same_path(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => normalize(a) == normalize(b),
    }
}

/// Absolute form with symlinks resolved as far up as the path exists.
fn resolve(path: &Path) -> PathBuf {
    let lexical = normalize(path);
    let mut existing = lexical.as_path();
    let mut rest = Vec::new();
    while let Some(parent) = existing.parent() {
        if let Ok(real) = existing.canonicalize() {
            return rest.iter().rev().fold(real, |acc, part| acc.join(part));
        }
        if let Some(name) = existing.file_name() {
            rest.push(name.to_os_string());
        }
        existing = parent;
    }
    lexical
}

/// True when `dir` is `path` or one of its ancestors.
fn encloses(dir: &Path, path: &Path) -> bool {
    resolve(path).starts_with(resolve(dir))
}

/// Tool invocations baked into the Makefile as overridable defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommands {
    pub ffmpeg: String,
    pub ffprobe: String,
    pub segmake: String,
}

impl Default for ToolCommands {
    fn default() -> Self {
        Self {
            ffmpeg: DEFAULT_FFMPEG_COMMAND.to_string(),
            ffprobe: DEFAULT_FFPROBE_COMMAND.to_string(),
            segmake: "segmake".to_string(),
        }
    }
}

/// Where split points come from.
#[derive(Debug, Clone, PartialEq)]
pub enum SplitSource {
    /// Cut the probed frame count into this many near-equal segments.
    Even { segments: usize },
    /// Read this file, or run scene detection and write the result to it.
    File { path: PathBuf, scene_threshold: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    pub tempdir: PathBuf,
    pub makefile: PathBuf,
    pub encoder: EncoderKind,
    pub nvidia: bool,
    pub split_source: SplitSource,
    pub tools: ToolCommands,
}

/// `movie.mkv` -> `movie.segmake`, next to wherever make runs.
pub fn default_tempdir(input: &Path) -> PathBuf {
    PathBuf::from(format!("{}.segmake", folder_basename(input)))
}

/// `movie.mkv` -> `movie.mkv.csv`.
pub fn default_splits_file(input: &Path) -> PathBuf {
    let mut name = OsString::from(input.as_os_str());
    name.push(".csv");
    PathBuf::from(name)
}

impl GenerateConfig {
    pub fn new(input: impl Into<PathBuf>) -> Self {
        let input = input.into();
        Self {
            output: PathBuf::from(DEFAULT_OUTPUT),
            tempdir: default_tempdir(&input),
            makefile: PathBuf::from(DEFAULT_MAKEFILE),
            encoder: EncoderKind::Av1,
            nvidia: false,
            split_source: SplitSource::File {
                path: default_splits_file(&input),
                scene_threshold: DEFAULT_SCENE_THRESHOLD,
            },
            tools: ToolCommands::default(),
            input,
        }
    }

    pub fn encoder_variant(&self) -> EncoderVariant {
        EncoderVariant::select(self.encoder, self.nvidia)
    }

    /// Everything that can be checked before touching ffmpeg or the filesystem's contents.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.input.exists() {
            return Err(ConfigError::InputMissing(self.input.clone()));
        }
        if !self.input.is_file() {
            return Err(ConfigError::InputNotAFile(self.input.clone()));
        }

        check_path_safe("input", &self.input)?;
        check_path_safe("output", &self.output)?;
        check_path_safe("tempdir", &self.tempdir)?;

        for (what, path) in [
            ("output", &self.output),
            ("tempdir", &self.tempdir),
            ("makefile", &self.makefile),
        ] {
            if same_path(&self.input, path) {
                return Err(ConfigError::Collision {
                    what,
                    path: path.clone(),
                });
            }
        }
        for (first, a, second, b) in [
            ("output", &self.output, "makefile", &self.makefile),
            ("output", &self.output, "tempdir", &self.tempdir),
            ("makefile", &self.makefile, "tempdir", &self.tempdir),
        ] {
            if same_path(a, b) {
                return Err(ConfigError::SamePath {
                    first,
                    second,
                    path: a.clone(),
                });
            }
        }

        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        for (what, path) in [
            ("input", &self.input),
            ("output", &self.output),
            ("makefile", &self.makefile),
            ("working directory", &cwd),
        ] {
            if encloses(&self.tempdir, path) {
                return Err(ConfigError::TempdirContains {
                    what,
                    tempdir: self.tempdir.clone(),
                    path: path.clone(),
                });
            }
        }

        match &self.split_source {
            SplitSource::Even { segments: 0 } => return Err(ConfigError::ZeroSplits),
            SplitSource::File {
                scene_threshold, ..
            } if !(*scene_threshold > 0.0 && *scene_threshold < 1.0) => {
                return Err(ConfigError::SceneThreshold(*scene_threshold));
            }
            _ => {}
        }
        Ok(())
    }
}
