use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

use crate::config::path_is_make_safe;

/// Oldest GNU make that understands grouped targets (`&:`).
pub const MIN_MAKE_VERSION: (u32, u32) = (4, 3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MakeSupport {
    Missing,
    Unrecognized(String),
    TooOld { version: (u32, u32) },
    Supported { version: (u32, u32) },
}

/// Locates `name` on `PATH`.
pub fn require(name: &str) -> Result<PathBuf> {
    which::which(name).with_context(|| format!("{name} was not found on PATH"))
}

pub fn ensure_ffmpeg_available() -> Result<()> {
    for tool in ["ffmpeg", "ffprobe"] {
        let path = require(tool)?;
        let out = Command::new(&path)
            .arg("-version")
            .output()
            .with_context(|| format!("failed to run {tool} -version"))?;
        if !out.status.success() {
            bail!("{tool} exists but returned non-zero on -version");
        }
        debug!(tool, path = %path.display(), "found");
    }
    Ok(())
}

/// `(major, minor)` from the first line of `make --version`.
pub fn parse_make_version(first_line: &str) -> Option<(u32, u32)> {
    let rest = first_line.trim().strip_prefix("GNU Make ")?;
    let mut parts = rest.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts
        .next()
        .and_then(|p| {
            let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
            digits.parse().ok()
        })
        .unwrap_or(0);
    Some((major, minor))
}

pub fn probe_make() -> MakeSupport {
    let Ok(path) = which::which("make") else {
        return MakeSupport::Missing;
    };
    let Ok(out) = Command::new(path).arg("--version").output() else {
        return MakeSupport::Missing;
    };
    let text = String::from_utf8_lossy(&out.stdout);
    let first = text.lines().next().unwrap_or_default().to_string();
    match parse_make_version(&first) {
        Some(version) if version >= MIN_MAKE_VERSION => MakeSupport::Supported { version },
        Some(version) => MakeSupport::TooOld { version },
        None => MakeSupport::Unrecognized(first),
    }
}

/// Warns, never fails: the Makefile is still useful on another machine.
pub fn warn_if_make_unsuitable() {
    let (major, minor) = MIN_MAKE_VERSION;
    match probe_make() {
        MakeSupport::Supported { version } => debug!(?version, "GNU make is usable"),
        MakeSupport::Missing => {
            warn!("make was not found on PATH; the generated Makefile needs GNU make {major}.{minor} or newer")
        }
        MakeSupport::TooOld { version: (a, b) } => warn!(
            "GNU make {a}.{b} is too old for grouped targets; GNU make {major}.{minor} or newer is needed"
        ),
        MakeSupport::Unrecognized(line) => {
            warn!("could not recognize make version {line:?}; GNU make {major}.{minor} or newer is needed")
        }
    }
}

/// How generated recipes call back into this binary.
///
/// Uses the absolute path of the running executable when make can embed it verbatim, else
/// relies on `segmake` being on `PATH`.
pub fn self_command() -> String {
    std::env::current_exe()
        .ok()
        .filter(|p| path_is_make_safe(p))
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_else(|| "segmake".to_string())
}

pub fn folder_basename(p: &Path) -> String {
    p.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "input".to_string())
}
