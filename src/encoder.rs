use clap::ValueEnum;
use tracing::warn;

/// Encoder family chosen on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum EncoderKind {
    Av1,
    Hevc,
}

/// How `segmake report` recognizes a frame counter in an encoder's stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressFormat {
    /// `frame=  123 fps=...` status lines.
    Ffmpeg,
    /// `Encoding frame  123 ...` status lines from SvtAv1EncApp.
    Svt,
}

impl ProgressFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ProgressFormat::Ffmpeg => "ffmpeg",
            ProgressFormat::Svt => "svt",
        }
    }
}

pub const DEFAULT_SVT_EXEC: &str = "SvtAv1EncApp";
pub const DEFAULT_SVT_PRESET: u8 = 8;

/// The single encode recipe a generated Makefile uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderVariant {
    /// ffmpeg decodes to y4m on a pipe, SvtAv1EncApp writes IVF, ffmpeg remuxes to mkv.
    SvtAv1,
    /// ffmpeg's own HEVC encoder, or NVENC with CUDA decoding.
    Hevc { nvidia: bool },
}

impl EncoderVariant {
    pub fn select(kind: EncoderKind, nvidia: bool) -> Self {
        match kind {
            EncoderKind::Av1 => {
                if nvidia {
                    warn!("--nvidia only applies to the hevc encoder; ignoring it for av1");
                }
                EncoderVariant::SvtAv1
            }
            EncoderKind::Hevc => EncoderVariant::Hevc { nvidia },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            EncoderVariant::SvtAv1 => "SvtAv1",
            EncoderVariant::Hevc { nvidia: false } => "Hevc",
            EncoderVariant::Hevc { nvidia: true } => "HevcNvenc",
        }
    }

    pub fn progress_format(self) -> ProgressFormat {
        match self {
            EncoderVariant::SvtAv1 => ProgressFormat::Svt,
            EncoderVariant::Hevc { .. } => ProgressFormat::Ffmpeg,
        }
    }

    /// Extra `?=` variables the recipe refers to.
    pub fn tool_variables(self) -> Vec<(&'static str, String)> {
        match self {
            EncoderVariant::SvtAv1 => vec![
                ("svtexec", DEFAULT_SVT_EXEC.to_string()),
                ("svtpreset", DEFAULT_SVT_PRESET.to_string()),
            ],
            EncoderVariant::Hevc { .. } => Vec::new(),
        }
    }

    /// Recipe turning `$<` (one split segment) into `$@` (its encoded counterpart), streaming
    /// frame progress for stem `$*` into the progress FIFO.
    pub fn recipe(self) -> Vec<String> {
        let report = format!(
            "$(segmake) report --segment $* --format {} --sink $(namedpipe)",
            self.progress_format().as_str()
        );

        let mut lines = vec!["@mkdir -p $(@D)".to_string()];
        match self {
            EncoderVariant::SvtAv1 => {
                lines.push(format!(
                    "$(ffmpegcommand) -i $< -map 0:v:0 -pix_fmt yuv420p -f yuv4mpegpipe - | \
                     $(svtexec) -i stdin --preset $(svtpreset) --tile-rows 2 --tile-columns 3 \
                     -b $(basename $@).ivf 2>&1 >/dev/null | {report}"
                ));
                lines.push("$(ffmpegcommand) -i $(basename $@).ivf -c copy $@".to_string());
                lines.push("@rm -f $(basename $@).ivf".to_string());
            }
            EncoderVariant::Hevc { nvidia } => {
                let (hwaccel, codec) = if nvidia {
                    ("-hwaccel cuda ", "hevc_nvenc")
                } else {
                    ("", "libx265")
                };
                lines.push(format!(
                    "$(ffmpegcommand) -stats {hwaccel}-i $< -map 0:v:0 -c:v {codec} $@ \
                     2>&1 >/dev/null | {report}"
                ));
            }
        }
        lines
    }
}
