mod aggregate;
mod config;
mod encoder;
mod graph;
mod makefile;
mod paths;
mod probe;
mod progress;
mod protocol;
mod report;
mod splits;
mod tools;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::HumanCount;
use std::path::PathBuf;
use tracing::{debug, info};

use aggregate::{AggregateSummary, AggregatorConfig};
use config::{GenerateConfig, SplitSource, ToolCommands};
use encoder::{EncoderKind, ProgressFormat};
use graph::{BuildGraph, GraphParams};
use makefile::MakefileHeader;
use progress::{format_duration, format_rate, ProgressConfig, ProgressMode};

#[derive(Parser)]
#[command(
    name = "segmake",
    version,
    about = "Write a Makefile that splits a video, encodes the pieces in parallel, checks frame counts and pastes the result",
    args_conflicts_with_subcommands = true,
    subcommand_negates_reqs = true
)]
struct Cli {
    #[command(subcommand)]
    cmd: Option<Commands>,

    #[command(flatten)]
    generate: GenerateArgs,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// Source video
    #[arg(required = true)]
    input: Option<PathBuf>,

    /// Working directory for segments and checkpoints. Default: <input stem>.segmake
    #[arg(long)]
    tempdir: Option<PathBuf>,

    /// Final output file
    #[arg(short, long, default_value = config::DEFAULT_OUTPUT)]
    output: PathBuf,

    /// Encoder used for every segment
    #[arg(short, long, value_enum, default_value_t = EncoderKind::Av1)]
    encoder: EncoderKind,

    /// Where to write the Makefile
    #[arg(short, long, default_value = config::DEFAULT_MAKEFILE)]
    makefile: PathBuf,

    /// Cut into this many equal segments instead of at scene changes
    #[arg(long, conflicts_with = "splitsfile")]
    splits: Option<usize>,

    /// Comma-separated split frames; written by scene detection when missing. Default: <input>.csv
    #[arg(long)]
    splitsfile: Option<PathBuf>,

    /// Decode with CUDA and encode with NVENC (hevc only)
    #[arg(long, default_value_t = false)]
    nvidia: bool,

    /// Scene-change score above which a new segment starts
    #[arg(long, default_value_t = config::DEFAULT_SCENE_THRESHOLD)]
    scene_threshold: f64,

    /// Debug logging
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay an encoder's stderr (on stdin) into the progress FIFO. Used by generated Makefiles.
    Report {
        /// Segment id reported on every line
        #[arg(long)]
        segment: String,

        /// Status line format of the encoder feeding stdin
        #[arg(long, value_enum, default_value_t = ProgressFormat::Ffmpeg)]
        format: ProgressFormat,

        /// Progress FIFO
        #[arg(long)]
        sink: PathBuf,
    },

    /// Show combined progress of all segment encodes. Used by generated Makefiles.
    Progress {
        /// Progress FIFO (or a file holding recorded progress lines)
        #[arg(long)]
        sink: PathBuf,

        /// Frame count of the whole input
        #[arg(long)]
        total_frames: u64,

        /// Number of segments in this run
        #[arg(long)]
        segments: usize,

        /// Temp root; segments already encoded there count as done
        #[arg(long)]
        tempdir: Option<PathBuf>,

        /// Stop when this process (the make that started us) exits
        #[arg(long)]
        watch_pid: Option<u32>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "segmake=debug" } else { "segmake=info" };
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.generate.verbose);

    match cli.cmd {
        Some(Commands::Report {
            segment,
            format,
            sink,
        }) => {
            report::run_report(&segment, format, &sink)?;
        }

        Some(Commands::Progress {
            sink,
            total_frames,
            segments,
            tempdir,
            watch_pid,
            progress,
        }) => {
            let summary = aggregate::run_aggregator(&AggregatorConfig {
                sink,
                total_frames,
                segments,
                tempdir,
                watch_pid,
                progress: ProgressConfig::new(progress),
            })?;
            print_progress_summary(&summary);
        }

        None => generate(cli.generate)?,
    }

    Ok(())
}

fn generate_config(args: GenerateArgs) -> Result<GenerateConfig> {
    let input = args.input.context("an input video is required")?;
    let mut cfg = GenerateConfig::new(input);
    cfg.output = args.output;
    cfg.makefile = args.makefile;
    cfg.encoder = args.encoder;
    cfg.nvidia = args.nvidia;
    if let Some(tempdir) = args.tempdir {
        cfg.tempdir = tempdir;
    }
    cfg.split_source = match args.splits {
        Some(segments) => SplitSource::Even { segments },
        None => SplitSource::File {
            path: args
                .splitsfile
                .unwrap_or_else(|| config::default_splits_file(&cfg.input)),
            scene_threshold: args.scene_threshold,
        },
    };
    cfg.tools = ToolCommands {
        segmake: tools::self_command(),
        ..ToolCommands::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

fn generate(args: GenerateArgs) -> Result<()> {
    let cfg = generate_config(args)?;
    debug!(?cfg, "generate");

    tools::warn_if_make_unsuitable();
    let needs_media_tools = match &cfg.split_source {
        SplitSource::Even { .. } => true,
        SplitSource::File { path, .. } => !path.exists(),
    };
    if needs_media_tools {
        tools::ensure_ffmpeg_available().context("ffmpeg is needed to choose split points")?;
    }

    let split_points = splits::resolve(&cfg.split_source, &cfg.input)?;
    let encoder = cfg.encoder_variant();
    let graph = BuildGraph::generate(&GraphParams {
        split_points,
        encoder,
    })
    .context("refusing to write an inconsistent build graph")?;

    let text = makefile::render(
        &graph,
        &MakefileHeader {
            input: cfg.input.to_string_lossy().into_owned(),
            output: cfg.output.to_string_lossy().into_owned(),
            tempdir: cfg.tempdir.to_string_lossy().into_owned(),
            tools: cfg.tools.clone(),
            encoder,
        },
    );
    makefile::write(&cfg.makefile, &text)?;
    info!(makefile = %cfg.makefile.display(), "written");

    println!(
        "Makefile summary: makefile={} input={} output={} tempdir={} encoder={} segments={} rules={}",
        cfg.makefile.display(),
        cfg.input.display(),
        cfg.output.display(),
        cfg.tempdir.display(),
        encoder.name(),
        graph.segments(),
        graph.rules().len(),
    );
    let run = match cfg.makefile.to_str() {
        Some(config::DEFAULT_MAKEFILE) => String::new(),
        _ => format!(" -f {}", cfg.makefile.display()),
    };
    println!("Next: make{} -j{}", run, num_cpus::get().max(1));
    Ok(())
}

fn print_progress_summary(summary: &AggregateSummary) {
    eprintln!(
        "Progress summary: finish={} segments={}/{} frames={} / {} duration={} rate={} malformed_lines={} warnings={}",
        summary.outcome(),
        summary.segments_done,
        summary.segments,
        HumanCount(summary.frames),
        HumanCount(summary.total_frames),
        format_duration(summary.elapsed),
        format_rate(summary.avg_fps),
        summary.malformed_lines,
        summary.warning_count,
    );
}
