//! Text form of a [`BuildGraph`].

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::ToolCommands;
use crate::encoder::EncoderVariant;
use crate::graph::{BuildGraph, Rule};

/// Values bound in the variable header.
#[derive(Debug, Clone)]
pub struct MakefileHeader {
    pub input: String,
    pub output: String,
    pub tempdir: String,
    pub tools: ToolCommands,
    pub encoder: EncoderVariant,
}

fn render_rule(out: &mut String, rule: &Rule) {
    let _ = writeln!(out, "# {}", rule.comment);

    let mut head = rule.outputs.join(" ");
    head.push_str(if rule.grouped { " &:" } else { ":" });
    if !rule.inputs.is_empty() {
        head.push(' ');
        head.push_str(&rule.inputs.join(" "));
    }
    if !rule.order_only.is_empty() {
        head.push_str(" | ");
        head.push_str(&rule.order_only.join(" "));
    }
    out.push_str(&head);
    out.push('\n');

    for line in &rule.recipe {
        out.push('\t');
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
}

/// Renders the whole Makefile. Output depends only on the arguments.
pub fn render(graph: &BuildGraph, header: &MakefileHeader) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by segmake {}", env!("CARGO_PKG_VERSION"));
    out.push_str("# Needs GNU make 4.3 or newer. Tool commands below can be overridden on the\n");
    out.push_str("# make command line, e.g. `make -j8 svtpreset=6`.\n\n");

    let _ = writeln!(out, "input := {}", header.input);
    let _ = writeln!(out, "output := {}", header.output);
    let _ = writeln!(out, "tempdir := {}", header.tempdir);
    out.push_str("inframes := $(tempdir)/input.fc\n");
    out.push_str("outframes := $(tempdir)/output.fc\n");
    out.push_str("namedpipe := $(tempdir)/progress.fifo\n\n");

    let _ = writeln!(out, "ffmpegcommand ?= {}", header.tools.ffmpeg);
    let _ = writeln!(out, "ffprobecommand ?= {}", header.tools.ffprobe);
    let _ = writeln!(out, "segmake ?= {}", header.tools.segmake);
    for (name, value) in header.encoder.tool_variables() {
        let _ = writeln!(out, "{name} ?= {value}");
    }
    out.push('\n');

    out.push_str("SHELL := /bin/bash\n");
    out.push_str(".SHELLFLAGS := -o pipefail -c\n\n");

    let patterns = graph.phony_patterns();
    if !patterns.is_empty() {
        let _ = writeln!(
            out,
            "# {} are phony as well; make takes .PHONY entries literally, so patterns stay off it.",
            patterns.join(" ")
        );
    }
    let _ = writeln!(out, ".PHONY: {}", graph.phony_targets().join(" "));
    out.push_str(".SECONDARY:\n");
    out.push_str(".DELETE_ON_ERROR:\n\n");

    for rule in graph.rules() {
        render_rule(&mut out, rule);
    }
    out
}

pub fn write(path: &Path, text: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphParams;
    use crate::splits::SplitPoints;

    fn header(encoder: EncoderVariant) -> MakefileHeader {
        MakefileHeader {
            input: "in.mkv".into(),
            output: "out.mkv".into(),
            tempdir: "in.segmake".into(),
            tools: ToolCommands::default(),
            encoder,
        }
    }

    fn text(points: Vec<u64>, encoder: EncoderVariant) -> String {
        let graph = BuildGraph::generate(&GraphParams {
            split_points: SplitPoints::new(points, None).unwrap(),
            encoder,
        })
        .unwrap();
        render(&graph, &header(encoder))
    }

    #[test]
    fn header_binds_paths_and_tools() {
        let mk = text(vec![], EncoderVariant::SvtAv1);
        for line in [
            "input := in.mkv",
            "output := out.mkv",
            "tempdir := in.segmake",
            "inframes := $(tempdir)/input.fc",
            "outframes := $(tempdir)/output.fc",
            "namedpipe := $(tempdir)/progress.fifo",
            "ffmpegcommand ?= ffmpeg -hide_banner -nostdin -y -loglevel warning",
            "ffprobecommand ?= ffprobe -v error",
            "segmake ?= segmake",
            "svtexec ?= SvtAv1EncApp",
            "svtpreset ?= 8",
            "SHELL := /bin/bash",
            ".SHELLFLAGS := -o pipefail -c",
            ".SECONDARY:",
            ".DELETE_ON_ERROR:",
        ] {
            assert!(mk.lines().any(|l| l == line), "missing {line:?} in\n{mk}");
        }
        assert!(!text(vec![], EncoderVariant::Hevc { nvidia: false }).contains("svtexec"));
    }

    #[test]
    fn all_is_the_first_rule() {
        let mk = text(vec![10, 20], EncoderVariant::SvtAv1);
        let first = mk
            .lines()
            .find(|l| !l.starts_with('#') && !l.starts_with('.') && l.contains(':') && !l.contains(":="))
            .unwrap();
        assert_eq!(first, "all: verifyOutputFrames");
    }

    #[test]
    fn rules_use_grouped_and_order_only_syntax() {
        let mk = text(vec![100, 250], EncoderVariant::SvtAv1);
        assert!(mk.contains(
            "$(tempdir)/split/00000.mkv $(tempdir)/split/00001.mkv $(tempdir)/split/00002.mkv &: $(input)\n"
        ));
        assert!(mk.contains("$(tempdir)/encode/%.mkv: $(tempdir)/split/%.mkv | $(namedpipe) tqdm\n"));
        assert!(mk.contains("$(tempdir)/check/%.match: $(tempdir)/split/%.fc $(tempdir)/encode/%.fc\n"));
        assert!(mk.contains("\nclean:\n\trm -rf $(tempdir)\n"));
        assert!(mk.contains("\n\t@mkdir -p $(@D)\n"));
    }

    #[test]
    fn phony_line_lists_command_targets() {
        let mk = text(vec![], EncoderVariant::Hevc { nvidia: true });
        let phony = mk.lines().find(|l| l.starts_with(".PHONY:")).unwrap();
        for name in [" all", " clean", " audio", " split", " verifyOutputFrames", " tqdm", " paste"] {
            assert!(phony.contains(name), "{phony}");
        }
        assert!(!phony.contains("$(output)"));
        assert!(!phony.contains('%'), "{phony}");

        let note = mk
            .lines()
            .take_while(|l| !l.starts_with(".PHONY:"))
            .last()
            .unwrap();
        assert!(note.starts_with("# recount-% reencode-% are phony"), "{note}");
    }

    #[test]
    fn rendering_is_deterministic() {
        let a = text(vec![5, 9, 300], EncoderVariant::Hevc { nvidia: false });
        let b = text(vec![5, 9, 300], EncoderVariant::Hevc { nvidia: false });
        assert_eq!(a, b);
    }

    #[test]
    fn write_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/Makefile");
        write(&path, "all:\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "all:\n");
    }
}
