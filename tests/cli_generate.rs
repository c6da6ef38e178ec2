use assert_cmd::Command;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn combined_output(output: &std::process::Output) -> String {
    format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn segmake(dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("segmake"));
    cmd.current_dir(dir);
    cmd
}

/// A fake input plus a split file, so generation never needs ffmpeg.
fn workspace(splits: &str) -> TempDir {
    let tmp = TempDir::new().expect("tempdir");
    fs::write(tmp.path().join("in.mkv"), b"not a real video").expect("write input");
    fs::write(tmp.path().join("in.mkv.csv"), splits).expect("write splits");
    tmp
}

fn generate(tmp: &TempDir, extra: &[&str]) -> (std::process::Output, Option<String>) {
    let output = segmake(tmp.path())
        .arg("in.mkv")
        .args(extra)
        .output()
        .expect("segmake runs");
    let makefile = fs::read_to_string(tmp.path().join("Makefile")).ok();
    (output, makefile)
}

#[test]
fn help_lists_generation_flags() {
    let tmp = TempDir::new().expect("tempdir");
    let output = segmake(tmp.path()).arg("--help").output().expect("--help runs");
    assert!(output.status.success());
    let text = combined_output(&output);
    for flag in [
        "--tempdir",
        "--output",
        "--encoder",
        "--makefile",
        "--splits",
        "--splitsfile",
        "--nvidia",
        "--scene-threshold",
        "--verbose",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn progress_help_lists_its_flags() {
    let tmp = TempDir::new().expect("tempdir");
    let output = segmake(tmp.path())
        .args(["progress", "--help"])
        .output()
        .expect("progress --help runs");
    assert!(output.status.success());
    let text = combined_output(&output);
    for flag in [
        "--sink",
        "--total-frames",
        "--segments",
        "--tempdir",
        "--watch-pid",
        "--progress",
    ] {
        assert!(text.contains(flag), "help text missing {flag}: {text}");
    }
}

#[test]
fn empty_split_file_yields_a_single_segment() {
    let tmp = workspace("");
    let (output, makefile) = generate(&tmp, &[]);
    assert!(output.status.success(), "{}", combined_output(&output));
    let mk = makefile.expect("Makefile written");

    assert!(mk.contains("$(tempdir)/split/00000.mkv &: $(input)"), "{mk}");
    assert!(!mk.contains("$(tempdir)/split/00001.mkv"), "{mk}");
    assert!(!mk.contains("-f segment"), "{mk}");
    assert!(mk.contains("tempdir := in.segmake\n"), "{mk}");
    assert!(mk.contains("output := output.mkv\n"), "{mk}");

    let text = combined_output(&output);
    assert!(text.contains("Makefile summary:"), "{text}");
    assert!(text.contains("segments=1"), "{text}");
}

#[test]
fn two_split_points_yield_three_gated_segments() {
    let tmp = workspace("100,250\n");
    let (output, makefile) = generate(&tmp, &["-o", "final.mkv"]);
    assert!(output.status.success(), "{}", combined_output(&output));
    let mk = makefile.expect("Makefile written");

    assert!(mk.contains("-f segment -segment_frames 100,250 $(tempdir)/split/%05d.mkv"), "{mk}");
    let paste = mk
        .lines()
        .find(|l| l.starts_with("$(output):"))
        .expect("paste rule");
    assert_eq!(
        paste,
        "$(output): $(tempdir)/encode/00000.mkv $(tempdir)/encode/00001.mkv \
         $(tempdir)/encode/00002.mkv $(tempdir)/audio.mkv $(tempdir)/check/00000.match \
         $(tempdir)/check/00001.match $(tempdir)/check/00002.match"
    );
    assert!(mk.contains("output := final.mkv\n"), "{mk}");
    assert!(combined_output(&output).contains("segments=3"));
}

#[test]
fn nvidia_reaches_hevc_but_never_av1() {
    let tmp = workspace("50");
    let (output, makefile) = generate(&tmp, &["-e", "hevc", "--nvidia"]);
    assert!(output.status.success(), "{}", combined_output(&output));
    let mk = makefile.expect("Makefile written");
    assert!(mk.contains("-hwaccel cuda"), "{mk}");
    assert!(mk.contains("hevc_nvenc"), "{mk}");
    assert!(!mk.contains("svtexec"), "{mk}");

    let (output, makefile) = generate(&tmp, &["-e", "av1", "--nvidia"]);
    assert!(output.status.success(), "{}", combined_output(&output));
    let mk = makefile.expect("Makefile written");
    assert!(!mk.contains("-hwaccel"), "{mk}");
    assert!(!mk.contains("nvenc"), "{mk}");
    assert!(mk.contains("svtexec ?= SvtAv1EncApp"), "{mk}");
    assert!(
        combined_output(&output).contains("--nvidia only applies to the hevc encoder"),
        "{}",
        combined_output(&output)
    );
}

#[test]
fn regeneration_is_byte_identical() {
    let tmp = workspace("10,20,30,40");
    let (first, a) = generate(&tmp, &["--tempdir", "work"]);
    assert!(first.status.success(), "{}", combined_output(&first));
    let (second, b) = generate(&tmp, &["--tempdir", "work"]);
    assert!(second.status.success(), "{}", combined_output(&second));
    assert_eq!(a.expect("first Makefile"), b.expect("second Makefile"));
}

#[test]
fn custom_makefile_path_is_honored() {
    let tmp = workspace("10");
    let (output, _) = generate(&tmp, &["-m", "build/encode.mk"]);
    assert!(output.status.success(), "{}", combined_output(&output));
    assert!(tmp.path().join("build/encode.mk").is_file());
    assert!(!tmp.path().join("Makefile").exists());
    assert!(combined_output(&output).contains("make -f build/encode.mk"));
}

#[test]
fn invalid_split_files_write_nothing() {
    for bad in ["250,100", "0,10", "10,abc", "10,10"] {
        let tmp = workspace(bad);
        let (output, makefile) = generate(&tmp, &[]);
        assert!(!output.status.success(), "{bad} accepted");
        assert!(makefile.is_none(), "{bad} still wrote a Makefile");
        assert!(
            combined_output(&output).contains("split"),
            "{}",
            combined_output(&output)
        );
    }
}

#[test]
fn missing_input_is_an_error() {
    let tmp = TempDir::new().expect("tempdir");
    let output = segmake(tmp.path())
        .arg("absent.mkv")
        .output()
        .expect("segmake runs");
    assert!(!output.status.success());
    assert!(combined_output(&output).contains("does not exist"));
    assert!(!tmp.path().join("Makefile").exists());
}

#[test]
fn output_colliding_with_input_is_an_error() {
    let tmp = workspace("");
    let (output, makefile) = generate(&tmp, &["-o", "./in.mkv"]);
    assert!(!output.status.success());
    assert!(makefile.is_none());
    assert!(
        combined_output(&output).contains("would overwrite the input"),
        "{}",
        combined_output(&output)
    );
}

#[test]
fn tempdir_enclosing_kept_files_is_rejected() {
    let tmp = workspace("");
    for args in [
        &["--tempdir", "."][..],
        &["--tempdir", "work", "-o", "work/out.mkv"][..],
        &["--tempdir", "work", "-m", "work/Makefile"][..],
    ] {
        let output = segmake(tmp.path())
            .arg("in.mkv")
            .args(args)
            .output()
            .expect("segmake runs");
        let text = combined_output(&output);
        assert!(!output.status.success(), "{args:?} accepted: {text}");
        assert!(text.contains("`make clean` would delete it"), "{text}");
        assert!(!tmp.path().join("Makefile").exists());
        assert!(!tmp.path().join("work/Makefile").exists());
    }
}

#[test]
fn unsafe_paths_are_rejected() {
    let tmp = workspace("");
    let (output, makefile) = generate(&tmp, &["-o", "my output.mkv"]);
    assert!(!output.status.success());
    assert!(makefile.is_none());
    assert!(combined_output(&output).contains("only letters, digits"));
}

#[test]
fn zero_even_splits_are_rejected() {
    let tmp = workspace("");
    let (output, makefile) = generate(&tmp, &["--splits", "0"]);
    assert!(!output.status.success());
    assert!(makefile.is_none());
    assert!(combined_output(&output).contains("--splits must be at least 1"));
}

#[test]
fn report_relays_monotonic_frames_then_done() {
    let tmp = TempDir::new().expect("tempdir");
    let sink = tmp.path().join("progress.log");
    fs::write(&sink, "").expect("create sink");

    let output = segmake(tmp.path())
        .args(["report", "--segment", "00002", "--format", "ffmpeg", "--sink"])
        .arg(&sink)
        .write_stdin("frame=    5 fps=1\rframe=    9 fps=1\rframe=    7 fps=1\r[hevc] something odd\n")
        .output()
        .expect("report runs");
    assert!(output.status.success(), "{}", combined_output(&output));
    assert_eq!(
        fs::read_to_string(&sink).expect("read sink"),
        "00002\t5\n00002\t9\n00002\tdone\n"
    );
    assert!(String::from_utf8_lossy(&output.stderr).contains("[hevc] something odd"));
}

#[test]
fn report_without_aggregator_still_succeeds() {
    let tmp = TempDir::new().expect("tempdir");
    let output = segmake(tmp.path())
        .args(["report", "--segment", "00000", "--format", "svt", "--sink", "no-such.fifo"])
        .write_stdin("Encoding frame   10\x08\x08Encoding frame   20\n")
        .output()
        .expect("report runs");
    assert!(output.status.success(), "{}", combined_output(&output));
}

#[test]
fn progress_summarizes_a_recorded_run() {
    let tmp = TempDir::new().expect("tempdir");
    let sink = tmp.path().join("progress.log");
    fs::write(
        &sink,
        "00000\t40\n00001\t25\n00000\tdone\ngarbage\n00001\t60\n00001\tdone\n",
    )
    .expect("write sink");

    let output = segmake(tmp.path())
        .args(["progress", "--total-frames", "1000", "--segments", "2", "--progress", "plain", "--sink"])
        .arg(&sink)
        .output()
        .expect("progress runs");
    assert!(output.status.success(), "{}", combined_output(&output));

    let text = combined_output(&output);
    assert!(text.contains("[PROGRESS] segments="), "{text}");
    assert!(text.contains("finish=all-segments-done"), "{text}");
    assert!(text.contains("segments=2/2"), "{text}");
    assert!(text.contains("malformed_lines=1"), "{text}");
}
