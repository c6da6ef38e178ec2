//! Build-graph synthesis: turns split points and an encoder choice into make rules.
//!
//! Every node of the pipeline is a [`Target`] variant carrying only what it needs; the
//! single [`Target::rule`] function maps a variant onto a [`Rule`] (outputs, prerequisites,
//! recipe). [`BuildGraph::generate`] assembles the full rule list and refuses to hand back a
//! graph with a dangling prerequisite, a cycle, or an unverified paste.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::encoder::EncoderVariant;
use crate::paths::{segment_indices, Ext, SegmentIndex, Stage, TempLayout};
use crate::splits::SplitPoints;

pub const INPUT: &str = "$(input)";
pub const OUTPUT: &str = "$(output)";
pub const TEMP_DIR: &str = "$(tempdir)";
pub const IN_FRAMES: &str = "$(inframes)";
pub const OUT_FRAMES: &str = "$(outframes)";
pub const NAMED_PIPE: &str = "$(namedpipe)";

pub const AUDIO_FILE: &str = "audio.mkv";
pub const CONCAT_FILE: &str = "concat.txt";
pub const VMAF_FILE: &str = "vmaf.json";

pub const ALL: &str = "all";
pub const CLEAN: &str = "clean";
pub const SPLIT: &str = "split";
pub const AUDIO: &str = "audio";
pub const PREPARE: &str = "prepare";
pub const PASTE: &str = "paste";
pub const VERIFY_OUTPUT: &str = "verifyOutputFrames";
pub const PROGRESS: &str = "tqdm";
pub const VMAF: &str = "vmaf";
pub const RECOUNT: &str = "recount-%";
pub const RECOUNT_OUTPUT: &str = "recount-output";
pub const REENCODE: &str = "reencode-%";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("target '{target}' is declared by more than one rule")]
    DuplicateTarget { target: String },

    #[error("target '{target}' depends on '{dependency}', which no rule produces")]
    Dangling { target: String, dependency: String },

    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("'{target}' must depend on exactly every encoded segment, the audio track and every segment gate (missing: [{}], unexpected: [{}])", .missing.join(" "), .unexpected.join(" "))]
    PasteNotGated {
        target: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },

    #[error("gate '{target}' must depend on [{}] but depends on [{}]", .expected.join(" "), .actual.join(" "))]
    GateMismatch {
        target: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },
}

/// Inputs that fully determine a generated graph.
#[derive(Debug, Clone)]
pub struct GraphParams {
    pub split_points: SplitPoints,
    pub encoder: EncoderVariant,
}

/// One node of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Clean,
    Prepare { segments: usize },
    Split { split_frames: Vec<u64>, segments: usize },
    SplitAlias { segments: usize },
    Audio,
    AudioAlias,
    InputFrameCount,
    OutputFrameCount,
    SegmentFrameCount { stage: Stage },
    NamedPipe,
    ProgressLauncher { segments: usize },
    Encode { variant: EncoderVariant },
    SegmentGate,
    Paste { segments: usize },
    OutputGate,
    Recount,
    RecountOutput,
    Reencode,
    ForcePaste,
    Vmaf,
    VmafAlias,
}

/// A make rule. `%` in an output marks a pattern rule instantiated once per segment stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub comment: String,
    pub outputs: Vec<String>,
    /// Declared with `&:`: one recipe run produces every output.
    pub grouped: bool,
    pub inputs: Vec<String>,
    pub order_only: Vec<String>,
    pub recipe: Vec<String>,
    pub phony: bool,
}

impl Rule {
    fn new(comment: impl Into<String>, outputs: Vec<String>, inputs: Vec<String>) -> Self {
        Self {
            comment: comment.into(),
            outputs,
            grouped: false,
            inputs,
            order_only: Vec::new(),
            recipe: Vec::new(),
            phony: false,
        }
    }

    fn phony(mut self) -> Self {
        self.phony = true;
        self
    }

    fn grouped(mut self) -> Self {
        self.grouped = true;
        self
    }

    fn order_only(mut self, deps: Vec<String>) -> Self {
        self.order_only = deps;
        self
    }

    fn recipe<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipe = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_pattern(&self) -> bool {
        self.outputs.iter().any(|o| o.contains('%'))
    }
}

fn segment_files(layout: &TempLayout, stage: Stage, ext: Ext, segments: usize) -> Vec<String> {
    segment_indices(segments)
        .map(|i| layout.segment(stage, i, ext))
        .collect()
}

fn mismatch_report(subject: &str, left: &str, right: &str, hints: &[&str]) -> Vec<String> {
    let mut lines = vec![
        "@if ! cmp -s $^; then \\".to_string(),
        format!(
            "\techo \"Frame count mismatch for {subject}: {left}=$$(cat $<) {right}=$$(cat $(word 2,$^))\" >&2; \\"
        ),
        "\techo \"You can try, in the following order:\" >&2; \\".to_string(),
    ];
    for hint in hints {
        lines.push(format!("\techo \"  - {hint}\" >&2; \\"));
    }
    lines.push("\tfalse; \\".to_string());
    lines.push("fi".to_string());
    lines
}

impl Target {
    pub fn rule(&self, layout: &TempLayout) -> Rule {
        match self {
            Target::All => Rule::new("All", vec![ALL.into()], vec![VERIFY_OUTPUT.into()]).phony(),

            Target::Clean => Rule::new("Clean", vec![CLEAN.into()], vec![])
                .phony()
                .recipe([format!("rm -rf {}", layout.root())]),

            Target::Prepare { segments } => {
                let mut inputs = segment_files(layout, Stage::Split, Ext::FrameCount, *segments);
                inputs.push(layout.file(AUDIO_FILE));
                Rule::new("Prepare", vec![PREPARE.into()], inputs).phony()
            }

            Target::Split {
                split_frames,
                segments,
            } => {
                let split_dir = layout.stage_dir(Stage::Split);
                let mut cmd = "$(ffmpegcommand) -i $< -map 0:v:0 -an -c:v copy -avoid_negative_ts 1"
                    .to_string();
                if split_frames.is_empty() {
                    cmd.push(' ');
                    cmd.push_str(&layout.segment(Stage::Split, SegmentIndex(0), Ext::Mkv));
                } else {
                    let frames = split_frames
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join(",");
                    cmd.push_str(&format!(
                        " -f segment -segment_frames {frames} {split_dir}/%05d.mkv"
                    ));
                }
                Rule::new(
                    "SplitFile",
                    segment_files(layout, Stage::Split, Ext::Mkv, *segments),
                    vec![INPUT.into()],
                )
                .grouped()
                .recipe([format!("@mkdir -p {split_dir}"), cmd])
            }

            Target::SplitAlias { segments } => Rule::new(
                "Split",
                vec![SPLIT.into()],
                segment_files(layout, Stage::Split, Ext::Mkv, *segments),
            )
            .phony(),

            Target::Audio => Rule::new(
                "GetAudio",
                vec![layout.file(AUDIO_FILE)],
                vec![INPUT.into()],
            )
            .recipe([
                "@mkdir -p $(@D)",
                "$(ffmpegcommand) -i $< -map 0:a -vn -c:a copy $@",
            ]),

            Target::AudioAlias => {
                Rule::new("Audio", vec![AUDIO.into()], vec![layout.file(AUDIO_FILE)]).phony()
            }

            Target::InputFrameCount => frame_count_rule(
                "FrameCount input",
                IN_FRAMES.into(),
                INPUT.into(),
            ),

            Target::OutputFrameCount => frame_count_rule(
                "FrameCount output",
                OUT_FRAMES.into(),
                OUTPUT.into(),
            ),

            Target::SegmentFrameCount { stage } => frame_count_rule(
                &format!("FrameCount {}", stage.dir_name()),
                layout.pattern(*stage, Ext::FrameCount),
                layout.pattern(*stage, Ext::Mkv),
            ),

            Target::NamedPipe => Rule::new("NamedPipe", vec![NAMED_PIPE.into()], vec![])
                .recipe(["@mkdir -p $(@D)", "mkfifo $@"]),

            Target::ProgressLauncher { segments } => {
                Rule::new("Progress", vec![PROGRESS.into()], vec![IN_FRAMES.into()])
                    .phony()
                    .order_only(vec![NAMED_PIPE.into()])
                    .recipe([format!(
                        "@$(segmake) progress --sink {NAMED_PIPE} --total-frames $$(cat $<) \
                         --segments {segments} --tempdir {} --watch-pid $$PPID &",
                        layout.root()
                    )])
            }

            Target::Encode { variant } => Rule::new(
                format!("{}EncodeFile", variant.name()),
                vec![layout.pattern(Stage::Encode, Ext::Mkv)],
                vec![layout.pattern(Stage::Split, Ext::Mkv)],
            )
            .order_only(vec![NAMED_PIPE.into(), PROGRESS.into()])
            .recipe(variant.recipe()),

            Target::SegmentGate => {
                let mut recipe = vec!["@mkdir -p $(@D)".to_string()];
                recipe.extend(mismatch_report(
                    "segment $*",
                    "split",
                    "encode",
                    &[
                        "recounting both checkpoints with 'make recount-$*'",
                        "re-encoding the segment with 'make reencode-$*'",
                        "restarting everything with 'make clean && make'",
                    ],
                ));
                recipe.push("@cp $< $@".to_string());
                Rule::new(
                    "MatchFrames",
                    vec![layout.pattern(Stage::Check, Ext::Match)],
                    vec![
                        layout.pattern(Stage::Split, Ext::FrameCount),
                        layout.pattern(Stage::Encode, Ext::FrameCount),
                    ],
                )
                .recipe(recipe)
            }

            Target::Paste { segments } => {
                let concat = layout.file(CONCAT_FILE);
                let audio = layout.file(AUDIO_FILE);
                let mut inputs = segment_files(layout, Stage::Encode, Ext::Mkv, *segments);
                inputs.push(audio.clone());
                inputs.extend(segment_files(layout, Stage::Check, Ext::Match, *segments));

                // Entries are relative to the list file, which lives in the temp root.
                let listing = format!(
                    "@seq -f \"file '{}/%05g.{}'\" 0 {} > {concat}",
                    Stage::Encode.dir_name(),
                    Ext::Mkv.as_str(),
                    segments - 1
                );
                Rule::new("PasteFiles", vec![OUTPUT.into()], inputs).recipe([
                    listing,
                    format!(
                        "$(ffmpegcommand) -f concat -safe 0 -i {concat} -i {audio} \
                         -map 0:v -map 1:a -c copy $@"
                    ),
                    format!("@rm -f {concat}"),
                ])
            }

            Target::OutputGate => {
                let mut recipe = mismatch_report(
                    "the output",
                    "input",
                    "output",
                    &[
                        "recounting the output frames with 'make recount-output'",
                        "pasting again with 'make paste'",
                        "restarting everything with 'make clean && make'",
                    ],
                );
                recipe.push("@echo \"Output verified: $$(cat $<) frames\"".to_string());
                Rule::new(
                    "MatchOutputFrames",
                    vec![VERIFY_OUTPUT.into()],
                    vec![IN_FRAMES.into(), OUT_FRAMES.into()],
                )
                .phony()
                .recipe(recipe)
            }

            Target::Recount => {
                let targets = format!(
                    "{} {}",
                    layout.stem_ref(Stage::Split, Ext::FrameCount),
                    layout.stem_ref(Stage::Encode, Ext::FrameCount)
                );
                Rule::new("Recount", vec![RECOUNT.into()], vec![])
                    .phony()
                    .recipe([format!("rm -f {targets}"), format!("$(MAKE) {targets}")])
            }

            Target::RecountOutput => Rule::new("RecountOutput", vec![RECOUNT_OUTPUT.into()], vec![])
                .phony()
                .recipe([
                    format!("rm -f {OUT_FRAMES}"),
                    format!("$(MAKE) {OUT_FRAMES}"),
                ]),

            Target::Reencode => {
                let gate = layout.stem_ref(Stage::Check, Ext::Match);
                Rule::new("Reencode", vec![REENCODE.into()], vec![])
                    .phony()
                    .recipe([
                        format!(
                            "rm -f {} {} {gate}",
                            layout.stem_ref(Stage::Encode, Ext::Mkv),
                            layout.stem_ref(Stage::Encode, Ext::FrameCount)
                        ),
                        format!("$(MAKE) {gate}"),
                    ])
            }

            Target::ForcePaste => Rule::new("Repaste", vec![PASTE.into()], vec![])
                .phony()
                .recipe([format!("rm -f {OUTPUT}"), format!("$(MAKE) {OUTPUT}")]),

            Target::Vmaf => Rule::new(
                "VMAF",
                vec![layout.file(VMAF_FILE)],
                vec![OUTPUT.into(), INPUT.into(), VERIFY_OUTPUT.into()],
            )
            .recipe([
                "$(ffmpegcommand) -i $< -i $(word 2,$^) \
                 -lavfi \"[0:v][1:v]libvmaf=log_fmt=json:log_path=$@\" -f null -",
            ]),

            Target::VmafAlias => {
                Rule::new("Vmaf", vec![VMAF.into()], vec![layout.file(VMAF_FILE)]).phony()
            }
        }
    }
}

fn frame_count_rule(comment: &str, output: String, input: String) -> Rule {
    Rule::new(comment, vec![output], vec![input]).recipe([
        "@mkdir -p $(@D)",
        "$(ffprobecommand) -select_streams v:0 -count_frames \
         -show_entries stream=nb_read_frames -of csv=p=0 $< > $@",
    ])
}

/// The complete, verified set of rules for one pipeline.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    layout: TempLayout,
    segments: usize,
    rules: Vec<Rule>,
}

impl BuildGraph {
    pub fn generate(params: &GraphParams) -> Result<Self, GraphError> {
        let layout = TempLayout::new(TEMP_DIR);
        let segments = params.split_points.segment_count();

        let targets = vec![
            Target::All,
            Target::Clean,
            Target::Prepare { segments },
            Target::Audio,
            Target::AudioAlias,
            Target::Split {
                split_frames: params.split_points.frames().to_vec(),
                segments,
            },
            Target::SplitAlias { segments },
            Target::Paste { segments },
            Target::InputFrameCount,
            Target::OutputFrameCount,
            Target::SegmentFrameCount { stage: Stage::Split },
            Target::SegmentFrameCount {
                stage: Stage::Encode,
            },
            Target::SegmentGate,
            Target::OutputGate,
            Target::NamedPipe,
            Target::ProgressLauncher { segments },
            Target::Encode {
                variant: params.encoder,
            },
            Target::Recount,
            Target::RecountOutput,
            Target::Reencode,
            Target::ForcePaste,
            Target::Vmaf,
            Target::VmafAlias,
        ];

        let rules = targets.iter().map(|t| t.rule(&layout)).collect();
        let graph = Self {
            layout,
            segments,
            rules,
        };
        graph.verify()?;
        Ok(graph)
    }

    pub fn segments(&self) -> usize {
        self.segments
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn phony_names(&self, patterns: bool) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.phony && r.is_pattern() == patterns)
            .flat_map(|r| r.outputs.iter().map(String::as_str))
            .collect()
    }

    /// Names for `.PHONY:`. Phony pattern rules are left out; make would read them literally.
    pub fn phony_targets(&self) -> Vec<&str> {
        self.phony_names(false)
    }

    /// Phony pattern rules such as `recount-%`, which `.PHONY:` cannot name.
    pub fn phony_patterns(&self) -> Vec<&str> {
        self.phony_names(true)
    }

    /// Every concrete target with its prerequisites (normal and order-only), with pattern
    /// rules instantiated for each segment stem.
    pub fn concrete_nodes(&self) -> Result<BTreeMap<String, Vec<String>>, GraphError> {
        let stems: Vec<String> = segment_indices(self.segments).map(|i| i.stem()).collect();
        let mut nodes: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for rule in &self.rules {
            let instances: Vec<Option<&str>> = if rule.is_pattern() {
                stems.iter().map(|s| Some(s.as_str())).collect()
            } else {
                vec![None]
            };

            for stem in instances {
                let subst = |s: &String| match stem {
                    Some(stem) => s.replace('%', stem),
                    None => s.clone(),
                };
                let deps: Vec<String> = rule
                    .inputs
                    .iter()
                    .chain(rule.order_only.iter())
                    .map(|d| subst(d))
                    .collect();
                for output in &rule.outputs {
                    let name = subst(output);
                    if nodes.insert(name.clone(), deps.clone()).is_some() {
                        return Err(GraphError::DuplicateTarget { target: name });
                    }
                }
            }
        }
        Ok(nodes)
    }

    /// Prerequisites of one concrete target, if any rule produces it.
    #[cfg(test)]
    pub fn dependencies_of(&self, target: &str) -> Option<Vec<String>> {
        self.concrete_nodes().ok()?.remove(target)
    }

    pub fn verify(&self) -> Result<(), GraphError> {
        let nodes = self.concrete_nodes()?;
        check_closed(&nodes)?;
        check_acyclic(&nodes)?;
        self.check_gates(&nodes)?;
        self.check_paste(&nodes)
    }

    fn check_gates(&self, nodes: &BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
        for idx in segment_indices(self.segments) {
            let gate = self.layout.segment(Stage::Check, idx, Ext::Match);
            let expected = vec![
                self.layout.segment(Stage::Split, idx, Ext::FrameCount),
                self.layout.segment(Stage::Encode, idx, Ext::FrameCount),
            ];
            let actual = nodes.get(&gate).cloned().unwrap_or_default();
            if actual != expected {
                return Err(GraphError::GateMismatch {
                    target: gate,
                    expected,
                    actual,
                });
            }
        }
        Ok(())
    }

    fn check_paste(&self, nodes: &BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
        let mut expected: BTreeSet<String> = BTreeSet::new();
        for idx in segment_indices(self.segments) {
            expected.insert(self.layout.segment(Stage::Encode, idx, Ext::Mkv));
            expected.insert(self.layout.segment(Stage::Check, idx, Ext::Match));
        }
        expected.insert(self.layout.file(AUDIO_FILE));

        let actual: BTreeSet<String> = nodes
            .get(OUTPUT)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();

        if actual != expected {
            return Err(GraphError::PasteNotGated {
                target: OUTPUT.to_string(),
                missing: expected.difference(&actual).cloned().collect(),
                unexpected: actual.difference(&expected).cloned().collect(),
            });
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn rules_mut(&mut self) -> &mut Vec<Rule> {
        &mut self.rules
    }
}

fn check_closed(nodes: &BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
    for (target, deps) in nodes {
        for dep in deps {
            if dep != INPUT && !nodes.contains_key(dep) {
                return Err(GraphError::Dangling {
                    target: target.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn check_acyclic(nodes: &BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    for start in nodes.keys() {
        if marks.contains_key(start.as_str()) {
            continue;
        }
        // Iterative DFS; `stack` holds (node, next child position).
        let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        marks.insert(start.as_str(), Mark::Visiting);

        while let Some((node, pos)) = stack.pop() {
            let deps = nodes.get(node).map(Vec::as_slice).unwrap_or(&[]);
            if pos < deps.len() {
                stack.push((node, pos + 1));
                let child = deps[pos].as_str();
                match marks.get(child) {
                    Some(Mark::Visiting) => {
                        let mut path: Vec<String> = stack
                            .iter()
                            .map(|(n, _)| n.to_string())
                            .skip_while(|n| n != child)
                            .collect();
                        path.push(child.to_string());
                        return Err(GraphError::Cycle { path });
                    }
                    Some(Mark::Done) => {}
                    None => {
                        if nodes.contains_key(child) {
                            marks.insert(child, Mark::Visiting);
                            stack.push((child, 0));
                        }
                    }
                }
            } else {
                marks.insert(node, Mark::Done);
            }
        }
    }
    Ok(())
}
