//! # pipeline.rs
//!
//! Sequencing of one BIDS App run:
//!
//! `PrepareTemplate → ValidateDataset → ResolveSubjects →
//!  {BuildCommand → RunAnalysis → RunPostProcess} per subject → Done`
//!
//! Subjects are processed one after the other. The first error ends the run; the stage
//! it happened in is logged and the error is returned unchanged.
//!
//! The post-process step runs the generated script directly, not through a shell
//! pipeline, and copies its output to the script log itself. Its exit code is the
//! script's own.

use std::fmt::Display;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::config::{InputConfig, Settings};
use crate::error::PipelineError;
use crate::runner::{Environment, ProcessRunner, Tee};
use crate::subjects::{SUBJECT_PREFIX, locate_files, resolve_subjects};
use crate::template::{CommandTemplate, Placeholders, ResolvedCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    PrepareTemplate,
    ValidateDataset,
    ResolveSubjects,
    BuildCommand(String),
    RunAnalysis(String),
    RunPostProcess(String),
    Done,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::PrepareTemplate => write!(f, "prepare-template"),
            Stage::ValidateDataset => write!(f, "validate-dataset"),
            Stage::ResolveSubjects => write!(f, "resolve-subjects"),
            Stage::BuildCommand(subject) => write!(f, "build-command[sub-{}]", subject),
            Stage::RunAnalysis(subject) => write!(f, "run-analysis[sub-{}]", subject),
            Stage::RunPostProcess(subject) => write!(f, "run-post-process[sub-{}]", subject),
            Stage::Done => write!(f, "done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Subjects fully processed, in processing order.
    pub subjects: Vec<String>,
    pub dry_run: bool,
}

pub struct Pipeline {
    input: InputConfig,
    settings: Settings,
    runner: ProcessRunner,
    stage: Stage,
}

impl Pipeline {
    /// The runner environment is the inherited one plus the `env` entries of `settings`.
    pub fn new(input: InputConfig, settings: Settings) -> Self {
        let env = Environment::inherit().with_overrides(settings.env_overrides());
        debug!("launching tools with {} environment variables", env.len());
        let runner = ProcessRunner::new(env, settings.shell.clone());
        Pipeline {
            input,
            settings,
            runner,
            stage: Stage::PrepareTemplate,
        }
    }

    pub fn stage(&self) -> &Stage {
        &self.stage
    }

    ///
    /// Runs every stage, relaying tool output and printing each command to `sink`.
    ///
    /// # Errors
    /// Any failure is terminal; `stage()` tells where the run stopped.
    pub fn run<W: Write>(&mut self, sink: &mut W) -> Result<RunSummary, PipelineError> {
        let start = Instant::now();
        let result = self.execute(sink);
        match &result {
            Ok(summary) => info!(
                "processed {} subjects in {:.2?}",
                summary.subjects.len(),
                start.elapsed()
            ),
            Err(e) => error!("run aborted during {}: {}", self.stage, e),
        }
        result
    }

    fn enter(&mut self, stage: Stage) {
        debug!("entering {}", stage);
        self.stage = stage;
    }

    fn execute<W: Write>(&mut self, sink: &mut W) -> Result<RunSummary, PipelineError> {
        self.enter(Stage::PrepareTemplate);
        let template =
            CommandTemplate::select(self.input.afni_proc.as_deref(), &self.settings)?;
        debug!("using {:?} template: {}", template.source(), template.as_str());

        self.enter(Stage::ValidateDataset);
        self.validate_dataset(sink)?;

        self.enter(Stage::ResolveSubjects);
        let subjects = resolve_subjects(&self.input.bids_dir, &self.input.participant_label)?;
        info!("{} subjects to analyze: {}", subjects.len(), subjects.join(" "));

        let mut processed = Vec::with_capacity(subjects.len());
        for subject in subjects {
            self.process_subject(&template, &subject, sink)?;
            processed.push(subject);
        }

        self.enter(Stage::Done);
        Ok(RunSummary {
            subjects: processed,
            dry_run: self.input.dry_run,
        })
    }

    fn validate_dataset<W: Write>(&self, sink: &mut W) -> Result<(), PipelineError> {
        let mut argv: Vec<String> = self
            .settings
            .validator
            .split_whitespace()
            .map(str::to_string)
            .collect();
        argv.push(self.input.bids_dir.display().to_string());
        match self.runner.run(&ResolvedCommand::Argv(argv), sink) {
            Ok(_) => Ok(()),
            Err(PipelineError::ProcessFailed { code, .. }) => {
                Err(PipelineError::ValidationFailed { code })
            }
            Err(e) => Err(e),
        }
    }

    fn process_subject<W: Write>(
        &mut self,
        template: &CommandTemplate,
        subject: &str,
        sink: &mut W,
    ) -> Result<(), PipelineError> {
        self.enter(Stage::BuildCommand(subject.to_string()));
        let files = locate_files(&self.input.bids_dir, subject)?;
        let out_dir = self
            .input
            .output_dir
            .join(format!("{}{}", SUBJECT_PREFIX, subject));
        let values = Placeholders::new(subject, &out_dir, &files.anat_path, &files.epi_paths);
        let command = template.resolve(&values, self.input.exec_mode)?;
        let post_process = ResolvedCommand::Argv(self.settings.post_process_argv());

        writeln!(sink, "{}", command)?;
        if self.input.dry_run {
            writeln!(sink, "{}", post_process)?;
            return Ok(());
        }

        self.enter(Stage::RunAnalysis(subject.to_string()));
        self.runner.run(&command, sink)?;

        self.enter(Stage::RunPostProcess(subject.to_string()));
        writeln!(sink, "{}", post_process)?;
        let log_path = self.settings.script_log();
        debug!("copying post-process output to {}", log_path.display());
        let log = BufWriter::new(File::create(&log_path)?);
        self.runner.run(&post_process, &mut Tee::new(&mut *sink, log))?;
        Ok(())
    }
}
