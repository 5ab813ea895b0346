//! BIDS App entrypoint for AFNI `afni_proc.py`: validate a dataset, build one
//! command per participant from a template, and run it followed by the generated
//! `proc.bids` script.

use std::io;

pub mod config;
pub mod error;
pub mod pipeline;
pub mod runner;
pub mod subjects;
pub mod template;

use crate::config::{InputConfig, Settings};
use crate::error::PipelineError;
use crate::pipeline::{Pipeline, RunSummary};

/// Loads the tool settings and runs the whole pipeline, relaying output to stdout.
pub fn run(config: InputConfig) -> Result<RunSummary, PipelineError> {
    let settings = Settings::load(config.config_file.as_deref())?;
    let mut pipeline = Pipeline::new(config, settings);
    let stdout = io::stdout();
    let mut sink = stdout.lock();
    pipeline.run(&mut sink)
}
