//! # error.rs
//!
//! Error type shared by every stage of the pipeline. Each variant is fatal: nothing in
//! the crate catches and retries, errors bubble up to `main` which prints them and exits
//! with [`PipelineError::exit_code`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("BIDS validation failed with exit code {code}")]
    ValidationFailed { code: i32 },

    #[error("Unsafe character '{sequence}' found in command: {template}")]
    UnsafeTemplate {
        sequence: &'static str,
        template: String,
    },

    #[error("Unsafe character '{sequence}' found in {placeholder} value: {value}")]
    UnsafeValue {
        placeholder: &'static str,
        sequence: &'static str,
        value: String,
    },

    #[error("No T1w image found for subject '{subject}' (searched {searched})")]
    MissingAnatomy { subject: String, searched: String },

    #[error("Unresolved placeholder '{{' found in command: {command}")]
    UnresolvedPlaceholder { command: String },

    #[error("Non zero return code from {program}: {code}")]
    ProcessFailed { program: String, code: i32 },

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Resolved command is empty")]
    EmptyCommand,

    #[error("Output path {} exists but it is not a directory", .0.display())]
    OutputDir(PathBuf),

    #[error("BIDS directory {} does not exist or is not a directory", .0.display())]
    BidsDir(PathBuf),

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl PipelineError {
    /// Process exit status for this failure. A failed child passes its own code through
    /// when it fits in a process status, everything else exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::ValidationFailed { code } | PipelineError::ProcessFailed { code, .. }
                if (1..=255).contains(code) =>
            {
                *code
            }
            _ => 1,
        }
    }
}
