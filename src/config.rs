//! # config.rs
//!
//! This module defines the configuration structures for the BIDS App entrypoint.
//! It includes:
//! - `InputConfig`: Parses command-line arguments (BIDS App conventions).
//! - `Settings`: Tool locations and fixed command lines, layered from the embedded
//!   defaults, an optional user TOML file and `AFNI_BIDS_*` environment variables.
//! - `AnalysisLevel` and `ExecMode`: value enums for the CLI.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Parser, ValueEnum};
use config::Config;
use serde::Deserialize;

use crate::error::PipelineError;

/// Configuration parsed from CLI input arguments.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "afni_proc BIDS-App",
    bin_name = "afni-proc-bids",
    version = env!("CARGO_PKG_VERSION"),
    disable_version_flag = true,
    about = "BIDS App entrypoint running AFNI afni_proc.py on every participant of a BIDS dataset."
)]
pub struct InputConfig {
    /// The directory with the input dataset formatted according to the BIDS standard.
    pub bids_dir: PathBuf,
    /// The directory where the output files should be stored.
    pub output_dir: PathBuf,
    /// Level of the analysis that will be performed. Only "participant" is supported.
    #[arg(value_enum)]
    pub analysis_level: AnalysisLevel,
    /// The label(s) of the participant(s) that should be analyzed, without the "sub-"
    /// prefix. If omitted all subjects are analyzed.
    #[arg(
        long = "participant_label",
        visible_alias = "participant-label",
        num_args = 1..,
        value_name = "LABEL"
    )]
    pub participant_label: Vec<String>,
    /// Optional afni_proc.py arguments. Values that vary by subject are written as
    /// {subj_id}, {out_dir}, {anat_path} or {epi_paths}. The first _T1w of each subject
    /// is used as the anat and all _bold files as the functionals.
    #[arg(
        long = "afni_proc",
        visible_alias = "afni-proc",
        value_name = "TEMPLATE",
        allow_hyphen_values = true
    )]
    pub afni_proc: Option<String>,
    /// How the analysis command is launched.
    #[arg(long = "exec-mode", value_enum, default_value_t = ExecMode::Argv)]
    pub exec_mode: ExecMode,
    /// TOML file overriding the built-in tool settings.
    #[arg(long = "config", value_name = "FILE")]
    pub config_file: Option<PathBuf>,
    /// Print each subject's commands without running the analysis.
    #[arg(long)]
    pub dry_run: bool,
    /// Log filter used when RUST_LOG is unset.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: (),
}

#[derive(Debug, PartialEq, Clone, Copy, ValueEnum)]
pub enum AnalysisLevel {
    Participant,
}

/// Whether the resolved command is handed to the OS as an argument vector or
/// interpreted by a shell.
#[derive(Debug, PartialEq, Eq, Clone, Copy, ValueEnum)]
pub enum ExecMode {
    Argv,
    Shell,
}

impl Display for ExecMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode_str = match self {
            ExecMode::Argv => "argv",
            ExecMode::Shell => "shell",
        };
        write!(f, "{}", mode_str)
    }
}

impl InputConfig {
    pub fn new(
        bids_dir: PathBuf,
        output_dir: PathBuf,
        participant_label: Vec<String>,
        afni_proc: Option<String>,
        exec_mode: ExecMode,
    ) -> Self {
        InputConfig {
            bids_dir,
            output_dir,
            analysis_level: AnalysisLevel::Participant,
            participant_label,
            afni_proc,
            exec_mode,
            config_file: None,
            dry_run: false,
            log_level: "info".to_string(),
            version: (),
        }
    }

    ///
    /// Parses command-line arguments into a validated `InputConfig`.
    ///
    /// # Errors
    /// Returns an error if the BIDS directory is missing or the output path is a file.
    pub fn build() -> Result<InputConfig, PipelineError> {
        let input_config = InputConfig::parse();
        input_config.validate()?;
        Ok(input_config)
    }

    /// Checks the input directory and creates the output directory if it does not exist.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.bids_dir.is_dir() {
            return Err(PipelineError::BidsDir(self.bids_dir.clone()));
        }

        if self.output_dir.exists() {
            if !self.output_dir.is_dir() {
                return Err(PipelineError::OutputDir(self.output_dir.clone()));
            }
        } else {
            std::fs::create_dir_all(&self.output_dir)?;
        }
        Ok(())
    }
}

///
/// Built-in tool settings, overridable from a TOML file or the environment.
pub const DEFAULT_SETTINGS_STR: &str = include_str!("../data/default_settings.toml");

const ENV_PREFIX: &str = "AFNI_BIDS";

/// Tool locations and fixed command lines used by the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// BIDS validator command; the dataset path is appended as the last argument.
    pub validator: String,
    /// Interpreter invocation prefixed to every analysis template.
    pub interpreter: String,
    /// afni_proc.py arguments used when no operator template is given.
    pub default_arguments: String,
    /// Script generated by the analysis step and executed by `post_process`.
    pub script_name: String,
    /// Interpreter invocation for the generated script; the script path is appended.
    pub post_process: String,
    pub shell: String,
    /// `KEY=VALUE` entries merged over the inherited environment of every process.
    #[serde(default)]
    pub env: Vec<String>,
}

impl Settings {
    /// Embedded defaults only.
    pub fn defaults() -> Result<Settings, PipelineError> {
        Ok(Self::base().build()?.try_deserialize::<Settings>()?)
    }

    ///
    /// Layers embedded defaults, the optional user file and `AFNI_BIDS_*` variables.
    ///
    /// # Errors
    /// Returns an error if the user file is missing or any layer fails to deserialize.
    pub fn load(config_file: Option<&Path>) -> Result<Settings, PipelineError> {
        let mut builder = Self::base();
        if let Some(path) = config_file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .list_separator(",")
                    .with_list_parse_key("env"),
            )
            .build()?
            .try_deserialize::<Settings>()?;
        #[cfg(debug_assertions)]
        dbg!(&settings);
        Ok(settings)
    }

    fn base() -> config::ConfigBuilder<config::builder::DefaultState> {
        Config::builder().add_source(config::File::from_str(
            DEFAULT_SETTINGS_STR,
            config::FileFormat::Toml,
        ))
    }

    /// Argument vector of the post-process step.
    pub fn post_process_argv(&self) -> Vec<String> {
        self.post_process
            .split_whitespace()
            .map(str::to_string)
            .chain(std::iter::once(self.script_name.clone()))
            .collect()
    }

    /// Log of the post-process step: `output.<script>` in the script's directory.
    pub fn script_log(&self) -> PathBuf {
        let script = Path::new(&self.script_name);
        let file_name = script
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        script.with_file_name(format!("output.{}", file_name))
    }

    /// Parsed `env` entries; entries without `=` are ignored with a warning.
    pub fn env_overrides(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|entry| match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => {
                    Some((key.to_string(), value.to_string()))
                }
                _ => {
                    tracing::warn!("ignoring malformed env entry '{}'", entry);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::defaults().unwrap();
        assert_eq!(settings.validator, "bids-validator");
        assert_eq!(settings.interpreter, "python /opt/afni/afni_proc.py");
        assert_eq!(settings.shell, "sh");
        assert_eq!(settings.script_name, "proc.bids");
        assert_eq!(settings.post_process_argv(), vec!["tcsh", "-xef", "proc.bids"]);
        assert_eq!(settings.script_log(), PathBuf::from("output.proc.bids"));
        assert!(
            settings
                .default_arguments
                .starts_with("-subj_id {subj_id} -script {script_name} ")
        );
        assert!(settings.default_arguments.ends_with("-blur_size 4.0 -bash"));
        assert!(settings.env.is_empty());
    }

    #[test]
    fn test_user_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "validator = \"true\"").unwrap();
        writeln!(file, "env = [\"OMP_NUM_THREADS=4\", \"broken\"]").unwrap();
        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.validator, "true");
        assert_eq!(settings.shell, "sh");
        assert_eq!(
            settings.env_overrides(),
            vec![("OMP_NUM_THREADS".to_string(), "4".to_string())]
        );
    }

    #[test]
    fn test_script_name_drives_post_process() {
        let mut settings = Settings::defaults().unwrap();
        settings.script_name = "/work/sub-01/proc.sub-01".to_string();
        settings.post_process = "tcsh -xef".to_string();
        assert_eq!(
            settings.post_process_argv(),
            vec!["tcsh", "-xef", "/work/sub-01/proc.sub-01"]
        );
        assert_eq!(
            settings.script_log(),
            PathBuf::from("/work/sub-01/output.proc.sub-01")
        );
    }

    #[test]
    fn test_missing_user_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/afni_bids.toml")));
        assert!(matches!(result, Err(PipelineError::Settings(_))));
    }

    #[test]
    fn test_args() {
        let missing_level = InputConfig::try_parse_from(["afni-proc-bids", "/data", "/out"]);
        assert!(missing_level.is_err(), "Expected an error, but parsing succeeded");

        let wrong_level =
            InputConfig::try_parse_from(["afni-proc-bids", "/data", "/out", "group"]);
        assert!(wrong_level.is_err(), "only participant level is supported");

        let args = InputConfig::try_parse_from([
            "afni-proc-bids",
            "/data",
            "/out",
            "participant",
            "--participant_label",
            "01",
            "02",
            "--afni_proc",
            "-subj_id {subj_id} -dsets {epi_paths}",
        ])
        .unwrap();
        assert_eq!(args.bids_dir, PathBuf::from("/data"));
        assert_eq!(args.analysis_level, AnalysisLevel::Participant);
        assert_eq!(args.participant_label, vec!["01", "02"]);
        assert_eq!(
            args.afni_proc.as_deref(),
            Some("-subj_id {subj_id} -dsets {epi_paths}")
        );
        assert_eq!(args.exec_mode, ExecMode::Argv);
        assert!(!args.dry_run);

        let shell_mode = InputConfig::try_parse_from([
            "afni-proc-bids",
            "/data",
            "/out",
            "participant",
            "--exec-mode",
            "shell",
            "--participant-label",
            "03",
        ])
        .unwrap();
        assert_eq!(shell_mode.exec_mode, ExecMode::Shell);
        assert_eq!(shell_mode.participant_label, vec!["03"]);
    }

    #[test]
    fn test_version_flag() {
        let err = InputConfig::try_parse_from(["afni-proc-bids", "-v"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_validate_creates_output_dir() {
        let bids = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let output_dir = out.path().join("derivatives").join("afni");
        let config = InputConfig::new(
            bids.path().to_path_buf(),
            output_dir.clone(),
            Vec::new(),
            None,
            ExecMode::Argv,
        );
        config.validate().unwrap();
        assert!(output_dir.is_dir());
    }

    #[test]
    fn test_validate_rejects_bad_paths() {
        let bids = tempfile::tempdir().unwrap();
        let missing = InputConfig::new(
            bids.path().join("missing"),
            bids.path().join("out"),
            Vec::new(),
            None,
            ExecMode::Argv,
        );
        assert!(matches!(missing.validate(), Err(PipelineError::BidsDir(_))));

        let file = bids.path().join("not_a_dir");
        std::fs::write(&file, "x").unwrap();
        let file_output = InputConfig::new(
            bids.path().to_path_buf(),
            file,
            Vec::new(),
            None,
            ExecMode::Argv,
        );
        assert!(matches!(
            file_output.validate(),
            Err(PipelineError::OutputDir(_))
        ));
    }
}
