//! # template.rs
//!
//! Per-subject command construction for afni_proc.py.
//!
//! An operator template is screened against [`DENYLIST`] before anything is substituted
//! into it, because in shell mode the rendered command is interpreted by `sh`. In shell
//! mode the substituted values are screened too: labels and directories come from the
//! command line. After rendering, any `{` left over means the template used a placeholder
//! this crate does not know, and the command is refused.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use itertools::Itertools;
use regex::{Captures, Regex};

use crate::config::{ExecMode, Settings};
use crate::error::PipelineError;

/// Sequences an operator template may not contain. `\.` is a backslash followed by a dot.
pub const DENYLIST: [&str; 14] = [
    "`", "|", "&", ";", ">", "<", "$", "?", "(", ")", "\\.", ":", "[", "]",
];

const PLACEHOLDER_OPEN: char = '{';

/// Filled from `Settings::script_name` when the default template is built.
const SCRIPT_NAME_PLACEHOLDER: &str = "{script_name}";

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

///
/// Rejects a template containing any denylisted sequence. Reports the first hit in
/// denylist order.
pub fn sanitize(template: &str) -> Result<(), PipelineError> {
    match denied_sequence(template) {
        Some(sequence) => Err(PipelineError::UnsafeTemplate {
            sequence,
            template: template.to_string(),
        }),
        None => Ok(()),
    }
}

fn denied_sequence(text: &str) -> Option<&'static str> {
    DENYLIST.iter().find(|bad| text.contains(**bad)).copied()
}

/// Values substituted for `{subj_id}`, `{out_dir}`, `{anat_path}` and `{epi_paths}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholders {
    pub subj_id: String,
    pub out_dir: String,
    pub anat_path: String,
    pub epi_paths: String,
}

impl Placeholders {
    pub fn new(subj_id: &str, out_dir: &Path, anat_path: &Path, epi_paths: &[PathBuf]) -> Self {
        Placeholders {
            subj_id: subj_id.to_string(),
            out_dir: out_dir.display().to_string(),
            anat_path: anat_path.display().to_string(),
            epi_paths: epi_paths.iter().map(|p| p.display()).join(" "),
        }
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.entries()
            .into_iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("subj_id", self.subj_id.as_str()),
            ("out_dir", self.out_dir.as_str()),
            ("anat_path", self.anat_path.as_str()),
            ("epi_paths", self.epi_paths.as_str()),
        ]
    }

    ///
    /// Rejects values a shell would interpret, before they reach a `sh -c` line.
    ///
    /// # Errors
    /// Returns `UnsafeValue` naming the first placeholder whose value holds a denylisted
    /// sequence.
    pub fn check_shell_safe(&self) -> Result<(), PipelineError> {
        for (placeholder, value) in self.entries() {
            if let Some(sequence) = denied_sequence(value) {
                return Err(PipelineError::UnsafeValue {
                    placeholder,
                    sequence,
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateSource {
    Default,
    Operator,
}

/// A full command line (interpreter included) with unsubstituted placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandTemplate {
    source: TemplateSource,
    body: String,
}

/// A command ready to launch.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedCommand {
    Argv(Vec<String>),
    Shell(String),
}

impl CommandTemplate {
    /// The built-in afni_proc.py parameters. Not operator input, so not sanitized.
    pub fn default_template(settings: &Settings) -> Self {
        let arguments = settings
            .default_arguments
            .replace(SCRIPT_NAME_PLACEHOLDER, &settings.script_name);
        CommandTemplate {
            source: TemplateSource::Default,
            body: format!("{} {}", settings.interpreter, arguments),
        }
    }

    ///
    /// Sanitizes an operator-supplied argument string and prefixes the interpreter.
    ///
    /// # Errors
    /// Returns `UnsafeTemplate` if `raw` contains a denylisted sequence.
    pub fn operator(raw: &str, settings: &Settings) -> Result<Self, PipelineError> {
        sanitize(raw)?;
        Ok(CommandTemplate {
            source: TemplateSource::Operator,
            body: format!("{} {}", settings.interpreter, raw),
        })
    }

    /// Operator template when one is given, the default otherwise.
    pub fn select(raw: Option<&str>, settings: &Settings) -> Result<Self, PipelineError> {
        match raw {
            Some(raw) => Self::operator(raw, settings),
            None => Ok(Self::default_template(settings)),
        }
    }

    pub fn source(&self) -> TemplateSource {
        self.source
    }

    pub fn as_str(&self) -> &str {
        &self.body
    }

    ///
    /// Substitutes every known placeholder in one pass; substituted text is never
    /// re-scanned. Fails if any `{` survives, including one brought in by a value.
    pub fn render(&self, values: &Placeholders) -> Result<String, PipelineError> {
        let rendered = PLACEHOLDER_RE.replace_all(&self.body, |caps: &Captures| {
            match values.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        });

        if rendered.contains(PLACEHOLDER_OPEN) {
            return Err(PipelineError::UnresolvedPlaceholder {
                command: rendered.into_owned(),
            });
        }
        Ok(rendered.into_owned())
    }

    /// Renders and packages the command for the given execution mode. Shell mode also
    /// screens the substituted values.
    pub fn resolve(
        &self,
        values: &Placeholders,
        mode: ExecMode,
    ) -> Result<ResolvedCommand, PipelineError> {
        if mode == ExecMode::Shell {
            values.check_shell_safe()?;
        }
        let rendered = self.render(values)?;
        let command = match mode {
            ExecMode::Argv => ResolvedCommand::Argv(
                rendered.split_whitespace().map(str::to_string).collect(),
            ),
            ExecMode::Shell => ResolvedCommand::Shell(rendered),
        };
        if command.is_empty() {
            return Err(PipelineError::EmptyCommand);
        }
        Ok(command)
    }
}

impl ResolvedCommand {
    pub fn is_empty(&self) -> bool {
        match self {
            ResolvedCommand::Argv(args) => args.is_empty(),
            ResolvedCommand::Shell(line) => line.trim().is_empty(),
        }
    }

    /// Name used in log lines and failure messages.
    pub fn program(&self) -> &str {
        match self {
            ResolvedCommand::Argv(args) => args.first().map(String::as_str).unwrap_or(""),
            ResolvedCommand::Shell(line) => line.split_whitespace().next().unwrap_or(""),
        }
    }
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedCommand::Argv(args) => write!(f, "{}", args.join(" ")),
            ResolvedCommand::Shell(line) => write!(f, "{}", line),
        }
    }
}
