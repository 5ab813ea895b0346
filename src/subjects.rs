//! # subjects.rs
//!
//! Subject discovery and per-subject input lookup in a BIDS tree:
//!
//! ```text
//! bids_dir/
//! ├── sub-01/
//! │   ├── anat/sub-01_T1w.nii.gz
//! │   └── func/sub-01_task-rest_bold.nii.gz
//! └── sub-02/
//!     ├── ses-pre/anat/sub-02_ses-pre_T1w.nii.gz
//!     └── ses-pre/func/sub-02_ses-pre_task-rest_bold.nii.gz
//! ```
//!
//! Files are matched by name only, with shell glob semantics (`*_T1w.nii*`,
//! `*bold.nii*`); hidden entries never match. Matches within one directory are sorted,
//! subject-level matches come before session-level ones, and sessions are visited in
//! sorted order.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use itertools::Itertools;
use regex::Regex;
use tracing::{debug, warn};

use crate::error::PipelineError;

pub const SUBJECT_PREFIX: &str = "sub-";
const SESSION_PREFIX: &str = "ses-";

static ANAT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"_T1w\.nii").unwrap());
static FUNC_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"bold\.nii").unwrap());

/// Image category, named after the BIDS datatype directory holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modality {
    Anat,
    Func,
}

impl Modality {
    fn dir_name(&self) -> &'static str {
        match self {
            Modality::Anat => "anat",
            Modality::Func => "func",
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            Modality::Anat => "*_T1w.nii*",
            Modality::Func => "*bold.nii*",
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        if file_name.starts_with('.') {
            return false;
        }
        match self {
            Modality::Anat => ANAT_RE.is_match(file_name),
            Modality::Func => FUNC_RE.is_match(file_name),
        }
    }
}

/// Inputs of one subject, ready for substitution.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectFiles {
    pub subject: String,
    pub anat_path: PathBuf,
    pub epi_paths: Vec<PathBuf>,
}

///
/// The subjects to process: the explicit labels when any are given (order kept, a
/// leading `sub-` dropped, repeats removed), otherwise every `sub-*` directory of `root`.
pub fn resolve_subjects(root: &Path, explicit: &[String]) -> Result<Vec<String>, PipelineError> {
    if !explicit.is_empty() {
        let labels: Vec<String> = explicit
            .iter()
            .map(|label| label.strip_prefix(SUBJECT_PREFIX).unwrap_or(label.as_str()).to_string())
            .unique()
            .collect();
        return Ok(labels);
    }
    discover_subjects(root)
}

/// Labels of every top-level `sub-<label>` directory, sorted.
pub fn discover_subjects(root: &Path) -> Result<Vec<String>, PipelineError> {
    let mut labels = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(label) = name.strip_prefix(SUBJECT_PREFIX) {
            if !label.is_empty() && entry.path().is_dir() {
                labels.push(label.to_string());
            }
        }
    }
    labels.sort();
    debug!("discovered {} subjects in {}", labels.len(), root.display());
    Ok(labels)
}

pub fn subject_dir(root: &Path, subject: &str) -> PathBuf {
    root.join(format!("{}{}", SUBJECT_PREFIX, subject))
}

/// Matches at `sub-<id>/<modality>/` followed by `sub-<id>/ses-*/<modality>/`.
pub fn find_modality_files(
    root: &Path,
    subject: &str,
    modality: Modality,
) -> Result<Vec<PathBuf>, PipelineError> {
    let subject_path = subject_dir(root, subject);
    let mut found = list_matching(&subject_path.join(modality.dir_name()), modality)?;
    for session in session_dirs(&subject_path)? {
        found.extend(list_matching(&session.join(modality.dir_name()), modality)?);
    }
    Ok(found)
}

///
/// Finds the anatomical image and the functional runs of `subject`.
///
/// # Errors
/// Returns `MissingAnatomy` if no `*_T1w.nii*` exists at subject or session level.
pub fn locate_files(root: &Path, subject: &str) -> Result<SubjectFiles, PipelineError> {
    let mut anat_matches = find_modality_files(root, subject, Modality::Anat)?.into_iter();
    let anat_path = anat_matches
        .next()
        .ok_or_else(|| PipelineError::MissingAnatomy {
            subject: subject.to_string(),
            searched: searched_patterns(root, subject, Modality::Anat),
        })?;
    let ignored: Vec<PathBuf> = anat_matches.collect();
    if !ignored.is_empty() {
        warn!(
            "subject {} has {} T1w images, using {} and ignoring {}",
            subject,
            ignored.len() + 1,
            anat_path.display(),
            ignored.iter().map(|p| p.display()).join(", ")
        );
    }

    let epi_paths = find_modality_files(root, subject, Modality::Func)?;
    if epi_paths.is_empty() {
        warn!(
            "subject {} has no functional images ({})",
            subject,
            searched_patterns(root, subject, Modality::Func)
        );
    }

    Ok(SubjectFiles {
        subject: subject.to_string(),
        anat_path,
        epi_paths,
    })
}

fn searched_patterns(root: &Path, subject: &str, modality: Modality) -> String {
    let subject_path = subject_dir(root, subject);
    format!(
        "{}, {}",
        subject_path
            .join(modality.dir_name())
            .join(modality.pattern())
            .display(),
        subject_path
            .join(format!("{}*", SESSION_PREFIX))
            .join(modality.dir_name())
            .join(modality.pattern())
            .display()
    )
}

/// Sorted entries of `dir` whose name matches `modality`. A missing directory has none.
fn list_matching(dir: &Path, modality: Modality) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if modality.matches(&entry.file_name().to_string_lossy()) {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn session_dirs(subject_path: &Path) -> io::Result<Vec<PathBuf>> {
    if !subject_path.is_dir() {
        return Ok(Vec::new());
    }
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(subject_path)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with(SESSION_PREFIX) && path.is_dir() {
            sessions.push(path);
        }
    }
    sessions.sort();
    Ok(sessions)
}
