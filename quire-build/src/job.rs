//! Build requests and their outcomes.

use quire_core::{FileContent, Project, ProjectError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Identifier handed out by the queue for a submitted job.
pub type JobId = Uuid;

/// One compile request: the full file set of a project and its entry file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub project_id: Uuid,
    /// File name (may contain `/`) → content
    pub files: BTreeMap<String, FileContent>,
    /// Top-level compiler input
    pub entry_file: String,
}

impl BuildJob {
    pub fn new(
        project_id: Uuid,
        files: BTreeMap<String, FileContent>,
        entry_file: impl Into<String>,
    ) -> Self {
        Self {
            project_id,
            files,
            entry_file: entry_file.into(),
        }
    }

    /// Build from wire strings; data-URL images are decoded here, once.
    pub fn from_wire<I, K, V>(project_id: Uuid, files: I, entry_file: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let files = files
            .into_iter()
            .map(|(name, raw)| (name.into(), FileContent::from_wire(raw.as_ref())))
            .collect();
        Self::new(project_id, files, entry_file)
    }

    /// Snapshot a project, compiling its main file.
    pub fn from_project(project: &Project) -> Result<Self, ProjectError> {
        let entry = project.main_file()?.name.clone();
        let files = project
            .files()
            .iter()
            .map(|f| (f.name.clone(), f.content.clone()))
            .collect();
        Ok(Self::new(project.id, files, entry))
    }

    /// Add or replace a file.
    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<FileContent>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}

/// Outcome of a build, as reported to clients.
///
/// ```json
/// {"status": "success", "artifact_path": "builds/<id>/main.pdf"}
/// {"status": "error", "log": "! Undefined control sequence. ..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum BuildResult {
    Success {
        artifact_path: PathBuf,
        /// Set when the reference-resolution pass failed after a good first pass
        #[serde(default, skip_serializing_if = "Option::is_none")]
        warning: Option<String>,
    },
    Error {
        log: String,
    },
}

impl BuildResult {
    pub fn error(log: impl Into<String>) -> Self {
        BuildResult::Error { log: log.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildResult::Success { .. })
    }

    pub fn artifact_path(&self) -> Option<&Path> {
        match self {
            BuildResult::Success { artifact_path, .. } => Some(artifact_path),
            BuildResult::Error { .. } => None,
        }
    }

    pub fn log(&self) -> Option<&str> {
        match self {
            BuildResult::Error { log } => Some(log),
            BuildResult::Success { .. } => None,
        }
    }
}
