//! Projects and their files.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

use crate::access::{AccessLevel, AccessList};
use crate::content::FileContent;

/// Name of the file seeded into every new project.
pub const DEFAULT_MAIN_FILE: &str = "main.tex";

/// Initial content of [`DEFAULT_MAIN_FILE`].
pub const DEFAULT_TEMPLATE: &str =
    "\\documentclass{article}\n\\begin{document}\nHello World\n\\end{document}";

/// Project invariant violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectError {
    #[error("file `{0}` already exists in this project")]
    DuplicateFile(String),
    #[error("file `{0}` not found in this project")]
    FileNotFound(String),
    #[error("cannot delete `{0}`: a project must keep at least one file")]
    LastFile(String),
    #[error("project has no main file")]
    NoMainFile,
    #[error("project has {0} files marked as main, expected exactly one")]
    MultipleMainFiles(usize),
    #[error("the project owner's access cannot be changed")]
    OwnerAccessImmutable,
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A single file within a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileItem {
    /// Unique within the project; may contain `/` for subdirectories
    pub name: String,
    pub content: FileContent,
    /// Compiler entry point
    pub is_main: bool,
    /// Last content change (seconds since epoch)
    pub updated_at: u64,
}

impl FileItem {
    pub fn new(name: impl Into<String>, content: impl Into<FileContent>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            is_main: false,
            updated_at: now_secs(),
        }
    }

    /// Mark this file as the entry point.
    pub fn main(mut self) -> Self {
        self.is_main = true;
        self
    }
}

/// A multi-file document project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    /// Files in insertion order
    files: Vec<FileItem>,
    access: AccessList,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Project {
    /// Create a project seeded with the default `main.tex`.
    pub fn new(name: impl Into<String>, owner_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_id,
            files: vec![FileItem::new(DEFAULT_MAIN_FILE, DEFAULT_TEMPLATE).main()],
            access: AccessList::new(),
            created_at: now,
            updated_at: now,
        }
    }

    // ─── Files ────────────────────────────────────────────────────────

    pub fn files(&self) -> &[FileItem] {
        &self.files
    }

    pub fn file(&self, name: &str) -> Option<&FileItem> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Append a file. Names are unique within a project.
    ///
    /// If the new file is marked main, every other file loses the flag.
    pub fn add_file(&mut self, file: FileItem) -> Result<(), ProjectError> {
        if self.file(&file.name).is_some() {
            return Err(ProjectError::DuplicateFile(file.name));
        }
        if file.is_main {
            self.files.iter_mut().for_each(|f| f.is_main = false);
        }
        self.files.push(file);
        self.touch();
        Ok(())
    }

    /// Remove a file. The last remaining file cannot be removed.
    pub fn remove_file(&mut self, name: &str) -> Result<FileItem, ProjectError> {
        let idx = self
            .files
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| ProjectError::FileNotFound(name.to_owned()))?;
        if self.files.len() == 1 {
            return Err(ProjectError::LastFile(name.to_owned()));
        }
        let removed = self.files.remove(idx);
        self.touch();
        Ok(removed)
    }

    /// Make `name` the single main file.
    pub fn set_main(&mut self, name: &str) -> Result<(), ProjectError> {
        if self.file(name).is_none() {
            return Err(ProjectError::FileNotFound(name.to_owned()));
        }
        for file in &mut self.files {
            file.is_main = file.name == name;
        }
        self.touch();
        Ok(())
    }

    /// The compiler entry point. Exactly one file must be marked main.
    pub fn main_file(&self) -> Result<&FileItem, ProjectError> {
        let mut mains = self.files.iter().filter(|f| f.is_main);
        match (mains.next(), mains.count()) {
            (None, _) => Err(ProjectError::NoMainFile),
            (Some(file), 0) => Ok(file),
            (Some(_), rest) => Err(ProjectError::MultipleMainFiles(rest + 1)),
        }
    }

    /// Overwrite a file's content (last writer wins).
    pub fn update_file_content(
        &mut self,
        name: &str,
        content: FileContent,
    ) -> Result<(), ProjectError> {
        let file = self
            .files
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| ProjectError::FileNotFound(name.to_owned()))?;
        file.content = content;
        file.updated_at = now_secs();
        self.touch();
        Ok(())
    }

    // ─── Access ───────────────────────────────────────────────────────

    pub fn access(&self) -> &AccessList {
        &self.access
    }

    /// Grant a collaborator access. The owner is not an access-list entry.
    pub fn grant(&mut self, user_id: Uuid, level: AccessLevel) -> Result<(), ProjectError> {
        if user_id == self.owner_id {
            return Err(ProjectError::OwnerAccessImmutable);
        }
        self.access.grant(user_id, level);
        self.touch();
        Ok(())
    }

    pub fn revoke(&mut self, user_id: Uuid) -> Result<Option<AccessLevel>, ProjectError> {
        if user_id == self.owner_id {
            return Err(ProjectError::OwnerAccessImmutable);
        }
        let previous = self.access.revoke(user_id);
        if previous.is_some() {
            self.touch();
        }
        Ok(previous)
    }

    /// Effective level for `user_id`; the owner is always [`AccessLevel::Owner`].
    pub fn access_level(&self, user_id: Uuid) -> Option<AccessLevel> {
        if user_id == self.owner_id {
            return Some(AccessLevel::Owner);
        }
        self.access.level(user_id)
    }

    pub fn can_view(&self, user_id: Uuid) -> bool {
        self.access_level(user_id).is_some()
    }

    pub fn can_edit(&self, user_id: Uuid) -> bool {
        self.access_level(user_id).is_some_and(AccessLevel::can_edit)
    }

    /// Bump the project's update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = now_secs();
    }
}
