//! # quire-core: Project data model
//!
//! Shared types for the collaborative editing server and the build
//! orchestrator:
//!
//! - [`project`]: projects, files, and their invariants
//! - [`content`]: text/binary file content with the data-URL wire form
//! - [`access`]: ordered access tiers and the per-project access list

pub mod access;
pub mod content;
pub mod project;

pub use access::{AccessEntry, AccessLevel, AccessList};
pub use content::FileContent;
pub use project::{
    now_secs, FileItem, Project, ProjectError, DEFAULT_MAIN_FILE, DEFAULT_TEMPLATE,
};
