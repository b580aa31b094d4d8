//! # quire-build: Build orchestrator for Quire projects
//!
//! Materializes a project's files into a per-project build directory,
//! drives the external compiler through two passes, and classifies the
//! outcome as a [`BuildResult`].
//!
//! ## Modules
//!
//! - [`job`]: `BuildJob` requests and `BuildResult` outcomes
//! - [`stage`]: sandboxed file staging
//! - [`compiler`]: one bounded compiler pass
//! - [`orchestrator`]: stage → pass 1 → pass 2 → classify
//! - [`queue`]: in-process worker pool with retrievable results

pub mod compiler;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod queue;
pub mod stage;

pub use compiler::{CompilerConfig, PassOutput};
pub use error::BuildError;
pub use job::{BuildJob, BuildResult, JobId};
pub use orchestrator::{BuildConfig, BuildOrchestrator, BuildStats};
pub use queue::{BuildQueue, JobStatus, QueueConfig, QueueError};
