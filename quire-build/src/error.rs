use quire_core::ProjectError;
use std::io;
use std::time::Duration;

/// Failures that end a build before it can be classified by the compiler's
/// exit status. The orchestrator turns every one of them into
/// [`BuildResult::Error`](crate::BuildResult::Error).
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("unsafe file name `{0}`: must be a relative path without `..`")]
    UnsafePath(String),
    #[error("entry file `{0}` is not part of the build")]
    EntryMissing(String),
    #[error("failed to stage `{path}`: {source}")]
    Staging {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to start compiler `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("compiler timed out after {0:?}")]
    Timeout(Duration),
    #[error("compiler reported success but `{0}` was not produced")]
    ArtifactMissing(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Project(#[from] ProjectError),
}
