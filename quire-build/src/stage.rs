//! Materializing a job's files into its build directory.
//!
//! The build directory is the compiler's sandbox: every file name must stay
//! inside it, so names are checked before anything is written.

use quire_core::FileContent;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::BuildError;

/// Validate a project file name as a path relative to the build directory.
///
/// Accepts nested names (`images/fig.png`); rejects empty names, absolute
/// paths, and any `..` component.
pub fn safe_relative_path(name: &str) -> Result<PathBuf, BuildError> {
    let unsafe_path = || BuildError::UnsafePath(name.to_owned());
    let mut normal = 0;

    for component in Path::new(name).components() {
        match component {
            Component::Normal(_) => normal += 1,
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path())
            }
        }
    }

    if normal == 0 {
        return Err(unsafe_path());
    }
    Ok(PathBuf::from(name))
}

/// Write every file under `dir`, creating it and any subdirectories.
///
/// All names are validated first; an unsafe name aborts before any write.
/// Returns the number of bytes written.
pub async fn stage_files(dir: &Path, files: &BTreeMap<String, FileContent>) -> Result<u64, BuildError> {
    let targets = files
        .iter()
        .map(|(name, content)| Ok((name, dir.join(safe_relative_path(name)?), content)))
        .collect::<Result<Vec<_>, BuildError>>()?;

    create_dir(dir).await?;

    let mut written = 0u64;
    for (name, target, content) in targets {
        if let Some(parent) = target.parent() {
            create_dir(parent).await?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|source| BuildError::Staging {
                path: name.clone(),
                source,
            })?;
        written += content.len() as u64;
    }

    Ok(written)
}

/// Remove `path` if it exists. Returns whether something was removed.
pub async fn remove_stale(path: &Path) -> Result<bool, BuildError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

async fn create_dir(dir: &Path) -> Result<(), BuildError> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| BuildError::Staging {
            path: dir.display().to_string(),
            source,
        })
}
