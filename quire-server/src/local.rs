//! Loading a project from a directory on disk, for one-shot compiles.

use quire_core::FileContent;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Read every file under `dir` into a name → content map.
///
/// Names are relative to `dir` with `/` separators. Hidden entries and the
/// directories in `exclude` are skipped. UTF-8 files become text, anything
/// else binary.
pub fn read_project_dir(dir: &Path, exclude: &[PathBuf]) -> io::Result<BTreeMap<String, FileContent>> {
    let exclude: Vec<PathBuf> = exclude
        .iter()
        .filter_map(|p| std::fs::canonicalize(p).ok())
        .collect();
    let mut files = BTreeMap::new();

    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !skipped(entry, &exclude));

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let Some(name) = relative_name(dir, path) else {
            log::warn!("Skipping {}: name is not valid UTF-8", path.display());
            continue;
        };
        let content = match String::from_utf8(std::fs::read(path)?) {
            Ok(text) => FileContent::Text(text),
            Err(e) => FileContent::Binary(e.into_bytes()),
        };
        files.insert(name, content);
    }

    Ok(files)
}

fn skipped(entry: &DirEntry, exclude: &[PathBuf]) -> bool {
    if entry.file_name().to_string_lossy().starts_with('.') {
        return true;
    }
    entry.file_type().is_dir()
        && std::fs::canonicalize(entry.path()).is_ok_and(|canonical| exclude.contains(&canonical))
}

fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}
