//! Turning a [`BuildJob`] into a [`BuildResult`].
//!
//! ```text
//!   BuildJob
//!      │
//!      ▼
//!   stage ──── <builds_root>/<project_id>/   (validated names, stale PDFs removed)
//!      │
//!      ▼
//!   pass 1 ─── exit status decides success / error
//!      │
//!      ▼
//!   pass 2 ─── cross-references; failure only downgrades to a warning
//!      │
//!      ▼
//!   classify ─ <entry stem>.pdf → main.pdf
//! ```
//!
//! The build directory persists between compiles so auxiliary files from a
//! previous run help resolve references. Builds of the same project are
//! serialized; different projects build concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::compiler::{self, CompilerConfig};
use crate::error::BuildError;
use crate::job::{BuildJob, BuildResult};
use crate::stage;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Parent of all per-project build directories
    pub builds_root: PathBuf,
    pub compiler: CompilerConfig,
    /// Extension of the compiler's output
    pub artifact_extension: String,
    /// Stable name the artifact is copied to
    pub canonical_artifact: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            builds_root: PathBuf::from("builds"),
            compiler: CompilerConfig::default(),
            artifact_extension: "pdf".to_string(),
            canonical_artifact: "main.pdf".to_string(),
        }
    }
}

/// Build statistics.
#[derive(Debug, Clone, Default)]
pub struct BuildStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct AtomicBuildStats {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Runs builds against a shared builds root.
pub struct BuildOrchestrator {
    config: BuildConfig,
    /// One lock per project with a build in flight
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
    stats: AtomicBuildStats,
}

impl BuildOrchestrator {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            locks: RwLock::new(HashMap::new()),
            stats: AtomicBuildStats::default(),
        }
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Staging directory of a project.
    pub fn build_dir(&self, project_id: Uuid) -> PathBuf {
        self.config.builds_root.join(project_id.to_string())
    }

    /// Where a successful build of `project_id` leaves its artifact.
    pub fn artifact_path(&self, project_id: Uuid) -> PathBuf {
        self.build_dir(project_id).join(&self.config.canonical_artifact)
    }

    /// Run a build to completion. Never fails: every problem is reported as
    /// [`BuildResult::Error`].
    pub async fn run(&self, job: &BuildJob) -> BuildResult {
        let project_id = job.project_id;
        let lock = self.project_lock(project_id).await;
        let guard = lock.lock().await;

        self.stats.started.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Build started: project {project_id}, entry {}, {} file(s)",
            job.entry_file,
            job.files.len()
        );

        let result = match self.execute(job).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Build for project {project_id} aborted: {e}");
                BuildResult::error(e.to_string())
            }
        };

        match &result {
            BuildResult::Success { artifact_path, warning } => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                log::info!("Build succeeded: {}", artifact_path.display());
                if let Some(warning) = warning {
                    log::warn!("Build for project {project_id}: {warning}");
                }
            }
            BuildResult::Error { .. } => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::info!("Build failed for project {project_id}");
            }
        }

        drop(guard);
        drop(lock);
        self.release_locks().await;
        result
    }

    pub fn stats(&self) -> BuildStats {
        BuildStats {
            started: self.stats.started.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
        }
    }

    async fn execute(&self, job: &BuildJob) -> Result<BuildResult, BuildError> {
        if !job.files.contains_key(&job.entry_file) {
            return Err(BuildError::EntryMissing(job.entry_file.clone()));
        }
        let entry = stage::safe_relative_path(&job.entry_file)?;

        let dir = self.build_dir(job.project_id);
        let bytes = stage::stage_files(&dir, &job.files).await?;
        log::debug!("Staged {bytes} bytes into {}", dir.display());

        let produced = self.entry_artifact(&dir, &entry)?;
        let canonical = self.artifact_path(job.project_id);
        stage::remove_stale(&produced).await?;
        stage::remove_stale(&canonical).await?;

        let compiler = &self.config.compiler;
        log::debug!("Compiling {} (pass 1)", job.entry_file);
        let first = compiler::run_pass(compiler, &dir, &job.entry_file).await?;

        log::debug!("Compiling {} (pass 2)", job.entry_file);
        let warning = match compiler::run_pass(compiler, &dir, &job.entry_file).await {
            Ok(second) if second.success() => None,
            Ok(second) => Some(format!("second pass exited with {}", second.status())),
            Err(e) => Some(format!("second pass failed: {e}")),
        };

        if !first.success() {
            return Ok(BuildResult::error(first.log()));
        }

        if !tokio::fs::try_exists(&produced).await? {
            return Err(BuildError::ArtifactMissing(produced.display().to_string()));
        }
        if produced != canonical {
            tokio::fs::copy(&produced, &canonical).await?;
        }

        Ok(BuildResult::Success {
            artifact_path: canonical,
            warning,
        })
    }

    /// The compiler writes its output next to the working directory, named
    /// after the entry file's stem.
    fn entry_artifact(&self, dir: &Path, entry: &Path) -> Result<PathBuf, BuildError> {
        let stem = entry
            .file_stem()
            .ok_or_else(|| BuildError::UnsafePath(entry.display().to_string()))?;
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(&self.config.artifact_extension);
        Ok(dir.join(name))
    }

    async fn project_lock(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.read().await.get(&project_id) {
            return lock.clone();
        }
        self.locks
            .write()
            .await
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop locks nobody holds or waits on.
    async fn release_locks(&self) {
        self.locks
            .write()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quire_core::FileContent;
    use std::time::Duration;

    fn orchestrator(root: &Path, script: &str) -> BuildOrchestrator {
        BuildOrchestrator::new(BuildConfig {
            builds_root: root.to_path_buf(),
            compiler: CompilerConfig {
                program: "sh".into(),
                args: vec!["-c".into(), script.into(), "fake-latex".into()],
                pass_timeout: Duration::from_secs(5),
            },
            ..BuildConfig::default()
        })
    }

    /// Copies the entry file to `<stem>.pdf`, like a very small typesetter.
    const TYPESET: &str = "cat \"$1\" > \"$(basename \"$1\" .tex).pdf\"; echo \"Output written\"";

    fn job(entry: &str, body: &str) -> BuildJob {
        BuildJob::new(Uuid::new_v4(), Default::default(), entry).with_file(entry, body)
    }

    #[test]
    fn test_paths() {
        let orch = BuildOrchestrator::new(BuildConfig::default());
        let id = Uuid::new_v4();
        assert_eq!(orch.build_dir(id), PathBuf::from("builds").join(id.to_string()));
        assert_eq!(
            orch.artifact_path(id),
            PathBuf::from("builds").join(id.to_string()).join("main.pdf")
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_produces_canonical_artifact() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), TYPESET);
        let job = job("main.tex", "\\documentclass{article}");

        let result = orch.run(&job).await;
        let path = result.artifact_path().expect("success").to_path_buf();
        assert_eq!(path, orch.artifact_path(job.project_id));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "\\documentclass{article}");
        assert_eq!(orch.stats().succeeded, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_other_entry_is_copied_to_canonical_name() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), TYPESET);
        let job = job("thesis.tex", "thesis body");

        let result = orch.run(&job).await;
        assert!(result.is_success());
        let dir = orch.build_dir(job.project_id);
        assert_eq!(std::fs::read_to_string(dir.join("thesis.pdf")).unwrap(), "thesis body");
        assert_eq!(std::fs::read_to_string(dir.join("main.pdf")).unwrap(), "thesis body");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nested_entry_artifact_lands_in_build_dir() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), TYPESET);
        let job = job("src/book.tex", "nested");

        let result = orch.run(&job).await;
        assert!(result.is_success(), "{result:?}");
        assert!(orch.build_dir(job.project_id).join("book.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_first_pass_reports_log() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), "echo '! Undefined control sequence.'; exit 1");
        let job = job("main.tex", "\\badmacro");

        let result = orch.run(&job).await;
        assert_eq!(result.log(), Some("! Undefined control sequence.\n"));
        assert!(!orch.artifact_path(job.project_id).exists());
        assert_eq!(orch.stats().failed, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_failure_still_has_log() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), "exit 7");

        let result = orch.run(&job("main.tex", "x")).await;
        assert_eq!(result.log(), Some("compiler exited with status 7"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_second_pass_failure_is_a_warning() {
        let root = tempfile::tempdir().unwrap();
        // Fails whenever a previous pass left its marker behind
        let script = "if [ -f .ran ]; then rm .ran; exit 1; fi; touch .ran; \
                      cat \"$1\" > \"$(basename \"$1\" .tex).pdf\"";
        let orch = orchestrator(root.path(), script);

        let result = orch.run(&job("main.tex", "refs")).await;
        match result {
            BuildResult::Success { warning, .. } => {
                assert_eq!(warning.as_deref(), Some("second pass exited with status 1"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_artifact_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), "echo done");

        let result = orch.run(&job("main.tex", "x")).await;
        assert!(result.log().unwrap().contains("was not produced"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_artifact_is_not_reported() {
        let root = tempfile::tempdir().unwrap();
        let good = orchestrator(root.path(), TYPESET);
        let job = job("main.tex", "v1");
        assert!(good.run(&job).await.is_success());

        let silent = orchestrator(root.path(), "exit 0");
        let result = silent.run(&job).await;
        assert!(!result.is_success());
        assert!(!silent.artifact_path(job.project_id).exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let orch = BuildOrchestrator::new(BuildConfig {
            builds_root: root.path().to_path_buf(),
            compiler: CompilerConfig {
                program: "sh".into(),
                args: vec!["-c".into(), "exec sleep 10".into(), "fake-latex".into()],
                pass_timeout: Duration::from_millis(200),
            },
            ..BuildConfig::default()
        });

        let result = orch.run(&job("main.tex", "x")).await;
        assert!(result.log().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_unsafe_name_fails_job() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), "exit 0");
        let job = job("main.tex", "x").with_file("../escape.tex", "nope");

        let result = orch.run(&job).await;
        assert!(result.log().unwrap().contains("unsafe file name"));
        assert!(!root.path().join("escape.tex").exists());
    }

    #[tokio::test]
    async fn test_entry_must_be_in_job() {
        let root = tempfile::tempdir().unwrap();
        let orch = orchestrator(root.path(), "exit 0");
        let job = BuildJob::new(Uuid::new_v4(), Default::default(), "main.tex")
            .with_file("other.tex", FileContent::from("x"));

        let result = orch.run(&job).await;
        assert!(result.log().unwrap().contains("entry file `main.tex`"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_same_project_builds_are_serialized() {
        let root = tempfile::tempdir().unwrap();
        // Detects overlap through a marker file in the shared build directory
        let script = "if [ -f .busy ]; then echo overlap; exit 1; fi; touch .busy; sleep 0.2; \
                      rm .busy; cat \"$1\" > \"$(basename \"$1\" .tex).pdf\"";
        let orch = Arc::new(orchestrator(root.path(), script));
        let project_id = Uuid::new_v4();
        let first = BuildJob::new(project_id, Default::default(), "main.tex").with_file("main.tex", "one");
        let second = BuildJob::new(project_id, Default::default(), "main.tex").with_file("main.tex", "two");

        let (a, b) = tokio::join!(orch.run(&first), orch.run(&second));
        assert!(a.is_success() && b.is_success(), "{a:?} / {b:?}");
        assert!(orch.locks.read().await.is_empty());
    }
}
