//! Control plane: project lifecycle and compile requests.
//!
//! The operations behind the project REST surface, without the HTTP layer.
//! Compiles are snapshotted from the stored project after pending live edits
//! of that project are written, then handed to the build queue; callers poll
//! by job id. Changes to stored projects go through the same per-project
//! lock as the live-edit writer.

use quire_build::{BuildJob, BuildQueue, BuildResult, JobId, JobStatus, QueueError};
use quire_collab::{PersisterHandle, ProjectStore, StoreError};
use quire_core::{AccessLevel, Project, ProjectError};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Control-plane errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("project `{0}` not found")]
    NotFound(Uuid),
    #[error("user `{user}` needs {required} access to project `{project}`")]
    Forbidden {
        user: Uuid,
        project: Uuid,
        required: AccessLevel,
    },
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub struct ControlPlane {
    store: Arc<dyn ProjectStore>,
    queue: Arc<BuildQueue>,
    persister: PersisterHandle,
}

impl ControlPlane {
    /// `persister` must write into the same `store`.
    pub fn new(store: Arc<dyn ProjectStore>, queue: Arc<BuildQueue>, persister: PersisterHandle) -> Self {
        Self {
            store,
            queue,
            persister,
        }
    }

    /// Create and store a project seeded with the default `main.tex`.
    pub async fn create_project(&self, name: &str, owner_id: Uuid) -> Result<Project, ControlError> {
        let project = Project::new(name, owner_id);
        self.store.save_project(&project).await?;
        log::info!("Created project {} ({name}) for {owner_id}", project.id);
        Ok(project)
    }

    pub async fn get_project(&self, id: Uuid) -> Result<Project, ControlError> {
        self.store
            .get_project(id)
            .await?
            .ok_or(ControlError::NotFound(id))
    }

    /// All stored projects. Ids that vanish while listing are skipped.
    pub async fn list_projects(&self) -> Result<Vec<Project>, ControlError> {
        let mut projects = Vec::new();
        for id in self.store.list_projects().await? {
            if let Some(project) = self.store.get_project(id).await? {
                projects.push(project);
            }
        }
        projects.sort_by_key(|p| (p.created_at, p.id));
        Ok(projects)
    }

    /// Grant `user` access to a project. Only the owner may share.
    pub async fn share_project(
        &self,
        project_id: Uuid,
        requester: Uuid,
        user: Uuid,
        level: AccessLevel,
    ) -> Result<(), ControlError> {
        let _guard = self.persister.lock_project(project_id).await;
        let mut project = self.get_project(project_id).await?;
        require(&project, requester, AccessLevel::Owner)?;
        project.grant(user, level)?;
        self.store.save_project(&project).await?;
        log::info!("Project {project_id}: {user} granted {level}");
        Ok(())
    }

    /// Snapshot the project and queue a compile of its main file.
    ///
    /// Live edits still waiting out their debounce are written first, so the
    /// build sees the last snapshot received. Requires at least viewer
    /// access. Returns as soon as the job is queued.
    pub async fn trigger_compile(&self, project_id: Uuid, requester: Uuid) -> Result<JobId, ControlError> {
        self.persister.flush_project(project_id).await;
        let project = self.get_project(project_id).await?;
        require(&project, requester, AccessLevel::Viewer)?;

        let job = BuildJob::from_project(&project)?;
        let job_id = self.queue.submit(job).await?;
        log::info!("Compile {job_id} queued for project {project_id} by {requester}");
        Ok(job_id)
    }

    /// `None` for unknown or expired jobs.
    pub async fn compile_status(&self, job_id: JobId) -> Option<JobStatus> {
        self.queue.status(job_id).await
    }

    pub async fn wait_for_compile(&self, job_id: JobId, timeout: Duration) -> Result<BuildResult, ControlError> {
        Ok(self.queue.wait(job_id, timeout).await?)
    }
}

fn require(project: &Project, user: Uuid, required: AccessLevel) -> Result<(), ControlError> {
    match project.access_level(user) {
        Some(level) if level >= required => Ok(()),
        _ => Err(ControlError::Forbidden {
            user,
            project: project.id,
            required,
        }),
    }
}
