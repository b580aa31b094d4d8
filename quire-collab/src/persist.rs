//! Debounced persistence of live edits.
//!
//! Connection tasks record snapshots into a shared table keyed by room, so
//! only the newest snapshot per room is ever held no matter how slow the
//! store is. A single writer task drains the table:
//!
//! ```text
//!  record(k, v1) record(k, v2) record(k, v3)          flush
//!  ──────●─────────────●─────────────●───── debounce ────▶ save(v3)
//!        └──────────────── max_delay ─────────────────────▶ (upper bound)
//! ```
//!
//! A flush groups due entries by project so one project is loaded and saved
//! once no matter how many of its files changed. The load/save cycle runs
//! under the project's [`ProjectLocks`] guard, shared with every other writer.

use quire_core::{FileContent, ProjectError};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::protocol::RoomKey;
use crate::storage::{ProjectLocks, ProjectStore, StoreError};

/// Outstanding flush/shutdown requests.
const COMMAND_CAPACITY: usize = 32;

/// Persister configuration.
#[derive(Debug, Clone)]
pub struct PersistConfig {
    /// Idle time after the last edit before a room is written
    pub debounce: Duration,
    /// Upper bound between the first unflushed edit and its write
    pub max_delay: Duration,
    /// Extra attempts after a failed save
    pub retries: u32,
    /// Delay before the first retry, doubled per attempt
    pub retry_backoff: Duration,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            retries: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Snapshot of persister counters.
#[derive(Debug, Clone, Default)]
pub struct PersistStats {
    pub edits_recorded: u64,
    pub saves: u64,
    pub save_failures: u64,
    /// Edits discarded because their project or file no longer exists
    pub edits_dropped: u64,
}

#[derive(Default)]
struct AtomicPersistStats {
    edits_recorded: AtomicU64,
    saves: AtomicU64,
    save_failures: AtomicU64,
    edits_dropped: AtomicU64,
}

impl AtomicPersistStats {
    fn snapshot(&self) -> PersistStats {
        PersistStats {
            edits_recorded: self.edits_recorded.load(Ordering::Relaxed),
            saves: self.saves.load(Ordering::Relaxed),
            save_failures: self.save_failures.load(Ordering::Relaxed),
            edits_dropped: self.edits_dropped.load(Ordering::Relaxed),
        }
    }
}

struct PendingEdit {
    content: Arc<str>,
    first_at: Instant,
    last_at: Instant,
}

impl PendingEdit {
    fn due_at(&self, config: &PersistConfig) -> Instant {
        (self.last_at + config.debounce).min(self.first_at + config.max_delay)
    }
}

/// State shared between handles and the writer task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<RoomKey, PendingEdit>>,
    wake: Notify,
    stats: AtomicPersistStats,
    locks: ProjectLocks,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<RoomKey, PendingEdit>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and return every pending edit matching `select`.
    fn take(&self, select: impl Fn(&RoomKey, &PendingEdit) -> bool) -> Vec<(RoomKey, Arc<str>)> {
        let mut pending = self.pending();
        let keys: Vec<RoomKey> = pending
            .iter()
            .filter(|(key, edit)| select(key, edit))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| pending.remove(&key).map(|edit| (key, edit.content)))
            .collect()
    }
}

enum Command {
    /// Write pending edits (of one project, or all) and report back
    Flush {
        project: Option<Uuid>,
        done: oneshot::Sender<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle given to connection tasks and the control plane.
#[derive(Clone)]
pub struct PersisterHandle {
    tx: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl PersisterHandle {
    /// Record the latest content of a room. Never blocks; replaces any
    /// snapshot of the same room that has not been written yet.
    pub fn record(&self, key: RoomKey, content: Arc<str>) {
        self.shared.stats.edits_recorded.fetch_add(1, Ordering::Relaxed);
        if self.tx.is_closed() {
            log::debug!("Persister stopped; edit for {key} not recorded");
            return;
        }

        let now = Instant::now();
        self.shared
            .pending()
            .entry(key)
            .and_modify(|edit| {
                edit.content = content.clone();
                edit.last_at = now;
            })
            .or_insert(PendingEdit {
                content,
                first_at: now,
                last_at: now,
            });
        self.shared.wake.notify_one();
    }

    /// Write everything pending now and wait for it.
    pub async fn flush(&self) {
        self.request_flush(None).await
    }

    /// Write the pending edits of one project and wait for them.
    pub async fn flush_project(&self, project_id: Uuid) {
        self.request_flush(Some(project_id)).await
    }

    async fn request_flush(&self, project: Option<Uuid>) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush { project, done }).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Exclusive write access to a stored project, shared with the writer task.
    pub async fn lock_project(&self, project_id: Uuid) -> OwnedMutexGuard<()> {
        self.shared.locks.lock(project_id).await
    }

    /// Rooms with an unwritten snapshot.
    pub fn pending_rooms(&self) -> usize {
        self.shared.pending().len()
    }

    pub fn stats(&self) -> PersistStats {
        self.shared.stats.snapshot()
    }
}

/// Owner of the writer task.
pub struct EditPersister {
    handle: PersisterHandle,
    task: JoinHandle<()>,
}

impl EditPersister {
    /// Start the writer task on the current runtime.
    pub fn spawn(store: Arc<dyn ProjectStore>, config: PersistConfig) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        let shared = Arc::new(Shared::default());
        let writer = Writer {
            store,
            config,
            shared: shared.clone(),
        };
        let task = tokio::spawn(writer.run(rx));
        Self {
            handle: PersisterHandle { tx, shared },
            task,
        }
    }

    pub fn handle(&self) -> PersisterHandle {
        self.handle.clone()
    }

    /// Flush all pending edits and stop the writer.
    pub async fn shutdown(self) {
        let (done, wait) = oneshot::channel();
        if self.handle.tx.send(Command::Shutdown(done)).await.is_ok() {
            let _ = wait.await;
        }
        if let Err(e) = self.task.await {
            log::error!("Persister task failed: {e}");
        }
    }
}

struct Writer {
    store: Arc<dyn ProjectStore>,
    config: PersistConfig,
    shared: Arc<Shared>,
}

impl Writer {
    async fn run(self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let next_due = self.next_due();
            let deadline = next_due.unwrap_or_else(|| Instant::now() + self.config.max_delay);

            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Flush { project, done }) => {
                        let batch = self
                            .shared
                            .take(|key, _| project.is_none_or(|id| key.project_id == id));
                        self.write(batch).await;
                        let _ = done.send(());
                    }
                    Some(Command::Shutdown(done)) => {
                        self.write(self.shared.take(|_, _| true)).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.write(self.shared.take(|_, _| true)).await;
                        break;
                    }
                },
                // A new edit may move the next deadline
                _ = self.shared.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline), if next_due.is_some() => {
                    let now = Instant::now();
                    let due = self.shared.take(|_, edit| edit.due_at(&self.config) <= now);
                    self.write(due).await;
                }
            }
        }
        log::debug!("Persister stopped");
    }

    fn next_due(&self) -> Option<Instant> {
        self.shared
            .pending()
            .values()
            .map(|edit| edit.due_at(&self.config))
            .min()
    }

    async fn write(&self, batch: Vec<(RoomKey, Arc<str>)>) {
        let mut by_project: BTreeMap<Uuid, Vec<(String, Arc<str>)>> = BTreeMap::new();
        for (key, content) in batch {
            by_project
                .entry(key.project_id)
                .or_default()
                .push((key.file_name, content));
        }

        for (project_id, edits) in by_project {
            self.write_project(project_id, &edits).await;
        }
    }

    async fn write_project(&self, project_id: Uuid, edits: &[(String, Arc<str>)]) {
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.apply(project_id, edits).await {
                Ok(()) => return,
                Err(e) if attempt < self.config.retries => {
                    attempt += 1;
                    log::warn!(
                        "Saving project {project_id} failed (attempt {attempt}): {e}; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    self.shared.stats.save_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("Giving up on saving project {project_id}: {e}");
                    return;
                }
            }
        }
    }

    async fn apply(&self, project_id: Uuid, edits: &[(String, Arc<str>)]) -> Result<(), StoreError> {
        let _guard = self.shared.locks.lock(project_id).await;
        let Some(mut project) = self.store.get_project(project_id).await? else {
            log::warn!("Dropping {} edit(s) for unknown project {project_id}", edits.len());
            self.dropped(edits.len());
            return Ok(());
        };

        let mut applied = 0;
        for (file_name, content) in edits {
            match project.update_file_content(file_name, FileContent::from_wire(content)) {
                Ok(()) => applied += 1,
                Err(ProjectError::FileNotFound(_)) => {
                    log::warn!("Dropping edit for missing file {file_name} in project {project_id}");
                    self.dropped(1);
                }
                Err(e) => {
                    log::warn!("Dropping edit for {file_name} in project {project_id}: {e}");
                    self.dropped(1);
                }
            }
        }

        if applied > 0 {
            self.store.save_project(&project).await?;
            self.shared.stats.saves.fetch_add(1, Ordering::Relaxed);
            log::debug!("Persisted {applied} file(s) of project {project_id}");
        }
        Ok(())
    }

    fn dropped(&self, n: usize) {
        self.shared.stats.edits_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryProjectStore;
    use async_trait::async_trait;
    use quire_core::{FileItem, Project};
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> PersistConfig {
        PersistConfig {
            debounce: Duration::from_millis(40),
            max_delay: Duration::from_secs(5),
            retries: 2,
            retry_backoff: Duration::from_millis(5),
        }
    }

    async fn seeded_store() -> (Arc<MemoryProjectStore>, Project) {
        let store = Arc::new(MemoryProjectStore::new());
        let mut project = Project::new("Paper", Uuid::new_v4());
        project.add_file(FileItem::new("fig.png", "")).unwrap();
        store.save_project(&project).await.unwrap();
        (store, project)
    }

    fn text_of(project: &Project, file: &str) -> String {
        project
            .file(file)
            .and_then(|f| f.content.as_text())
            .unwrap_or_default()
            .to_owned()
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_save() {
        let (store, project) = seeded_store().await;
        let persister = EditPersister::spawn(store.clone(), fast_config());
        let handle = persister.handle();
        let key = RoomKey::new(project.id, "main.tex");

        for i in 0..10 {
            handle.record(key.clone(), Arc::from(format!("draft {i}")));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        // One seed save plus one debounced save
        assert_eq!(store.save_count(), 2);
        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "draft 9");
        assert_eq!(handle.stats().edits_recorded, 10);
        assert_eq!(handle.stats().saves, 1);

        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_explicit_flush() {
        let (store, project) = seeded_store().await;
        let config = PersistConfig {
            debounce: Duration::from_secs(60),
            ..fast_config()
        };
        let persister = EditPersister::spawn(store.clone(), config);
        let handle = persister.handle();

        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("now"));
        handle.flush().await;

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "now");
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_files_of_one_project_saved_together() {
        let (store, project) = seeded_store().await;
        let persister = EditPersister::spawn(store.clone(), fast_config());
        let handle = persister.handle();

        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("body"));
        handle.record(
            RoomKey::new(project.id, "fig.png"),
            Arc::from("data:image/png;base64,iVBORw0KGgo="),
        );
        handle.flush().await;

        assert_eq!(store.save_count(), 2);
        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "body");
        let fig = saved.file("fig.png").unwrap();
        assert!(fig.content.is_binary());
        assert_eq!(fig.content.as_bytes(), &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_max_delay_bounds_continuous_typing() {
        let (store, project) = seeded_store().await;
        let config = PersistConfig {
            debounce: Duration::from_millis(200),
            max_delay: Duration::from_millis(100),
            ..fast_config()
        };
        let persister = EditPersister::spawn(store.clone(), config);
        let handle = persister.handle();
        let key = RoomKey::new(project.id, "main.tex");

        // Edits every 20ms never leave a 200ms idle gap
        for i in 0..25 {
            handle.record(key.clone(), Arc::from(format!("v{i}")));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(handle.stats().saves >= 1);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_project_and_file_dropped() {
        let (store, project) = seeded_store().await;
        let persister = EditPersister::spawn(store.clone(), fast_config());
        let handle = persister.handle();

        handle.record(RoomKey::new(Uuid::new_v4(), "main.tex"), Arc::from("x"));
        handle.record(RoomKey::new(project.id, "missing.tex"), Arc::from("y"));
        handle.flush().await;

        assert_eq!(store.save_count(), 1);
        assert_eq!(handle.stats().edits_dropped, 2);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let (store, project) = seeded_store().await;
        let config = PersistConfig {
            debounce: Duration::from_secs(60),
            ..fast_config()
        };
        let persister = EditPersister::spawn(store.clone(), config);
        persister
            .handle()
            .record(RoomKey::new(project.id, "main.tex"), Arc::from("final"));
        persister.shutdown().await;

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "final");
    }

    /// Fails the first `failures` saves, then delegates.
    struct FlakyStore {
        inner: MemoryProjectStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ProjectStore for FlakyStore {
        async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
            self.inner.get_project(id).await
        }

        async fn save_project(&self, project: &Project) -> Result<(), StoreError> {
            let left = self.failures.load(Ordering::Relaxed);
            if left > 0 {
                self.failures.store(left - 1, Ordering::Relaxed);
                return Err(StoreError::Database("disk unavailable".into()));
            }
            self.inner.save_project(project).await
        }

        async fn delete_project(&self, id: Uuid) -> Result<bool, StoreError> {
            self.inner.delete_project(id).await
        }

        async fn list_projects(&self) -> Result<Vec<Uuid>, StoreError> {
            self.inner.list_projects().await
        }
    }

    #[tokio::test]
    async fn test_failed_save_is_retried() {
        let inner = MemoryProjectStore::new();
        let project = Project::new("Paper", Uuid::new_v4());
        inner.save_project(&project).await.unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures: AtomicU32::new(2),
        });

        let persister = EditPersister::spawn(store.clone(), fast_config());
        let handle = persister.handle();
        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("kept"));
        handle.flush().await;

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "kept");
        assert_eq!(handle.stats().save_failures, 0);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let inner = MemoryProjectStore::new();
        let project = Project::new("Paper", Uuid::new_v4());
        inner.save_project(&project).await.unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            failures: AtomicU32::new(10),
        });

        let persister = EditPersister::spawn(store.clone(), fast_config());
        let handle = persister.handle();
        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("lost"));
        handle.flush().await;

        assert_eq!(handle.stats().save_failures, 1);
        assert_eq!(handle.stats().saves, 0);
        persister.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_project_leaves_other_projects_pending() {
        let (store, project) = seeded_store().await;
        let other = Project::new("Other", Uuid::new_v4());
        store.save_project(&other).await.unwrap();
        let config = PersistConfig {
            debounce: Duration::from_secs(60),
            ..fast_config()
        };
        let persister = EditPersister::spawn(store.clone(), config);
        let handle = persister.handle();

        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("mine"));
        handle.record(RoomKey::new(other.id, "main.tex"), Arc::from("theirs"));
        handle.flush_project(project.id).await;

        let saved = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(text_of(&saved, "main.tex"), "mine");
        let untouched = store.get_project(other.id).await.unwrap().unwrap();
        assert_eq!(text_of(&untouched, "main.tex"), quire_core::DEFAULT_TEMPLATE);
        assert_eq!(handle.pending_rooms(), 1);
        persister.shutdown().await;
    }

    /// Never answers `get_project`.
    struct StuckStore;

    #[async_trait]
    impl ProjectStore for StuckStore {
        async fn get_project(&self, _id: Uuid) -> Result<Option<Project>, StoreError> {
            std::future::pending().await
        }

        async fn save_project(&self, _project: &Project) -> Result<(), StoreError> {
            Ok(())
        }

        async fn delete_project(&self, _id: Uuid) -> Result<bool, StoreError> {
            Ok(false)
        }

        async fn list_projects(&self) -> Result<Vec<Uuid>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_stuck_store_holds_one_snapshot_per_room() {
        let persister = EditPersister::spawn(Arc::new(StuckStore), fast_config());
        let handle = persister.handle();
        let project_id = Uuid::new_v4();
        let key = RoomKey::new(project_id, "main.tex");

        // First edit becomes due and wedges the writer inside get_project
        handle.record(key.clone(), Arc::from("first"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handle.pending_rooms(), 0);

        for i in 0..10_000 {
            handle.record(key.clone(), Arc::from(format!("keystroke {i}")));
        }
        handle.record(RoomKey::new(project_id, "refs.bib"), Arc::from("@book{}"));

        assert_eq!(handle.pending_rooms(), 2);
        assert_eq!(handle.stats().edits_recorded, 10_002);
    }

    #[tokio::test]
    async fn test_writer_holds_project_lock_while_saving() {
        let (store, project) = seeded_store().await;
        let config = PersistConfig {
            debounce: Duration::from_secs(60),
            ..fast_config()
        };
        let persister = EditPersister::spawn(store.clone(), config);
        let handle = persister.handle();

        let guard = handle.lock_project(project.id).await;
        handle.record(RoomKey::new(project.id, "main.tex"), Arc::from("queued"));
        let flusher = handle.clone();
        let flushing = tokio::spawn(async move { flusher.flush().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.save_count(), 1);
        assert!(!flushing.is_finished());

        drop(guard);
        flushing.await.unwrap();
        assert_eq!(store.save_count(), 2);
        persister.shutdown().await;
    }
}
