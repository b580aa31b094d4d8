//! Per-project write serialization.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Serializes load-modify-save cycles on whole projects.
///
/// Every writer holds the project's guard from `get_project` until its
/// `save_project` returns. Clones share the same set of locks.
#[derive(Clone, Default)]
pub struct ProjectLocks {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ProjectLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to `project_id`.
    pub async fn lock(&self, project_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Drop locks nobody holds or waits on
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(project_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of projects with a live lock entry.
    pub async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_project_is_exclusive() {
        let locks = ProjectLocks::new();
        let id = Uuid::new_v4();

        let guard = locks.lock(id).await;
        let contender = locks.clone();
        let waiting = tokio::spawn(async move {
            let _guard = contender.lock(id).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_other_projects_not_blocked() {
        let locks = ProjectLocks::new();
        let _a = locks.lock(Uuid::new_v4()).await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.lock(Uuid::new_v4())).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_released_locks_are_pruned() {
        let locks = ProjectLocks::new();
        for _ in 0..5 {
            let _guard = locks.lock(Uuid::new_v4()).await;
        }
        let _held = locks.lock(Uuid::new_v4()).await;
        assert_eq!(locks.tracked().await, 1);
    }
}
