//! A compile issued right after a live edit builds that edit.
#![cfg(unix)]

use futures_util::SinkExt;
use quire_build::{BuildConfig, BuildOrchestrator, BuildQueue, CompilerConfig, QueueConfig};
use quire_collab::{CollabServer, MemoryProjectStore, PersistConfig, ProjectStore, RoomKey, ServerConfig};
use quire_server::ControlPlane;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

const TYPESET: &str = "cat \"$1\" > \"$(basename \"$1\" .tex).pdf\"";

#[tokio::test]
async fn test_compile_right_after_live_edit() {
    let builds = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryProjectStore::new());

    let orchestrator = BuildOrchestrator::new(BuildConfig {
        builds_root: builds.path().to_path_buf(),
        compiler: CompilerConfig {
            program: "sh".into(),
            args: vec!["-c".into(), TYPESET.into(), "fake-latex".into()],
            pass_timeout: Duration::from_secs(5),
        },
        ..BuildConfig::default()
    });
    let queue = Arc::new(BuildQueue::new(Arc::new(orchestrator), QueueConfig::default()));

    let server = CollabServer::with_store(
        ServerConfig {
            bind_addr: "127.0.0.1:0".into(),
            persist: PersistConfig {
                debounce: Duration::from_secs(60),
                max_delay: Duration::from_secs(60),
                ..PersistConfig::default()
            },
            ..ServerConfig::default()
        },
        store.clone(),
    );
    let control = ControlPlane::new(store.clone(), queue.clone(), server.persister());
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = Arc::new(server);
    let running = server.clone();
    tokio::spawn(async move { running.serve(listener).await });

    let owner = Uuid::new_v4();
    let project = control.create_project("Live", owner).await.unwrap();
    let key = RoomKey::new(project.id, "main.tex");

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}{}", key.to_path()))
        .await
        .unwrap();
    ws.send(Message::text("edited live")).await.unwrap();

    // The server has the edit, the store does not yet
    let persister = server.persister();
    tokio::time::timeout(Duration::from_secs(3), async {
        while persister.stats().edits_recorded == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    let stored = store.get_project(project.id).await.unwrap().unwrap();
    assert_ne!(stored.file("main.tex").and_then(|f| f.content.as_text()), Some("edited live"));

    let job_id = control.trigger_compile(project.id, owner).await.unwrap();
    let result = control.wait_for_compile(job_id, Duration::from_secs(10)).await.unwrap();
    let artifact = result.artifact_path().expect("success");
    assert_eq!(std::fs::read_to_string(artifact).unwrap(), "edited live");

    queue.shutdown().await;
}
