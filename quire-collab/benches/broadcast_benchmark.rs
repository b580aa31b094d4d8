use criterion::{criterion_group, criterion_main, Criterion};
use quire_collab::broadcast::RoomRegistry;
use quire_collab::protocol::{PeerInfo, RoomKey};
use quire_core::FileContent;
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_room_key_parse(c: &mut Criterion) {
    let path = RoomKey::new(Uuid::new_v4(), "chapters/intro.tex").to_path();

    c.bench_function("room_key_from_path", |b| {
        b.iter(|| black_box(RoomKey::from_path(black_box(&path)).unwrap()))
    });
}

fn bench_content_from_wire(c: &mut Criterion) {
    let text = "\\section{Results}\n".repeat(200);
    let image = format!("data:image/png;base64,{}", "iVBORw0KGgo".repeat(400));

    c.bench_function("from_wire_text_3KB", |b| {
        b.iter(|| black_box(FileContent::from_wire(black_box(&text))))
    });
    c.bench_function("from_wire_image_4KB", |b| {
        b.iter(|| black_box(FileContent::from_wire(black_box(&image))))
    });
}

fn bench_fan_out_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let snapshot: Arc<str> = Arc::from("x".repeat(4096));

    c.bench_function("fan_out_4KB_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = RoomRegistry::new(16);
                let key = RoomKey::new(Uuid::new_v4(), "main.tex");

                let mut subs = Vec::new();
                for i in 0..100 {
                    subs.push(registry.join(key.clone(), PeerInfo::new(format!("peer{i}"))).await);
                }

                let sender = subs[0].peer_id();
                registry.dispatch(&key, snapshot.clone(), sender).await;

                for sub in subs.iter_mut().skip(1) {
                    black_box(sub.try_recv());
                }
            })
        })
    });
}

fn bench_fan_out_1000_snapshots(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("fan_out_1000_snapshots_10_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let registry = RoomRegistry::new(2048);
                let key = RoomKey::new(Uuid::new_v4(), "main.tex");

                let mut subs = Vec::new();
                for i in 0..10 {
                    subs.push(registry.join(key.clone(), PeerInfo::new(format!("peer{i}"))).await);
                }

                let sender = subs[0].peer_id();
                for i in 0..1000 {
                    registry.dispatch(&key, Arc::from(format!("v{i}")), sender).await;
                }

                for sub in subs.iter_mut().skip(1) {
                    while let Some(snapshot) = sub.try_recv() {
                        black_box(snapshot);
                    }
                }
            })
        })
    });
}

criterion_group!(
    benches,
    bench_room_key_parse,
    bench_content_from_wire,
    bench_fan_out_100_peers,
    bench_fan_out_1000_snapshots,
);
criterion_main!(benches);
