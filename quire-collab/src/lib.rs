//! # quire-collab: Real-time session broadcaster for Quire
//!
//! Relays full-document snapshots between everyone editing the same file
//! of a project, and persists the latest snapshot in the background.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   /ws/<project>/<file>   ┌──────────────┐
//! │ editor tab  │ ◄──────────────────────► │ CollabServer │
//! │ (per user)  │     text snapshots       │              │
//! └─────────────┘                          └──────┬───────┘
//!                                                 │
//!                                  ┌──────────────┼──────────────┐
//!                                  ▼                             ▼
//!                          ┌──────────────┐             ┌──────────────┐
//!                          │ RoomRegistry │             │ EditPersister│
//!                          │ (fan-out)    │             │ (debounced)  │
//!                          └──────────────┘             └──────┬───────┘
//!                                                              ▼
//!                                                      dyn ProjectStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Room addressing and the broadcast envelope
//! - [`broadcast`]: Room registry with per-room fan-out
//! - [`persist`]: Coalescing, debounced writer for live edits
//! - [`server`]: WebSocket session server
//! - [`storage`]: Project store boundary (memory, RocksDB)

pub mod protocol;
pub mod broadcast;
pub mod persist;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use protocol::{Envelope, PeerInfo, ProtocolError, RoomKey, ROOM_PATH_PREFIX};
pub use broadcast::{BroadcastStats, Room, RoomRegistry, Subscription};
pub use persist::{EditPersister, PersistConfig, PersistStats, PersisterHandle};
pub use server::{CollabServer, ServerConfig, ServerStats, SessionError};
pub use storage::{
    MemoryProjectStore, ProjectLocks, ProjectMetadata, ProjectStore, RocksProjectStore,
    StoreConfig, StoreError,
};
