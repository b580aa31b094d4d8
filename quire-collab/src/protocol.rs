//! Room addressing and the in-process broadcast envelope.
//!
//! Connections select their room through the WebSocket request path:
//! ```text
//! /ws/<project-uuid>/<file-name>
//!      └─────┬──────┘ └────┬────┘
//!        project id    file name (may contain '/')
//! ```
//!
//! Every text frame on the socket is the complete new content of the file
//! (snapshot, not diff). Fan-out happens on [`Envelope`]s carrying that
//! snapshot plus the sender's peer id.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Path prefix for session endpoints.
pub const ROOM_PATH_PREFIX: &str = "/ws/";

/// Broadcast grouping key: one room per (project, file).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    pub project_id: Uuid,
    pub file_name: String,
}

impl RoomKey {
    pub fn new(project_id: Uuid, file_name: impl Into<String>) -> Self {
        Self {
            project_id,
            file_name: file_name.into(),
        }
    }

    /// Parse a request path of the form `/ws/<project-uuid>/<file-name>`.
    ///
    /// A query string, if present, is ignored.
    pub fn from_path(path: &str) -> Result<Self, ProtocolError> {
        let path = path.split_once('?').map_or(path, |(p, _)| p);
        let rest = path
            .strip_prefix(ROOM_PATH_PREFIX)
            .ok_or_else(|| ProtocolError::InvalidPath(path.to_owned()))?;
        let (project, file_name) = rest
            .split_once('/')
            .ok_or_else(|| ProtocolError::InvalidPath(path.to_owned()))?;
        if file_name.is_empty() || file_name.ends_with('/') {
            return Err(ProtocolError::InvalidPath(path.to_owned()));
        }
        let project_id = Uuid::parse_str(project)
            .map_err(|_| ProtocolError::InvalidProjectId(project.to_owned()))?;
        Ok(Self::new(project_id, file_name))
    }

    /// Request path for this room.
    pub fn to_path(&self) -> String {
        format!("{ROOM_PATH_PREFIX}{}/{}", self.project_id, self.file_name)
    }
}

impl std::fmt::Display for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project_id, self.file_name)
    }
}

/// Identity of one live connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    /// Display label (remote address for socket peers)
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Create with explicit peer_id (for testing)
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// One snapshot in flight through a room.
///
/// Cloned once per receiver; the content is shared.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: Uuid,
    pub content: Arc<str>,
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("room path must look like /ws/<project-id>/<file>, got `{0}`")]
    InvalidPath(String),
    #[error("invalid project id `{0}`")]
    InvalidProjectId(String),
    #[error("room is full ({0} peers)")]
    RoomFull(usize),
    #[error("room closed")]
    RoomClosed,
}
