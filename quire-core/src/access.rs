//! Per-project access control list.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Capability tiers, ordered `Viewer < Editor < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum AccessLevel {
    Viewer = 1,
    Editor = 2,
    Owner = 3,
}

impl AccessLevel {
    pub fn can_edit(self) -> bool {
        self >= AccessLevel::Editor
    }
}

impl std::fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessLevel::Viewer => write!(f, "viewer"),
            AccessLevel::Editor => write!(f, "editor"),
            AccessLevel::Owner => write!(f, "owner"),
        }
    }
}

/// A single `(user, level)` grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessEntry {
    pub user_id: Uuid,
    pub level: AccessLevel,
}

/// Set of grants, unique by user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessList {
    entries: Vec<AccessEntry>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `level` to `user_id`, replacing any existing grant.
    ///
    /// Returns the previous level, if any.
    pub fn grant(&mut self, user_id: Uuid, level: AccessLevel) -> Option<AccessLevel> {
        match self.entries.iter_mut().find(|e| e.user_id == user_id) {
            Some(entry) => Some(std::mem::replace(&mut entry.level, level)),
            None => {
                self.entries.push(AccessEntry { user_id, level });
                None
            }
        }
    }

    /// Remove the grant for `user_id`.
    pub fn revoke(&mut self, user_id: Uuid) -> Option<AccessLevel> {
        let idx = self.entries.iter().position(|e| e.user_id == user_id)?;
        Some(self.entries.remove(idx).level)
    }

    pub fn level(&self, user_id: Uuid) -> Option<AccessLevel> {
        self.entries
            .iter()
            .find(|e| e.user_id == user_id)
            .map(|e| e.level)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(AccessLevel::Viewer < AccessLevel::Editor);
        assert!(AccessLevel::Editor < AccessLevel::Owner);
        assert!(!AccessLevel::Viewer.can_edit());
        assert!(AccessLevel::Editor.can_edit());
    }

    #[test]
    fn test_grant_replaces_existing() {
        let mut list = AccessList::new();
        let user = Uuid::new_v4();

        assert_eq!(list.grant(user, AccessLevel::Viewer), None);
        assert_eq!(list.grant(user, AccessLevel::Editor), Some(AccessLevel::Viewer));
        assert_eq!(list.len(), 1);
        assert_eq!(list.level(user), Some(AccessLevel::Editor));
    }

    #[test]
    fn test_revoke() {
        let mut list = AccessList::new();
        let user = Uuid::new_v4();
        list.grant(user, AccessLevel::Editor);

        assert_eq!(list.revoke(user), Some(AccessLevel::Editor));
        assert_eq!(list.revoke(user), None);
        assert!(list.is_empty());
    }

    #[test]
    fn test_level_serializes_lowercase() {
        let json = serde_json::to_string(&AccessLevel::Editor).unwrap();
        assert_eq!(json, "\"editor\"");
    }
}
