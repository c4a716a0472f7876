//! Session persistence
//!
//! Stores session records as one JSON document per session so an operator
//! can inspect and prune them by hand. Browser contexts are never
//! persisted; a restored record that claims to be logged in is demoted by
//! the manager at startup.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Where a session is in its lifecycle.
///
/// Transitions are one-directional: `Uninitialized -> AwaitingCaptcha ->
/// Authenticated -> Expired`, with `Invalidated` reachable from any live
/// state on explicit logout. A fresh login always creates a new session;
/// nothing ever re-enters `AwaitingCaptcha`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Uninitialized,
    AwaitingCaptcha,
    Authenticated,
    Expired,
    Invalidated,
}

impl SessionState {
    /// Whether the session can still become or stay usable.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionState::Uninitialized | SessionState::AwaitingCaptcha | SessionState::Authenticated
        )
    }
}

/// Persisted session record. The driver handle lives next to this in the
/// manager, never inside it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    /// Display label for the operator profile; not a credential.
    pub owner_profile: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(owner_profile: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_profile: owner_profile.to_string(),
            state: SessionState::Uninitialized,
            created_at: now,
            last_activity_at: now,
            expires_at: None,
        }
    }

    /// Expiry check against the wall clock.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires) => now > expires,
            None => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persistence contract for session records.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn save(&self, session: &Session) -> Result<(), StoreError>;
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;
    /// List sessions, newest first, optionally scoped to one profile.
    async fn list(&self, owner_profile: Option<&str>) -> Result<Vec<Session>, StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// One JSON file per session under a directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        let content = serde_json::to_string_pretty(session)?;
        std::fs::write(self.path_for(&session.id), content)?;
        debug!("Session {} saved", session.id);
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn list(&self, owner_profile: Option<&str>) -> Result<Vec<Session>, StoreError> {
        let mut sessions = Vec::new();

        if !self.dir.exists() {
            return Ok(sessions);
        }

        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str::<Session>(&content) {
                        Ok(session) => {
                            if owner_profile
                                .map(|p| session.owner_profile == p)
                                .unwrap_or(true)
                            {
                                sessions.push(session);
                            }
                        }
                        Err(e) => warn!("Skipping unreadable session file {:?}: {}", path, e),
                    },
                    Err(e) => warn!("Failed to read session file {:?}: {}", path, e),
                }
            }
        }

        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// In-memory store for tests and embedders without persistence.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn save(&self, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().await.get(id).cloned())
    }

    async fn list(&self, owner_profile: Option<&str>) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|s| owner_profile.map(|p| s.owner_profile == p).unwrap_or(true))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }
}
