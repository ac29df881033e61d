//! In-memory session registry owned by the application root.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::session::{Liveness, Session, SessionStatus};

/// Shared `session_id → Session` map. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<BTreeMap<String, Session>>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a session. Returns the previous entry.
    pub async fn insert(&self, session: Session) -> Option<Session> {
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session)
    }

    /// Remove a session.
    pub async fn remove(&self, session_id: &str) -> Option<Session> {
        self.sessions.write().await.remove(session_id)
    }

    /// Clone of a single session.
    pub async fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().await.get(session_id).cloned()
    }

    /// Clones of all sessions, ordered by id.
    pub async fn list(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Update a session's status. Returns the previous status.
    pub async fn set_status(&self, session_id: &str, status: SessionStatus) -> Option<SessionStatus> {
        self.sessions
            .write()
            .await
            .get_mut(session_id)
            .map(|session| std::mem::replace(&mut session.status, status))
    }

    /// Update a session's liveness. Returns the previous value.
    pub async fn set_liveness(&self, session_id: &str, liveness: Liveness) -> Option<Liveness> {
        self.sessions
            .write()
            .await
            .get_mut(session_id)
            .map(|session| std::mem::replace(&mut session.liveness, liveness))
    }

    /// Record observed output. Returns `false` for unknown sessions.
    pub async fn touch_activity(&self, session_id: &str, at: DateTime<Utc>) -> bool {
        match self.sessions.write().await.get_mut(session_id) {
            Some(session) => {
                session.last_activity = Some(at);
                true
            }
            None => false,
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry is empty.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
