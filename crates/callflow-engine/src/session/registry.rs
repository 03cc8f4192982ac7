//! Live sessions keyed by call id.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use super::ConversationSession;

pub type SharedSession = Arc<AsyncMutex<ConversationSession>>;

/// Owns every in-progress conversation. A session is removed once its call
/// ends or it sits idle past the silence timeout.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing nothing if one already exists for the
    /// call. Returns the session that ends up registered.
    pub fn insert(&self, session: ConversationSession) -> SharedSession {
        let mut sessions = self.lock();
        sessions
            .entry(session.call_id())
            .or_insert_with(|| Arc::new(AsyncMutex::new(session)))
            .clone()
    }

    pub fn get(&self, call_id: Uuid) -> Option<SharedSession> {
        self.lock().get(&call_id).cloned()
    }

    pub fn remove(&self, call_id: Uuid) -> Option<SharedSession> {
        self.lock().remove(&call_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Call ids whose last activity is before `cutoff`.
    ///
    /// Sessions currently locked by an in-flight turn are skipped; they are
    /// active by definition.
    pub fn idle_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter_map(|(id, session)| {
                let guard = session.try_lock().ok()?;
                (guard.last_activity() < cutoff).then_some(*id)
            })
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SharedSession>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
