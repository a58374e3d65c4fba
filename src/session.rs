//! The pluggable session collaborator.
//!
//! The engine only depends on the four [`SessionManager`] operations; the
//! bundled [`MemorySessionManager`] keeps sessions in a mutex-guarded map
//! with timeout-based eviction.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Cookie under which the active session id travels.
pub const SESSION_COOKIE: &str = "petrel-session-id";

/// A keyed bag of JSON blobs tied to a client.
#[derive(Debug, Clone)]
pub struct Session {
    id: String,
    invalidated: bool,
    new: bool,
    values: HashMap<String, Value>,
}

impl Session {
    pub(crate) fn fresh() -> Session {
        Session {
            id: Uuid::new_v4().simple().to_string(),
            invalidated: false,
            new: true,
            values: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether this session was created for the current request rather than
    /// restored from the manager.
    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_as<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        serde_json::from_value(self.values.get(name)?.clone()).ok()
    }

    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), serde_json::Error> {
        self.values.insert(name.into(), serde_json::to_value(value)?);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.remove(name)
    }

    /// Marks the session for removal; the response writer emits the
    /// matching removal cookie and drops it from the manager.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }

    pub(crate) fn mark_restored(&mut self) {
        self.new = false;
    }
}

pub trait SessionManager: Send + Sync {
    fn create_session(&self) -> Session;
    fn get_session(&self, id: &str) -> Option<Session>;
    fn save_session(&self, session: Session);
    fn remove_session(&self, id: &str);
    /// How long an untouched session stays valid; also the cookie max-age.
    fn timeout(&self) -> Duration;
}

struct StoredSession {
    session: Session,
    touched: Instant,
}

/// In-memory [`SessionManager`] with timeout eviction on access.
pub struct MemorySessionManager {
    timeout: Duration,
    sessions: Mutex<HashMap<String, StoredSession>>,
}

impl MemorySessionManager {
    pub fn new(timeout: Duration) -> MemorySessionManager {
        MemorySessionManager {
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StoredSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for MemorySessionManager {
    fn default() -> Self {
        MemorySessionManager::new(Duration::from_secs(30 * 60))
    }
}

impl SessionManager for MemorySessionManager {
    fn create_session(&self) -> Session {
        Session::fresh()
    }

    fn get_session(&self, id: &str) -> Option<Session> {
        let mut sessions = self.lock();
        match sessions.get_mut(id) {
            Some(stored) if stored.touched.elapsed() < self.timeout => {
                stored.touched = Instant::now();
                let mut session = stored.session.clone();
                session.mark_restored();
                Some(session)
            }
            Some(_) => {
                sessions.remove(id);
                None
            }
            None => None,
        }
    }

    fn save_session(&self, session: Session) {
        self.lock().insert(
            session.id().to_owned(),
            StoredSession {
                session,
                touched: Instant::now(),
            },
        );
    }

    fn remove_session(&self, id: &str) {
        self.lock().remove(id);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_round_trip_through_the_manager() {
        let manager = MemorySessionManager::default();

        let mut session = manager.create_session();
        assert!(session.is_new());
        session.set("user", "frodo").unwrap();
        let id = session.id().to_owned();
        manager.save_session(session);

        let restored = manager.get_session(&id).unwrap();
        assert!(!restored.is_new());
        assert_eq!(restored.get_as::<String>("user").as_deref(), Some("frodo"));

        manager.remove_session(&id);
        assert!(manager.get_session(&id).is_none());
    }

    #[test]
    fn expired_sessions_are_evicted_on_access() {
        let manager = MemorySessionManager::new(Duration::ZERO);
        let session = manager.create_session();
        let id = session.id().to_owned();
        manager.save_session(session);

        assert!(manager.get_session(&id).is_none());
    }
}
