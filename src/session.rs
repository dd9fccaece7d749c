//! Sessions and the registry of live sessions.
//!
//! A [`Session`] only tracks its id and lifecycle state; whoever needs to
//! react to it starting or ending registers an observer. The
//! [`SessionRegistry`] holds weak references, so it never keeps a session
//! alive on its own.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use uuid::Uuid;

lazy_static::lazy_static! {
    static ref GLOBAL_SESSIONS: Arc<SessionRegistry> = Arc::new(SessionRegistry::new());
}

/// Lifecycle state of a [`Session`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not started yet.
    NotStarted,
    /// Started and not ended.
    Active,
    /// Ended.
    Ended,
}

/// Callback run on a session transition.
pub type SessionObserver = Arc<dyn Fn(&Arc<Session>) + Send + Sync>;

#[derive(Default)]
struct Observers {
    on_start: Vec<SessionObserver>,
    on_end: Vec<SessionObserver>,
}

/// A traced unit of agent work.
pub struct Session {
    id: Uuid,
    state: Mutex<SessionState>,
    observers: Mutex<Observers>,
}

impl Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates a session with a random v4 id.
    pub fn new() -> Arc<Self> {
        Self::with_id(Uuid::new_v4())
    }

    /// Creates a session with the given id.
    pub fn with_id(id: Uuid) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(SessionState::NotStarted),
            observers: Mutex::new(Observers::default()),
        })
    }

    /// The session id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the session has started and not ended.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    fn observers(&self) -> MutexGuard<'_, Observers> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a callback for when the session starts.
    pub fn on_start(&self, observer: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.observers().on_start.push(Arc::new(observer));
    }

    /// Registers a callback for when the session ends.
    pub fn on_end(&self, observer: impl Fn(&Arc<Session>) + Send + Sync + 'static) {
        self.observers().on_end.push(Arc::new(observer));
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return false;
        }
        *state = to;
        true
    }

    /// Starts the session and notifies start observers.
    ///
    /// Returns `false` without notifying if the session is not fresh.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.transition(SessionState::NotStarted, SessionState::Active) {
            return false;
        }
        tracing::debug!(session_id = %self.id, "session started");
        // Cloned so observers may touch the session without deadlocking.
        let observers = self.observers().on_start.clone();
        for observer in observers {
            observer(self);
        }
        true
    }

    /// Ends an active session and notifies end observers.
    ///
    /// Returns `false` without notifying if the session is not active.
    pub fn end(self: &Arc<Self>) -> bool {
        if !self.transition(SessionState::Active, SessionState::Ended) {
            return false;
        }
        tracing::debug!(session_id = %self.id, "session ended");
        let observers = self.observers().on_end.clone();
        for observer in observers {
            observer(self);
        }
        true
    }
}

/// Weak registry of live sessions, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<Uuid, Weak<Session>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<SessionRegistry> {
        Arc::clone(&GLOBAL_SESSIONS)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Weak<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `session`, replacing any entry with the same id.
    pub fn register(&self, session: &Arc<Session>) {
        self.sessions().insert(session.id(), Arc::downgrade(session));
    }

    /// Removes the entry for `id`.
    pub fn unregister(&self, id: Uuid) {
        self.sessions().remove(&id);
    }

    /// Looks up a session. Entries whose session was dropped count as absent.
    pub fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let mut sessions = self.sessions();
        match sessions.get(&id).map(Weak::upgrade) {
            Some(Some(session)) => Some(session),
            Some(None) => {
                sessions.remove(&id);
                None
            }
            None => None,
        }
    }

    /// Whether a live session with `id` is registered.
    pub fn contains(&self, id: Uuid) -> bool {
        self.get(id).is_some()
    }

    /// Ids of all live registered sessions.
    pub fn active_ids(&self) -> Vec<Uuid> {
        let mut sessions = self.sessions();
        sessions.retain(|_, session| session.strong_count() > 0);
        sessions.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_transitions_only_move_forward() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::NotStarted);

        // Ending a session that never started does nothing
        assert!(!session.end());
        assert!(session.start());
        assert!(session.is_active());
        assert!(!session.start());
        assert!(session.end());
        assert!(!session.end());
        assert!(!session.start());
        assert_eq!(session.state(), SessionState::Ended);
    }

    #[test]
    fn test_observers_fire_once_per_transition() {
        let session = Session::new();
        let started = Arc::new(AtomicUsize::new(0));
        let ended = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&started);
        let expected = session.id();
        session.on_start(move |s| {
            assert_eq!(s.id(), expected);
            assert!(s.is_active());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = Arc::clone(&ended);
        session.on_end(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        session.start();
        session.start();
        session.end();
        session.end();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_registry_does_not_keep_sessions_alive() {
        let registry = SessionRegistry::new();
        let kept = Session::new();
        let dropped = Session::new();
        registry.register(&kept);
        registry.register(&dropped);

        let dropped_id = dropped.id();
        drop(dropped);

        assert!(registry.contains(kept.id()));
        assert!(registry.get(dropped_id).is_none());
        assert_eq!(registry.active_ids(), vec![kept.id()]);

        registry.unregister(kept.id());
        assert!(registry.get(kept.id()).is_none());
    }
}
