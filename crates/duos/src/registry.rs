use duo_common::SessionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Server-side state for one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Transport-assigned id.
    pub id: SessionId,
    /// Current partner. Symmetric: if A points at B, B points at A.
    pub partner: Option<SessionId>,
    /// Last heartbeat (or connect) time.
    pub last_seen_at: Instant,
    /// Set only while this session occupies the waiting slot.
    pub waiting_since: Option<Instant>,
}

impl Session {
    fn new(id: SessionId, now: Instant) -> Self {
        Self {
            id,
            partner: None,
            last_seen_at: now,
            waiting_since: None,
        }
    }

    /// Whether the heartbeat has been silent for longer than `threshold`.
    #[must_use]
    pub fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_seen_at) > threshold
    }
}

/// Id → session table. The only place a session is ever destroyed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a fresh session, replacing any entry with the same id.
    pub fn register(&mut self, id: SessionId, now: Instant) -> &Session {
        let session = Session::new(id.clone(), now);
        self.sessions.insert(id.clone(), session);
        &self.sessions[&id]
    }

    /// Look up a session by id.
    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    /// Remove a session. Removing a missing id is a no-op.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Refresh `last_seen_at`. Returns `false` for unknown ids.
    pub fn touch(&mut self, id: &SessionId, now: Instant) -> bool {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// Ids of sessions whose heartbeat has been silent longer than `threshold`.
    #[must_use]
    pub fn stale(&self, now: Instant, threshold: Duration) -> Vec<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.is_stale(now, threshold))
            .map(|s| s.id.clone())
            .collect()
    }

    /// Iterate over all sessions.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Returns `true` if no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
