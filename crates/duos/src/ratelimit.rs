use duo_common::SessionId;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Actions throttled per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// `findPartner`
    FindPartner,
    /// `next`
    Next,
    /// `report`
    Report,
}

impl Action {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FindPartner => "find_partner",
            Self::Next => "next",
            Self::Report => "report",
        }
    }
}

/// Per-session, per-action cooldown ledger.
///
/// Stores the last *allowed* invocation of each action. A call inside the
/// window is refused and does not move the window, so hammering an action
/// never extends its own cooldown.
#[derive(Debug, Default)]
pub struct CooldownLimiter {
    last: HashMap<SessionId, HashMap<Action, Instant>>,
}

impl CooldownLimiter {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records `now` if at least `window` has passed since
    /// the last allowed `action` by `id`; otherwise returns `false`.
    pub fn check_and_mark(
        &mut self,
        id: &SessionId,
        action: Action,
        window: Duration,
        now: Instant,
    ) -> bool {
        let per_session = self.last.entry(id.clone()).or_default();
        match per_session.get(&action) {
            Some(prev) if now.saturating_duration_since(*prev) < window => false,
            _ => {
                per_session.insert(action, now);
                true
            }
        }
    }

    /// Drop everything recorded for `id`.
    pub fn forget(&mut self, id: &SessionId) {
        self.last.remove(id);
    }
}
