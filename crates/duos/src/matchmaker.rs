//! The pairing engine.
//!
//! [`Matchmaker`] owns every piece of shared pairing state: the session
//! registry, the single waiting slot, recent-pair memory, cooldowns, the
//! report ledger and the ban set. It does no I/O. Each operation takes the
//! current [`Instant`] and returns the events to deliver, so callers decide
//! how time advances and how events reach clients.
//!
//! Invariants held between operations:
//! - at most one session occupies the waiting slot, and it has no partner;
//! - partner links are symmetric and never point at the session itself.

use crate::abuse::{AbuseControl, Report, ReportOutcome};
use crate::config::Policy;
use crate::ratelimit::{Action, CooldownLimiter};
use crate::recent::RecentPairs;
use crate::registry::{Session, SessionRegistry};
use duo_common::types::notice;
use duo_common::{Payload, RelayKind, ServerEvent, SessionId};
use serde::Serialize;
use std::time::Instant;

/// An event addressed to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    /// Recipient.
    pub to: SessionId,
    /// Event to deliver.
    pub event: ServerEvent,
}

impl Outbound {
    fn new(to: &SessionId, event: ServerEvent) -> Self {
        Self {
            to: to.clone(),
            event,
        }
    }
}

/// What a match request (or the implicit one behind `next`) did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The requester is not registered.
    Unknown,
    /// The requester is banned.
    Banned,
    /// The request fell inside its cooldown.
    CoolingDown,
    /// The requester now occupies the waiting slot.
    Waiting,
    /// The requester was already waiting.
    AlreadyWaiting,
    /// The waiting occupant was paired with the requester too recently; the
    /// requester was dropped and the occupant keeps waiting.
    RecentlyPaired,
    /// A pair was formed.
    Paired,
}

impl MatchOutcome {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Banned => "banned",
            Self::CoolingDown => "cooldown",
            Self::Waiting => "waiting",
            Self::AlreadyWaiting => "already_waiting",
            Self::RecentlyPaired => "recent_pair",
            Self::Paired => "paired",
        }
    }
}

/// What a `report` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportResult {
    /// The reporter is not registered.
    Unknown,
    /// The report fell inside the reporter's cooldown.
    CoolingDown,
    /// Neither a partner nor a usable target id was available.
    NoTarget,
    /// The report was filed.
    Filed(ReportOutcome),
}

/// Point-in-time counters for the admin surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    /// Live sessions.
    pub sessions: usize,
    /// Whether someone occupies the waiting slot.
    pub waiting: bool,
    /// Active pairs.
    pub pairs: usize,
    /// Recent-pair exclusions not yet expired.
    pub recent_pairs: usize,
    /// Reports on file.
    pub reports: usize,
    /// Banned ids.
    pub bans: usize,
}

/// Single owner of all pairing state.
#[derive(Debug)]
pub struct Matchmaker {
    policy: Policy,
    registry: SessionRegistry,
    waiting: Option<SessionId>,
    recent: RecentPairs,
    limiter: CooldownLimiter,
    abuse: AbuseControl,
}

impl Matchmaker {
    /// Creates an empty engine governed by `policy`.
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self {
            recent: RecentPairs::new(policy.recent_pair_ttl),
            abuse: AbuseControl::new(policy.ban_threshold),
            registry: SessionRegistry::new(),
            waiting: None,
            limiter: CooldownLimiter::new(),
            policy,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Register a new connection and greet it with its id.
    pub fn connect(&mut self, id: SessionId, now: Instant) -> Vec<Outbound> {
        if self.registry.contains(&id) {
            tracing::warn!(session = %id, "duplicate session id on connect, ignoring");
            return Vec::new();
        }
        self.registry.register(id.clone(), now);
        vec![Outbound::new(&id, ServerEvent::Welcome { session_id: id.clone() })]
    }

    /// Tear a session down: leave the slot, release the partner, forget it.
    ///
    /// Unknown ids are a no-op, so disconnect and reaping may race freely.
    pub fn disconnect(&mut self, id: &SessionId) -> Vec<Outbound> {
        let mut out = Vec::new();
        if !self.registry.contains(id) {
            return out;
        }
        self.release(id, &mut out);
        self.registry.remove(id);
        self.limiter.forget(id);
        out
    }

    /// Refresh liveness. Never resurrects a removed session.
    pub fn heartbeat(&mut self, id: &SessionId, now: Instant) -> bool {
        self.registry.touch(id, now)
    }

    /// Disconnect every session whose heartbeat is older than the staleness
    /// threshold, and drop expired recent-pair entries.
    pub fn reap(&mut self, now: Instant) -> (Vec<SessionId>, Vec<Outbound>) {
        self.recent.expire(now);
        let stale = self.registry.stale(now, self.policy.stale_after);
        let mut out = Vec::new();
        for id in &stale {
            out.extend(self.disconnect(id));
        }
        (stale, out)
    }

    // ── Matching ────────────────────────────────────────────────────

    /// Handle `findPartner`.
    pub fn find_partner(&mut self, id: &SessionId, now: Instant) -> (MatchOutcome, Vec<Outbound>) {
        let mut out = Vec::new();
        if !self.registry.contains(id) {
            return (MatchOutcome::Unknown, out);
        }
        if self.abuse.is_banned(id) {
            out.push(Outbound::new(id, banned_event()));
            return (MatchOutcome::Banned, out);
        }
        if !self
            .limiter
            .check_and_mark(id, Action::FindPartner, self.policy.match_cooldown, now)
        {
            out.push(Outbound::new(
                id,
                ServerEvent::MatchTimeout {
                    message: notice::MATCH_COOLDOWN.to_string(),
                },
            ));
            return (MatchOutcome::CoolingDown, out);
        }
        let outcome = self.enqueue(id, now, &mut out);
        (outcome, out)
    }

    /// Handle `next`: release the current pairing, then look for another
    /// partner without applying the match-request cooldown.
    pub fn next(&mut self, id: &SessionId, now: Instant) -> (MatchOutcome, Vec<Outbound>) {
        let mut out = Vec::new();
        if !self.registry.contains(id) {
            return (MatchOutcome::Unknown, out);
        }
        if !self
            .limiter
            .check_and_mark(id, Action::Next, self.policy.next_cooldown, now)
        {
            out.push(Outbound::new(
                id,
                ServerEvent::MatchTimeout {
                    message: notice::NEXT_COOLDOWN.to_string(),
                },
            ));
            return (MatchOutcome::CoolingDown, out);
        }
        self.release(id, &mut out);
        out.push(Outbound::new(id, ServerEvent::ReadyForNext));
        if self.abuse.is_banned(id) {
            out.push(Outbound::new(id, banned_event()));
            return (MatchOutcome::Banned, out);
        }
        let outcome = self.enqueue(id, now, &mut out);
        (outcome, out)
    }

    /// Put `id` in the waiting slot or pair it with the occupant.
    fn enqueue(&mut self, id: &SessionId, now: Instant, out: &mut Vec<Outbound>) -> MatchOutcome {
        if self.waiting.as_ref() == Some(id) {
            return MatchOutcome::AlreadyWaiting;
        }
        // Waiting and being paired are exclusive
        self.release(id, out);
        self.recent.expire(now);

        let Some(occupant) = self.waiting.clone() else {
            self.occupy_slot(id, now);
            return MatchOutcome::Waiting;
        };

        if !self.registry.contains(&occupant) {
            tracing::warn!(session = %occupant, "waiting slot held a removed session, clearing");
            self.occupy_slot(id, now);
            return MatchOutcome::Waiting;
        }

        if self.recent.contains(id, &occupant, now) {
            tracing::debug!(session = %id, waiting = %occupant, "recently paired with waiting session, dropping request");
            return MatchOutcome::RecentlyPaired;
        }

        // Clear the slot before linking so no other request can see the
        // occupant as both waiting and paired
        self.waiting = None;
        self.link(id, &occupant);
        self.recent.record(id, &occupant, now);

        out.push(Outbound::new(
            id,
            ServerEvent::Match {
                initiator: true,
                partner_id: occupant.clone(),
            },
        ));
        out.push(Outbound::new(
            &occupant,
            ServerEvent::Match {
                initiator: false,
                partner_id: id.clone(),
            },
        ));
        MatchOutcome::Paired
    }

    fn occupy_slot(&mut self, id: &SessionId, now: Instant) {
        if let Some(previous) = self.waiting.take() {
            if let Some(session) = self.registry.get_mut(&previous) {
                session.waiting_since = None;
            }
        }
        if let Some(session) = self.registry.get_mut(id) {
            session.waiting_since = Some(now);
        }
        self.waiting = Some(id.clone());
    }

    fn link(&mut self, a: &SessionId, b: &SessionId) {
        for (this, other) in [(a, b), (b, a)] {
            if let Some(session) = self.registry.get_mut(this) {
                session.waiting_since = None;
                session.partner = Some(other.clone());
            }
        }
    }

    /// Leave the waiting slot and drop any partner, telling the partner.
    ///
    /// Idempotent. A partner link to a removed session, or one the other
    /// side no longer reciprocates, is cleared silently.
    fn release(&mut self, id: &SessionId, out: &mut Vec<Outbound>) {
        if self.waiting.as_ref() == Some(id) {
            self.waiting = None;
        }
        let Some(session) = self.registry.get_mut(id) else {
            return;
        };
        session.waiting_since = None;
        let Some(partner_id) = session.partner.take() else {
            return;
        };
        if let Some(partner) = self.registry.get_mut(&partner_id) {
            if partner.partner.as_ref() == Some(id) {
                partner.partner = None;
                out.push(Outbound::new(&partner_id, ServerEvent::PartnerLeft));
            }
        }
    }

    // ── Relay ───────────────────────────────────────────────────────

    /// Forward a handshake payload to the sender's current partner.
    ///
    /// Returns nothing when the sender is unpaired.
    pub fn relay(&mut self, id: &SessionId, kind: RelayKind, payload: Payload) -> Option<Outbound> {
        let partner_id = self.live_partner(id)?;
        Some(Outbound::new(&partner_id, kind.into_event(payload)))
    }

    /// The partner of `id`, provided the link points back. A one-sided
    /// link is cleared and treated as no partner.
    fn live_partner(&mut self, id: &SessionId) -> Option<SessionId> {
        let partner_id = self.registry.get(id)?.partner.clone()?;
        let reciprocated = self
            .registry
            .get(&partner_id)
            .is_some_and(|p| p.partner.as_ref() == Some(id));
        if reciprocated {
            return Some(partner_id);
        }
        tracing::warn!(session = %id, partner = %partner_id, "dangling partner link, clearing");
        if let Some(session) = self.registry.get_mut(id) {
            session.partner = None;
        }
        None
    }

    // ── Abuse control ───────────────────────────────────────────────

    /// Handle `report`. The reporter's current partner, when there is one,
    /// takes precedence over the supplied `reported_id`.
    pub fn report(
        &mut self,
        id: &SessionId,
        reported_id: Option<SessionId>,
        reason: Option<String>,
        now: Instant,
    ) -> (ReportResult, Vec<Outbound>) {
        let mut out = Vec::new();
        if !self.registry.contains(id) {
            return (ReportResult::Unknown, out);
        }
        let target = self.live_partner(id).or(reported_id);
        if !self
            .limiter
            .check_and_mark(id, Action::Report, self.policy.report_cooldown, now)
        {
            return (ReportResult::CoolingDown, out);
        }
        let Some(target) = target.filter(|t| t != id) else {
            return (ReportResult::NoTarget, out);
        };

        let reason = reason
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| "unspecified".to_string());
        let outcome = self.abuse.file_report(id.clone(), target.clone(), reason);
        out.push(Outbound::new(
            id,
            ServerEvent::ReportAck {
                message: notice::REPORT_RECEIVED.to_string(),
            },
        ));

        if outcome.newly_banned {
            tracing::info!(session = %target, reports = outcome.count, "session banned");
            if self.waiting.as_ref() == Some(&target) {
                self.waiting = None;
                if let Some(session) = self.registry.get_mut(&target) {
                    session.waiting_since = None;
                }
            }
            if self.registry.contains(&target) {
                out.push(Outbound::new(&target, banned_event()));
            }
        }
        (ReportResult::Filed(outcome), out)
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Look up a session.
    #[must_use]
    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.registry.get(id)
    }

    /// Partner of `id`, if paired.
    #[must_use]
    pub fn partner_of(&self, id: &SessionId) -> Option<&SessionId> {
        self.registry.get(id)?.partner.as_ref()
    }

    /// Current waiting-slot occupant.
    #[must_use]
    pub fn waiting(&self) -> Option<&SessionId> {
        self.waiting.as_ref()
    }

    /// Whether `id` is banned.
    #[must_use]
    pub fn is_banned(&self, id: &SessionId) -> bool {
        self.abuse.is_banned(id)
    }

    /// Whether `a` and `b` are still excluded from each other.
    #[must_use]
    pub fn recently_paired(&self, a: &SessionId, b: &SessionId, now: Instant) -> bool {
        self.recent.contains(a, b, now)
    }

    /// The report ledger, oldest first.
    #[must_use]
    pub fn reports(&self) -> &[Report] {
        self.abuse.ledger().entries()
    }

    /// Banned ids, sorted.
    #[must_use]
    pub fn bans(&self) -> Vec<SessionId> {
        self.abuse.bans().snapshot()
    }

    /// Counters for the admin surface.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            sessions: self.registry.len(),
            waiting: self.waiting.is_some(),
            pairs: self.registry.iter().filter(|s| s.partner.is_some()).count() / 2,
            recent_pairs: self.recent.len(),
            reports: self.abuse.ledger().len(),
            bans: self.abuse.bans().len(),
        }
    }
}

fn banned_event() -> ServerEvent {
    ServerEvent::Banned {
        message: notice::BANNED.to_string(),
    }
}
