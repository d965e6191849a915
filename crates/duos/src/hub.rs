use crate::abuse::Report;
use crate::config::Policy;
use crate::matchmaker::{EngineStats, MatchOutcome, Matchmaker, Outbound, ReportResult};
use crate::metrics::{counters, gauges};
use crate::ratelimit::Action;
use dashmap::DashMap;
use duo_common::{ClientEvent, ServerEvent, SessionId};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Serialization point between connections and the pairing engine.
///
/// Every engine operation runs under one lock, and the events it produces
/// are queued to their recipients before the lock is released, so each
/// client sees events in the order the engine produced them.
#[derive(Debug)]
pub struct Hub {
    engine: Mutex<Matchmaker>,
    outlets: DashMap<SessionId, mpsc::Sender<ServerEvent>>,
}

impl Hub {
    /// Create a hub with an empty engine.
    #[must_use]
    pub fn new(policy: Policy) -> Self {
        Self {
            engine: Mutex::new(Matchmaker::new(policy)),
            outlets: DashMap::new(),
        }
    }

    fn engine(&self) -> MutexGuard<'_, Matchmaker> {
        // Engine operations never panic midway through a transition, so a
        // poisoned lock still guards consistent state
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and the channel its events are written to.
    pub fn connect(&self, id: SessionId, tx: mpsc::Sender<ServerEvent>) {
        self.connect_at(id, tx, Instant::now());
    }

    /// [`Hub::connect`] with an explicit clock reading.
    pub fn connect_at(&self, id: SessionId, tx: mpsc::Sender<ServerEvent>, now: Instant) {
        let mut engine = self.engine();
        self.outlets.insert(id.clone(), tx);
        let out = engine.connect(id.clone(), now);
        self.dispatch(out);
        gauges::set_sessions_active(engine.stats().sessions);
        debug!(session = %id, "session connected");
    }

    /// Tear down a connection. Safe to call for sessions already reaped.
    pub fn disconnect(&self, id: &SessionId) {
        let mut engine = self.engine();
        let out = engine.disconnect(id);
        self.dispatch(out);
        self.outlets.remove(id);
        gauges::set_sessions_active(engine.stats().sessions);
        debug!(session = %id, "session disconnected");
    }

    /// Apply one inbound event from `id`.
    pub fn handle(&self, id: &SessionId, event: ClientEvent) {
        self.handle_at(id, event, Instant::now());
    }

    /// [`Hub::handle`] with an explicit clock reading.
    pub fn handle_at(&self, id: &SessionId, event: ClientEvent, now: Instant) {
        let mut engine = self.engine();
        match event {
            ClientEvent::FindPartner => {
                let (outcome, out) = engine.find_partner(id, now);
                record_match_outcome(id, Action::FindPartner, outcome);
                self.dispatch(out);
            }
            ClientEvent::Next => {
                let (outcome, out) = engine.next(id, now);
                record_match_outcome(id, Action::Next, outcome);
                self.dispatch(out);
            }
            ClientEvent::Heartbeat => {
                engine.heartbeat(id, now);
            }
            ClientEvent::Report {
                reported_id,
                reason,
            } => {
                let (result, out) = engine.report(id, reported_id, reason, now);
                match result {
                    ReportResult::Filed(outcome) => {
                        counters::reports_total();
                        if outcome.newly_banned {
                            counters::bans_total();
                        }
                    }
                    ReportResult::CoolingDown => {
                        counters::rejections_total("cooldown", Action::Report);
                        debug!(session = %id, action = Action::Report.as_str(), "refused by cooldown");
                    }
                    ReportResult::NoTarget | ReportResult::Unknown => {
                        debug!(session = %id, "report without a target ignored");
                    }
                }
                self.dispatch(out);
            }
            relay @ (ClientEvent::Offer { .. }
            | ClientEvent::Answer { .. }
            | ClientEvent::Candidate { .. }) => {
                let Some((kind, payload)) = relay.into_relay() else {
                    return;
                };
                match engine.relay(id, kind, payload) {
                    Some(out) => {
                        counters::relayed_total(kind.as_str());
                        self.dispatch(vec![out]);
                    }
                    None => {
                        counters::events_dropped_total("unpaired");
                        debug!(session = %id, kind = kind.as_str(), "relay without partner dropped");
                    }
                }
            }
        }
    }

    /// Run a liveness sweep now. Returns the number of sessions reaped.
    pub fn reap(&self) -> usize {
        self.reap_at(Instant::now())
    }

    /// [`Hub::reap`] with an explicit clock reading.
    pub fn reap_at(&self, now: Instant) -> usize {
        let mut engine = self.engine();
        let (reaped, out) = engine.reap(now);
        self.dispatch(out);
        for id in &reaped {
            // Dropping the sender ends the connection's event loop
            self.outlets.remove(id);
            info!(session = %id, "reaped stale session");
        }
        if !reaped.is_empty() {
            counters::sessions_reaped_total(reaped.len() as u64);
            gauges::set_sessions_active(engine.stats().sessions);
        }
        reaped.len()
    }

    /// Snapshot of the report ledger.
    #[must_use]
    pub fn reports(&self) -> Vec<Report> {
        self.engine().reports().to_vec()
    }

    /// Snapshot of the ban set.
    #[must_use]
    pub fn bans(&self) -> Vec<SessionId> {
        self.engine().bans()
    }

    /// Engine counters.
    #[must_use]
    pub fn stats(&self) -> EngineStats {
        self.engine().stats()
    }

    /// Run `f` against the engine under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&Matchmaker) -> R) -> R {
        f(&self.engine())
    }

    /// Whether `id` still has an outbound channel.
    #[must_use]
    pub fn is_attached(&self, id: &SessionId) -> bool {
        self.outlets.contains_key(id)
    }

    /// Queue events to their recipients without waiting. Must be called with
    /// the engine lock held.
    fn dispatch(&self, out: Vec<Outbound>) {
        for Outbound { to, event } in out {
            let Some(tx) = self.outlets.get(&to) else {
                counters::events_dropped_total("offline");
                continue;
            };
            match tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    counters::events_dropped_total("queue_full");
                    debug!(session = %to, event = event.name(), "outbound queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    counters::events_dropped_total("closed");
                }
            }
        }
    }
}

fn record_match_outcome(id: &SessionId, action: Action, outcome: MatchOutcome) {
    match outcome {
        MatchOutcome::Paired => counters::matches_total(),
        MatchOutcome::Banned | MatchOutcome::CoolingDown | MatchOutcome::RecentlyPaired => {
            counters::rejections_total(outcome.as_str(), action);
        }
        MatchOutcome::Waiting | MatchOutcome::AlreadyWaiting | MatchOutcome::Unknown => {}
    }
    debug!(
        session = %id,
        action = action.as_str(),
        outcome = outcome.as_str(),
        "match request handled"
    );
}
