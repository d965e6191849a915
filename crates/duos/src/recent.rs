use duo_common::SessionId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

/// A scheduled removal of one recorded pair.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Expiry {
    at: Instant,
    a: SessionId,
    b: SessionId,
}

/// Time-boxed exclusion filter keeping two sessions from being paired again
/// right after they were paired.
///
/// Pure bookkeeping by id: entries outlive the sessions they name and are
/// only removed by [`RecentPairs::expire`].
#[derive(Debug)]
pub struct RecentPairs {
    ttl: Duration,
    excluded: HashMap<SessionId, HashMap<SessionId, Instant>>,
    schedule: BinaryHeap<Reverse<Expiry>>,
}

impl RecentPairs {
    /// Creates an empty filter whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            excluded: HashMap::new(),
            schedule: BinaryHeap::new(),
        }
    }

    /// Record `a` and `b` as recently paired, in both directions.
    ///
    /// Recording an existing pair pushes its expiry out to `now + ttl`.
    pub fn record(&mut self, a: &SessionId, b: &SessionId, now: Instant) {
        if a == b {
            return;
        }
        let at = now + self.ttl;
        self.excluded
            .entry(a.clone())
            .or_default()
            .insert(b.clone(), at);
        self.excluded
            .entry(b.clone())
            .or_default()
            .insert(a.clone(), at);
        self.schedule.push(Reverse(Expiry {
            at,
            a: a.clone(),
            b: b.clone(),
        }));
    }

    /// Whether `a` and `b` are still excluded from each other at `now`.
    #[must_use]
    pub fn contains(&self, a: &SessionId, b: &SessionId, now: Instant) -> bool {
        self.excluded
            .get(a)
            .and_then(|partners| partners.get(b))
            .is_some_and(|at| *at > now)
    }

    /// Remove every entry due at or before `now`. Returns the number of
    /// pairs removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(Reverse(next)) = self.schedule.peek() {
            if next.at > now {
                break;
            }
            let Some(Reverse(Expiry { at, a, b })) = self.schedule.pop() else {
                break;
            };
            // A re-record leaves an older heap entry behind; it must not
            // remove the newer expiry.
            let first = self.remove_direction(&a, &b, at);
            let second = self.remove_direction(&b, &a, at);
            if first || second {
                removed += 1;
            }
        }
        removed
    }

    fn remove_direction(&mut self, from: &SessionId, to: &SessionId, at: Instant) -> bool {
        let Some(partners) = self.excluded.get_mut(from) else {
            return false;
        };
        if partners.get(to) != Some(&at) {
            return false;
        }
        partners.remove(to);
        if partners.is_empty() {
            self.excluded.remove(from);
        }
        true
    }

    /// Number of recorded pairs not yet removed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.excluded.values().map(HashMap::len).sum::<usize>() / 2
    }

    /// Returns `true` if no pair is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty()
    }
}
