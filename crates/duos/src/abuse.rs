use chrono::{DateTime, Utc};
use duo_common::SessionId;
use serde::Serialize;
use std::collections::{HashMap, HashSet};

/// One entry in the report ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    /// Session that filed the report.
    pub reporter_id: SessionId,
    /// Session being reported.
    pub reported_id: SessionId,
    /// Free-form reason supplied by the reporter.
    pub reason: String,
    /// Wall-clock time the report was filed.
    pub timestamp: DateTime<Utc>,
}

/// Append-only list of reports with a per-target tally.
#[derive(Debug, Default)]
pub struct ReportLedger {
    entries: Vec<Report>,
    tally: HashMap<SessionId, usize>,
}

impl ReportLedger {
    /// Append `report` and return how many reports now name its target.
    pub fn append(&mut self, report: Report) -> usize {
        let count = self.tally.entry(report.reported_id.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.entries.push(report);
        count
    }

    /// All reports in filing order.
    #[must_use]
    pub fn entries(&self) -> &[Report] {
        &self.entries
    }

    /// Total number of reports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing has been reported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ids barred from matching. Grows only.
#[derive(Debug, Default)]
pub struct BanSet {
    ids: HashSet<SessionId>,
}

impl BanSet {
    /// Ban `id`. Returns `true` if it was not banned before.
    pub fn insert(&mut self, id: SessionId) -> bool {
        self.ids.insert(id)
    }

    /// Whether `id` is banned.
    #[must_use]
    pub fn contains(&self, id: &SessionId) -> bool {
        self.ids.contains(id)
    }

    /// Banned ids, sorted for stable output.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of banned ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns `true` if nobody is banned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Result of filing one report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    /// Reports now on file against the target.
    pub count: usize,
    /// `true` only for the report that pushed the target over the threshold.
    pub newly_banned: bool,
}

/// Report ledger plus ban set, with the threshold that links them.
#[derive(Debug)]
pub struct AbuseControl {
    ledger: ReportLedger,
    bans: BanSet,
    ban_threshold: usize,
}

impl AbuseControl {
    /// Creates empty abuse state banning at `ban_threshold` reports.
    #[must_use]
    pub fn new(ban_threshold: usize) -> Self {
        Self {
            ledger: ReportLedger::default(),
            bans: BanSet::default(),
            ban_threshold,
        }
    }

    /// Record a report and ban the target once it reaches the threshold.
    pub fn file_report(
        &mut self,
        reporter_id: SessionId,
        reported_id: SessionId,
        reason: String,
    ) -> ReportOutcome {
        let count = self.ledger.append(Report {
            reporter_id,
            reported_id: reported_id.clone(),
            reason,
            timestamp: Utc::now(),
        });
        let newly_banned = count >= self.ban_threshold && self.bans.insert(reported_id);
        ReportOutcome {
            count,
            newly_banned,
        }
    }

    /// Whether `id` is banned.
    #[must_use]
    pub fn is_banned(&self, id: &SessionId) -> bool {
        self.bans.contains(id)
    }

    /// The report ledger.
    #[must_use]
    pub fn ledger(&self) -> &ReportLedger {
        &self.ledger
    }

    /// The ban set.
    #[must_use]
    pub fn bans(&self) -> &BanSet {
        &self.bans
    }
}
