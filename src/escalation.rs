use crate::types::{EscalationLevel, EscalationRecord, IssueId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{info, warn};

/// Timeout-gated, leveled escalation of unresolved issues.
///
/// Records only ever move up the ladder; the human-decision level halts
/// automated progress until an explicit external resolution.
#[derive(Debug, Default)]
pub struct EscalationTracker {
    timeout_secs: u64,
    records: HashMap<IssueId, EscalationRecord>,
}

impl EscalationTracker {
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_secs,
            records: HashMap::new(),
        }
    }

    /// Rebuild from persisted session records on resume.
    #[must_use]
    pub fn from_records(timeout_secs: u64, records: Vec<EscalationRecord>) -> Self {
        Self {
            timeout_secs,
            records: records.into_iter().map(|r| (r.issue_id, r)).collect(),
        }
    }

    pub fn open(
        &mut self,
        summary: impl Into<String>,
        stage_index: Option<usize>,
        now: DateTime<Utc>,
    ) -> EscalationRecord {
        let record = EscalationRecord::open(summary, stage_index, now);
        info!(
            "Escalation opened at {} for issue {}: {}",
            record.level, record.issue_id, record.summary
        );
        self.records.insert(record.issue_id, record.clone());
        record
    }

    #[must_use]
    pub fn get(&self, issue_id: IssueId) -> Option<&EscalationRecord> {
        self.records.get(&issue_id)
    }

    /// Inactivity past the timeout with no resolution recorded.
    #[must_use]
    pub fn should_auto_escalate(&self, record: &EscalationRecord, now: DateTime<Utc>) -> bool {
        if record.resolved || record.level.is_terminal() {
            return false;
        }
        let idle = now - record.last_activity_at;
        idle.num_seconds() >= 0 && idle.num_seconds().unsigned_abs() > self.timeout_secs
    }

    /// Advance every overdue record exactly one level, resetting its
    /// activity clock. Returns the issues that moved.
    pub fn auto_escalate_due(&mut self, now: DateTime<Utc>) -> Vec<(IssueId, EscalationLevel)> {
        let due: Vec<IssueId> = self
            .records
            .values()
            .filter(|r| self.should_auto_escalate(r, now))
            .map(|r| r.issue_id)
            .collect();

        let mut advanced = Vec::with_capacity(due.len());
        for issue_id in due {
            if let Some(record) = self.records.get_mut(&issue_id) {
                let level = record.escalate(now);
                if level.is_terminal() {
                    warn!(
                        "Issue {} reached {}; automation halted on it",
                        issue_id, level
                    );
                } else {
                    info!("Issue {} auto-escalated to {}", issue_id, level);
                }
                advanced.push((issue_id, level));
            }
        }
        advanced
    }

    pub fn record_activity(&mut self, issue_id: IssueId, now: DateTime<Utc>) {
        if let Some(record) = self.records.get_mut(&issue_id) {
            record.touch(now);
        }
    }

    /// Explicit external resolution; the only thing that clears the
    /// human-decision level.
    pub fn resolve(&mut self, issue_id: IssueId, now: DateTime<Utc>) -> bool {
        match self.records.get_mut(&issue_id) {
            Some(record) => {
                record.resolve(now);
                info!("Issue {} resolved at {}", issue_id, record.level);
                true
            }
            None => false,
        }
    }

    /// Unresolved issues currently halted on human decision.
    #[must_use]
    pub fn awaiting_human(&self) -> Vec<&EscalationRecord> {
        self.records
            .values()
            .filter(|r| !r.resolved && r.level.is_terminal())
            .collect()
    }

    /// Snapshot for persistence into session state.
    #[must_use]
    pub fn records(&self) -> Vec<EscalationRecord> {
        let mut all: Vec<EscalationRecord> = self.records.values().cloned().collect();
        all.sort_by_key(|r| r.opened_at);
        all
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::EscalationTracker;
    use crate::types::EscalationLevel;
    use chrono::{Duration, Utc};

    #[test]
    fn auto_escalation_fires_only_after_timeout() {
        let now = Utc::now();
        let mut tracker = EscalationTracker::new(120);
        let record = tracker.open("stage 2 deploy failed", Some(2), now);

        assert!(!tracker.should_auto_escalate(&record, now + Duration::seconds(119)));
        assert!(tracker.should_auto_escalate(&record, now + Duration::seconds(121)));

        let advanced = tracker.auto_escalate_due(now + Duration::seconds(121));
        assert_eq!(advanced.len(), 1);
        assert_eq!(advanced[0].1, EscalationLevel::ArchitectureReview);

        // The activity clock reset; nothing is due immediately after.
        assert!(tracker
            .auto_escalate_due(now + Duration::seconds(122))
            .is_empty());
    }

    #[test]
    fn resolution_stops_the_ladder() {
        let now = Utc::now();
        let mut tracker = EscalationTracker::new(60);
        let record = tracker.open("lint failure", None, now);

        assert!(tracker.resolve(record.issue_id, now));
        assert!(tracker
            .auto_escalate_due(now + Duration::seconds(3600))
            .is_empty());
    }

    #[test]
    fn terminal_level_halts_automation_until_resolved() {
        let now = Utc::now();
        let mut tracker = EscalationTracker::new(10);
        let record = tracker.open("unfixable template", Some(1), now);

        let mut at = now;
        for _ in 0..3 {
            at += Duration::seconds(11);
            tracker.auto_escalate_due(at);
        }
        let current = tracker.get(record.issue_id).unwrap();
        assert_eq!(current.level, EscalationLevel::HumanDecision);
        assert_eq!(tracker.awaiting_human().len(), 1);

        // No further automatic movement.
        assert!(tracker
            .auto_escalate_due(at + Duration::seconds(3600))
            .is_empty());

        tracker.resolve(record.issue_id, at);
        assert!(tracker.awaiting_human().is_empty());
    }

    #[test]
    fn records_snapshot_round_trips() {
        let now = Utc::now();
        let mut tracker = EscalationTracker::new(30);
        tracker.open("first", Some(1), now);
        tracker.open("second", None, now + Duration::seconds(1));

        let snapshot = tracker.records();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].summary, "first");

        let rebuilt = EscalationTracker::from_records(30, snapshot);
        assert_eq!(rebuilt.records().len(), 2);
    }
}
