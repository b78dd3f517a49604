use super::identifiers::IssueId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Escalation ladder for unresolved failures.
///
/// L4 halts automated progress on the issue; only an explicit external
/// resolution clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EscalationLevel {
    DocumentedFixes,
    ArchitectureReview,
    BroadenedSearch,
    HumanDecision,
}

impl EscalationLevel {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DocumentedFixes => "documented-fixes",
            Self::ArchitectureReview => "architecture-review",
            Self::BroadenedSearch => "broadened-search",
            Self::HumanDecision => "human-decision",
        }
    }

    #[must_use]
    pub const fn number(&self) -> u8 {
        match self {
            Self::DocumentedFixes => 1,
            Self::ArchitectureReview => 2,
            Self::BroadenedSearch => 3,
            Self::HumanDecision => 4,
        }
    }

    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::DocumentedFixes => Some(Self::ArchitectureReview),
            Self::ArchitectureReview => Some(Self::BroadenedSearch),
            Self::BroadenedSearch => Some(Self::HumanDecision),
            Self::HumanDecision => None,
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::HumanDecision)
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for EscalationLevel {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "documented-fixes" => Ok(Self::DocumentedFixes),
            "architecture-review" => Ok(Self::ArchitectureReview),
            "broadened-search" => Ok(Self::BroadenedSearch),
            "human-decision" => Ok(Self::HumanDecision),
            _ => Err(format!("Unknown escalation level: {s}")),
        }
    }
}

/// One escalated issue. Level only ever increases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub issue_id: IssueId,
    pub summary: String,
    pub stage_index: Option<usize>,
    pub level: EscalationLevel,
    pub opened_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub resolved: bool,
}

impl EscalationRecord {
    #[must_use]
    pub fn open(summary: impl Into<String>, stage_index: Option<usize>, now: DateTime<Utc>) -> Self {
        Self {
            issue_id: IssueId::generate(),
            summary: summary.into(),
            stage_index,
            level: EscalationLevel::DocumentedFixes,
            opened_at: now,
            last_activity_at: now,
            resolved: false,
        }
    }

    /// Advance one level and reset the activity clock.
    pub fn escalate(&mut self, now: DateTime<Utc>) -> EscalationLevel {
        if let Some(next) = self.level.next() {
            self.level = next;
        }
        self.last_activity_at = now;
        self.level
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity_at = now;
    }

    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.resolved = true;
        self.last_activity_at = now;
    }
}
