use super::escalation::EscalationLevel;
use super::policy::ViolationResolution;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured failure detail attached to audit events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FailureDiagnostics {
    pub category: String,
    pub retryable: bool,
    pub next_action: String,
    pub detail: Option<String>,
}

/// What happened. Every absorbed failure shows up here; nothing fails
/// silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventDetail {
    SessionStarted { kind: String },
    SessionResumed { kind: String, phase: String },
    SessionReset { kind: String },
    PlanComputed { stage_count: usize },
    StageGenerated { stage_index: usize },
    TaskDispatched { stage_index: usize, role: String },
    TaskFailed { stage_index: usize, role: String },
    ViolationRaised { stage_index: usize, rule_id: String, severity: String },
    ViolationResolved { stage_index: usize, rule_id: String, resolution: ViolationResolution },
    RemediationAttempted { stage_index: usize, attempt: u32 },
    RemediationExhausted { stage_index: usize, attempts: u32 },
    StagePolicyChecked { stage_index: usize },
    PreflightPassed,
    PreflightFailed { items: Vec<String> },
    StageDeployed { stage_index: usize },
    StageDeployFailed { stage_index: usize },
    StageSkipped { stage_index: usize, reason: String },
    OutputCaptured { stage_index: usize, keys: Vec<String> },
    StageRolledBack { stage_index: usize },
    RollbackRefused { requested: usize, blocking: usize },
    EscalationOpened { issue: String, level: EscalationLevel },
    EscalationAdvanced { issue: String, level: EscalationLevel },
    EscalationResolved { issue: String },
    CircuitOpened { provider: String },
    CircuitClosed { provider: String },
    CallRefused { provider: String },
    ReviewFeedback { targets: Vec<usize>, note: String },
    BuildAccepted,
    BuildAborted,
    CancelRequested,
}

/// One append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: EventDetail,
    pub diagnostics: Option<FailureDiagnostics>,
}

impl SessionEvent {
    #[must_use]
    pub fn new(seq: u64, detail: EventDetail, created_at: DateTime<Utc>) -> Self {
        Self {
            seq,
            created_at,
            detail,
            diagnostics: None,
        }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: FailureDiagnostics) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }
}
