mod artifacts;
mod budget;
mod circuit_breaker;
mod escalation;
mod events;
mod identifiers;
mod policy;
mod stage;
mod task;

pub use artifacts::{Artifact, ArtifactKind, ArtifactRef};
pub use budget::{BudgetLimit, TokenUsage};
pub use circuit_breaker::{BreakerRecord, CircuitConfig, CircuitState};
pub use escalation::{EscalationLevel, EscalationRecord};
pub use events::{EventDetail, FailureDiagnostics, SessionEvent};
pub use identifiers::{ComponentName, IssueId, RoleName};
pub use policy::{
    PolicyPredicate, PolicyRule, PolicySeverity, PolicyViolation, ViolationResolution,
};
pub use stage::{Stage, StageKind, StageStatus};
pub use task::{Task, TaskStatus};
