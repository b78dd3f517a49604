#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use thiserror::Error;

/// Error code constants for type-safe error handling
pub mod code {
    pub const CYCLE: &str = "CYCLE";
    pub const PLAN_CONFLICT: &str = "PLAN_CONFLICT";
    pub const TASK_FAILED: &str = "TASK_FAILED";
    pub const POLICY_REQUIRED: &str = "POLICY_REQUIRED";
    pub const VALIDATION: &str = "VALIDATION";
    pub const PREFLIGHT: &str = "PREFLIGHT";
    pub const DEPLOY_FAILED: &str = "DEPLOY_FAILED";
    pub const ROLLBACK_ORDER: &str = "ROLLBACK_ORDER";
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    pub const CONFLICT: &str = "CONFLICT";
    pub const INVALID: &str = "INVALID";
    pub const DEPENDENCY: &str = "DEPENDENCY";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL: &str = "INTERNAL";
}

/// One unmet deployment prerequisite together with its suggested fix.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UnmetPrerequisite {
    pub item: String,
    pub fix: String,
}

impl std::fmt::Display for UnmetPrerequisite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (fix: {})", self.item, self.fix)
    }
}

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Cyclic dependency between components: {}", components.join(" -> "))]
    CyclicDependency { components: Vec<String> },

    #[error("Plan conflict: stage '{stage}' is already deployed and {detail}")]
    PlanConflict { stage: String, detail: String },

    #[error("Task for role '{role}' failed: {detail}")]
    TaskFailure { role: String, detail: String },

    #[error("Required policy rule '{rule}' unresolved on stage {stage}")]
    PolicyViolationRequired { rule: String, stage: usize },

    #[error("Validation failed for stage {stage}: {detail}")]
    ValidationFailure { stage: usize, detail: String },

    #[error("Preflight unmet: {}", items.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    PreflightUnmet { items: Vec<UnmetPrerequisite> },

    #[error("Deployment of stage {stage} failed: {detail}")]
    DeployFailure { stage: usize, detail: String },

    #[error("Cannot roll back stage {requested} while stage {blocking} is deployed")]
    RollbackOrderViolation { requested: usize, blocking: usize },

    #[error("Circuit open for provider '{provider}'; call refused")]
    CircuitOpen { provider: String },

    #[error("Session state error: {0}")]
    StateError(String),

    #[error("Contract error: {0}")]
    ContractError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider '{provider}' timed out after {timeout_secs}s")]
    ProviderTimeout { provider: String, timeout_secs: u64 },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ForgeError {
    /// Returns the protocol error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            ForgeError::CyclicDependency { .. } => code::CYCLE,
            ForgeError::PlanConflict { .. } => code::PLAN_CONFLICT,
            ForgeError::TaskFailure { .. } => code::TASK_FAILED,
            ForgeError::PolicyViolationRequired { .. } => code::POLICY_REQUIRED,
            ForgeError::ValidationFailure { .. } => code::VALIDATION,
            ForgeError::PreflightUnmet { .. } => code::PREFLIGHT,
            ForgeError::DeployFailure { .. } => code::DEPLOY_FAILED,
            ForgeError::RollbackOrderViolation { .. } => code::ROLLBACK_ORDER,
            ForgeError::CircuitOpen { .. } => code::CIRCUIT_OPEN,
            ForgeError::StateError(_) => code::CONFLICT,
            ForgeError::ContractError(_) => code::DEPENDENCY,
            ForgeError::ConfigError(_) => code::INVALID,
            ForgeError::ProviderTimeout { .. } => code::TIMEOUT,
            ForgeError::IoError(_) => code::DEPENDENCY,
            ForgeError::SerializationError(_) => code::INVALID,
            ForgeError::Internal(_) => code::INTERNAL,
        }
    }

    /// Returns the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            ForgeError::ConfigError(_) => 2,
            ForgeError::CyclicDependency { .. } => 3,
            ForgeError::PlanConflict { .. } => 4,
            ForgeError::TaskFailure { .. } => 5,
            ForgeError::PolicyViolationRequired { .. } => 6,
            ForgeError::ValidationFailure { .. } => 7,
            ForgeError::PreflightUnmet { .. } => 8,
            ForgeError::DeployFailure { .. } => 9,
            ForgeError::RollbackOrderViolation { .. } => 10,
            ForgeError::CircuitOpen { .. } => 11,
            ForgeError::StateError(_) => 12,
            ForgeError::ContractError(_) => 13,
            ForgeError::ProviderTimeout { .. } => 14,
            ForgeError::IoError(_) => 15,
            ForgeError::SerializationError(_) => 16,
            ForgeError::Internal(_) => 17,
        }
    }

    /// True when the condition degrades capability without blocking progress.
    ///
    /// An open circuit refuses one provider locally; callers that treat the
    /// provider as optional may continue without it.
    pub fn is_degraded_capability(&self) -> bool {
        matches!(self, ForgeError::CircuitOpen { .. })
    }
}

/// Protocol error codes with description and suggested fix
pub const ERROR_CODES: &[(&str, &str, &str)] = &[
    (
        code::CYCLE,
        "Component dependencies form a cycle",
        "Break the cycle between the named components before planning again",
    ),
    (
        code::PLAN_CONFLICT,
        "Re-plan would reorder an already deployed stage",
        "Roll back the named stage or keep its position in the design",
    ),
    (
        code::TASK_FAILED,
        "A generation task failed",
        "Inspect the task error in the session audit trail and regenerate the stage",
    ),
    (
        code::POLICY_REQUIRED,
        "A required policy violation is unresolved",
        "Regenerate the stage to comply or record an override with justification",
    ),
    (
        code::VALIDATION,
        "Structural validation of a stage failed",
        "Review the validation output and let remediation retry the stage",
    ),
    (
        code::PREFLIGHT,
        "Deployment prerequisites are unmet",
        "Apply the listed fixes and restart the deploy session",
    ),
    (
        code::DEPLOY_FAILED,
        "A stage failed to deploy",
        "Inspect the escalation record, then retry, skip, or roll back",
    ),
    (
        code::ROLLBACK_ORDER,
        "Rollback requested out of reverse deployment order",
        "Roll back higher-indexed stages first",
    ),
    (
        code::CIRCUIT_OPEN,
        "Provider circuit breaker is open",
        "Wait for the cool-down or proceed without the optional capability",
    ),
    (
        code::CONFLICT,
        "Conflicting session state transition",
        "Inspect the session status view for the current phase",
    ),
    (
        code::INVALID,
        "Invalid payload or configuration",
        "Validate the document against the expected schema",
    ),
    (
        code::DEPENDENCY,
        "Missing external dependency",
        "Register the required provider or install the missing tool",
    ),
    (
        code::TIMEOUT,
        "Provider call timed out",
        "Increase the provider timeout and retry",
    ),
    (
        code::INTERNAL,
        "Unexpected internal failure",
        "Inspect logs and retry the session step",
    ),
];

/// Get error code details (description and fix) for a given error code
pub fn get_error_info(error_code: &str) -> Option<(&'static str, &'static str)> {
    ERROR_CODES
        .iter()
        .find(|(code, _, _)| *code == error_code)
        .map(|(_, desc, fix)| (*desc, *fix))
}

pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_code_has_a_documented_fix() {
        let samples = [
            ForgeError::CyclicDependency {
                components: vec!["a".into(), "b".into()],
            },
            ForgeError::PlanConflict {
                stage: "network".into(),
                detail: "would move after storage".into(),
            },
            ForgeError::TaskFailure {
                role: "infra".into(),
                detail: "boom".into(),
            },
            ForgeError::PolicyViolationRequired {
                rule: "no-plaintext-secrets".into(),
                stage: 2,
            },
            ForgeError::ValidationFailure {
                stage: 1,
                detail: "dry-run failed".into(),
            },
            ForgeError::PreflightUnmet {
                items: vec![UnmetPrerequisite {
                    item: "target location missing".into(),
                    fix: "create the resource group".into(),
                }],
            },
            ForgeError::DeployFailure {
                stage: 3,
                detail: "apply failed".into(),
            },
            ForgeError::RollbackOrderViolation {
                requested: 2,
                blocking: 3,
            },
            ForgeError::CircuitOpen {
                provider: "search".into(),
            },
            ForgeError::Internal("x".into()),
        ];

        for err in samples {
            assert!(get_error_info(err.code()).is_some(), "no info for {err}");
            assert!(err.exit_code() > 1);
        }
    }

    #[test]
    fn cycle_error_names_every_participant() {
        let err = ForgeError::CyclicDependency {
            components: vec!["vault".into(), "identity".into(), "vault".into()],
        };
        let text = err.to_string();
        assert!(text.contains("vault"));
        assert!(text.contains("identity"));
    }

    #[test]
    fn circuit_open_is_degraded_not_fatal() {
        let err = ForgeError::CircuitOpen {
            provider: "search".into(),
        };
        assert!(err.is_degraded_capability());
        assert!(!ForgeError::Internal("x".into()).is_degraded_capability());
    }
}
