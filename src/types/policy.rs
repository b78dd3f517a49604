use super::identifiers::RoleName;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicySeverity {
    Optional,
    Recommended,
    Required,
}

impl PolicySeverity {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Optional => "optional",
            Self::Recommended => "recommended",
            Self::Required => "required",
        }
    }
}

impl fmt::Display for PolicySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for PolicySeverity {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "optional" => Ok(Self::Optional),
            "recommended" => Ok(Self::Recommended),
            "required" => Ok(Self::Required),
            _ => Err(format!("Unknown policy severity: {s}")),
        }
    }
}

/// Checkable predicate over generated artifact text.
///
/// Rule *content* is authored outside the engine; these are the evaluation
/// mechanics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyPredicate {
    /// Artifact body must contain this text.
    RequiresText { text: String },
    /// Artifact body must not contain this text.
    ForbidsText { text: String },
    /// Artifact body must be non-empty.
    NonEmpty,
}

impl PolicyPredicate {
    /// True when the artifact body complies.
    #[must_use]
    pub fn holds_for(&self, body: &str) -> bool {
        match self {
            Self::RequiresText { text } => body.contains(text.as_str()),
            Self::ForbidsText { text } => !body.contains(text.as_str()),
            Self::NonEmpty => !body.trim().is_empty(),
        }
    }

    /// Structured feedback handed to remediation when the predicate fails.
    #[must_use]
    pub fn violation_text(&self) -> String {
        match self {
            Self::RequiresText { text } => format!("generated artifact must contain '{text}'"),
            Self::ForbidsText { text } => format!("generated artifact must not contain '{text}'"),
            Self::NonEmpty => "generated artifact must not be empty".to_string(),
        }
    }
}

/// A governance rule applicable to the artifacts of certain roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub severity: PolicySeverity,
    pub applies_to: Vec<RoleName>,
    pub predicate: PolicyPredicate,
}

impl PolicyRule {
    #[must_use]
    pub fn applies_to_role(&self, role: &RoleName) -> bool {
        self.applies_to.is_empty() || self.applies_to.contains(role)
    }
}

/// Terminal resolution of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationResolution {
    AcceptedCompliant,
    Overridden,
    Regenerated,
}

impl ViolationResolution {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptedCompliant => "accepted-compliant",
            Self::Overridden => "overridden",
            Self::Regenerated => "regenerated",
        }
    }
}

impl fmt::Display for ViolationResolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One rule violation raised against a stage, and how it was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub rule_id: String,
    pub severity: PolicySeverity,
    pub stage_index: usize,
    pub detail: String,
    pub resolution: Option<ViolationResolution>,
    pub justification: Option<String>,
}

impl PolicyViolation {
    #[must_use]
    pub fn open(rule: &PolicyRule, stage_index: usize) -> Self {
        Self {
            rule_id: rule.id.clone(),
            severity: rule.severity,
            stage_index,
            detail: rule.predicate.violation_text(),
            resolution: None,
            justification: None,
        }
    }

    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// A required violation blocks the stage until regenerated to comply or
    /// overridden with a recorded justification.
    #[must_use]
    pub fn blocks_stage(&self, block_on_recommended: bool) -> bool {
        if self.is_resolved() {
            return false;
        }
        match self.severity {
            PolicySeverity::Required => true,
            PolicySeverity::Recommended => block_on_recommended,
            PolicySeverity::Optional => false,
        }
    }
}
