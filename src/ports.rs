//! Port traits for the external collaborators the engine consumes.
//!
//! Generator agents, provisioning tools, environment probes, policy rule
//! sources, and the interactive front end all live behind these narrow
//! contracts. Tests drive the engine with in-memory fakes.

use crate::error::{Result, UnmetPrerequisite};
use crate::types::{
    Artifact, ArtifactKind, PolicyRule, PolicyViolation, RoleName, Stage, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Request envelope handed to a generator agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub role: RoleName,
    pub capability: String,
    pub description: String,
    /// Artifacts the role's contract entitles it to read.
    pub available: Vec<Artifact>,
    /// Constraints, including structured fix instructions on remediation.
    pub constraints: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedArtifact {
    pub key: String,
    pub kind: ArtifactKind,
    pub body: String,
}

/// Response envelope. The engine interprets nothing beyond this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub artifacts: Vec<GeneratedArtifact>,
    pub usage: TokenUsage,
}

pub trait GeneratorAgent: Send + Sync {
    fn generate(&self, request: GenerationRequest) -> PortFuture<'_, GenerationResponse>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvisionMode {
    DryRun,
    Apply,
    Destroy,
}

impl ProvisionMode {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DryRun => "dry-run",
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ProvisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pass/fail/output contract of an external provisioning tool run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub success: bool,
    pub outputs: BTreeMap<String, String>,
    pub raw_log: String,
}

impl ProvisionOutcome {
    #[must_use]
    pub fn succeeded(outputs: BTreeMap<String, String>, raw_log: impl Into<String>) -> Self {
        Self {
            success: true,
            outputs,
            raw_log: raw_log.into(),
        }
    }

    #[must_use]
    pub fn failed(raw_log: impl Into<String>) -> Self {
        Self {
            success: false,
            outputs: BTreeMap::new(),
            raw_log: raw_log.into(),
        }
    }
}

pub trait Provisioner: Send + Sync {
    fn invoke<'a>(
        &'a self,
        stage: &'a Stage,
        artifacts: &'a [Artifact],
        mode: ProvisionMode,
    ) -> PortFuture<'a, ProvisionOutcome>;
}

/// Target-environment prerequisite validation. An empty finding list means
/// preflight passes.
pub trait EnvironmentProbe: Send + Sync {
    fn preflight(&self) -> PortFuture<'_, Vec<UnmetPrerequisite>>;
}

/// Governance rule documents, loaded once per session and cached by the
/// policy engine.
pub trait PolicySource: Send + Sync {
    fn load_rules(&self) -> PortFuture<'_, Vec<PolicyRule>>;
}

/// How a raised violation should be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionDecision {
    Accept,
    Override { justification: String },
    Regenerate,
}

/// Decides accept/override/regenerate per violation. The shipped
/// `AutoArbiter` answers from configuration; an interactive front end can
/// put a human behind this port instead.
pub trait ViolationArbiter: Send + Sync {
    fn decide<'a>(&'a self, violation: &'a PolicyViolation) -> PortFuture<'a, ResolutionDecision>;
}

/// Blocking read of the next raw command line for an interactive session
/// state. Suspension between state-machine steps is exactly this read.
pub trait ReviewChannel: Send + Sync {
    fn next_command(&self) -> PortFuture<'_, String>;
}

/// A named external tool provider reachable only through the gateway.
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn call<'a>(&'a self, payload: &'a serde_json::Value) -> PortFuture<'a, serde_json::Value>;
}
