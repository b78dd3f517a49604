use serde::{Deserialize, Serialize};
use std::fmt;

/// Artifact kinds flowing between generator roles.
///
/// Contracts reference kinds, never concrete artifact instances, so the
/// scheduler can order and parallelize tasks from declarations alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ArtifactKind {
    ServiceDesign,
    InfrastructureTemplate,
    DatabaseSchema,
    IntegrationManifest,
    ApplicationScaffold,
    DeploymentParameters,
    IdentityBindings,
    NetworkLayout,
    ResourceOutputs,
    ValidationReport,
    FixInstruction,
}

impl ArtifactKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceDesign => "service_design",
            Self::InfrastructureTemplate => "infrastructure_template",
            Self::DatabaseSchema => "database_schema",
            Self::IntegrationManifest => "integration_manifest",
            Self::ApplicationScaffold => "application_scaffold",
            Self::DeploymentParameters => "deployment_parameters",
            Self::IdentityBindings => "identity_bindings",
            Self::NetworkLayout => "network_layout",
            Self::ResourceOutputs => "resource_outputs",
            Self::ValidationReport => "validation_report",
            Self::FixInstruction => "fix_instruction",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for ArtifactKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "service_design" => Ok(Self::ServiceDesign),
            "infrastructure_template" => Ok(Self::InfrastructureTemplate),
            "database_schema" => Ok(Self::DatabaseSchema),
            "integration_manifest" => Ok(Self::IntegrationManifest),
            "application_scaffold" => Ok(Self::ApplicationScaffold),
            "deployment_parameters" => Ok(Self::DeploymentParameters),
            "identity_bindings" => Ok(Self::IdentityBindings),
            "network_layout" => Ok(Self::NetworkLayout),
            "resource_outputs" => Ok(Self::ResourceOutputs),
            "validation_report" => Ok(Self::ValidationReport),
            "fix_instruction" => Ok(Self::FixInstruction),
            _ => Err(format!("Unknown artifact kind: {s}")),
        }
    }
}

/// Reference to a stored artifact, carried on stages and in session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub key: String,
    pub kind: ArtifactKind,
    pub fingerprint: String,
}

/// A stored artifact: the body plus enough metadata to audit where it
/// came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub key: String,
    pub kind: ArtifactKind,
    pub stage_index: usize,
    pub body: String,
    pub fingerprint: String,
}

impl Artifact {
    #[must_use]
    pub fn to_ref(&self) -> ArtifactRef {
        ArtifactRef {
            key: self.key.clone(),
            kind: self.kind,
            fingerprint: self.fingerprint.clone(),
        }
    }
}
