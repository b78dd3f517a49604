use super::artifacts::ArtifactRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What a stage deploys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum StageKind {
    InfrastructureComponent,
    Database,
    Integration,
    Application,
}

impl StageKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InfrastructureComponent => "infrastructure-component",
            Self::Database => "database",
            Self::Integration => "integration",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StageKind {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "infrastructure-component" => Ok(Self::InfrastructureComponent),
            "database" => Ok(Self::Database),
            "integration" => Ok(Self::Integration),
            "application" => Ok(Self::Application),
            _ => Err(format!("Unknown stage kind: {s}")),
        }
    }
}

/// Lifecycle status of a stage across build and deploy sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageStatus {
    Pending,
    Generated,
    PolicyChecked,
    Deployed,
    Failed,
    RolledBack,
}

impl StageStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Generated => "generated",
            Self::PolicyChecked => "policy-checked",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
            Self::RolledBack => "rolled-back",
        }
    }

    /// Whether the stage carries committed generation output.
    #[must_use]
    pub const fn has_output(&self) -> bool {
        matches!(self, Self::Generated | Self::PolicyChecked | Self::Deployed)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StageStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(Self::Pending),
            "generated" => Ok(Self::Generated),
            "policy-checked" => Ok(Self::PolicyChecked),
            "deployed" => Ok(Self::Deployed),
            "failed" => Ok(Self::Failed),
            "rolled-back" => Ok(Self::RolledBack),
            _ => Err(format!("Unknown stage status: {s}")),
        }
    }
}

/// One unit of generation/deployment work.
///
/// `index` is 1-based and defines both deploy order and reverse rollback
/// order. `predecessors` hold stage indices, all strictly smaller than
/// `index` for any plan the planner emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub index: usize,
    pub name: String,
    pub kind: StageKind,
    pub predecessors: BTreeSet<usize>,
    pub status: StageStatus,
    pub artifacts: Vec<ArtifactRef>,
    pub outputs: Vec<(String, String)>,
    /// Distance from the roots of the dependency graph. Stages sharing a
    /// depth have no path between them and are eligible together once their
    /// predecessors are deployed.
    pub depth: usize,
}

impl Stage {
    #[must_use]
    pub fn new(index: usize, name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            predecessors: BTreeSet::new(),
            status: StageStatus::Pending,
            artifacts: Vec::new(),
            outputs: Vec::new(),
            depth: 0,
        }
    }

    /// All predecessors deployed, so this stage may deploy next.
    #[must_use]
    pub fn ready_to_deploy(&self, stages: &[Stage]) -> bool {
        self.predecessors.iter().all(|&p| {
            stages
                .iter()
                .any(|s| s.index == p && s.status == StageStatus::Deployed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Stage, StageKind, StageStatus};

    #[test]
    fn status_string_roundtrip_works() {
        for status in [
            StageStatus::Pending,
            StageStatus::Generated,
            StageStatus::PolicyChecked,
            StageStatus::Deployed,
            StageStatus::Failed,
            StageStatus::RolledBack,
        ] {
            assert_eq!(StageStatus::try_from(status.as_str()), Ok(status));
        }
        assert!(StageStatus::try_from("bogus").is_err());
    }

    #[test]
    fn kind_string_roundtrip_works() {
        for kind in [
            StageKind::InfrastructureComponent,
            StageKind::Database,
            StageKind::Integration,
            StageKind::Application,
        ] {
            assert_eq!(StageKind::try_from(kind.as_str()), Ok(kind));
        }
    }

    #[test]
    fn readiness_requires_all_predecessors_deployed() {
        let mut first = Stage::new(1, "network", StageKind::InfrastructureComponent);
        let mut second = Stage::new(2, "db", StageKind::Database);
        second.predecessors.insert(1);

        let stages = vec![first.clone(), second.clone()];
        assert!(!stages[1].ready_to_deploy(&stages));

        first.status = StageStatus::Deployed;
        let stages = vec![first, second.clone()];
        assert!(stages[1].ready_to_deploy(&stages));

        second.predecessors.insert(99);
        assert!(!second.ready_to_deploy(&stages));
    }
}
