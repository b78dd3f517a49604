use super::artifacts::ArtifactKind;
use super::identifiers::RoleName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// One generator role's unit of work within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub role: RoleName,
    pub capability: String,
    pub consumes: BTreeSet<ArtifactKind>,
    pub produces: BTreeSet<ArtifactKind>,
    pub status: TaskStatus,
    pub error: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new(role: RoleName, capability: impl Into<String>) -> Self {
        Self {
            role,
            capability: capability.into(),
            consumes: BTreeSet::new(),
            produces: BTreeSet::new(),
            status: TaskStatus::Queued,
            error: None,
        }
    }

    #[must_use]
    pub fn consuming(mut self, kinds: impl IntoIterator<Item = ArtifactKind>) -> Self {
        self.consumes.extend(kinds);
        self
    }

    #[must_use]
    pub fn producing(mut self, kinds: impl IntoIterator<Item = ArtifactKind>) -> Self {
        self.produces.extend(kinds);
        self
    }

    /// Independence per the contract model: disjoint consumed/produced
    /// artifact kind sets.
    #[must_use]
    pub fn is_independent_of(&self, other: &Task) -> bool {
        let mine: BTreeSet<_> = self.consumes.union(&self.produces).copied().collect();
        let theirs: BTreeSet<_> = other.consumes.union(&other.produces).copied().collect();
        mine.is_disjoint(&theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::{Task, TaskStatus};
    use crate::types::artifacts::ArtifactKind;
    use crate::types::identifiers::RoleName;

    #[test]
    fn status_string_roundtrip_works() {
        for status in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::try_from(status.as_str()), Ok(status));
        }
    }

    #[test]
    fn disjoint_artifact_sets_are_independent() {
        let infra = Task::new(RoleName::new("infra"), "templates")
            .consuming([ArtifactKind::ServiceDesign])
            .producing([ArtifactKind::InfrastructureTemplate]);
        let db = Task::new(RoleName::new("db"), "schemas")
            .consuming([ArtifactKind::NetworkLayout])
            .producing([ArtifactKind::DatabaseSchema]);
        let app = Task::new(RoleName::new("app"), "scaffolds")
            .consuming([ArtifactKind::InfrastructureTemplate])
            .producing([ArtifactKind::ApplicationScaffold]);

        assert!(infra.is_independent_of(&db));
        assert!(!infra.is_independent_of(&app));
    }
}
