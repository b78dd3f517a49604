use crate::error::{ForgeError, Result};
use crate::types::{ArtifactKind, RoleName, Task};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Declared capability surface of one generator role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentContract {
    pub role: RoleName,
    /// Artifact kinds the role must be able to read before it runs.
    pub inputs: BTreeSet<ArtifactKind>,
    /// Artifact kinds the role produces.
    pub outputs: BTreeSet<ArtifactKind>,
    /// Roles this one may hand sub-tasks to.
    pub delegates_to: Vec<RoleName>,
}

impl AgentContract {
    #[must_use]
    pub fn new(role: impl Into<String>) -> Self {
        Self {
            role: RoleName::new(role),
            inputs: BTreeSet::new(),
            outputs: BTreeSet::new(),
            delegates_to: Vec::new(),
        }
    }

    #[must_use]
    pub fn reading(mut self, kinds: impl IntoIterator<Item = ArtifactKind>) -> Self {
        self.inputs.extend(kinds);
        self
    }

    #[must_use]
    pub fn writing(mut self, kinds: impl IntoIterator<Item = ArtifactKind>) -> Self {
        self.outputs.extend(kinds);
        self
    }

    #[must_use]
    pub fn delegating_to(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.delegates_to
            .extend(roles.into_iter().map(RoleName::new));
        self
    }

    /// Every declared input kind is available.
    #[must_use]
    pub fn inputs_satisfied(&self, available: &BTreeSet<ArtifactKind>) -> bool {
        self.inputs.is_subset(available)
    }

    /// Input kinds still missing, for actionable error reporting.
    #[must_use]
    pub fn missing_inputs(&self, available: &BTreeSet<ArtifactKind>) -> Vec<ArtifactKind> {
        self.inputs.difference(available).copied().collect()
    }
}

/// Named contract layer. Layers are consulted in fixed priority order, so
/// a custom registration shadows an override, which shadows a builtin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContractLayer {
    pub name: String,
    contracts: BTreeMap<RoleName, AgentContract>,
}

impl ContractLayer {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contracts: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with(mut self, contract: AgentContract) -> Self {
        self.contracts.insert(contract.role.clone(), contract);
        self
    }

    pub fn register(&mut self, contract: AgentContract) {
        self.contracts.insert(contract.role.clone(), contract);
    }

    #[must_use]
    pub fn get(&self, role: &RoleName) -> Option<&AgentContract> {
        self.contracts.get(role)
    }
}

/// Layered role -> contract lookup: custom, then override, then builtin.
///
/// No runtime patching; resolution order is fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct AgentContractRegistry {
    layers: Vec<ContractLayer>,
}

impl AgentContractRegistry {
    #[must_use]
    pub fn new(layers: Vec<ContractLayer>) -> Self {
        Self { layers }
    }

    #[must_use]
    pub fn builtin(contracts: impl IntoIterator<Item = AgentContract>) -> Self {
        let mut layer = ContractLayer::new("builtin");
        for contract in contracts {
            layer.register(contract);
        }
        Self {
            layers: vec![layer],
        }
    }

    /// Prepend a higher-priority layer.
    #[must_use]
    pub fn overlaid_with(mut self, layer: ContractLayer) -> Self {
        self.layers.insert(0, layer);
        self
    }

    /// # Errors
    ///
    /// `ContractError` when no layer declares the role.
    pub fn resolve(&self, role: &RoleName) -> Result<&AgentContract> {
        self.layers
            .iter()
            .find_map(|layer| layer.get(role))
            .ok_or_else(|| {
                ForgeError::ContractError(format!("no contract registered for role '{role}'"))
            })
    }

    /// A task may run once every input kind its contract declares is
    /// present among `completed_outputs` (store contents plus kinds
    /// produced earlier in the stage).
    ///
    /// # Errors
    ///
    /// `ContractError` when the task's role is unknown.
    pub fn dependents_satisfied(
        &self,
        task: &Task,
        completed_outputs: &BTreeSet<ArtifactKind>,
    ) -> Result<bool> {
        let contract = self.resolve(&task.role)?;
        Ok(contract.inputs_satisfied(completed_outputs)
            && task.consumes.is_subset(completed_outputs))
    }

    /// Validate a task against its contract: it must not consume kinds the
    /// contract cannot read, nor produce kinds it does not declare.
    ///
    /// # Errors
    ///
    /// `ContractError` naming the undeclared kinds.
    pub fn validate_task(&self, task: &Task) -> Result<()> {
        let contract = self.resolve(&task.role)?;
        let undeclared_reads: Vec<_> = task.consumes.difference(&contract.inputs).collect();
        if !undeclared_reads.is_empty() {
            return Err(ForgeError::ContractError(format!(
                "task for role '{}' consumes kinds outside its contract: {}",
                task.role,
                undeclared_reads
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        let undeclared_writes: Vec<_> = task.produces.difference(&contract.outputs).collect();
        if !undeclared_writes.is_empty() {
            return Err(ForgeError::ContractError(format!(
                "task for role '{}' produces kinds outside its contract: {}",
                task.role,
                undeclared_writes
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            )));
        }
        Ok(())
    }
}

/// Which tasks each stage kind dispatches. The task graph is fixed by the
/// product domain, not user-programmable; this catalog is its single
/// declaration point.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    by_kind: BTreeMap<crate::types::StageKind, Vec<Task>>,
}

impl TaskCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, kind: crate::types::StageKind, tasks: Vec<Task>) -> Self {
        self.by_kind.insert(kind, tasks);
        self
    }

    /// Fresh queued task instances for one stage.
    #[must_use]
    pub fn tasks_for(&self, stage: &crate::types::Stage) -> Vec<Task> {
        self.by_kind
            .get(&stage.kind)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|t| {
                        let mut task = t.clone();
                        task.status = crate::types::TaskStatus::Queued;
                        task.error = None;
                        task
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
