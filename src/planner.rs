use crate::error::{ForgeError, Result};
use crate::types::{ComponentName, Stage, StageKind, StageStatus};
use itertools::Itertools;
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// One component of the service design, before ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: ComponentName,
    pub kind: StageKind,
    pub depends_on: Vec<ComponentName>,
    /// Component disables shared-key/password auth on its resource. Such a
    /// component implicitly depends on an identity-and-role-assignment
    /// component landing in the same or an earlier stage.
    pub disables_shared_key_auth: bool,
    /// Component assigns identities and role bindings.
    pub provides_identity: bool,
}

impl ComponentSpec {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: StageKind) -> Self {
        Self {
            name: ComponentName::new(name),
            kind,
            depends_on: Vec::new(),
            disables_shared_key_auth: false,
            provides_identity: false,
        }
    }

    #[must_use]
    pub fn depending_on(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on
            .extend(names.into_iter().map(ComponentName::new));
        self
    }

    #[must_use]
    pub const fn disabling_shared_key_auth(mut self) -> Self {
        self.disables_shared_key_auth = true;
        self
    }

    #[must_use]
    pub const fn providing_identity(mut self) -> Self {
        self.provides_identity = true;
        self
    }
}

/// Plans components into a deterministic ordered stage list.
///
/// Pure over its inputs; re-planning is a separate entry point that also
/// checks deployed-stage ordering.
pub struct StagePlanner;

impl StagePlanner {
    /// Build the DAG (explicit plus derived edges) and topologically sort
    /// it into 1-based stage indices. Ties break by declaration order.
    ///
    /// # Errors
    ///
    /// `CyclicDependency` naming every cycle participant; `ConfigError` for
    /// a dependency on an unknown component.
    pub fn plan(components: &[ComponentSpec]) -> Result<Vec<Stage>> {
        let by_name: HashMap<&str, usize> = components
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.value(), i))
            .collect();

        let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
        for i in 0..components.len() {
            graph.add_node(i);
        }

        for (i, component) in components.iter().enumerate() {
            for dep in &component.depends_on {
                let Some(&d) = by_name.get(dep.value()) else {
                    return Err(ForgeError::ConfigError(format!(
                        "component '{}' depends on unknown component '{}'",
                        component.name, dep
                    )));
                };
                if d == i {
                    return Err(ForgeError::CyclicDependency {
                        components: vec![component.name.value().to_string()],
                    });
                }
                graph.add_edge(d, i, ());
            }
        }

        for (i, component) in components.iter().enumerate() {
            if let Some(provider) = Self::derived_identity_dependency(components, i, component) {
                debug!(
                    "Derived dependency: {} requires identity from {}",
                    component.name, components[provider].name
                );
                graph.add_edge(provider, i, ());
            }
        }

        let order = Self::stable_topo_order(&graph, components)?;

        let mut index_of: HashMap<usize, usize> = HashMap::new();
        for (position, &node) in order.iter().enumerate() {
            index_of.insert(node, position + 1);
        }

        let mut stages = Vec::with_capacity(components.len());
        let mut depth_of: HashMap<usize, usize> = HashMap::new();
        for &node in &order {
            let component = &components[node];
            let mut stage = Stage::new(index_of[&node], component.name.value(), component.kind);
            let preds: BTreeSet<usize> = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .map(|p| index_of[&p])
                .collect();
            stage.depth = 1 + preds
                .iter()
                .filter_map(|p| depth_of.get(p))
                .max()
                .copied()
                .unwrap_or(0);
            depth_of.insert(stage.index, stage.depth);
            stage.predecessors = preds;
            stages.push(stage);
        }

        Ok(stages)
    }

    /// Recompute a plan after a design change without reordering anything
    /// already deployed. Statuses, artifacts, and captured outputs carry
    /// over by stage name.
    ///
    /// # Errors
    ///
    /// `PlanConflict` when a deployed stage would be removed or would move
    /// relative to another deployed stage.
    pub fn replan(existing: &[Stage], components: &[ComponentSpec]) -> Result<Vec<Stage>> {
        let mut fresh = Self::plan(components)?;

        let deployed: Vec<&Stage> = existing
            .iter()
            .filter(|s| s.status == StageStatus::Deployed)
            .sorted_by_key(|s| s.index)
            .collect();

        let mut last_new_index = 0usize;
        for stage in &deployed {
            let Some(new_stage) = fresh.iter().find(|s| s.name == stage.name) else {
                return Err(ForgeError::PlanConflict {
                    stage: stage.name.clone(),
                    detail: "the new design removes it".to_string(),
                });
            };
            if new_stage.index < last_new_index {
                return Err(ForgeError::PlanConflict {
                    stage: stage.name.clone(),
                    detail: "the new design would reorder it against another deployed stage"
                        .to_string(),
                });
            }
            last_new_index = new_stage.index;
        }

        for stage in &mut fresh {
            if let Some(old) = existing.iter().find(|s| s.name == stage.name) {
                stage.status = old.status;
                stage.artifacts = old.artifacts.clone();
                stage.outputs = old.outputs.clone();
            }
        }

        Ok(fresh)
    }

    fn derived_identity_dependency(
        components: &[ComponentSpec],
        index: usize,
        component: &ComponentSpec,
    ) -> Option<usize> {
        if !component.disables_shared_key_auth || component.provides_identity {
            return None;
        }
        let provider = components
            .iter()
            .position(|c| c.provides_identity)
            .filter(|&p| p != index)?;
        let already_direct = component
            .depends_on
            .iter()
            .any(|d| d.value() == components[provider].name.value());
        (!already_direct).then_some(provider)
    }

    /// Kahn's algorithm scanning declaration order each round, so equal
    /// candidates always emit in input order.
    fn stable_topo_order(
        graph: &DiGraphMap<usize, ()>,
        components: &[ComponentSpec],
    ) -> Result<Vec<usize>> {
        let n = components.len();
        let mut indegree = vec![0usize; n];
        for node in 0..n {
            indegree[node] = graph
                .neighbors_directed(node, petgraph::Direction::Incoming)
                .count();
        }

        let mut emitted = vec![false; n];
        let mut order = Vec::with_capacity(n);

        while order.len() < n {
            let Some(next) = (0..n).find(|&i| !emitted[i] && indegree[i] == 0) else {
                return Err(Self::cycle_error(graph, components, &emitted));
            };
            emitted[next] = true;
            order.push(next);
            for succ in graph.neighbors_directed(next, petgraph::Direction::Outgoing) {
                indegree[succ] = indegree[succ].saturating_sub(1);
            }
        }

        Ok(order)
    }

    fn cycle_error(
        graph: &DiGraphMap<usize, ()>,
        components: &[ComponentSpec],
        emitted: &[bool],
    ) -> ForgeError {
        let in_cycle: Vec<String> = tarjan_scc(graph)
            .into_iter()
            .filter(|scc| scc.len() > 1)
            .flatten()
            .filter(|&n| !emitted[n])
            .sorted()
            .map(|n| components[n].name.value().to_string())
            .collect();

        let components = if in_cycle.is_empty() {
            // Self-loops and anything else unplannable.
            emitted
                .iter()
                .enumerate()
                .filter(|(_, done)| !**done)
                .map(|(n, _)| components[n].name.value().to_string())
                .collect()
        } else {
            in_cycle
        };

        ForgeError::CyclicDependency { components }
    }
}
