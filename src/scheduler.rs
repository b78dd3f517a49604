use crate::artifact_store::ArtifactStore;
use crate::contracts::AgentContractRegistry;
use crate::error::Result;
use crate::ports::{GenerationRequest, GeneratorAgent};
use crate::types::{Artifact, ArtifactKind, ArtifactRef, Stage, Task, TaskStatus, TokenUsage};
use futures_util::stream::{self, StreamExt};
use itertools::Itertools;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of dispatching one stage's task set.
///
/// Failures are aggregated here, never raised: a failed task ends up
/// `failed` with its error while siblings still report.
#[derive(Debug, Clone)]
pub struct StageDispatchReport {
    pub stage_index: usize,
    pub tasks: Vec<Task>,
    pub produced: Vec<ArtifactRef>,
    pub usage: TokenUsage,
}

impl StageDispatchReport {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.tasks
            .iter()
            .all(|t| t.status == TaskStatus::Succeeded)
    }

    #[must_use]
    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .collect()
    }

    /// One line per failed task, for stage failure reporting.
    #[must_use]
    pub fn failure_summary(&self) -> String {
        self.failed_tasks()
            .iter()
            .map(|t| {
                format!(
                    "{}: {}",
                    t.role,
                    t.error.as_deref().unwrap_or("unknown error")
                )
            })
            .join("; ")
    }
}

/// Contract-driven dispatcher for one stage's tasks.
///
/// Tasks are partitioned into independence classes by their declared
/// artifact kinds; each class runs concurrently on a bounded pool and the
/// next class starts only when the previous one has fully settled.
pub struct TaskScheduler {
    registry: AgentContractRegistry,
    agent: Arc<dyn GeneratorAgent>,
    pool_size: usize,
}

impl TaskScheduler {
    #[must_use]
    pub fn new(
        registry: AgentContractRegistry,
        agent: Arc<dyn GeneratorAgent>,
        pool_size: usize,
    ) -> Self {
        Self {
            registry,
            agent,
            pool_size: pool_size.max(1),
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &AgentContractRegistry {
        &self.registry
    }

    /// Dispatch every task of `stage`. `constraints` carry remediation fix
    /// instructions; `supersede_existing` lets a replay overwrite the
    /// artifacts of the prior attempt instead of conflicting with them.
    ///
    /// # Errors
    ///
    /// Only infrastructure errors propagate; task failures are absorbed
    /// into the report.
    pub async fn dispatch_stage(
        &self,
        stage: &Stage,
        tasks: Vec<Task>,
        store: &ArtifactStore,
        constraints: &[String],
        supersede_existing: bool,
    ) -> Result<StageDispatchReport> {
        let mut report = StageDispatchReport {
            stage_index: stage.index,
            tasks: Vec::with_capacity(tasks.len()),
            produced: Vec::new(),
            usage: TokenUsage::default(),
        };

        let mut remaining: Vec<Task> = Vec::with_capacity(tasks.len());
        for mut task in tasks {
            // Contract violations are absorbed as upfront task failures.
            if let Err(err) = self.registry.validate_task(&task) {
                task.status = TaskStatus::Failed;
                task.error = Some(err.to_string());
                warn!("Task for {} rejected by contract: {}", task.role, err);
                report.tasks.push(task);
            } else {
                remaining.push(task);
            }
        }

        let mut available = store.available_kinds().await;

        while !remaining.is_empty() {
            let (wave, rest) = self.next_class(remaining, &available);

            if wave.is_empty() {
                for mut task in rest {
                    let missing = self.missing_kinds_for(&task, &available);
                    task.status = TaskStatus::Failed;
                    task.error = Some(format!(
                        "input artifacts never became available: {}",
                        missing.iter().map(ToString::to_string).join(", ")
                    ));
                    warn!(
                        "Task for {} cannot start on stage {}: {:?}",
                        task.role, stage.index, missing
                    );
                    report.tasks.push(task);
                }
                break;
            }

            let settled = self
                .dispatch_class(stage, wave, store, constraints, supersede_existing)
                .await;

            for (task, produced, usage) in settled {
                if task.status == TaskStatus::Succeeded {
                    available.extend(task.produces.iter().copied());
                }
                report.produced.extend(produced);
                report.usage = report.usage.add(usage);
                report.tasks.push(task);
            }

            remaining = rest;
        }

        debug!(
            "Stage {} dispatch settled: {}/{} tasks succeeded",
            stage.index,
            report
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Succeeded)
                .count(),
            report.tasks.len()
        );

        Ok(report)
    }

    /// Split off the next independence class in declaration order: every
    /// task whose inputs are already satisfiable and whose artifact kinds
    /// are disjoint from the rest of the class.
    fn next_class(
        &self,
        remaining: Vec<Task>,
        available: &BTreeSet<ArtifactKind>,
    ) -> (Vec<Task>, Vec<Task>) {
        let mut wave: Vec<Task> = Vec::new();
        let mut rest: Vec<Task> = Vec::new();

        for task in remaining {
            let ready = self
                .registry
                .dependents_satisfied(&task, available)
                .unwrap_or(false);
            if ready && wave.iter().all(|member| member.is_independent_of(&task)) {
                wave.push(task);
            } else {
                rest.push(task);
            }
        }

        (wave, rest)
    }

    fn missing_kinds_for(
        &self,
        task: &Task,
        available: &BTreeSet<ArtifactKind>,
    ) -> Vec<ArtifactKind> {
        let mut missing: BTreeSet<ArtifactKind> =
            task.consumes.difference(available).copied().collect();
        if let Ok(contract) = self.registry.resolve(&task.role) {
            missing.extend(contract.missing_inputs(available));
        }
        missing.into_iter().collect()
    }

    /// Run one class concurrently on the bounded pool. Sibling failures do
    /// not interrupt the class; every task settles.
    async fn dispatch_class(
        &self,
        stage: &Stage,
        wave: Vec<Task>,
        store: &ArtifactStore,
        constraints: &[String],
        supersede_existing: bool,
    ) -> Vec<(Task, Vec<ArtifactRef>, TokenUsage)> {
        let mut prepared = Vec::with_capacity(wave.len());
        for task in wave {
            let readable = self.readable_artifacts(&task, store).await;
            prepared.push((task, readable));
        }

        let calls = prepared.into_iter().map(|(mut task, readable)| {
            let agent = Arc::clone(&self.agent);
            let constraints = constraints.to_vec();
            let stage_name = stage.name.clone();
            async move {
                task.status = TaskStatus::Running;
                debug!("Dispatching {} for stage '{}'", task.role, stage_name);
                let request = GenerationRequest {
                    role: task.role.clone(),
                    capability: task.capability.clone(),
                    description: format!(
                        "Generate {} artifacts for stage '{stage_name}'",
                        task.capability
                    ),
                    available: readable,
                    constraints,
                };
                let response = agent.generate(request).await;
                (task, response)
            }
        });

        let settled: Vec<_> = stream::iter(calls)
            .buffer_unordered(self.pool_size)
            .collect()
            .await;

        let mut out = Vec::with_capacity(settled.len());
        for (mut task, response) in settled {
            match response {
                Ok(response) => {
                    // Commit artifacts only now that the task has succeeded,
                    // so a failed sibling never pollutes shared state.
                    let mut produced = Vec::with_capacity(response.artifacts.len());
                    let mut commit_error = None;
                    for artifact in response.artifacts {
                        let committed = if supersede_existing {
                            Ok(store
                                .replace(artifact.key, artifact.kind, stage.index, artifact.body)
                                .await)
                        } else {
                            store
                                .put(artifact.key, artifact.kind, stage.index, artifact.body)
                                .await
                        };
                        match committed {
                            Ok(reference) => produced.push(reference),
                            Err(err) => {
                                commit_error = Some(err.to_string());
                                break;
                            }
                        }
                    }

                    if let Some(err) = commit_error {
                        task.status = TaskStatus::Failed;
                        task.error = Some(err);
                        out.push((task, Vec::new(), response.usage));
                    } else {
                        task.status = TaskStatus::Succeeded;
                        out.push((task, produced, response.usage));
                    }
                }
                Err(err) => {
                    warn!("Task for {} failed: {}", task.role, err);
                    task.status = TaskStatus::Failed;
                    task.error = Some(err.to_string());
                    out.push((task, Vec::new(), TokenUsage::default()));
                }
            }
        }
        out
    }

    async fn readable_artifacts(&self, task: &Task, store: &ArtifactStore) -> Vec<Artifact> {
        let mut kinds: BTreeSet<ArtifactKind> = task.consumes.clone();
        if let Ok(contract) = self.registry.resolve(&task.role) {
            kinds.extend(contract.inputs.iter().copied());
        }
        let mut artifacts = Vec::new();
        for kind in kinds {
            artifacts.extend(store.by_kind(kind).await);
        }
        artifacts
    }
}
