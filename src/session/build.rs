use crate::artifact_store::ArtifactStore;
use crate::config::ForgeConfig;
use crate::contracts::TaskCatalog;
use crate::error::{ForgeError, Result};
use crate::escalation::EscalationTracker;
use crate::planner::{ComponentSpec, StagePlanner};
use crate::policy::PolicyResolutionEngine;
use crate::ports::{ReviewChannel, ViolationArbiter};
use crate::remediation::{stage_artifacts_by_role, RemediationController};
use crate::scheduler::TaskScheduler;
use crate::session::commands::BuildCommand;
use crate::session::state::{SessionKind, SessionState, SessionStore};
use crate::types::{
    EventDetail, FailureDiagnostics, PolicySeverity, Stage, StageStatus, TaskStatus,
};
use chrono::Utc;
use itertools::Itertools;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Plan,
    PerStageGenerate,
    PerStagePolicyCheck,
    AdvisoryReview,
    ReportReady,
    InteractiveReview,
    Accepted,
    Aborted,
}

impl BuildPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::PerStageGenerate => "per-stage-generate",
            Self::PerStagePolicyCheck => "per-stage-policy-check",
            Self::AdvisoryReview => "advisory-review",
            Self::ReportReady => "report-ready",
            Self::InteractiveReview => "interactive-review",
            Self::Accepted => "accepted",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BuildPhase {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "plan" => Ok(Self::Plan),
            "per-stage-generate" => Ok(Self::PerStageGenerate),
            "per-stage-policy-check" => Ok(Self::PerStagePolicyCheck),
            "advisory-review" => Ok(Self::AdvisoryReview),
            "report-ready" => Ok(Self::ReportReady),
            "interactive-review" => Ok(Self::InteractiveReview),
            "accepted" => Ok(Self::Accepted),
            "aborted" => Ok(Self::Aborted),
            _ => Err(format!("Unknown build phase: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildOutcome {
    Accepted,
    Aborted,
}

/// Resumable build state machine: plan, generate per stage, policy-check
/// per stage (with bounded remediation), then interactive review until the
/// stage list is accepted or the session is aborted.
///
/// State is read-modify-written once per transition, so a crash loses at
/// most one step.
pub struct BuildSession {
    config: ForgeConfig,
    components: Vec<ComponentSpec>,
    catalog: TaskCatalog,
    scheduler: TaskScheduler,
    policy: PolicyResolutionEngine,
    remediation: RemediationController,
    arbiter: Arc<dyn ViolationArbiter>,
    review: Arc<dyn ReviewChannel>,
    store: Arc<dyn SessionStore>,
    artifacts: Arc<ArtifactStore>,
}

impl BuildSession {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: ForgeConfig,
        components: Vec<ComponentSpec>,
        catalog: TaskCatalog,
        scheduler: TaskScheduler,
        policy: PolicyResolutionEngine,
        arbiter: Arc<dyn ViolationArbiter>,
        review: Arc<dyn ReviewChannel>,
        store: Arc<dyn SessionStore>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        let remediation = RemediationController::new(config.max_remediation_attempts);
        Self {
            config,
            components,
            catalog,
            scheduler,
            policy,
            remediation,
            arbiter,
            review,
            store,
            artifacts,
        }
    }

    /// Drive the machine to a terminal phase, resuming from persisted
    /// state when present.
    ///
    /// # Errors
    ///
    /// Planning conflicts and infrastructure failures; per-task and
    /// per-rule failures are absorbed into session state.
    pub async fn run(&self) -> Result<BuildOutcome> {
        let mut state = self.load_state().await?;

        loop {
            let phase = BuildPhase::try_from(state.phase.as_str())
                .map_err(ForgeError::StateError)?;
            match phase {
                BuildPhase::Plan => self.plan(&mut state).await?,
                BuildPhase::PerStageGenerate => self.generate_stages(&mut state).await?,
                BuildPhase::PerStagePolicyCheck => self.policy_check_stages(&mut state).await?,
                BuildPhase::AdvisoryReview => self.advisory_review(&mut state).await?,
                BuildPhase::ReportReady => {
                    self.transition(&mut state, BuildPhase::InteractiveReview).await?;
                }
                BuildPhase::InteractiveReview => {
                    if let Some(outcome) = self.interactive_review(&mut state).await? {
                        return Ok(outcome);
                    }
                }
                BuildPhase::Accepted => return Ok(BuildOutcome::Accepted),
                BuildPhase::Aborted => return Ok(BuildOutcome::Aborted),
            }
        }
    }

    /// Explicit, irreversible reset of this session's state and the
    /// generated artifacts under the engine's control.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset(SessionKind::Build).await?;
        self.artifacts.clear().await;
        self.policy.invalidate().await;
        Ok(())
    }

    async fn load_state(&self) -> Result<SessionState> {
        match self.store.load(SessionKind::Build).await? {
            Some(mut state) => {
                info!("Resuming build session at phase '{}'", state.phase);
                state.record(EventDetail::SessionResumed {
                    kind: SessionKind::Build.as_str().to_string(),
                    phase: state.phase.clone(),
                });
                self.store.save(&state).await?;
                Ok(state)
            }
            None => {
                let mut state = SessionState::new(SessionKind::Build, BuildPhase::Plan.as_str());
                state.record(EventDetail::SessionStarted {
                    kind: SessionKind::Build.as_str().to_string(),
                });
                self.store.save(&state).await?;
                Ok(state)
            }
        }
    }

    async fn transition(&self, state: &mut SessionState, to: BuildPhase) -> Result<()> {
        state.phase = to.as_str().to_string();
        self.store.save(state).await
    }

    async fn plan(&self, state: &mut SessionState) -> Result<()> {
        let stages = if state.stages.is_empty() {
            StagePlanner::plan(&self.components)?
        } else {
            StagePlanner::replan(&state.stages, &self.components)?
        };
        state.record(EventDetail::PlanComputed {
            stage_count: stages.len(),
        });
        state.stages = stages;
        self.transition(state, BuildPhase::PerStageGenerate).await
    }

    async fn generate_stages(&self, state: &mut SessionState) -> Result<()> {
        let indices: Vec<usize> = state.stages.iter().map(|s| s.index).sorted().collect();

        for index in indices {
            let snapshot = match state.stage(index) {
                Some(stage) if !stage.status.has_output() => stage.clone(),
                _ => continue,
            };

            if !self.predecessors_usable(state, &snapshot) {
                state.record(EventDetail::StageSkipped {
                    stage_index: index,
                    reason: "a predecessor stage failed to generate".to_string(),
                });
                self.store.save(state).await?;
                continue;
            }

            self.generate_one(state, &snapshot, &[]).await?;
            self.store.save(state).await?;
        }

        self.transition(state, BuildPhase::PerStagePolicyCheck).await
    }

    /// Generate one stage, recording dispatch results into state. Returns
    /// whether the stage now has committed output.
    async fn generate_one(
        &self,
        state: &mut SessionState,
        snapshot: &Stage,
        constraints: &[String],
    ) -> Result<bool> {
        let tasks = self.catalog.tasks_for(snapshot);
        if tasks.is_empty() {
            return Err(ForgeError::ConfigError(format!(
                "no tasks cataloged for stage kind {}",
                snapshot.kind
            )));
        }

        for task in &tasks {
            state.record(EventDetail::TaskDispatched {
                stage_index: snapshot.index,
                role: task.role.value().to_string(),
            });
        }

        let report = self
            .scheduler
            .dispatch_stage(snapshot, tasks, &self.artifacts, constraints, false)
            .await?;
        state.add_usage(report.usage);

        for task in &report.tasks {
            if task.status == TaskStatus::Failed {
                state.record_with_diagnostics(
                    EventDetail::TaskFailed {
                        stage_index: snapshot.index,
                        role: task.role.value().to_string(),
                    },
                    FailureDiagnostics {
                        category: "generation".to_string(),
                        retryable: true,
                        next_action: format!("regenerate {}", snapshot.index),
                        detail: task.error.clone(),
                    },
                );
            }
        }

        let generated = report.is_success();
        if let Some(stage) = state.stage_mut(snapshot.index) {
            if generated {
                stage.status = StageStatus::Generated;
                stage.artifacts = report.produced.clone();
            } else {
                stage.status = StageStatus::Failed;
            }
        }
        if generated {
            state.record(EventDetail::StageGenerated {
                stage_index: snapshot.index,
            });
        } else {
            warn!(
                "Stage {} generation failed: {}",
                snapshot.index,
                report.failure_summary()
            );
        }
        Ok(generated)
    }

    async fn policy_check_stages(&self, state: &mut SessionState) -> Result<()> {
        let indices: Vec<usize> = state
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Generated)
            .map(|s| s.index)
            .sorted()
            .collect();

        for index in indices {
            self.policy_check_one(state, index).await?;
            self.store.save(state).await?;
        }

        self.transition(state, BuildPhase::AdvisoryReview).await
    }

    async fn policy_check_one(&self, state: &mut SessionState, index: usize) -> Result<()> {
        let Some(snapshot) = state.stage(index).cloned() else {
            return Ok(());
        };
        let tasks = self.catalog.tasks_for(&snapshot);
        let produced = stage_artifacts_by_role(&snapshot, &tasks, &self.artifacts).await;
        let violations = self.policy.check_stage(index, &produced).await?;

        for violation in &violations {
            state.record(EventDetail::ViolationRaised {
                stage_index: index,
                rule_id: violation.rule_id.clone(),
                severity: violation.severity.as_str().to_string(),
            });
        }

        let resolution = self.policy.resolve(violations, self.arbiter.as_ref()).await?;
        for violation in &resolution.resolved {
            if let Some(resolved) = violation.resolution {
                state.record(EventDetail::ViolationResolved {
                    stage_index: index,
                    rule_id: violation.rule_id.clone(),
                    resolution: resolved,
                });
            }
            state.upsert_violation(violation.clone());
        }

        if resolution.regenerate.is_empty() {
            if let Some(stage) = state.stage_mut(index) {
                stage.status = StageStatus::PolicyChecked;
            }
            state.record(EventDetail::StagePolicyChecked { stage_index: index });
            return Ok(());
        }

        // Bounded remediation, then escalation on exhaustion.
        let mut working = snapshot.clone();
        let outcome = self
            .remediation
            .remediate(
                &mut working,
                &tasks,
                &self.scheduler,
                &self.artifacts,
                &self.policy,
                resolution.regenerate,
                &[],
            )
            .await?;

        for attempt in 1..=outcome.attempts {
            state.record(EventDetail::RemediationAttempted {
                stage_index: index,
                attempt,
            });
        }
        if let Some(report) = &outcome.last_report {
            state.add_usage(report.usage);
        }
        for violation in &outcome.resolved {
            if let Some(resolved) = violation.resolution {
                state.record(EventDetail::ViolationResolved {
                    stage_index: index,
                    rule_id: violation.rule_id.clone(),
                    resolution: resolved,
                });
            }
            state.upsert_violation(violation.clone());
        }
        for violation in &outcome.remaining {
            state.upsert_violation(violation.clone());
        }

        if let Some(stage) = state.stage_mut(index) {
            stage.status = working.status;
            if let Some(report) = &outcome.last_report {
                if outcome.cleared {
                    stage.artifacts = report.produced.clone();
                }
            }
        }

        if outcome.cleared {
            if let Some(stage) = state.stage_mut(index) {
                stage.status = StageStatus::PolicyChecked;
            }
            state.record(EventDetail::StagePolicyChecked { stage_index: index });
        } else {
            state.record(EventDetail::RemediationExhausted {
                stage_index: index,
                attempts: outcome.attempts,
            });
            let mut tracker = EscalationTracker::from_records(
                self.config.escalation_timeout_secs,
                state.escalations.clone(),
            );
            let record = tracker.open(
                format!(
                    "stage {index} failed policy remediation: {}",
                    outcome.remaining.iter().map(|v| v.rule_id.as_str()).join(", ")
                ),
                Some(index),
                Utc::now(),
            );
            state.record(EventDetail::EscalationOpened {
                issue: record.issue_id.to_string(),
                level: record.level,
            });
            state.escalations = tracker.records();
        }
        Ok(())
    }

    /// Informational only; never blocks acceptance.
    async fn advisory_review(&self, state: &mut SessionState) -> Result<()> {
        let accepted_recommended = state
            .violations
            .iter()
            .filter(|v| v.severity == PolicySeverity::Recommended && v.is_resolved())
            .count();
        let note = format!(
            "advisory: {} stage(s) ready, {} failed, {} recommended finding(s) waived",
            state
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::PolicyChecked)
                .count(),
            state
                .stages
                .iter()
                .filter(|s| s.status == StageStatus::Failed)
                .count(),
            accepted_recommended,
        );
        state.note_interaction("engine", note);
        self.transition(state, BuildPhase::ReportReady).await
    }

    /// One command per call; `Some(outcome)` ends the session.
    async fn interactive_review(&self, state: &mut SessionState) -> Result<Option<BuildOutcome>> {
        let line = self.review.next_command().await?;
        state.note_interaction("user", line.clone());

        let command = match BuildCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                state.note_interaction("engine", err.to_string());
                self.store.save(state).await?;
                return Ok(None);
            }
        };

        match command {
            BuildCommand::Status => {
                state.note_interaction("engine", self.status_line(state));
                self.store.save(state).await?;
                Ok(None)
            }
            BuildCommand::Accept => {
                let blockers: Vec<String> = state
                    .stages
                    .iter()
                    .filter(|s| s.status != StageStatus::PolicyChecked)
                    .map(|s| format!("stage {} is {}", s.index, s.status))
                    .collect();
                if blockers.is_empty() {
                    state.record(EventDetail::BuildAccepted);
                    self.transition(state, BuildPhase::Accepted).await?;
                    Ok(Some(BuildOutcome::Accepted))
                } else {
                    state.note_interaction(
                        "engine",
                        format!("cannot accept: {}", blockers.join("; ")),
                    );
                    self.store.save(state).await?;
                    Ok(None)
                }
            }
            BuildCommand::Abort => {
                // Uncommitted output goes; the audit trail stays.
                self.artifacts.clear().await;
                for stage in &mut state.stages {
                    if stage.status != StageStatus::Deployed {
                        stage.status = StageStatus::Pending;
                        stage.artifacts.clear();
                    }
                }
                state.record(EventDetail::BuildAborted);
                self.transition(state, BuildPhase::Aborted).await?;
                Ok(Some(BuildOutcome::Aborted))
            }
            BuildCommand::Regenerate { stages, note } => {
                state.record(EventDetail::ReviewFeedback {
                    targets: stages.clone(),
                    note: note.clone(),
                });
                for index in stages {
                    self.regenerate_targeted(state, index, &note).await?;
                }
                self.store.save(state).await?;
                Ok(None)
            }
        }
    }

    /// Re-enter generation and policy-check for exactly one targeted stage.
    async fn regenerate_targeted(
        &self,
        state: &mut SessionState,
        index: usize,
        note: &str,
    ) -> Result<()> {
        let Some(snapshot) = state.stage(index).cloned() else {
            state.note_interaction("engine", format!("no stage with index {index}"));
            return Ok(());
        };

        let tasks = self.catalog.tasks_for(&snapshot);
        let constraints: Vec<String> = if note.is_empty() {
            Vec::new()
        } else {
            vec![format!("review feedback: {note}")]
        };

        // Supersede the prior output for just this stage.
        let report = self
            .scheduler
            .dispatch_stage(&snapshot, tasks, &self.artifacts, &constraints, true)
            .await?;
        state.add_usage(report.usage);

        if let Some(stage) = state.stage_mut(index) {
            if report.is_success() {
                stage.status = StageStatus::Generated;
                stage.artifacts = report.produced.clone();
            } else {
                stage.status = StageStatus::Failed;
            }
        }
        if report.is_success() {
            state.record(EventDetail::StageGenerated { stage_index: index });
            self.policy_check_one(state, index).await?;
        } else {
            state.note_interaction(
                "engine",
                format!("regeneration of stage {index} failed: {}", report.failure_summary()),
            );
        }
        Ok(())
    }

    fn predecessors_usable(&self, state: &SessionState, stage: &Stage) -> bool {
        stage.predecessors.iter().all(|&p| {
            state
                .stage(p)
                .is_some_and(|s| s.status != StageStatus::Failed)
        })
    }

    fn status_line(&self, state: &SessionState) -> String {
        state
            .stages
            .iter()
            .sorted_by_key(|s| s.index)
            .map(|s| format!("{}:{}={}", s.index, s.name, s.status))
            .join(" ")
    }
}
