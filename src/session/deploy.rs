use crate::artifact_store::ArtifactStore;
use crate::config::ForgeConfig;
use crate::error::{ForgeError, Result};
use crate::escalation::EscalationTracker;
use crate::ports::{EnvironmentProbe, ProvisionMode, Provisioner, ReviewChannel};
use crate::rollback::RollbackController;
use crate::session::commands::DeployCommand;
use crate::session::state::{SessionKind, SessionState, SessionStore};
use crate::types::{ArtifactKind, EventDetail, FailureDiagnostics, PolicySeverity, StageStatus};
use chrono::Utc;
use itertools::Itertools;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    PlanOverview,
    Preflight,
    StageDeployLoop,
    Report,
    InteractiveLoop,
    Completed,
}

impl DeployPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PlanOverview => "plan-overview",
            Self::Preflight => "preflight",
            Self::StageDeployLoop => "stage-deploy-loop",
            Self::Report => "report",
            Self::InteractiveLoop => "interactive-loop",
            Self::Completed => "completed",
        }
    }
}

impl fmt::Display for DeployPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for DeployPhase {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "plan-overview" => Ok(Self::PlanOverview),
            "preflight" => Ok(Self::Preflight),
            "stage-deploy-loop" => Ok(Self::StageDeployLoop),
            "report" => Ok(Self::Report),
            "interactive-loop" => Ok(Self::InteractiveLoop),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Unknown deploy phase: {s}")),
        }
    }
}

/// Final shape of a deploy session when the user is done with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub deployed: Vec<usize>,
    pub failed: Vec<usize>,
    pub rolled_back: Vec<usize>,
}

/// Resumable deploy state machine: preflight, strict index-order stage
/// deployment with immediate output capture, then an interactive loop for
/// retry, targeted redeploy, and rollback.
pub struct DeploySession {
    config: ForgeConfig,
    provisioner: Arc<dyn Provisioner>,
    probe: Arc<dyn EnvironmentProbe>,
    review: Arc<dyn ReviewChannel>,
    store: Arc<dyn SessionStore>,
    artifacts: Arc<ArtifactStore>,
    rollback: RollbackController,
    cancel: Arc<AtomicBool>,
}

impl DeploySession {
    #[must_use]
    pub fn new(
        config: ForgeConfig,
        provisioner: Arc<dyn Provisioner>,
        probe: Arc<dyn EnvironmentProbe>,
        review: Arc<dyn ReviewChannel>,
        store: Arc<dyn SessionStore>,
        artifacts: Arc<ArtifactStore>,
    ) -> Self {
        let rollback = RollbackController::new(Arc::clone(&provisioner));
        Self {
            config,
            provisioner,
            probe,
            review,
            store,
            artifacts,
            rollback,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for requesting cancellation. Takes effect at the next stage
    /// boundary; the in-flight stage runs to completion or failure.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Drive the machine until the user finishes the interactive loop.
    ///
    /// # Errors
    ///
    /// `PreflightUnmet` fails fast before any stage runs; stage deploy
    /// failures are absorbed, escalated, and offered for retry instead.
    pub async fn run(&self) -> Result<DeployOutcome> {
        let mut state = self.load_state().await?;

        loop {
            let phase = DeployPhase::try_from(state.phase.as_str())
                .map_err(ForgeError::StateError)?;
            match phase {
                DeployPhase::PlanOverview => self.plan_overview(&mut state).await?,
                DeployPhase::Preflight => self.preflight(&mut state).await?,
                DeployPhase::StageDeployLoop => self.deploy_stages(&mut state).await?,
                DeployPhase::Report => self.report(&mut state).await?,
                DeployPhase::InteractiveLoop => {
                    if let Some(outcome) = self.interactive(&mut state).await? {
                        return Ok(outcome);
                    }
                }
                DeployPhase::Completed => return Ok(Self::summarize(&state)),
            }
        }
    }

    /// Explicit, irreversible reset of the deploy record.
    ///
    /// # Errors
    ///
    /// Storage failures.
    pub async fn reset(&self) -> Result<()> {
        self.store.reset(SessionKind::Deploy).await
    }

    async fn load_state(&self) -> Result<SessionState> {
        if let Some(mut state) = self.store.load(SessionKind::Deploy).await? {
            info!("Resuming deploy session at phase '{}'", state.phase);
            state.record(EventDetail::SessionResumed {
                kind: SessionKind::Deploy.as_str().to_string(),
                phase: state.phase.clone(),
            });
            self.store.save(&state).await?;
            return Ok(state);
        }

        // First entry consumes the accepted build's frozen stage list.
        let build = self.store.load(SessionKind::Build).await?.ok_or_else(|| {
            ForgeError::StateError(
                "no build session found; run and accept a build first".to_string(),
            )
        })?;
        if build.phase != crate::session::BuildPhase::Accepted.as_str() {
            return Err(ForgeError::StateError(format!(
                "build session is '{}', not accepted; finish the build first",
                build.phase
            )));
        }
        if let Some(open) = build
            .violations
            .iter()
            .find(|v| !v.is_resolved() && v.severity == PolicySeverity::Required)
        {
            return Err(ForgeError::PolicyViolationRequired {
                rule: open.rule_id.clone(),
                stage: open.stage_index,
            });
        }

        let mut state = SessionState::new(SessionKind::Deploy, DeployPhase::PlanOverview.as_str());
        state.stages = build.stages;
        state.violations = build.violations;
        state.record(EventDetail::SessionStarted {
            kind: SessionKind::Deploy.as_str().to_string(),
        });
        self.store.save(&state).await?;
        Ok(state)
    }

    async fn transition(&self, state: &mut SessionState, to: DeployPhase) -> Result<()> {
        state.phase = to.as_str().to_string();
        self.store.save(state).await
    }

    async fn plan_overview(&self, state: &mut SessionState) -> Result<()> {
        let overview = state
            .stages
            .iter()
            .sorted_by_key(|s| s.index)
            .map(|s| {
                let preds = s.predecessors.iter().map(ToString::to_string).join(",");
                if preds.is_empty() {
                    format!("{}. {} ({})", s.index, s.name, s.kind)
                } else {
                    format!("{}. {} ({}) after [{preds}]", s.index, s.name, s.kind)
                }
            })
            .join("\n");
        state.note_interaction("engine", format!("deployment plan:\n{overview}"));
        state.record(EventDetail::PlanComputed {
            stage_count: state.stages.len(),
        });
        self.transition(state, DeployPhase::Preflight).await
    }

    /// Validate environment prerequisites, failing fast with every unmet
    /// item and its fix. The phase stays `preflight` so a rerun after
    /// fixing retries from here.
    async fn preflight(&self, state: &mut SessionState) -> Result<()> {
        let findings = self.probe.preflight().await?;
        if findings.is_empty() {
            state.record(EventDetail::PreflightPassed);
            return self.transition(state, DeployPhase::StageDeployLoop).await;
        }

        let items: Vec<String> = findings.iter().map(ToString::to_string).collect();
        warn!("Preflight unmet: {}", items.join("; "));
        state.record_with_diagnostics(
            EventDetail::PreflightFailed {
                items: items.clone(),
            },
            FailureDiagnostics {
                category: "preflight".to_string(),
                retryable: true,
                next_action: "apply the listed fixes and rerun the deploy session".to_string(),
                detail: None,
            },
        );
        self.store.save(state).await?;
        Err(ForgeError::PreflightUnmet { items: findings })
    }

    async fn deploy_stages(&self, state: &mut SessionState) -> Result<()> {
        let indices: Vec<usize> = state.stages.iter().map(|s| s.index).sorted().collect();

        for index in indices {
            // Cancellation takes effect here, at the stage boundary.
            if self.cancel.load(Ordering::SeqCst) {
                info!("Cancel requested; stopping before stage {}", index);
                state.record(EventDetail::CancelRequested);
                break;
            }

            let status = match state.stage(index) {
                Some(stage) => stage.status,
                None => continue,
            };
            if status == StageStatus::Deployed {
                continue;
            }
            if status == StageStatus::Failed || status == StageStatus::RolledBack {
                continue;
            }

            if !self.predecessors_deployed(state, index) {
                state.record(EventDetail::StageSkipped {
                    stage_index: index,
                    reason: "a predecessor stage is not deployed".to_string(),
                });
                self.store.save(state).await?;
                continue;
            }

            self.deploy_one(state, index).await?;
            self.store.save(state).await?;
        }

        self.transition(state, DeployPhase::Report).await
    }

    /// Deploy a single stage, capturing its outputs immediately on
    /// success. Failures are absorbed: the stage is marked failed and an
    /// escalation record is opened before any retry/skip/rollback offer.
    async fn deploy_one(&self, state: &mut SessionState, index: usize) -> Result<bool> {
        let Some(snapshot) = state.stage(index).cloned() else {
            return Ok(false);
        };
        let artifacts = self.artifacts.by_stage(index).await;
        info!("Deploying stage {} '{}'", index, snapshot.name);

        let failure_detail = match self
            .provisioner
            .invoke(&snapshot, &artifacts, ProvisionMode::Apply)
            .await
        {
            Ok(outcome) if outcome.success => {
                // Output capture happens before the status flip, so a crash
                // in between re-attempts the stage and the idempotent store
                // absorbs the replayed writes.
                let keys: Vec<String> = outcome.outputs.keys().cloned().collect();
                for (key, value) in &outcome.outputs {
                    self.artifacts
                        .replace(
                            format!("outputs/{index}/{key}"),
                            ArtifactKind::ResourceOutputs,
                            index,
                            value.clone(),
                        )
                        .await;
                }
                if let Some(stage) = state.stage_mut(index) {
                    stage.outputs = outcome.outputs.into_iter().collect();
                }
                state.record(EventDetail::OutputCaptured {
                    stage_index: index,
                    keys,
                });
                if let Some(stage) = state.stage_mut(index) {
                    stage.status = StageStatus::Deployed;
                }
                state.record(EventDetail::StageDeployed { stage_index: index });
                return Ok(true);
            }
            Ok(outcome) => outcome.raw_log,
            Err(err) => err.to_string(),
        };

        warn!("Stage {} deploy failed: {}", index, failure_detail);
        if let Some(stage) = state.stage_mut(index) {
            stage.status = StageStatus::Failed;
        }
        state.record_with_diagnostics(
            EventDetail::StageDeployFailed { stage_index: index },
            FailureDiagnostics {
                category: "provisioning".to_string(),
                retryable: true,
                next_action: format!("retry {index}, redeploy {index}, or rollback-all"),
                detail: Some(failure_detail.clone()),
            },
        );

        let mut tracker = EscalationTracker::from_records(
            self.config.escalation_timeout_secs,
            state.escalations.clone(),
        );
        let record = tracker.open(
            format!("stage {index} deploy failed: {failure_detail}"),
            Some(index),
            Utc::now(),
        );
        state.record(EventDetail::EscalationOpened {
            issue: record.issue_id.to_string(),
            level: record.level,
        });
        state.escalations = tracker.records();
        Ok(false)
    }

    async fn report(&self, state: &mut SessionState) -> Result<()> {
        let summary = Self::summarize(state);
        state.note_interaction(
            "engine",
            format!(
                "deployed: [{}] failed: [{}] rolled back: [{}]",
                summary.deployed.iter().join(", "),
                summary.failed.iter().join(", "),
                summary.rolled_back.iter().join(", "),
            ),
        );
        self.transition(state, DeployPhase::InteractiveLoop).await
    }

    /// One command per call; `Some(outcome)` ends the session.
    async fn interactive(&self, state: &mut SessionState) -> Result<Option<DeployOutcome>> {
        self.advance_overdue_escalations(state);

        let line = self.review.next_command().await?;
        state.note_interaction("user", line.clone());

        let command = match DeployCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                state.note_interaction("engine", err.to_string());
                self.store.save(state).await?;
                return Ok(None);
            }
        };

        match command {
            DeployCommand::Status => {
                let status = state
                    .stages
                    .iter()
                    .sorted_by_key(|s| s.index)
                    .map(|s| format!("{}:{}={}", s.index, s.name, s.status))
                    .join(" ");
                state.note_interaction("engine", status);
            }
            DeployCommand::Retry { stage } => {
                self.retry_stage(state, stage).await?;
            }
            DeployCommand::Redeploy { stage } => {
                match self.rollback.rollback_stage(state, &self.artifacts, stage).await {
                    Ok(()) => {
                        if let Some(s) = state.stage_mut(stage) {
                            // Eligible to apply again.
                            s.status = StageStatus::PolicyChecked;
                        }
                        self.deploy_one(state, stage).await?;
                    }
                    Err(err) => {
                        state.note_interaction("engine", err.to_string());
                    }
                }
            }
            DeployCommand::Rollback { stage } => {
                if let Err(err) = self
                    .rollback
                    .rollback_stage(state, &self.artifacts, stage)
                    .await
                {
                    state.note_interaction("engine", err.to_string());
                }
            }
            DeployCommand::RollbackAll => {
                if let Err(err) = self.rollback.rollback_all(state, &self.artifacts).await {
                    state.note_interaction("engine", err.to_string());
                }
            }
            DeployCommand::Cancel => {
                self.cancel.store(true, Ordering::SeqCst);
                state.record(EventDetail::CancelRequested);
            }
            DeployCommand::Done => {
                let outcome = Self::summarize(state);
                self.transition(state, DeployPhase::Completed).await?;
                return Ok(Some(outcome));
            }
        }

        self.store.save(state).await?;
        Ok(None)
    }

    async fn retry_stage(&self, state: &mut SessionState, index: usize) -> Result<()> {
        let eligible = state
            .stage(index)
            .is_some_and(|s| s.status == StageStatus::Failed);
        if !eligible {
            state.note_interaction(
                "engine",
                format!("stage {index} is not in a failed state; nothing to retry"),
            );
            return Ok(());
        }
        if !self.predecessors_deployed(state, index) {
            state.note_interaction(
                "engine",
                format!("stage {index} cannot retry until its predecessors are deployed"),
            );
            return Ok(());
        }

        if let Some(stage) = state.stage_mut(index) {
            stage.status = StageStatus::PolicyChecked;
        }
        if self.deploy_one(state, index).await? {
            // A successful retry resolves the stage's open escalations.
            let mut tracker = EscalationTracker::from_records(
                self.config.escalation_timeout_secs,
                state.escalations.clone(),
            );
            let issues: Vec<_> = tracker
                .records()
                .into_iter()
                .filter(|r| r.stage_index == Some(index) && !r.resolved)
                .map(|r| r.issue_id)
                .collect();
            for issue in issues {
                tracker.resolve(issue, Utc::now());
                state.record(EventDetail::EscalationResolved {
                    issue: issue.to_string(),
                });
            }
            state.escalations = tracker.records();
        }
        Ok(())
    }

    fn advance_overdue_escalations(&self, state: &mut SessionState) {
        let mut tracker = EscalationTracker::from_records(
            self.config.escalation_timeout_secs,
            state.escalations.clone(),
        );
        let advanced = tracker.auto_escalate_due(Utc::now());
        if advanced.is_empty() {
            return;
        }
        for (issue, level) in advanced {
            state.record(EventDetail::EscalationAdvanced {
                issue: issue.to_string(),
                level,
            });
        }
        state.escalations = tracker.records();
    }

    fn predecessors_deployed(&self, state: &SessionState, index: usize) -> bool {
        state
            .stage(index)
            .is_some_and(|stage| stage.ready_to_deploy(&state.stages))
    }

    fn summarize(state: &SessionState) -> DeployOutcome {
        let mut outcome = DeployOutcome {
            deployed: Vec::new(),
            failed: Vec::new(),
            rolled_back: Vec::new(),
        };
        for stage in state.stages.iter().sorted_by_key(|s| s.index) {
            match stage.status {
                StageStatus::Deployed => outcome.deployed.push(stage.index),
                StageStatus::Failed => outcome.failed.push(stage.index),
                StageStatus::RolledBack => outcome.rolled_back.push(stage.index),
                _ => {}
            }
        }
        outcome
    }
}
