use crate::artifact_store::ArtifactStore;
use crate::error::Result;
use crate::policy::PolicyResolutionEngine;
use crate::scheduler::{StageDispatchReport, TaskScheduler};
use crate::types::{
    Artifact, PolicyViolation, RoleName, Stage, StageStatus, Task, ViolationResolution,
};
use itertools::Itertools;
use tracing::{info, warn};

/// Pair each stage artifact with the role whose task produced its kind,
/// for policy evaluation.
pub async fn stage_artifacts_by_role(
    stage: &Stage,
    tasks: &[Task],
    store: &ArtifactStore,
) -> Vec<(RoleName, Artifact)> {
    let mut produced = Vec::new();
    for artifact in store.by_stage(stage.index).await {
        let producer = tasks
            .iter()
            .find(|t| t.produces.contains(&artifact.kind))
            .map(|t| t.role.clone());
        if let Some(role) = producer {
            produced.push((role, artifact));
        }
    }
    produced
}

/// What one remediation run did to a stage.
#[derive(Debug, Clone)]
pub struct RemediationOutcome {
    pub attempts: u32,
    pub cleared: bool,
    /// Findings the rewrite satisfied, now terminally `regenerated`.
    pub resolved: Vec<PolicyViolation>,
    /// Findings still open after the final attempt. Only these are
    /// reported upward.
    pub remaining: Vec<PolicyViolation>,
    pub last_report: Option<StageDispatchReport>,
}

/// Bounded-retry regeneration of a failed stage.
///
/// Each attempt replays the stage's dispatch with the open finding text as
/// a structured fix instruction, then re-validates through the same policy
/// path. Exhaustion marks the stage failed; escalation is the caller's
/// next step.
pub struct RemediationController {
    max_attempts: u32,
}

impl RemediationController {
    #[must_use]
    pub const fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// # Errors
    ///
    /// Infrastructure errors only; findings and task failures are data.
    pub async fn remediate(
        &self,
        stage: &mut Stage,
        tasks: &[Task],
        scheduler: &TaskScheduler,
        store: &ArtifactStore,
        engine: &PolicyResolutionEngine,
        open_findings: Vec<PolicyViolation>,
        structural_feedback: &[String],
    ) -> Result<RemediationOutcome> {
        // Already-resolved findings pass through untouched; only open ones
        // drive the retry loop.
        let (resolved, open): (Vec<_>, Vec<_>) =
            open_findings.into_iter().partition(PolicyViolation::is_resolved);
        let mut outcome = RemediationOutcome {
            attempts: 0,
            cleared: false,
            resolved,
            remaining: open,
            last_report: None,
        };

        while outcome.attempts < self.max_attempts {
            outcome.attempts += 1;
            let constraints = Self::fix_instructions(&outcome.remaining, structural_feedback);
            info!(
                "Remediation attempt {}/{} for stage {} ({} open findings)",
                outcome.attempts,
                self.max_attempts,
                stage.index,
                outcome.remaining.len()
            );

            let report = scheduler
                .dispatch_stage(stage, tasks.to_vec(), store, &constraints, true)
                .await?;
            let dispatch_ok = report.is_success();
            if !dispatch_ok {
                warn!(
                    "Remediation dispatch for stage {} failed: {}",
                    stage.index,
                    report.failure_summary()
                );
            }
            outcome.last_report = Some(report);

            let produced = stage_artifacts_by_role(stage, tasks, store).await;
            let current = engine.check_stage(stage.index, &produced).await?;
            let still_open: Vec<String> = current.iter().map(|v| v.rule_id.clone()).collect();

            // Findings the rewrite satisfied resolve as regenerated;
            // they are not re-surfaced on later attempts.
            let (fixed, unfixed): (Vec<_>, Vec<_>) = outcome
                .remaining
                .drain(..)
                .partition(|v| !still_open.contains(&v.rule_id));
            for mut violation in fixed {
                violation.resolution = Some(ViolationResolution::Regenerated);
                outcome.resolved.push(violation);
            }

            // Carry prior finding records forward; add anything new the
            // rewrite introduced.
            let mut remaining = unfixed;
            for violation in current {
                if !remaining.iter().any(|v| v.rule_id == violation.rule_id) {
                    remaining.push(violation);
                }
            }
            outcome.remaining = remaining;

            if dispatch_ok && engine.clears_stage(&outcome.remaining) {
                outcome.cleared = true;
                stage.status = StageStatus::Generated;
                return Ok(outcome);
            }
        }

        warn!(
            "Stage {} still failing after {} remediation attempts",
            stage.index, outcome.attempts
        );
        stage.status = StageStatus::Failed;
        Ok(outcome)
    }

    fn fix_instructions(
        findings: &[PolicyViolation],
        structural_feedback: &[String],
    ) -> Vec<String> {
        findings
            .iter()
            .map(|v| format!("fix required: {} (rule {})", v.detail, v.rule_id))
            .chain(
                structural_feedback
                    .iter()
                    .map(|text| format!("fix required: {text}")),
            )
            .unique()
            .collect()
    }
}
