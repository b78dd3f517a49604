use crate::error::{ForgeError, Result};
use crate::ports::{PolicySource, ResolutionDecision, ViolationArbiter};
use crate::types::{
    Artifact, PolicyRule, PolicySeverity, PolicyViolation, RoleName, ViolationResolution,
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of one resolution pass over a stage's violations.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Violations with a terminal resolution recorded.
    pub resolved: Vec<PolicyViolation>,
    /// Still-open violations routed to remediation.
    pub regenerate: Vec<PolicyViolation>,
}

impl ResolutionReport {
    #[must_use]
    pub fn all(&self) -> Vec<PolicyViolation> {
        self.resolved
            .iter()
            .chain(self.regenerate.iter())
            .cloned()
            .collect()
    }
}

/// Evaluates generated artifacts against governance rules and drives the
/// accept/override/regenerate workflow per violation.
///
/// Rules come from a `PolicySource`, loaded once and cached; `invalidate`
/// forces a reload on next use.
pub struct PolicyResolutionEngine {
    source: Arc<dyn PolicySource>,
    cache: RwLock<Option<Vec<PolicyRule>>>,
    block_on_recommended: bool,
}

impl PolicyResolutionEngine {
    #[must_use]
    pub fn new(source: Arc<dyn PolicySource>, block_on_recommended: bool) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
            block_on_recommended,
        }
    }

    /// # Errors
    ///
    /// Propagates the source's load failure.
    pub async fn rules(&self) -> Result<Vec<PolicyRule>> {
        if let Some(rules) = self.cache.read().await.as_ref() {
            return Ok(rules.clone());
        }
        let loaded = self.source.load_rules().await?;
        debug!("Loaded {} policy rules", loaded.len());
        *self.cache.write().await = Some(loaded.clone());
        Ok(loaded)
    }

    /// Drop the cached rules; the next check reloads from the source.
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
    }

    /// Evaluate every applicable rule against every produced artifact and
    /// return the open violations.
    ///
    /// # Errors
    ///
    /// Propagates rule-source failures only; violations are data, not
    /// errors.
    pub async fn check_stage(
        &self,
        stage_index: usize,
        produced: &[(RoleName, Artifact)],
    ) -> Result<Vec<PolicyViolation>> {
        let rules = self.rules().await?;
        let mut violations = Vec::new();

        for rule in &rules {
            for (role, artifact) in produced {
                if !rule.applies_to_role(role) {
                    continue;
                }
                if !rule.predicate.holds_for(&artifact.body) {
                    warn!(
                        "Rule '{}' ({}) violated by '{}' on stage {}",
                        rule.id, rule.severity, artifact.key, stage_index
                    );
                    let mut violation = PolicyViolation::open(rule, stage_index);
                    violation.detail =
                        format!("{} (artifact '{}')", violation.detail, artifact.key);
                    violations.push(violation);
                    // One violation per rule per stage is enough to act on.
                    break;
                }
            }
        }

        Ok(violations)
    }

    /// Ask the arbiter for a decision on each open violation.
    ///
    /// A `required` violation refuses plain acceptance: without an override
    /// justification it stays open and is routed to regeneration.
    ///
    /// # Errors
    ///
    /// `ConfigError` when an override carries no justification.
    pub async fn resolve(
        &self,
        violations: Vec<PolicyViolation>,
        arbiter: &dyn ViolationArbiter,
    ) -> Result<ResolutionReport> {
        let mut report = ResolutionReport::default();

        for mut violation in violations {
            if violation.is_resolved() {
                report.resolved.push(violation);
                continue;
            }

            match arbiter.decide(&violation).await? {
                ResolutionDecision::Accept => {
                    if violation.severity == PolicySeverity::Required {
                        warn!(
                            "Refusing to accept required rule '{}' without a rewrite; \
                             routing to regeneration",
                            violation.rule_id
                        );
                        report.regenerate.push(violation);
                    } else {
                        violation.resolution = Some(ViolationResolution::AcceptedCompliant);
                        report.resolved.push(violation);
                    }
                }
                ResolutionDecision::Override { justification } => {
                    if justification.trim().is_empty() {
                        return Err(ForgeError::ConfigError(format!(
                            "override of rule '{}' requires a justification",
                            violation.rule_id
                        )));
                    }
                    info!(
                        "Rule '{}' overridden on stage {}: {}",
                        violation.rule_id, violation.stage_index, justification
                    );
                    violation.resolution = Some(ViolationResolution::Overridden);
                    violation.justification = Some(justification);
                    report.resolved.push(violation);
                }
                ResolutionDecision::Regenerate => report.regenerate.push(violation),
            }
        }

        Ok(report)
    }

    /// Whether the stage may advance to policy-checked: no unresolved
    /// blocking violation remains.
    #[must_use]
    pub fn clears_stage(&self, violations: &[PolicyViolation]) -> bool {
        !violations
            .iter()
            .any(|v| v.blocks_stage(self.block_on_recommended))
    }
}

/// Configuration-driven arbiter: regenerate `required` violations, accept
/// the rest (or regenerate `recommended` too when it blocks).
pub struct AutoArbiter {
    block_on_recommended: bool,
}

impl AutoArbiter {
    #[must_use]
    pub const fn new(block_on_recommended: bool) -> Self {
        Self {
            block_on_recommended,
        }
    }
}

impl ViolationArbiter for AutoArbiter {
    fn decide<'a>(
        &'a self,
        violation: &'a PolicyViolation,
    ) -> crate::ports::PortFuture<'a, ResolutionDecision> {
        Box::pin(async move {
            let decision = if violation.blocks_stage(self.block_on_recommended) {
                ResolutionDecision::Regenerate
            } else {
                ResolutionDecision::Accept
            };
            Ok(decision)
        })
    }
}

/// Fixed in-memory rule source; the usual implementation reads rule
/// documents from the project knowledge base.
pub struct StaticPolicySource {
    rules: Vec<PolicyRule>,
}

impl StaticPolicySource {
    #[must_use]
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }
}

impl PolicySource for StaticPolicySource {
    fn load_rules(&self) -> crate::ports::PortFuture<'_, Vec<PolicyRule>> {
        Box::pin(async move { Ok(self.rules.clone()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{AutoArbiter, PolicyResolutionEngine, ResolutionDecision, StaticPolicySource};
    use crate::artifact_store::fingerprint;
    use crate::ports::{PortFuture, ViolationArbiter};
    use crate::types::{
        Artifact, ArtifactKind, PolicyPredicate, PolicyRule, PolicySeverity, PolicyViolation,
        RoleName, ViolationResolution,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn rule(id: &str, severity: PolicySeverity) -> PolicyRule {
        PolicyRule {
            id: id.to_string(),
            severity,
            applies_to: vec![RoleName::new("infra")],
            predicate: PolicyPredicate::ForbidsText {
                text: "sharedKey".to_string(),
            },
        }
    }

    fn offending_artifact() -> (RoleName, Artifact) {
        let body = "auth: sharedKey".to_string();
        (
            RoleName::new("infra"),
            Artifact {
                key: "stage/template".to_string(),
                kind: ArtifactKind::InfrastructureTemplate,
                stage_index: 1,
                fingerprint: fingerprint(&body),
                body,
            },
        )
    }

    struct CountingSource {
        loads: Arc<AtomicUsize>,
        rules: Vec<PolicyRule>,
    }

    impl crate::ports::PolicySource for CountingSource {
        fn load_rules(&self) -> PortFuture<'_, Vec<PolicyRule>> {
            Box::pin(async move {
                self.loads.fetch_add(1, Ordering::SeqCst);
                Ok(self.rules.clone())
            })
        }
    }

    #[tokio::test]
    async fn rules_load_once_until_invalidated() {
        let loads = Arc::new(AtomicUsize::new(0));
        let engine = PolicyResolutionEngine::new(
            Arc::new(CountingSource {
                loads: Arc::clone(&loads),
                rules: vec![rule("r1", PolicySeverity::Required)],
            }),
            false,
        );

        engine.rules().await.unwrap();
        engine.rules().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        engine.invalidate().await;
        engine.rules().await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn check_raises_violations_for_applicable_roles_only() {
        let engine = PolicyResolutionEngine::new(
            Arc::new(StaticPolicySource::new(vec![rule(
                "no-shared-keys",
                PolicySeverity::Required,
            )])),
            false,
        );

        let violations = engine
            .check_stage(1, &[offending_artifact()])
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule_id, "no-shared-keys");
        assert!(!engine.clears_stage(&violations));

        // A different role is untouched by the rule.
        let (_, artifact) = offending_artifact();
        let violations = engine
            .check_stage(1, &[(RoleName::new("app"), artifact)])
            .await
            .unwrap();
        assert!(violations.is_empty());
        assert!(engine.clears_stage(&violations));
    }

    #[tokio::test]
    async fn auto_arbiter_regenerates_required_and_accepts_recommended() {
        let engine = PolicyResolutionEngine::new(
            Arc::new(StaticPolicySource::new(vec![
                rule("must-fix", PolicySeverity::Required),
                rule("should-fix", PolicySeverity::Recommended),
            ])),
            false,
        );

        let violations = vec![
            PolicyViolation::open(&rule("must-fix", PolicySeverity::Required), 1),
            PolicyViolation::open(&rule("should-fix", PolicySeverity::Recommended), 1),
        ];
        let report = engine
            .resolve(violations, &AutoArbiter::new(false))
            .await
            .unwrap();

        assert_eq!(report.regenerate.len(), 1);
        assert_eq!(report.regenerate[0].rule_id, "must-fix");
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(
            report.resolved[0].resolution,
            Some(ViolationResolution::AcceptedCompliant)
        );
    }

    struct AlwaysAccept;

    impl ViolationArbiter for AlwaysAccept {
        fn decide<'a>(
            &'a self,
            _violation: &'a PolicyViolation,
        ) -> PortFuture<'a, ResolutionDecision> {
            Box::pin(async move { Ok(ResolutionDecision::Accept) })
        }
    }

    struct OverrideWith(String);

    impl ViolationArbiter for OverrideWith {
        fn decide<'a>(
            &'a self,
            _violation: &'a PolicyViolation,
        ) -> PortFuture<'a, ResolutionDecision> {
            let justification = self.0.clone();
            Box::pin(async move { Ok(ResolutionDecision::Override { justification }) })
        }
    }

    #[tokio::test]
    async fn required_violation_cannot_be_plainly_accepted() {
        let engine = PolicyResolutionEngine::new(Arc::new(StaticPolicySource::new(vec![])), false);
        let violation = PolicyViolation::open(&rule("must-fix", PolicySeverity::Required), 2);

        let report = engine.resolve(vec![violation], &AlwaysAccept).await.unwrap();
        assert!(report.resolved.is_empty());
        assert_eq!(report.regenerate.len(), 1);
        assert!(report.regenerate[0].resolution.is_none());
    }

    #[tokio::test]
    async fn override_requires_justification() {
        let engine = PolicyResolutionEngine::new(Arc::new(StaticPolicySource::new(vec![])), false);
        let violation = PolicyViolation::open(&rule("must-fix", PolicySeverity::Required), 2);

        let err = engine
            .resolve(vec![violation.clone()], &OverrideWith(String::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("justification"));

        let report = engine
            .resolve(
                vec![violation],
                &OverrideWith("accepted risk in dev environment".to_string()),
            )
            .await
            .unwrap();
        assert_eq!(
            report.resolved[0].resolution,
            Some(ViolationResolution::Overridden)
        );
        assert!(report.resolved[0].justification.is_some());
    }

    #[tokio::test]
    async fn recommended_blocks_when_configured() {
        let engine = PolicyResolutionEngine::new(Arc::new(StaticPolicySource::new(vec![])), true);
        let violation = PolicyViolation::open(&rule("should-fix", PolicySeverity::Recommended), 1);
        assert!(!engine.clears_stage(&[violation]));
    }
}
