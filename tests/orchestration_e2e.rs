//! End-to-end orchestration scenarios driven through the public API with
//! in-memory fakes behind every port.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use stageforge::ports::{
    EnvironmentProbe, GeneratedArtifact, GenerationRequest, GenerationResponse, GeneratorAgent,
    PortFuture, ProvisionMode, ProvisionOutcome, Provisioner, ReviewChannel,
};
use stageforge::session::InMemoryStore;
use stageforge::{
    AgentContract, AgentContractRegistry, ArtifactKind, ArtifactStore, AutoArbiter, BuildOutcome,
    BuildSession, ComponentSpec, DeploySession, EscalationLevel, EventDetail, ForgeConfig,
    ForgeError, JsonFileStore, PolicyPredicate, PolicyResolutionEngine, PolicyRule, PolicySeverity,
    RoleName, SessionKind, SessionStore, Stage, StageKind, StagePlanner, StageStatus,
    StaticPolicySource, Task, TaskCatalog, TaskScheduler, TokenUsage, UnmetPrerequisite,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

struct TemplateAgent {
    body: &'static str,
}

impl GeneratorAgent for TemplateAgent {
    fn generate(&self, request: GenerationRequest) -> PortFuture<'_, GenerationResponse> {
        Box::pin(async move {
            Ok(GenerationResponse {
                artifacts: vec![GeneratedArtifact {
                    key: format!("{}/{}", request.description, request.role),
                    kind: ArtifactKind::InfrastructureTemplate,
                    body: self.body.to_string(),
                }],
                usage: TokenUsage::new(80, 20),
            })
        })
    }
}

struct RecordingProvisioner {
    fail_stages: Vec<usize>,
    applied: Arc<Mutex<Vec<usize>>>,
    destroyed: Arc<Mutex<Vec<usize>>>,
}

impl RecordingProvisioner {
    fn new(fail_stages: &[usize]) -> Self {
        Self {
            fail_stages: fail_stages.to_vec(),
            applied: Arc::new(Mutex::new(Vec::new())),
            destroyed: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl Provisioner for RecordingProvisioner {
    fn invoke<'a>(
        &'a self,
        stage: &'a Stage,
        _artifacts: &'a [stageforge::Artifact],
        mode: ProvisionMode,
    ) -> PortFuture<'a, ProvisionOutcome> {
        Box::pin(async move {
            match mode {
                ProvisionMode::Apply => {
                    if self.fail_stages.contains(&stage.index) {
                        return Ok(ProvisionOutcome::failed("deployment quota exceeded"));
                    }
                    self.applied.lock().await.push(stage.index);
                    let mut outputs = BTreeMap::new();
                    outputs.insert("resource_id".to_string(), format!("id-{}", stage.name));
                    Ok(ProvisionOutcome::succeeded(outputs, "applied"))
                }
                ProvisionMode::Destroy => {
                    self.destroyed.lock().await.push(stage.index);
                    Ok(ProvisionOutcome::succeeded(BTreeMap::new(), "destroyed"))
                }
                ProvisionMode::DryRun => {
                    Ok(ProvisionOutcome::succeeded(BTreeMap::new(), "planned"))
                }
            }
        })
    }
}

struct CleanProbe;

impl EnvironmentProbe for CleanProbe {
    fn preflight(&self) -> PortFuture<'_, Vec<UnmetPrerequisite>> {
        Box::pin(async move { Ok(Vec::new()) })
    }
}

struct ScriptedReview {
    lines: Mutex<Vec<String>>,
    fallback: String,
}

impl ScriptedReview {
    fn new(lines: &[&str], fallback: &str) -> Self {
        Self {
            lines: Mutex::new(lines.iter().rev().map(ToString::to_string).collect()),
            fallback: fallback.to_string(),
        }
    }
}

impl ReviewChannel for ScriptedReview {
    fn next_command(&self) -> PortFuture<'_, String> {
        Box::pin(async move {
            Ok(self
                .lines
                .lock()
                .await
                .pop()
                .unwrap_or_else(|| self.fallback.clone()))
        })
    }
}

fn three_component_design() -> Vec<ComponentSpec> {
    vec![
        ComponentSpec::new("core", StageKind::InfrastructureComponent),
        ComponentSpec::new("db", StageKind::Database).depending_on(["core"]),
        ComponentSpec::new("api", StageKind::Application).depending_on(["core"]),
    ]
}

fn catalog() -> TaskCatalog {
    let task = |role: &str| {
        Task::new(RoleName::new(role), "templates")
            .producing([ArtifactKind::InfrastructureTemplate])
    };
    TaskCatalog::new()
        .with(StageKind::InfrastructureComponent, vec![task("infra")])
        .with(StageKind::Database, vec![task("infra")])
        .with(StageKind::Application, vec![task("infra")])
}

fn registry() -> AgentContractRegistry {
    AgentContractRegistry::builtin([
        AgentContract::new("infra").writing([ArtifactKind::InfrastructureTemplate])
    ])
}

fn build_session(
    store: Arc<dyn SessionStore>,
    artifacts: Arc<ArtifactStore>,
    components: Vec<ComponentSpec>,
    rules: Vec<PolicyRule>,
    agent_body: &'static str,
    review: &[&str],
) -> BuildSession {
    let config = ForgeConfig::default();
    BuildSession::new(
        config.clone(),
        components,
        catalog(),
        TaskScheduler::new(registry(), Arc::new(TemplateAgent { body: agent_body }), 4),
        PolicyResolutionEngine::new(
            Arc::new(StaticPolicySource::new(rules)),
            config.block_on_recommended,
        ),
        Arc::new(AutoArbiter::new(false)),
        Arc::new(ScriptedReview::new(review, "abort")),
        store,
        artifacts,
    )
}

fn deploy_session(
    store: Arc<dyn SessionStore>,
    artifacts: Arc<ArtifactStore>,
    provisioner: Arc<RecordingProvisioner>,
    review: &[&str],
) -> DeploySession {
    DeploySession::new(
        ForgeConfig::default(),
        provisioner,
        Arc::new(CleanProbe),
        Arc::new(ScriptedReview::new(review, "done")),
        store,
        artifacts,
    )
}

#[tokio::test]
async fn plan_then_deploy_respects_dependency_order() -> anyhow::Result<()> {
    init_tracing();
    // Scenario: A with no deps, B and C both depending on A. The plan is a
    // total order with B and C at the same dependency depth, and the
    // deployment walks the indices.
    let stages = StagePlanner::plan(&three_component_design())?;
    assert_eq!(stages[0].name, "core");
    assert_eq!(stages[0].index, 1);
    assert_eq!(stages[1].depth, stages[2].depth);

    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let artifacts = Arc::new(ArtifactStore::new());

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        three_component_design(),
        vec![],
        "auth: managedIdentity",
        &["accept"],
    );
    assert_eq!(build.run().await?, BuildOutcome::Accepted);

    let provisioner = Arc::new(RecordingProvisioner::new(&[]));
    let deploy = deploy_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&provisioner),
        &["done"],
    );
    let outcome = deploy.run().await?;
    assert_eq!(outcome.deployed, vec![1, 2, 3]);
    assert_eq!(*provisioner.applied.lock().await, vec![1, 2, 3]);
    Ok(())
}

#[tokio::test]
async fn remediation_exhaustion_escalates_at_level_one() {
    // The generator can never satisfy a required rule; the remediation
    // ceiling is 2, the stage ends failed, and escalation opens at L1.
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let artifacts = Arc::new(ArtifactStore::new());
    let impossible = PolicyRule {
        id: "requires-identity-bindings".to_string(),
        severity: PolicySeverity::Required,
        applies_to: vec![],
        predicate: PolicyPredicate::RequiresText {
            text: "identityBindings".to_string(),
        },
    };

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        three_component_design(),
        vec![impossible],
        "auth: sharedKey",
        &["abort"],
    );
    assert_eq!(build.run().await.unwrap(), BuildOutcome::Aborted);

    let state = store.load(SessionKind::Build).await.unwrap().unwrap();
    let exhausted: Vec<_> = state
        .events
        .iter()
        .filter(|e| matches!(e.detail, EventDetail::RemediationExhausted { .. }))
        .collect();
    assert!(!exhausted.is_empty());
    // Attempts stayed within the ceiling.
    assert!(state.events.iter().all(|e| !matches!(
        e.detail,
        EventDetail::RemediationAttempted { attempt, .. } if attempt > 2
    )));
    // Escalation opened at the first level.
    assert!(!state.escalations.is_empty());
    assert!(state
        .escalations
        .iter()
        .all(|r| r.level == EscalationLevel::DocumentedFixes));
    // The stage failed before the abort; the audit trail shows it.
    assert!(state
        .events
        .iter()
        .any(|e| matches!(e.detail, EventDetail::EscalationOpened { .. })));
}

#[tokio::test]
async fn deploy_failure_never_reaches_dependents() {
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let artifacts = Arc::new(ArtifactStore::new());

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        vec![
            ComponentSpec::new("core", StageKind::InfrastructureComponent),
            ComponentSpec::new("db", StageKind::Database).depending_on(["core"]),
            ComponentSpec::new("api", StageKind::Application).depending_on(["db"]),
        ],
        vec![],
        "auth: managedIdentity",
        &["accept"],
    );
    assert_eq!(build.run().await.unwrap(), BuildOutcome::Accepted);

    let provisioner = Arc::new(RecordingProvisioner::new(&[2]));
    let deploy = deploy_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&provisioner),
        &["done"],
    );
    let outcome = deploy.run().await.unwrap();
    assert_eq!(outcome.deployed, vec![1]);
    assert_eq!(outcome.failed, vec![2]);
    assert_eq!(*provisioner.applied.lock().await, vec![1]);

    let state = store.load(SessionKind::Deploy).await.unwrap().unwrap();
    assert_eq!(state.escalations.len(), 1);
    assert_eq!(state.escalations[0].level, EscalationLevel::DocumentedFixes);
    assert!(state.events.iter().any(|e| matches!(
        e.detail,
        EventDetail::StageSkipped { stage_index: 3, .. }
    )));
}

#[tokio::test]
async fn rollback_enforces_reverse_order_end_to_end() {
    // Scenario: stages 1..3 deployed; rolling back 2 while 3 is deployed is
    // refused; 3 then 2 succeeds.
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let artifacts = Arc::new(ArtifactStore::new());

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        three_component_design(),
        vec![],
        "auth: managedIdentity",
        &["accept"],
    );
    build.run().await.unwrap();

    let provisioner = Arc::new(RecordingProvisioner::new(&[]));
    let deploy = deploy_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&provisioner),
        &["rollback 2", "rollback 3", "rollback 2", "done"],
    );
    let outcome = deploy.run().await.unwrap();

    assert_eq!(outcome.deployed, vec![1]);
    assert_eq!(outcome.rolled_back, vec![2, 3]);
    // Destroy ran in strictly descending order.
    assert_eq!(*provisioner.destroyed.lock().await, vec![3, 2]);

    let state = store.load(SessionKind::Deploy).await.unwrap().unwrap();
    assert!(state.events.iter().any(|e| matches!(
        e.detail,
        EventDetail::RollbackRefused { requested: 2, blocking: 3 }
    )));
}

#[tokio::test]
async fn crash_between_output_capture_and_status_flip_is_recovered() {
    // Scenario: the process dies after stage 1's artifacts are written but
    // before its status flips to deployed. On resume the stage is
    // re-attempted and the idempotent store absorbs the replayed writes.
    let dir = tempfile::TempDir::new().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(JsonFileStore::new(dir.path()));
    let artifacts = Arc::new(ArtifactStore::new());

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        vec![ComponentSpec::new("core", StageKind::InfrastructureComponent)],
        vec![],
        "auth: managedIdentity",
        &["accept"],
    );
    build.run().await.unwrap();

    // Simulate the torn step: outputs landed in the artifact store, but the
    // persisted record still shows the stage undeployed.
    artifacts
        .put(
            "outputs/1/resource_id",
            ArtifactKind::ResourceOutputs,
            1,
            "id-core",
        )
        .await
        .unwrap();
    let outputs_before = artifacts.by_kind(ArtifactKind::ResourceOutputs).await.len();

    let provisioner = Arc::new(RecordingProvisioner::new(&[]));
    let deploy = deploy_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        Arc::clone(&provisioner),
        &["done"],
    );
    let outcome = deploy.run().await.unwrap();

    // The stage was re-attempted, not skipped.
    assert_eq!(outcome.deployed, vec![1]);
    assert_eq!(*provisioner.applied.lock().await, vec![1]);
    // No duplicate artifact appeared.
    assert_eq!(
        artifacts.by_kind(ArtifactKind::ResourceOutputs).await.len(),
        outputs_before
    );

    let state = store.load(SessionKind::Deploy).await.unwrap().unwrap();
    assert_eq!(state.stage(1).unwrap().status, StageStatus::Deployed);
}

#[tokio::test]
async fn reset_is_explicit_and_irreversible() {
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let artifacts = Arc::new(ArtifactStore::new());

    let build = build_session(
        Arc::clone(&store),
        Arc::clone(&artifacts),
        three_component_design(),
        vec![],
        "auth: managedIdentity",
        &["accept"],
    );
    build.run().await.unwrap();
    assert!(store.load(SessionKind::Build).await.unwrap().is_some());
    assert!(!artifacts.is_empty().await);

    build.reset().await.unwrap();
    assert!(store.load(SessionKind::Build).await.unwrap().is_none());
    assert!(artifacts.is_empty().await);
}

#[tokio::test]
async fn missing_build_is_a_remediable_state_error() {
    // A missing build session is a state error with a stable code and a
    // documented fix.
    let store: Arc<dyn SessionStore> = Arc::new(InMemoryStore::new());
    let provisioner = Arc::new(RecordingProvisioner::new(&[]));
    let deploy = deploy_session(
        Arc::clone(&store),
        Arc::new(ArtifactStore::new()),
        provisioner,
        &[],
    );
    let err = deploy.run().await.unwrap_err();
    assert!(matches!(err, ForgeError::StateError(_)));
    assert!(stageforge::error::get_error_info(err.code()).is_some());
}
