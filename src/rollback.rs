use crate::artifact_store::ArtifactStore;
use crate::error::{ForgeError, Result};
use crate::ports::{ProvisionMode, Provisioner};
use crate::session::SessionState;
use crate::types::{EventDetail, StageStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Enforces strict reverse-order rollback over deployed stages.
pub struct RollbackController {
    provisioner: Arc<dyn Provisioner>,
}

impl RollbackController {
    #[must_use]
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Roll back one stage. Refused outright while any higher-indexed
    /// stage is still deployed.
    ///
    /// # Errors
    ///
    /// `RollbackOrderViolation` when out of order; `StateError` when the
    /// stage is unknown or not deployed; `DeployFailure` when the destroy
    /// invocation fails.
    pub async fn rollback_stage(
        &self,
        state: &mut SessionState,
        store: &ArtifactStore,
        index: usize,
    ) -> Result<()> {
        if let Some(blocking) = state
            .stages
            .iter()
            .filter(|s| s.index > index && s.status == StageStatus::Deployed)
            .map(|s| s.index)
            .max()
        {
            warn!(
                "Refusing rollback of stage {}: stage {} is still deployed",
                index, blocking
            );
            state.record(EventDetail::RollbackRefused {
                requested: index,
                blocking,
            });
            return Err(ForgeError::RollbackOrderViolation {
                requested: index,
                blocking,
            });
        }

        let Some(stage) = state.stage(index) else {
            return Err(ForgeError::StateError(format!("no stage with index {index}")));
        };
        if stage.status != StageStatus::Deployed {
            return Err(ForgeError::StateError(format!(
                "stage {index} is {} and cannot be rolled back",
                stage.status
            )));
        }

        let snapshot = stage.clone();
        let artifacts = store.by_stage(index).await;
        let outcome = self
            .provisioner
            .invoke(&snapshot, &artifacts, ProvisionMode::Destroy)
            .await?;

        if !outcome.success {
            return Err(ForgeError::DeployFailure {
                stage: index,
                detail: format!("rollback (destroy) failed: {}", outcome.raw_log),
            });
        }

        if let Some(stage) = state.stage_mut(index) {
            stage.status = StageStatus::RolledBack;
        }
        state.record(EventDetail::StageRolledBack { stage_index: index });
        info!("Stage {} rolled back", index);
        Ok(())
    }

    /// Roll back every deployed stage from the highest index down, one at
    /// a time, stopping on the first failure rather than continuing past
    /// it.
    ///
    /// # Errors
    ///
    /// The first stage failure, after recording what already rolled back.
    pub async fn rollback_all(
        &self,
        state: &mut SessionState,
        store: &ArtifactStore,
    ) -> Result<Vec<usize>> {
        let mut deployed: Vec<usize> = state
            .stages
            .iter()
            .filter(|s| s.status == StageStatus::Deployed)
            .map(|s| s.index)
            .collect();
        deployed.sort_unstable_by(|a, b| b.cmp(a));

        let mut rolled_back = Vec::with_capacity(deployed.len());
        for index in deployed {
            self.rollback_stage(state, store, index).await?;
            rolled_back.push(index);
        }
        Ok(rolled_back)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::RollbackController;
    use crate::artifact_store::ArtifactStore;
    use crate::error::ForgeError;
    use crate::ports::{PortFuture, ProvisionMode, ProvisionOutcome, Provisioner};
    use crate::session::{SessionKind, SessionState};
    use crate::types::{Artifact, EventDetail, Stage, StageKind, StageStatus};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    struct ScriptedProvisioner {
        fail_on: Option<usize>,
        destroyed: Arc<Mutex<Vec<usize>>>,
    }

    impl Provisioner for ScriptedProvisioner {
        fn invoke<'a>(
            &'a self,
            stage: &'a Stage,
            _artifacts: &'a [Artifact],
            mode: ProvisionMode,
        ) -> PortFuture<'a, ProvisionOutcome> {
            Box::pin(async move {
                assert_eq!(mode, ProvisionMode::Destroy);
                if self.fail_on == Some(stage.index) {
                    return Ok(ProvisionOutcome::failed("resource lock held"));
                }
                self.destroyed.lock().await.push(stage.index);
                Ok(ProvisionOutcome::succeeded(BTreeMap::new(), "destroyed"))
            })
        }
    }

    fn deployed_state(count: usize) -> SessionState {
        let mut state = SessionState::new(SessionKind::Deploy, "interactive");
        for i in 1..=count {
            let mut stage = Stage::new(i, format!("stage-{i}"), StageKind::InfrastructureComponent);
            stage.status = StageStatus::Deployed;
            state.stages.push(stage);
        }
        state
    }

    fn controller(fail_on: Option<usize>) -> (RollbackController, Arc<Mutex<Vec<usize>>>) {
        let destroyed = Arc::new(Mutex::new(Vec::new()));
        let provisioner = ScriptedProvisioner {
            fail_on,
            destroyed: Arc::clone(&destroyed),
        };
        (RollbackController::new(Arc::new(provisioner)), destroyed)
    }

    #[tokio::test]
    async fn out_of_order_rollback_is_refused() {
        let (controller, destroyed) = controller(None);
        let mut state = deployed_state(3);
        let store = ArtifactStore::new();

        let err = controller
            .rollback_stage(&mut state, &store, 2)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ForgeError::RollbackOrderViolation {
                requested: 2,
                blocking: 3
            }
        ));
        // Refusal is recorded and nothing was destroyed.
        assert!(state
            .events
            .iter()
            .any(|e| matches!(e.detail, EventDetail::RollbackRefused { .. })));
        assert!(destroyed.lock().await.is_empty());
        assert_eq!(state.stage(2).unwrap().status, StageStatus::Deployed);
    }

    #[tokio::test]
    async fn reverse_order_rollback_succeeds_stage_by_stage() {
        let (controller, _) = controller(None);
        let mut state = deployed_state(3);
        let store = ArtifactStore::new();

        controller
            .rollback_stage(&mut state, &store, 3)
            .await
            .unwrap();
        controller
            .rollback_stage(&mut state, &store, 2)
            .await
            .unwrap();
        assert_eq!(state.stage(3).unwrap().status, StageStatus::RolledBack);
        assert_eq!(state.stage(2).unwrap().status, StageStatus::RolledBack);
        assert_eq!(state.stage(1).unwrap().status, StageStatus::Deployed);
    }

    #[tokio::test]
    async fn rollback_all_walks_strictly_descending() {
        let (controller, destroyed) = controller(None);
        let mut state = deployed_state(3);
        let store = ArtifactStore::new();

        let rolled = controller.rollback_all(&mut state, &store).await.unwrap();
        assert_eq!(rolled, vec![3, 2, 1]);
        assert_eq!(*destroyed.lock().await, vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn rollback_all_stops_at_first_failure() {
        let (controller, destroyed) = controller(Some(2));
        let mut state = deployed_state(3);
        let store = ArtifactStore::new();

        let err = controller.rollback_all(&mut state, &store).await.unwrap_err();
        assert!(matches!(err, ForgeError::DeployFailure { stage: 2, .. }));
        // Stage 3 went; stages 2 and 1 remain deployed.
        assert_eq!(*destroyed.lock().await, vec![3]);
        assert_eq!(state.stage(3).unwrap().status, StageStatus::RolledBack);
        assert_eq!(state.stage(2).unwrap().status, StageStatus::Deployed);
        assert_eq!(state.stage(1).unwrap().status, StageStatus::Deployed);
    }

    #[tokio::test]
    async fn non_deployed_stage_cannot_roll_back() {
        let (controller, _) = controller(None);
        let mut state = deployed_state(1);
        state.stage_mut(1).unwrap().status = StageStatus::Pending;
        let store = ArtifactStore::new();

        assert!(matches!(
            controller.rollback_stage(&mut state, &store, 1).await,
            Err(ForgeError::StateError(_))
        ));
    }
}
