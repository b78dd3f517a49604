use crate::error::ForgeError;
use crate::ports::PortFuture;
use crate::types::{
    EscalationRecord, EventDetail, FailureDiagnostics, PolicyViolation, SessionEvent, Stage,
    TokenUsage,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const SESSION_STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    Build,
    Deploy,
}

impl SessionKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SessionKind {
    type Error = String;

    fn try_from(s: &str) -> std::result::Result<Self, String> {
        match s {
            "build" => Ok(Self::Build),
            "deploy" => Ok(Self::Deploy),
            _ => Err(format!("Unknown session kind: {s}")),
        }
    }
}

/// One recorded user/engine exchange in an interactive loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionEntry {
    pub at: DateTime<Utc>,
    pub origin: String,
    pub text: String,
}

/// The single durable, versioned record a session owns.
///
/// Mutated only by the owning session's state machine, persisted once per
/// state-machine step, and cleared only by explicit reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub kind: SessionKind,
    /// Name of the phase to resume from.
    pub phase: String,
    pub stages: Vec<Stage>,
    pub events: Vec<SessionEvent>,
    pub violations: Vec<PolicyViolation>,
    pub escalations: Vec<EscalationRecord>,
    pub interactions: Vec<InteractionEntry>,
    pub usage: TokenUsage,
}

impl SessionState {
    #[must_use]
    pub fn new(kind: SessionKind, phase: impl Into<String>) -> Self {
        Self {
            version: SESSION_STATE_VERSION,
            kind,
            phase: phase.into(),
            stages: Vec::new(),
            events: Vec::new(),
            violations: Vec::new(),
            escalations: Vec::new(),
            interactions: Vec::new(),
            usage: TokenUsage::default(),
        }
    }

    /// Append to the audit trail. Entries are never rewritten.
    pub fn record(&mut self, detail: EventDetail) {
        let seq = self.events.len() as u64 + 1;
        self.events.push(SessionEvent::new(seq, detail, Utc::now()));
    }

    pub fn record_with_diagnostics(&mut self, detail: EventDetail, diagnostics: FailureDiagnostics) {
        let seq = self.events.len() as u64 + 1;
        self.events
            .push(SessionEvent::new(seq, detail, Utc::now()).with_diagnostics(diagnostics));
    }

    pub fn note_interaction(&mut self, origin: impl Into<String>, text: impl Into<String>) {
        self.interactions.push(InteractionEntry {
            at: Utc::now(),
            origin: origin.into(),
            text: text.into(),
        });
    }

    pub fn add_usage(&mut self, usage: TokenUsage) {
        self.usage = self.usage.add(usage);
    }

    #[must_use]
    pub fn stage(&self, index: usize) -> Option<&Stage> {
        self.stages.iter().find(|s| s.index == index)
    }

    pub fn stage_mut(&mut self, index: usize) -> Option<&mut Stage> {
        self.stages.iter_mut().find(|s| s.index == index)
    }

    /// Violation history is append-only; resolutions update in place by
    /// rule and stage.
    pub fn upsert_violation(&mut self, violation: PolicyViolation) {
        if let Some(existing) = self
            .violations
            .iter_mut()
            .find(|v| v.rule_id == violation.rule_id && v.stage_index == violation.stage_index)
        {
            *existing = violation;
        } else {
            self.violations.push(violation);
        }
    }

    #[must_use]
    pub fn open_violations_for(&self, stage_index: usize) -> Vec<&PolicyViolation> {
        self.violations
            .iter()
            .filter(|v| v.stage_index == stage_index && !v.is_resolved())
            .collect()
    }
}

/// Durable storage port for session state: one record per session kind.
pub trait SessionStore: Send + Sync {
    fn load(&self, kind: SessionKind) -> PortFuture<'_, Option<SessionState>>;
    fn save<'a>(&'a self, state: &'a SessionState) -> PortFuture<'a, ()>;
    /// Explicit, irreversible reset.
    fn reset(&self, kind: SessionKind) -> PortFuture<'_, ()>;
}

/// JSON-file store with atomic replace: write the whole document to a
/// sibling temp file, then rename over the target, so a crash mid-save
/// never leaves a torn record.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, kind: SessionKind) -> PathBuf {
        self.dir.join(format!("{}.json", kind.as_str()))
    }
}

impl SessionStore for JsonFileStore {
    fn load(&self, kind: SessionKind) -> PortFuture<'_, Option<SessionState>> {
        Box::pin(async move {
            let path = self.path_for(kind);
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(err) => return Err(ForgeError::IoError(err)),
            };
            let state: SessionState = serde_json::from_str(&content)?;
            if state.version > SESSION_STATE_VERSION {
                return Err(ForgeError::StateError(format!(
                    "session record version {} is newer than supported {}",
                    state.version, SESSION_STATE_VERSION
                )));
            }
            debug!("Loaded {} session state from {}", kind, path.display());
            Ok(Some(state))
        })
    }

    fn save<'a>(&'a self, state: &'a SessionState) -> PortFuture<'a, ()> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let path = self.path_for(state.kind);
            let tmp = path.with_extension("json.tmp");
            let body = serde_json::to_vec_pretty(state)?;
            tokio::fs::write(&tmp, body).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok(())
        })
    }

    fn reset(&self, kind: SessionKind) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let path = self.path_for(kind);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Reset {} session state", kind),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ForgeError::IoError(err)),
            }
            // Generated artifacts under the engine's control go with it.
            let artifacts = self.dir.join("artifacts").join(kind.as_str());
            match tokio::fs::remove_dir_all(&artifacts).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(ForgeError::IoError(err)),
            }
            Ok(())
        })
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<SessionKind, SessionState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemoryStore {
    fn load(&self, kind: SessionKind) -> PortFuture<'_, Option<SessionState>> {
        Box::pin(async move { Ok(self.records.lock().await.get(&kind).cloned()) })
    }

    fn save<'a>(&'a self, state: &'a SessionState) -> PortFuture<'a, ()> {
        Box::pin(async move {
            self.records.lock().await.insert(state.kind, state.clone());
            Ok(())
        })
    }

    fn reset(&self, kind: SessionKind) -> PortFuture<'_, ()> {
        Box::pin(async move {
            self.records.lock().await.remove(&kind);
            Ok(())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{JsonFileStore, SessionKind, SessionState, SessionStore, SESSION_STATE_VERSION};
    use crate::types::{EventDetail, Stage, StageKind, StageStatus};

    #[tokio::test]
    async fn file_store_round_trips_and_resets() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        assert!(store.load(SessionKind::Build).await.unwrap().is_none());

        let mut state = SessionState::new(SessionKind::Build, "plan");
        state.stages.push(Stage::new(1, "network", StageKind::InfrastructureComponent));
        state.record(EventDetail::PlanComputed { stage_count: 1 });
        store.save(&state).await.unwrap();

        let loaded = store.load(SessionKind::Build).await.unwrap().unwrap();
        assert_eq!(loaded.phase, "plan");
        assert_eq!(loaded.stages.len(), 1);
        assert_eq!(loaded.events.len(), 1);
        assert_eq!(loaded.version, SESSION_STATE_VERSION);

        store.reset(SessionKind::Build).await.unwrap();
        assert!(store.load(SessionKind::Build).await.unwrap().is_none());
        // Resetting an absent record is not an error.
        store.reset(SessionKind::Build).await.unwrap();
    }

    #[tokio::test]
    async fn build_and_deploy_records_are_separate() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());

        store
            .save(&SessionState::new(SessionKind::Build, "plan"))
            .await
            .unwrap();
        store
            .save(&SessionState::new(SessionKind::Deploy, "preflight"))
            .await
            .unwrap();

        store.reset(SessionKind::Build).await.unwrap();
        assert!(store.load(SessionKind::Build).await.unwrap().is_none());
        assert!(store.load(SessionKind::Deploy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn newer_version_is_refused() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut state = SessionState::new(SessionKind::Deploy, "preflight");
        state.version = SESSION_STATE_VERSION + 1;
        store.save(&state).await.unwrap();

        assert!(store.load(SessionKind::Deploy).await.is_err());
    }

    #[test]
    fn audit_trail_is_append_only_with_increasing_seq() {
        let mut state = SessionState::new(SessionKind::Build, "plan");
        state.record(EventDetail::PlanComputed { stage_count: 2 });
        state.record(EventDetail::StageGenerated { stage_index: 1 });
        assert_eq!(state.events[0].seq, 1);
        assert_eq!(state.events[1].seq, 2);
    }

    #[test]
    fn stage_lookup_by_index_ignores_position() {
        let mut state = SessionState::new(SessionKind::Deploy, "loop");
        let mut stage = Stage::new(3, "api", StageKind::Application);
        stage.status = StageStatus::Deployed;
        state.stages.push(stage);
        assert!(state.stage(3).is_some());
        assert!(state.stage(1).is_none());
        state.stage_mut(3).unwrap().status = StageStatus::RolledBack;
        assert_eq!(state.stage(3).unwrap().status, StageStatus::RolledBack);
    }
}
