use crate::error::{ForgeError, Result};
use crate::types::{Artifact, ArtifactKind, ArtifactRef};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

/// Append-only record of named outputs produced by stages.
///
/// Writes are compare-and-set per key: storing identical content again is a
/// no-op (a crash-resumed stage can safely replay its writes), while
/// conflicting content for an existing key is refused rather than silently
/// overwritten.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    entries: RwLock<HashMap<String, Artifact>>,
}

#[must_use]
pub fn fingerprint(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl ArtifactStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one artifact. Idempotent for identical content.
    ///
    /// # Errors
    ///
    /// Returns `StateError` when the key exists with different content.
    pub async fn put(
        &self,
        key: impl Into<String>,
        kind: ArtifactKind,
        stage_index: usize,
        body: impl Into<String>,
    ) -> Result<ArtifactRef> {
        let key = key.into();
        let body = body.into();
        let fingerprint = fingerprint(&body);

        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(&key) {
            if existing.fingerprint == fingerprint {
                debug!("Idempotent re-write of artifact {}", key);
                return Ok(existing.to_ref());
            }
            return Err(ForgeError::StateError(format!(
                "artifact '{key}' already exists with different content"
            )));
        }

        let artifact = Artifact {
            key: key.clone(),
            kind,
            stage_index,
            body,
            fingerprint,
        };
        let reference = artifact.to_ref();
        entries.insert(key, artifact);
        Ok(reference)
    }

    /// Replace an artifact during remediation. The old body is superseded
    /// deliberately; regular writes never take this path.
    pub async fn replace(
        &self,
        key: impl Into<String>,
        kind: ArtifactKind,
        stage_index: usize,
        body: impl Into<String>,
    ) -> ArtifactRef {
        let key = key.into();
        let body = body.into();
        let artifact = Artifact {
            fingerprint: fingerprint(&body),
            key: key.clone(),
            kind,
            stage_index,
            body,
        };
        let reference = artifact.to_ref();
        self.entries.write().await.insert(key, artifact);
        reference
    }

    pub async fn get(&self, key: &str) -> Option<Artifact> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn by_kind(&self, kind: ArtifactKind) -> Vec<Artifact> {
        let mut found: Vec<Artifact> = self
            .entries
            .read()
            .await
            .values()
            .filter(|a| a.kind == kind)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    pub async fn by_stage(&self, stage_index: usize) -> Vec<Artifact> {
        let mut found: Vec<Artifact> = self
            .entries
            .read()
            .await
            .values()
            .filter(|a| a.stage_index == stage_index)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    /// Artifact kinds currently present, for contract input checks.
    pub async fn available_kinds(&self) -> BTreeSet<ArtifactKind> {
        self.entries.read().await.values().map(|a| a.kind).collect()
    }

    pub async fn contains_kind(&self, kind: ArtifactKind) -> bool {
        self.entries.read().await.values().any(|a| a.kind == kind)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Irreversible clear, used by explicit session reset only.
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}
