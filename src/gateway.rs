use crate::error::{ForgeError, Result};
use crate::ports::{
    GenerationRequest, GenerationResponse, GeneratorAgent, PortFuture, ProvisionMode,
    ProvisionOutcome, Provisioner, ToolProvider,
};
use crate::types::{Artifact, BreakerRecord, CircuitConfig, CircuitState, Stage};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// One registered external tool provider.
pub struct ProviderRegistration {
    pub provider: Arc<dyn ToolProvider>,
    /// Role/stage names allowed to use the provider; empty means any.
    pub scope: Vec<String>,
    pub call_timeout_secs: u64,
    pub retry_limit: u32,
    pub breaker: CircuitConfig,
}

impl ProviderRegistration {
    #[must_use]
    pub fn new(provider: Arc<dyn ToolProvider>, breaker: CircuitConfig) -> Self {
        Self {
            provider,
            scope: Vec::new(),
            call_timeout_secs: breaker.call_timeout_secs,
            retry_limit: 0,
            breaker,
        }
    }

    #[must_use]
    pub fn scoped_to(mut self, members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.scope.extend(members.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }
}

/// Bounded, time-expiring cache for repeatable gateway calls (e.g. search
/// lookups shared across generator invocations). Passed explicitly into
/// call sites, never global.
#[derive(Debug)]
pub struct CallResultCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, (DateTime<Utc>, Value)>>,
}

impl CallResultCache {
    #[must_use]
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            ttl: Duration::seconds(i64::try_from(ttl_secs).unwrap_or(i64::MAX)),
            max_entries: max_entries.max(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let (stored_at, value) = entries.get(key)?;
        (Utc::now() - *stored_at < self.ttl).then(|| value.clone())
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            // Evict the stalest entry to stay bounded.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (at, _))| *at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key.into(), (Utc::now(), value));
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

/// The only component permitted to call registered external providers.
///
/// Every call runs under a per-call timeout; timeouts and failures feed the
/// provider's breaker. An open breaker refuses locally without contacting
/// the provider.
pub struct ToolGateway {
    providers: HashMap<String, ProviderRegistration>,
    breakers: RwLock<HashMap<String, BreakerRecord>>,
}

impl ToolGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_provider(mut self, name: impl Into<String>, registration: ProviderRegistration) -> Self {
        self.providers.insert(name.into(), registration);
        self
    }

    pub async fn breaker_state(&self, provider: &str) -> Option<CircuitState> {
        self.breakers.read().await.get(provider).map(|b| b.state)
    }

    /// Call a provider on behalf of `caller` (a role or stage name),
    /// enforcing the provider's declared scope.
    ///
    /// # Errors
    ///
    /// `ContractError` for unknown providers or out-of-scope callers;
    /// `CircuitOpen` when the breaker refuses; the provider's own error or
    /// `ProviderTimeout` after retries are exhausted.
    pub async fn call_scoped(&self, name: &str, caller: &str, payload: &Value) -> Result<Value> {
        let registration = self.providers.get(name).ok_or_else(|| {
            ForgeError::ContractError(format!("no tool provider registered as '{name}'"))
        })?;
        if !registration.scope.is_empty()
            && !registration.scope.iter().any(|member| member == caller)
        {
            return Err(ForgeError::ContractError(format!(
                "provider '{name}' is not in scope for '{caller}'"
            )));
        }
        self.call_registered(name, registration, payload).await
    }

    /// Call a provider without scope restrictions (engine-internal use).
    ///
    /// # Errors
    ///
    /// As `call_scoped`, minus the scope check.
    pub async fn call(&self, name: &str, payload: &Value) -> Result<Value> {
        let registration = self.providers.get(name).ok_or_else(|| {
            ForgeError::ContractError(format!("no tool provider registered as '{name}'"))
        })?;
        self.call_registered(name, registration, payload).await
    }

    async fn call_registered(
        &self,
        name: &str,
        registration: &ProviderRegistration,
        payload: &Value,
    ) -> Result<Value> {
        let state = self.admit(name, registration).await?;

        // A half-open breaker admits exactly one probe; no retries.
        let attempts = if state == CircuitState::HalfOpen {
            1
        } else {
            registration.retry_limit.saturating_add(1)
        };

        let timeout = std::time::Duration::from_secs(registration.call_timeout_secs);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match tokio::time::timeout(timeout, registration.provider.call(payload)).await {
                Ok(Ok(value)) => {
                    self.record_success(name).await;
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    warn!("Provider '{}' attempt {} failed: {}", name, attempt, err);
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(
                        "Provider '{}' attempt {} timed out after {}s",
                        name, attempt, registration.call_timeout_secs
                    );
                    last_error = Some(ForgeError::ProviderTimeout {
                        provider: name.to_string(),
                        timeout_secs: registration.call_timeout_secs,
                    });
                }
            }

            let opened = self.record_failure(name, registration).await;
            if opened {
                break;
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ForgeError::Internal(format!("provider '{name}' produced no outcome"))
        }))
    }

    /// Check the breaker, transitioning open -> half-open when the
    /// cool-down has elapsed.
    async fn admit(&self, name: &str, registration: &ProviderRegistration) -> Result<CircuitState> {
        let mut breakers = self.breakers.write().await;
        let record = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerRecord::new(name, registration.breaker));
        *record = record.clone().try_half_open(Utc::now());

        if !record.state.allows_calls() {
            debug!("Refusing call to '{}': circuit open", name);
            return Err(ForgeError::CircuitOpen {
                provider: name.to_string(),
            });
        }
        Ok(record.state)
    }

    async fn record_success(&self, name: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(record) = breakers.get_mut(name) {
            *record = record.clone().record_success();
        }
    }

    async fn record_failure(&self, name: &str, registration: &ProviderRegistration) -> bool {
        let mut breakers = self.breakers.write().await;
        let record = breakers
            .entry(name.to_string())
            .or_insert_with(|| BreakerRecord::new(name, registration.breaker));
        *record = record.clone().record_failure(Utc::now());
        if record.state == CircuitState::Open {
            warn!("Circuit opened for provider '{}'", name);
            true
        } else {
            false
        }
    }
}

impl Default for ToolGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Generator agent reached through the gateway, keeping all external calls
/// behind the breaker.
pub struct GatewayGenerator {
    gateway: Arc<ToolGateway>,
    provider: String,
}

impl GatewayGenerator {
    #[must_use]
    pub fn new(gateway: Arc<ToolGateway>, provider: impl Into<String>) -> Self {
        Self {
            gateway,
            provider: provider.into(),
        }
    }
}

impl GeneratorAgent for GatewayGenerator {
    fn generate(&self, request: GenerationRequest) -> PortFuture<'_, GenerationResponse> {
        Box::pin(async move {
            let caller = request.role.value().to_string();
            let payload = serde_json::to_value(&request)?;
            let raw = self
                .gateway
                .call_scoped(&self.provider, &caller, &payload)
                .await?;
            let response: GenerationResponse = serde_json::from_value(raw)?;
            Ok(response)
        })
    }
}

/// Provisioning tool reached through the gateway.
pub struct GatewayProvisioner {
    gateway: Arc<ToolGateway>,
    provider: String,
}

impl GatewayProvisioner {
    #[must_use]
    pub fn new(gateway: Arc<ToolGateway>, provider: impl Into<String>) -> Self {
        Self {
            gateway,
            provider: provider.into(),
        }
    }
}

impl Provisioner for GatewayProvisioner {
    fn invoke<'a>(
        &'a self,
        stage: &'a Stage,
        artifacts: &'a [Artifact],
        mode: ProvisionMode,
    ) -> PortFuture<'a, ProvisionOutcome> {
        Box::pin(async move {
            let payload = serde_json::json!({
                "stage": stage.name,
                "mode": mode.as_str(),
                "artifacts": artifacts,
            });
            let raw = self
                .gateway
                .call_scoped(&self.provider, &stage.name, &payload)
                .await?;
            let outcome: ProvisionOutcome = serde_json::from_value(raw)?;
            Ok(outcome)
        })
    }
}
