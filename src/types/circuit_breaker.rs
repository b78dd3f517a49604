use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn allows_calls(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl TryFrom<&str> for CircuitState {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "closed" => Ok(Self::Closed),
            "open" => Ok(Self::Open),
            "half-open" | "half_open" => Ok(Self::HalfOpen),
            _ => Err(format!("Unknown circuit state: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub call_timeout_secs: u64,
}

impl CircuitConfig {
    #[must_use]
    pub const fn new(failure_threshold: u32, cooldown_secs: u64, call_timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            cooldown_secs,
            call_timeout_secs,
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self::new(5, 60, 30)
    }
}

/// Per-provider breaker state.
///
/// Consecutive failures reaching the threshold trip `closed -> open`; after
/// the cool-down one probe call is admitted (`half-open`). A successful
/// probe resets the counter and closes; a failed probe reopens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub config: CircuitConfig,
}

impl BreakerRecord {
    #[must_use]
    pub fn new(provider: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            provider: provider.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            opened_at: None,
            config,
        }
    }

    #[must_use]
    pub const fn should_open(&self) -> bool {
        matches!(self.state, CircuitState::Closed)
            && self.failure_count >= self.config.failure_threshold
    }

    #[must_use]
    pub fn record_failure(mut self, now: DateTime<Utc>) -> Self {
        self.failure_count += 1;
        self.last_failure_at = Some(now);

        match self.state {
            CircuitState::HalfOpen => {
                // Failed probe reopens immediately.
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Closed if self.should_open() => {
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            _ => {}
        }

        self
    }

    #[must_use]
    pub fn record_success(mut self) -> Self {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self
    }

    /// Admit a single probe once the cool-down has elapsed.
    #[must_use]
    pub fn try_half_open(mut self, now: DateTime<Utc>) -> Self {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                let elapsed = (now - opened_at).num_seconds();
                if elapsed >= 0 && elapsed.unsigned_abs() >= self.config.cooldown_secs {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{BreakerRecord, CircuitConfig, CircuitState};
    use chrono::{Duration, Utc};

    #[test]
    fn circuit_state_allows_calls_when_closed_or_half_open() {
        assert!(CircuitState::Closed.allows_calls());
        assert!(CircuitState::HalfOpen.allows_calls());
        assert!(!CircuitState::Open.allows_calls());
    }

    #[test]
    fn circuit_state_roundtrip_preserves_values() {
        let cases = [
            (CircuitState::Closed, "closed"),
            (CircuitState::Open, "open"),
            (CircuitState::HalfOpen, "half-open"),
        ];

        for (state, expected) in cases {
            assert_eq!(state.as_str(), expected);
            assert_eq!(CircuitState::try_from(expected), Ok(state));
        }
        assert_eq!(
            CircuitState::try_from("half_open"),
            Ok(CircuitState::HalfOpen)
        );
    }

    #[test]
    fn breaker_opens_exactly_at_threshold() {
        let now = Utc::now();
        let config = CircuitConfig::new(3, 60, 30);
        let mut breaker = BreakerRecord::new("provisioner", config);

        breaker = breaker.record_failure(now).record_failure(now);
        assert_eq!(breaker.state, CircuitState::Closed);

        breaker = breaker.record_failure(now);
        assert_eq!(breaker.state, CircuitState::Open);
        assert!(breaker.opened_at.is_some());
    }

    #[test]
    fn half_open_only_after_cooldown() {
        let opened = Utc::now();
        let config = CircuitConfig::new(1, 60, 30);
        let breaker = BreakerRecord::new("search", config).record_failure(opened);
        assert_eq!(breaker.state, CircuitState::Open);

        let early = breaker.clone().try_half_open(opened + Duration::seconds(30));
        assert_eq!(early.state, CircuitState::Open);

        let ready = breaker.try_half_open(opened + Duration::seconds(60));
        assert_eq!(ready.state, CircuitState::HalfOpen);
    }

    #[test]
    fn probe_success_closes_and_probe_failure_reopens() {
        let now = Utc::now();
        let config = CircuitConfig::new(1, 0, 30);
        let breaker = BreakerRecord::new("generator", config)
            .record_failure(now)
            .try_half_open(now);
        assert_eq!(breaker.state, CircuitState::HalfOpen);

        let closed = breaker.clone().record_success();
        assert_eq!(closed.state, CircuitState::Closed);
        assert_eq!(closed.failure_count, 0);

        let reopened = breaker.record_failure(now);
        assert_eq!(reopened.state, CircuitState::Open);
    }
}
