#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::types::CircuitConfig;
use serde::{Deserialize, Serialize};

/// Engine tunables. Loading these from a project file is the front end's
/// concern; the engine only consumes the resolved values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Bounded worker pool size for independent task dispatch.
    pub worker_pool_size: usize,
    /// Regeneration attempts per stage before escalation.
    pub max_remediation_attempts: u32,
    /// Inactivity seconds before an unresolved issue auto-escalates.
    pub escalation_timeout_secs: u64,
    /// Whether an unresolved `recommended` violation blocks a stage.
    pub block_on_recommended: bool,
    /// Breaker defaults applied to providers without their own config.
    pub breaker: CircuitConfig,
    /// TTL for gateway call-result cache entries.
    pub call_cache_ttl_secs: u64,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            max_remediation_attempts: 2,
            escalation_timeout_secs: 120,
            block_on_recommended: false,
            breaker: CircuitConfig::default(),
            call_cache_ttl_secs: 300,
        }
    }
}

impl ForgeConfig {
    #[must_use]
    pub const fn with_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size;
        self
    }

    #[must_use]
    pub const fn with_remediation_attempts(mut self, attempts: u32) -> Self {
        self.max_remediation_attempts = attempts;
        self
    }

    #[must_use]
    pub const fn with_escalation_timeout(mut self, secs: u64) -> Self {
        self.escalation_timeout_secs = secs;
        self
    }

    #[must_use]
    pub const fn blocking_on_recommended(mut self) -> Self {
        self.block_on_recommended = true;
        self
    }
}
