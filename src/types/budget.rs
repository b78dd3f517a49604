//! Token accounting for generator calls, aggregated per session.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    #[must_use]
    pub const fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    #[must_use]
    pub const fn add(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
        }
    }
}

/// Optional ceiling on session token spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLimit {
    pub max_input_tokens: u64,
    pub max_output_tokens: u64,
    pub max_total_tokens: u64,
}

impl BudgetLimit {
    #[must_use]
    pub const fn new(max_input: u64, max_output: u64, max_total: u64) -> Self {
        Self {
            max_input_tokens: max_input,
            max_output_tokens: max_output,
            max_total_tokens: max_total,
        }
    }

    #[must_use]
    pub const fn is_exceeded(&self, usage: &TokenUsage) -> bool {
        usage.input_tokens > self.max_input_tokens
            || usage.output_tokens > self.max_output_tokens
            || usage.total_tokens() > self.max_total_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::{BudgetLimit, TokenUsage};

    #[test]
    fn usage_accumulates_across_calls() {
        let total = TokenUsage::new(100, 40).add(TokenUsage::new(50, 10));
        assert_eq!(total.input_tokens, 150);
        assert_eq!(total.output_tokens, 50);
        assert_eq!(total.total_tokens(), 200);
    }

    #[test]
    fn limit_detects_exceeded_budget() {
        let limit = BudgetLimit::new(100, 100, 150);
        assert!(!limit.is_exceeded(&TokenUsage::new(100, 50)));
        assert!(limit.is_exceeded(&TokenUsage::new(101, 0)));
        assert!(limit.is_exceeded(&TokenUsage::new(100, 51)));
    }
}
