//! Step metadata: kinds, retry policy, introspection records.

use serde::{Deserialize, Serialize};

/// The kind of a registered step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Ordinary unit of work.
    Step,
    /// Fan-out owner: spawns one companion invocation per item.
    Map,
    /// Conditional branch over a route table.
    Switch,
    /// Nested sub-pipeline.
    Sub,
    /// Token-streaming step.
    Streaming,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepKind::Step => "step",
            StepKind::Map => "map",
            StepKind::Switch => "switch",
            StepKind::Sub => "sub",
            StepKind::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Retry behavior for one step, applied by the stock retry middleware.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryPolicy {
    /// Retry up to `n` times after the first attempt.
    Attempts(u32),
    /// Full configuration.
    Config(RetryConfig),
}

/// Detailed retry configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first.
    pub stop: u32,
    /// Initial wait between attempts, in seconds.
    pub wait_secs: f64,
    /// Multiplier applied to the wait after each attempt.
    pub multiplier: f64,
    /// Upper bound on the wait, if any.
    pub max_wait_secs: Option<f64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            stop: 3,
            wait_secs: 0.05,
            multiplier: 2.0,
            max_wait_secs: None,
        }
    }
}

impl RetryPolicy {
    /// Normalize to a full configuration.
    pub fn config(&self) -> RetryConfig {
        match self {
            RetryPolicy::Attempts(n) => RetryConfig {
                stop: n + 1,
                ..RetryConfig::default()
            },
            RetryPolicy::Config(cfg) => *cfg,
        }
    }

    /// Number of retries beyond the first attempt.
    pub fn retries(&self) -> u32 {
        self.config().stop.saturating_sub(1)
    }
}

/// Introspection record for one registered step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepInfo {
    pub name: String,
    pub kind: StepKind,
    pub timeout: Option<f64>,
    pub retries: u32,
    /// Reserved: maximum time to wait for a fan-out batch to drain. Accepted
    /// and surfaced but not yet enforced by the runtime.
    pub barrier_timeout: Option<f64>,
    pub has_error_handler: bool,
    /// Every step this one can reach: static successors, map target, switch
    /// routes and default.
    pub targets: Vec<String>,
}

/// The middleware's view of the step being wrapped.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Step name.
    pub name: String,
    /// Name of the owning pipeline.
    pub pipe_name: String,
    /// Step kind.
    pub kind: StepKind,
    /// Configured retry policy, if any.
    pub retries: Option<RetryPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempts_normalization() {
        let policy = RetryPolicy::Attempts(3);
        assert_eq!(policy.config().stop, 4);
        assert_eq!(policy.retries(), 3);
    }

    #[test]
    fn test_config_passthrough() {
        let cfg = RetryConfig {
            stop: 2,
            wait_secs: 0.01,
            multiplier: 1.0,
            max_wait_secs: Some(0.1),
        };
        let policy = RetryPolicy::Config(cfg);
        assert_eq!(policy.config(), cfg);
        assert_eq!(policy.retries(), 1);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(StepKind::Streaming.to_string(), "streaming");
        assert_eq!(StepKind::Switch.to_string(), "switch");
    }
}
