// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use verdict_model::ModelUsage;

/// Which budget was exhausted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Tokens,
    Messages,
    Time,
    WorkingTime,
    Cost,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tokens => "token",
            Self::Messages => "message",
            Self::Time => "time",
            Self::WorkingTime => "working time",
            Self::Cost => "cost",
        };
        write!(f, "{name}")
    }
}

/// A sample crossed one of its configured budgets.
///
/// This is a non-local exit caught at the sample boundary: the sample
/// terminates cleanly with a `SampleLimit` event and the task continues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, thiserror::Error)]
#[error("{kind} limit exceeded: {value} >= {limit}")]
pub struct LimitExceeded {
    pub kind: LimitKind,
    pub limit: f64,
    pub value: f64,
}

/// Budgets for one scope (sample or whole run).  Unset = unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LimitsConfig {
    pub token_limit: Option<u64>,
    pub message_limit: Option<u64>,
    pub time_limit: Option<u64>,
    pub working_limit: Option<u64>,
    pub cost_limit: Option<f64>,
}

#[derive(Default)]
struct Counters {
    tokens: u64,
    cost: f64,
    waiting: Duration,
    usage: ModelUsage,
}

/// Scalar accumulators plus the wall/working clock pair for one scope.
///
/// The working clock subtracts time reported via [`report_waiting`] (retry
/// backoff, rate-limit waits) from wall time, so "time the sample actually
/// spent doing work" is distinct from "time it waited on the provider".
///
/// [`report_waiting`]: SampleLimits::report_waiting
pub struct SampleLimits {
    config: LimitsConfig,
    started: Instant,
    counters: Mutex<Counters>,
}

impl SampleLimits {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            started: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(LimitsConfig::default())
    }

    pub fn config(&self) -> &LimitsConfig {
        &self.config
    }

    /// Fold one generate call's usage into the accumulators.
    pub fn record_usage(&self, usage: &ModelUsage) {
        let mut counters = self.counters.lock().unwrap();
        counters.tokens += usage.total_tokens;
        counters.cost += usage.total_cost.unwrap_or(0.0);
        counters.usage += *usage;
    }

    /// Report time spent waiting (backoff, rate limits) so the working
    /// clock excludes it.
    pub fn report_waiting(&self, waited: Duration) {
        self.counters.lock().unwrap().waiting += waited;
    }

    pub fn total_usage(&self) -> ModelUsage {
        self.counters.lock().unwrap().usage
    }

    pub fn tokens(&self) -> u64 {
        self.counters.lock().unwrap().tokens
    }

    pub fn cost(&self) -> f64 {
        self.counters.lock().unwrap().cost
    }

    pub fn wall_time(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn waiting_time(&self) -> Duration {
        self.counters.lock().unwrap().waiting
    }

    /// Wall time minus reported waiting time, floored at zero.
    pub fn working_time(&self) -> Duration {
        self.wall_time()
            .checked_sub(self.waiting_time())
            .unwrap_or(Duration::ZERO)
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.config.time_limit.map(Duration::from_secs)
    }

    pub fn check_token_limit(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.config.token_limit {
            let value = self.tokens();
            if value >= limit {
                return Err(LimitExceeded {
                    kind: LimitKind::Tokens,
                    limit: limit as f64,
                    value: value as f64,
                });
            }
        }
        Ok(())
    }

    /// Check the message budget against the current conversation length.
    pub fn check_message_limit(&self, count: u64) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.config.message_limit {
            if count >= limit {
                return Err(LimitExceeded {
                    kind: LimitKind::Messages,
                    limit: limit as f64,
                    value: count as f64,
                });
            }
        }
        Ok(())
    }

    pub fn check_time_limit(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.config.time_limit {
            let value = self.wall_time().as_secs_f64();
            if value >= limit as f64 {
                return Err(LimitExceeded {
                    kind: LimitKind::Time,
                    limit: limit as f64,
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn check_working_limit(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.config.working_limit {
            let value = self.working_time().as_secs_f64();
            if value >= limit as f64 {
                return Err(LimitExceeded {
                    kind: LimitKind::WorkingTime,
                    limit: limit as f64,
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn check_cost_limit(&self) -> Result<(), LimitExceeded> {
        if let Some(limit) = self.config.cost_limit {
            let value = self.cost();
            if value >= limit {
                return Err(LimitExceeded {
                    kind: LimitKind::Cost,
                    limit,
                    value,
                });
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_never_raises() {
        let limits = SampleLimits::unlimited();
        limits.record_usage(&ModelUsage::new(1_000_000, 1_000_000));
        assert!(limits.check_token_limit().is_ok());
        assert!(limits.check_message_limit(10_000).is_ok());
        assert!(limits.check_cost_limit().is_ok());
    }

    #[test]
    fn token_limit_meets_or_exceeds() {
        let limits = SampleLimits::new(LimitsConfig {
            token_limit: Some(100),
            ..Default::default()
        });
        limits.record_usage(&ModelUsage::new(40, 20));
        assert!(limits.check_token_limit().is_ok());
        limits.record_usage(&ModelUsage::new(30, 20));
        let err = limits.check_token_limit().unwrap_err();
        assert_eq!(err.kind, LimitKind::Tokens);
        assert_eq!(err.limit, 100.0);
        assert_eq!(err.value, 110.0);
    }

    #[test]
    fn message_limit_raises_at_equal() {
        let limits = SampleLimits::new(LimitsConfig {
            message_limit: Some(5),
            ..Default::default()
        });
        assert!(limits.check_message_limit(4).is_ok());
        assert!(limits.check_message_limit(5).is_err());
    }

    #[test]
    fn cost_limit_accumulates_from_usage() {
        let limits = SampleLimits::new(LimitsConfig {
            cost_limit: Some(1.0),
            ..Default::default()
        });
        let mut usage = ModelUsage::new(10, 10);
        usage.total_cost = Some(0.6);
        limits.record_usage(&usage);
        assert!(limits.check_cost_limit().is_ok());
        limits.record_usage(&usage);
        assert_eq!(limits.check_cost_limit().unwrap_err().kind, LimitKind::Cost);
    }

    #[test]
    fn working_time_excludes_reported_waits() {
        let limits = SampleLimits::unlimited();
        std::thread::sleep(Duration::from_millis(20));
        limits.report_waiting(Duration::from_millis(15));
        let wall = limits.wall_time();
        let working = limits.working_time();
        assert!(wall >= working);
        assert!(wall - working >= Duration::from_millis(14));
    }

    #[test]
    fn working_time_never_goes_negative() {
        let limits = SampleLimits::unlimited();
        limits.report_waiting(Duration::from_secs(3600));
        assert_eq!(limits.working_time(), Duration::ZERO);
    }

    #[test]
    fn usage_totals_are_component_wise_sums() {
        let limits = SampleLimits::unlimited();
        limits.record_usage(&ModelUsage::new(60, 0));
        limits.record_usage(&ModelUsage::new(0, 50));
        let total = limits.total_usage();
        assert_eq!(total.input_tokens, 60);
        assert_eq!(total.output_tokens, 50);
        assert_eq!(total.total_tokens, 110);
    }

    #[test]
    fn limit_exceeded_serializes_kind() {
        let err = LimitExceeded {
            kind: LimitKind::WorkingTime,
            limit: 10.0,
            value: 12.0,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("working_time"));
    }
}
