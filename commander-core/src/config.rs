//! Runtime tuning configuration

use crate::{CommanderResult, ConfigError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after which a record is flagged failed.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt following `retry_count` failures.
    ///
    /// `initial * multiplier^(retry_count - 1)`, capped at `max_backoff`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let exp = (retry_count - 1).min(32) as i32;
        let factor = (self.backoff_multiplier as f64).powi(exp);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    pub fn validate(&self) -> CommanderResult<()> {
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_retries".to_string(),
                value: self.max_retries.to_string(),
                reason: "must be at least 1".to_string(),
            }
            .into());
        }
        if self.initial_backoff.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "initial_backoff".to_string(),
                value: format!("{:?}", self.initial_backoff),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.max_backoff < self.initial_backoff {
            return Err(ConfigError::IncompatibleOptions {
                option_a: "initial_backoff".to_string(),
                option_b: "max_backoff".to_string(),
            }
            .into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_multiplier".to_string(),
                value: self.backoff_multiplier.to_string(),
                reason: "must be >= 1.0".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Relay sync engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Timeout for the fire-and-forget push of a fresh write.
    pub push_timeout: Duration,
    /// Timeout for a batch upload.
    pub batch_timeout: Duration,
    /// Timeout for a relay read on a local miss.
    pub query_timeout: Duration,
    /// Maximum records per uploaded batch.
    pub batch_size: usize,
    /// How often the uploader polls the outbox.
    pub upload_interval: Duration,
    pub retry: RetryConfig,
    /// Synced local records older than this may be pruned.
    pub retention: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_timeout: Duration::from_secs(2),
            batch_timeout: Duration::from_secs(5),
            query_timeout: Duration::from_secs(3),
            batch_size: 100,
            upload_interval: Duration::from_secs(5),
            retry: RetryConfig::default(),
            retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> CommanderResult<()> {
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.push_timeout.is_zero() || self.batch_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "push_timeout".to_string(),
                value: format!("{:?}", self.push_timeout),
                reason: "timeouts must be positive".to_string(),
            }
            .into());
        }
        self.retry.validate()
    }
}

/// Heartbeat timeout for one benchmark tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatTier {
    /// Applies to nodes with `benchmark_score >= min_benchmark`.
    pub min_benchmark: u32,
    pub timeout: Duration,
}

/// Heartbeat monitor configuration.
///
/// Faster nodes heartbeat more often under load, so they get shorter timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Sorted by descending `min_benchmark`.
    pub tiers: Vec<HeartbeatTier>,
    /// Timeout for nodes below every tier.
    pub fallback_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                HeartbeatTier {
                    min_benchmark: 100,
                    timeout: Duration::from_secs(15),
                },
                HeartbeatTier {
                    min_benchmark: 50,
                    timeout: Duration::from_secs(30),
                },
                HeartbeatTier {
                    min_benchmark: 20,
                    timeout: Duration::from_secs(45),
                },
            ],
            fallback_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl HeartbeatConfig {
    /// Timeout for a node with the given benchmark score.
    pub fn timeout_for(&self, benchmark_score: u32) -> Duration {
        self.tiers
            .iter()
            .filter(|t| benchmark_score >= t.min_benchmark)
            .max_by_key(|t| t.min_benchmark)
            .map(|t| t.timeout)
            .unwrap_or(self.fallback_timeout)
    }

    /// A single timeout for every node.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            tiers: Vec::new(),
            fallback_timeout: timeout,
            ..Self::default()
        }
    }
}

/// Engine lifecycle controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Wait this long after a graceful stop request before force killing.
    pub stop_grace: Duration,
    /// Wait this long for the engine to report ready.
    pub ready_timeout: Duration,
    /// Interval between readiness checks.
    pub ready_poll_interval: Duration,
    /// Bytes of process output kept for diagnostics.
    pub diagnostics_limit: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(120),
            ready_poll_interval: Duration::from_millis(500),
            diagnostics_limit: 8 * 1024,
        }
    }
}

/// State broadcaster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    pub interval: Duration,
    /// Per-subscriber buffer; a subscriber that falls this far behind is dropped.
    pub channel_capacity: usize,
    /// Envelopes included in a full snapshot.
    pub recent_envelopes: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            channel_capacity: 256,
            recent_envelopes: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff_for(0), Duration::ZERO);
        assert_eq!(retry.backoff_for(1), Duration::from_secs(1));
        assert_eq!(retry.backoff_for(2), Duration::from_secs(2));
        assert_eq!(retry.backoff_for(3), Duration::from_secs(4));
        assert_eq!(retry.backoff_for(20), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_validate() {
        assert!(RetryConfig::default().validate().is_ok());

        let bad = RetryConfig {
            max_backoff: Duration::from_millis(10),
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = RetryConfig {
            backoff_multiplier: 0.5,
            ..RetryConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_heartbeat_timeout_tiers() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.timeout_for(130), Duration::from_secs(15));
        assert_eq!(hb.timeout_for(60), Duration::from_secs(30));
        assert_eq!(hb.timeout_for(30), Duration::from_secs(45));
        assert_eq!(hb.timeout_for(9), Duration::from_secs(60));
    }

    #[test]
    fn test_faster_nodes_never_get_longer_timeouts() {
        let hb = HeartbeatConfig::default();
        for score in 0..200 {
            assert!(hb.timeout_for(score) >= hb.timeout_for(score + 1));
        }
    }

    #[test]
    fn test_sync_config_validate() {
        assert!(SyncConfig::default().validate().is_ok());
        let bad = SyncConfig {
            batch_size: 0,
            ..SyncConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
