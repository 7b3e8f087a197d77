//! Engine configuration.
//!
//! Every field has a default, so an empty YAML document is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_BUFFERS_PER_KEY: u64 = 1_000_000;
pub const DEFAULT_MAX_KEY_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Upper bound for every blocking wait (assignment readiness, generation barrier)
    pub wait_timeout_ms: u64,
    /// Buffers a key may protect before rotation is forced
    pub max_buffers_per_key: u64,
    /// Seconds a key may stay active before rotation is forced
    pub max_key_seconds: u64,
    /// Distinct node masks that may hold a key at the same time
    pub max_key_masks: usize,
    /// Encrypt/decrypt workers
    pub crypto_workers: usize,
    /// Capacity of each worker channel
    pub channel_capacity: usize,
    /// Forwarded transmits allowed in flight per outbound link
    pub forward_tx_window: u32,
    /// Chunks prepared together per forward group, 0 for a whole block
    pub forward_group_chunks: usize,
    pub inbound_retry: RetryConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            max_buffers_per_key: DEFAULT_MAX_BUFFERS_PER_KEY,
            max_key_seconds: DEFAULT_MAX_KEY_SECONDS,
            max_key_masks: 16,
            crypto_workers: 2,
            channel_capacity: 1024,
            forward_tx_window: 2,
            forward_group_chunks: 0,
            inbound_retry: RetryConfig::default(),
        }
    }
}

/// Backoff used while polling for a peer's outbound assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 10,
            max_delay_ms: 500,
            max_attempts: 50,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (0-based), doubling up to the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(20)).unwrap_or(u64::MAX);
        let delay = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

impl MeshConfig {
    pub fn from_yaml_str(yaml: &str) -> MeshResult<Self> {
        let config: MeshConfig =
            serde_yaml::from_str(yaml).map_err(|e| MeshError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.wait_timeout_ms == 0 {
            return Err(MeshError::Config("wait_timeout_ms must be > 0".into()));
        }
        if self.crypto_workers == 0 {
            return Err(MeshError::Config("crypto_workers must be > 0".into()));
        }
        if self.channel_capacity == 0 {
            return Err(MeshError::Config("channel_capacity must be > 0".into()));
        }
        if self.forward_tx_window == 0 {
            return Err(MeshError::Config("forward_tx_window must be > 0".into()));
        }
        if self.max_key_masks == 0 {
            return Err(MeshError::Config("max_key_masks must be > 0".into()));
        }
        if self.inbound_retry.max_attempts == 0 {
            return Err(MeshError::Config(
                "inbound_retry.max_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
