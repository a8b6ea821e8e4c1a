// SPDX-License-Identifier: BSL-1.1 OR Apache-2.0
//! Configuration types for the lock managers, sequencer and hand-off.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MonitorError, Result};

// Environment variable names for configuration.

/// Server lock policy (`greedy` or `altruistic`).
pub const ENV_LOCK_POLICY: &str = "MONITOR_LOCK_POLICY";
/// Server timer tick in milliseconds.
pub const ENV_TIMER_TICK_MS: &str = "MONITOR_TIMER_TICK_MS";
/// Pending queue depth that triggers a warning.
pub const ENV_PENDING_WARN_DEPTH: &str = "MONITOR_PENDING_WARN_DEPTH";
/// Enable periodic deadlock scans.
pub const ENV_DEADLOCK_SCAN: &str = "MONITOR_DEADLOCK_SCAN";
/// Client lock GC interval in milliseconds.
pub const ENV_LOCK_GC_INTERVAL_MS: &str = "MONITOR_LOCK_GC_INTERVAL_MS";
/// Idle time before an unused greedy grant is released, in milliseconds.
pub const ENV_GREEDY_IDLE_MS: &str = "MONITOR_GREEDY_IDLE_MS";
/// Client-side bound on waiting for a server response, in milliseconds.
pub const ENV_REQUEST_TIMEOUT_MS: &str = "MONITOR_REQUEST_TIMEOUT_MS";
/// Low-water-mark cleanup interval in milliseconds.
pub const ENV_LWM_INTERVAL_MS: &str = "MONITOR_LWM_INTERVAL_MS";
/// Maximum descriptors deleted per cleanup pass (0 = unlimited).
pub const ENV_DELETE_BATCH_SIZE: &str = "MONITOR_DELETE_BATCH_SIZE";
/// Reconnect window after failover in milliseconds.
pub const ENV_RECONNECT_WINDOW_MS: &str = "MONITOR_RECONNECT_WINDOW_MS";

/// Environment variable parsing helpers.
mod env_parse {
    use super::{LockPolicy, MonitorError, Result};

    pub fn parse_u64(key: &str, val: &str) -> Result<u64> {
        val.parse()
            .map_err(|e| MonitorError::Config(format!("invalid {key}: {e}")))
    }

    pub fn parse_usize(key: &str, val: &str) -> Result<usize> {
        val.parse()
            .map_err(|e| MonitorError::Config(format!("invalid {key}: {e}")))
    }

    /// Accepts "true", "1", "yes", "on" / "false", "0", "no", "off" (case-insensitive).
    pub fn parse_bool(key: &str, val: &str) -> Result<bool> {
        match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(MonitorError::Config(format!(
                "invalid {key}: expected boolean (true/false/1/0/yes/no/on/off)"
            ))),
        }
    }

    pub fn parse_policy(key: &str, val: &str) -> Result<LockPolicy> {
        match val.to_lowercase().as_str() {
            "greedy" => Ok(LockPolicy::Greedy),
            "altruistic" => Ok(LockPolicy::Altruistic),
            other => Err(MonitorError::Config(format!(
                "invalid {key}: expected greedy or altruistic, got {other}"
            ))),
        }
    }
}

/// Whether the server may grant locks to whole nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockPolicy {
    #[default]
    Greedy,
    /// Never grant greedily; every acquire is a round-trip.
    Altruistic,
}

/// Server lock manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockManagerConfig {
    /// Policy applied when the manager starts.
    pub lock_policy: LockPolicy,
    /// How often wait and try-lock timers are checked.
    pub timer_tick_ms: u64,
    /// Pending queue depth at which a warning is logged.
    pub pending_warn_depth: usize,
    /// Run a deadlock scan on every timer tick.
    pub deadlock_scan: bool,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lock_policy: LockPolicy::Greedy,
            timer_tick_ms: 10,
            pending_warn_depth: 1024,
            deadlock_scan: false,
        }
    }
}

impl LockManagerConfig {
    pub fn timer_tick(&self) -> Duration {
        Duration::from_millis(self.timer_tick_ms)
    }

    pub fn with_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = policy;
        self
    }
}

/// Client lock manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientLockConfig {
    pub gc_interval_ms: u64,
    /// Idle time after which an unused greedy grant is handed back.
    pub greedy_idle_ms: u64,
    /// Extra time granted to the server beyond a caller's own timeout.
    pub request_timeout_ms: u64,
}

impl Default for ClientLockConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 60_000,
            greedy_idle_ms: 120_000,
            request_timeout_ms: 30_000,
        }
    }
}

impl ClientLockConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }

    pub fn greedy_idle(&self) -> Duration {
        Duration::from_millis(self.greedy_idle_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Transaction sequencer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub lwm_cleanup_interval_ms: u64,
    /// Upper bound on descriptors removed per cleanup pass; 0 means unbounded.
    pub delete_batch_size: usize,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            lwm_cleanup_interval_ms: 1_000,
            delete_batch_size: 0,
        }
    }
}

impl SequencerConfig {
    pub fn lwm_cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.lwm_cleanup_interval_ms)
    }
}

/// Failover hand-off settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffConfig {
    /// How long the new primary waits for clients to reconnect.
    pub reconnect_window_ms: u64,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            reconnect_window_ms: 5_000,
        }
    }
}

impl HandoffConfig {
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }
}

/// All coordinator settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub lock_manager: LockManagerConfig,
    pub client: ClientLockConfig,
    pub sequencer: SequencerConfig,
    pub handoff: HandoffConfig,
}

impl MonitorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MONITOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = lookup(ENV_LOCK_POLICY) {
            config.lock_manager.lock_policy = env_parse::parse_policy(ENV_LOCK_POLICY, &val)?;
        }
        if let Some(val) = lookup(ENV_TIMER_TICK_MS) {
            config.lock_manager.timer_tick_ms = env_parse::parse_u64(ENV_TIMER_TICK_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_PENDING_WARN_DEPTH) {
            config.lock_manager.pending_warn_depth =
                env_parse::parse_usize(ENV_PENDING_WARN_DEPTH, &val)?;
        }
        if let Some(val) = lookup(ENV_DEADLOCK_SCAN) {
            config.lock_manager.deadlock_scan = env_parse::parse_bool(ENV_DEADLOCK_SCAN, &val)?;
        }

        if let Some(val) = lookup(ENV_LOCK_GC_INTERVAL_MS) {
            config.client.gc_interval_ms = env_parse::parse_u64(ENV_LOCK_GC_INTERVAL_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_GREEDY_IDLE_MS) {
            config.client.greedy_idle_ms = env_parse::parse_u64(ENV_GREEDY_IDLE_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            config.client.request_timeout_ms = env_parse::parse_u64(ENV_REQUEST_TIMEOUT_MS, &val)?;
        }

        if let Some(val) = lookup(ENV_LWM_INTERVAL_MS) {
            config.sequencer.lwm_cleanup_interval_ms =
                env_parse::parse_u64(ENV_LWM_INTERVAL_MS, &val)?;
        }
        if let Some(val) = lookup(ENV_DELETE_BATCH_SIZE) {
            config.sequencer.delete_batch_size = env_parse::parse_usize(ENV_DELETE_BATCH_SIZE, &val)?;
        }

        if let Some(val) = lookup(ENV_RECONNECT_WINDOW_MS) {
            config.handoff.reconnect_window_ms = env_parse::parse_u64(ENV_RECONNECT_WINDOW_MS, &val)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_manager.timer_tick_ms == 0 {
            return Err(MonitorError::Config(
                "timer_tick_ms must be greater than 0".to_string(),
            ));
        }
        if self.client.gc_interval_ms == 0 {
            return Err(MonitorError::Config(
                "gc_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.sequencer.lwm_cleanup_interval_ms == 0 {
            return Err(MonitorError::Config(
                "lwm_cleanup_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
