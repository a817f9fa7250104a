//! Broker configuration.

use crate::error::{BrokerError, Result};
use crate::store::StoreConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration, loadable from a JSON file.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub store: StoreConfig,
    pub gateway: GatewayConfig,
    pub fanout: FanoutConfig,
}

impl BrokerConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| BrokerError::Deserialization(e.to_string()))
    }
}

/// External gateway settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upper bound on any single upstream call, in milliseconds.
    /// Zero disables the timeout.
    /// Default: 5000
    pub call_timeout_ms: u64,

    /// Base AMQP address that subscription endpoints are published under.
    pub amqp_base: String,

    /// Topic used for realtime (fanout) upstream subscriptions.
    pub realtime_topic: String,

    /// User that realtime upstream subscriptions are issued as.
    pub service_user: String,

    /// Worker threads running upstream calls.
    /// Default: 4
    pub workers: usize,

    /// Calls that may wait for a free worker. Beyond that, calls fail
    /// immediately with `GatewayUnavailable`.
    /// Default: 64
    pub queue_capacity: usize,
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Option<Duration> {
        if self.call_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.call_timeout_ms))
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5000,
            amqp_base: "amqp://localhost:5672".to_string(),
            realtime_topic: "realtime".to_string(),
            service_user: "admin".to_string(),
            workers: 4,
            queue_capacity: 64,
        }
    }
}

/// Realtime fanout settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Per-client delivery buffer.
    /// Default: 64
    pub channel_capacity: usize,

    /// How long a delivery may wait on a full client buffer before the
    /// message is dropped for that client. Zero means never wait.
    pub send_timeout_ms: u64,

    /// Number of lock stripes serializing upstream activation. Entities
    /// sharing a stripe wait on each other's transitions.
    pub transition_stripes: usize,

    /// How often the dispatcher retries routes whose upstream state is
    /// unknown after a failed or timed-out call. Zero disables the retry.
    /// Default: 1000
    pub repair_interval_ms: u64,
}

impl FanoutConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn repair_interval(&self) -> Option<Duration> {
        if self.repair_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.repair_interval_ms))
        }
    }
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            send_timeout_ms: 50,
            transition_stripes: 64,
            repair_interval_ms: 1000,
        }
    }
}
