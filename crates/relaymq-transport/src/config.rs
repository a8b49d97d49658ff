//! Connection pool configuration.
//!
//! Pools are configured from a generic property map namespaced per connector,
//! e.g. `vm.reap_interval = 30`. Durations are given in seconds and may be
//! fractional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ResourceError, Result};
use crate::info::Properties;

/// Property suffix for the dead connection reap interval.
pub const REAP_INTERVAL: &str = "reap_interval";
/// Property suffix for the number of unanswered ping cycles tolerated.
pub const REAP_DEAD_ITERATIONS: &str = "reap_dead_iterations";
/// Property suffix for the idle period before an unleased connection is reaped.
pub const IDLE_PERIOD: &str = "idle_period";

/// Reaping configuration for one connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Interval between dead connection scans (default: 60s). Zero disables dead reaping.
    #[serde(with = "duration_ms", rename = "reap_interval_ms")]
    pub reap_interval: Duration,
    /// Unanswered ping cycles before a connection is declared dead (default: 5).
    pub reap_dead_iterations: u32,
    /// How long a connection must go without leases before it is reaped (default: 5s).
    #[serde(with = "duration_ms", rename = "idle_period_ms")]
    pub idle_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_secs(60),
            reap_dead_iterations: 5,
            idle_period: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    /// Reads the configuration for `namespace` from a property map.
    ///
    /// Missing keys keep their defaults. Malformed values are rejected.
    pub fn from_properties(properties: &Properties, namespace: &str) -> Result<Self> {
        let mut config = Self::default();
        if let Some(interval) = duration_property(properties, namespace, REAP_INTERVAL)? {
            config.reap_interval = interval;
        }
        if let Some(period) = duration_property(properties, namespace, IDLE_PERIOD)? {
            config.idle_period = period;
        }
        let key = namespaced(namespace, REAP_DEAD_ITERATIONS);
        if let Some(raw) = properties.get(&key) {
            config.reap_dead_iterations = raw
                .trim()
                .parse()
                .map_err(|_| ResourceError::InvalidConfig {
                    key: key.clone(),
                    value: raw.clone(),
                })?;
        }
        Ok(config)
    }

    /// Sets the dead connection reap interval.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval;
        self
    }

    /// Sets the number of unanswered ping cycles tolerated.
    pub fn with_reap_dead_iterations(mut self, iterations: u32) -> Self {
        self.reap_dead_iterations = iterations;
        self
    }

    /// Sets the idle period.
    pub fn with_idle_period(mut self, period: Duration) -> Self {
        self.idle_period = period;
        self
    }

    /// Returns true if the periodic dead connection scan should run.
    pub fn dead_reaping_enabled(&self) -> bool {
        !self.reap_interval.is_zero()
    }
}

fn namespaced(namespace: &str, key: &str) -> String {
    if namespace.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", namespace, key)
    }
}

fn duration_property(
    properties: &Properties,
    namespace: &str,
    key: &str,
) -> Result<Option<Duration>> {
    let key = namespaced(namespace, key);
    let Some(raw) = properties.get(&key) else {
        return Ok(None);
    };
    let invalid = || ResourceError::InvalidConfig {
        key: key.clone(),
        value: raw.clone(),
    };
    let secs: f64 = raw.trim().parse().map_err(|_| invalid())?;
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| invalid())
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
