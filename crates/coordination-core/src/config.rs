use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, Result};

/// Coordination layer configuration
///
/// # Configuration Sections
///
/// - [`general`]: system identity and global limits
/// - [`ring`]: ring fan-out and claim arbitration timing
/// - [`park`]: parked-call bounds and the cleanup sweep
/// - [`database`]: shared datastore location
///
/// # Examples
///
/// ```
/// use parkline_coordination_core::config::CoordinationConfig;
/// use std::time::Duration;
///
/// let mut config = CoordinationConfig::default();
/// config.ring.ring_timeout = Duration::from_secs(45);
/// config.park.max_park_duration = Duration::from_secs(600);
///
/// config.validate().expect("configuration should be valid");
/// ```
///
/// [`general`]: GeneralConfig
/// [`ring`]: RingConfig
/// [`park`]: ParkConfig
/// [`database`]: DatabaseConfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationConfig {
    /// System identity and global limits
    pub general: GeneralConfig,

    /// Ring fan-out and claim timing
    pub ring: RingConfig,

    /// Parked-call bounds and cleanup sweep
    pub park: ParkConfig,

    /// Shared datastore configuration
    pub database: DatabaseConfig,
}

/// General system settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Domain used when rendering agent addresses
    pub domain: String,

    /// Maximum number of registered agents
    pub max_agents: usize,

    /// Maximum number of simultaneously tracked calls (ringing, active,
    /// parked, and transferring combined). New inbound signals beyond this
    /// are refused.
    pub max_concurrent_calls: usize,
}

/// Ring fan-out and claim arbitration timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// How long a call may stay in ringing before it is marked missed.
    ///
    /// Every externally-facing action in the ring path is bounded by this
    /// value, including claim retries against an unreachable store.
    pub ring_timeout: Duration,

    /// Base delay for claim retry backoff when the store is unreachable.
    /// Doubled per attempt, total bounded by `ring_timeout`.
    pub claim_retry_base: Duration,
}

/// Parked-call bounds and cleanup sweep settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParkConfig {
    /// A parked call older than this is abandoned by the cleanup sweep.
    pub max_park_duration: Duration,

    /// How often the server-side cleanup sweep runs.
    pub sweep_interval: Duration,
}

/// Shared datastore configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL; `sqlite::memory:` for tests
    pub database_url: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            domain: "parkline.local".to_string(),
            max_agents: 100,
            max_concurrent_calls: 1000,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(30),
            claim_retry_base: Duration::from_millis(50),
        }
    }
}

impl Default for ParkConfig {
    fn default() -> Self {
        Self {
            max_park_duration: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
        }
    }
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            ring: RingConfig::default(),
            park: ParkConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl CoordinationConfig {
    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.general.domain.is_empty() {
            return Err(CoordinationError::configuration("domain must not be empty"));
        }
        if self.general.max_agents == 0 {
            return Err(CoordinationError::configuration("max_agents must be positive"));
        }
        if self.general.max_concurrent_calls == 0 {
            return Err(CoordinationError::configuration(
                "max_concurrent_calls must be positive",
            ));
        }
        if self.ring.ring_timeout < Duration::from_secs(1) {
            return Err(CoordinationError::configuration(
                "ring_timeout must be at least one second",
            ));
        }
        if self.ring.claim_retry_base.is_zero() {
            return Err(CoordinationError::configuration(
                "claim_retry_base must be positive",
            ));
        }
        if self.ring.claim_retry_base >= self.ring.ring_timeout {
            return Err(CoordinationError::configuration(
                "claim_retry_base must be smaller than ring_timeout",
            ));
        }
        if self.park.max_park_duration.is_zero() {
            return Err(CoordinationError::configuration(
                "max_park_duration must be positive",
            ));
        }
        if self.park.sweep_interval.is_zero() {
            return Err(CoordinationError::configuration(
                "sweep_interval must be positive",
            ));
        }
        if self.database.database_url.is_empty() {
            return Err(CoordinationError::configuration(
                "database_url must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        CoordinationConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_zero_ring_timeout() {
        let mut config = CoordinationConfig::default();
        config.ring.ring_timeout = Duration::from_millis(100);
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_retry_base_exceeding_ring_timeout() {
        let mut config = CoordinationConfig::default();
        config.ring.claim_retry_base = Duration::from_secs(60);
        assert!(config.validate().is_err());
    }
}
