//! Session layer configuration.
//!
//! Loading these from files or the command line is left to the embedding
//! process; both structs deserialize with serde and fall back to defaults
//! for any missing field.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default inactivity bound granted to new sessions.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5_000;

/// How long an out-of-order command may wait for the gap to fill.
///
/// Measured in consensus time (entry timestamps), not local wall clock,
/// so every replica rejects the same held commands at the same log index.
pub const DEFAULT_GAP_TIMEOUT_MS: u64 = 1_000;

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid configuration: `{field}` must be greater than zero")]
pub struct ConfigError {
    pub field: &'static str,
}

// =============================================================================
// CLUSTER SIDE
// =============================================================================

/// Cluster-side session settings. Must be identical on every member, since
/// several of them shape the replicated session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Inactivity bound after which a session may be expired.
    pub session_timeout_ms: u64,
    /// Unacknowledged command results cached per session before further
    /// commands are held.
    pub max_cached_results: usize,
    /// Maximum out-of-order commands held per session.
    pub max_held_commands: usize,
    /// How long a held command waits before it is rejected with `SequenceGap`.
    pub gap_timeout_ms: u64,
    /// Maximum number of expired/closed session tombstones retained.
    pub max_tombstones: usize,
    /// How long a request handler waits for its entry to commit.
    pub commit_timeout_ms: u64,
    /// Period of the expiry timer.
    pub expiry_check_interval_ms: u64,
    /// Idle instances kept per message pool.
    pub pool_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            max_cached_results: 128,
            max_held_commands: 64,
            gap_timeout_ms: DEFAULT_GAP_TIMEOUT_MS,
            max_tombstones: 4096,
            commit_timeout_ms: 2_000,
            expiry_check_interval_ms: 250,
            pool_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 8] = [
            ("session_timeout_ms", self.session_timeout_ms),
            ("max_cached_results", self.max_cached_results as u64),
            ("max_held_commands", self.max_held_commands as u64),
            ("gap_timeout_ms", self.gap_timeout_ms),
            ("max_tombstones", self.max_tombstones as u64),
            ("commit_timeout_ms", self.commit_timeout_ms),
            ("expiry_check_interval_ms", self.expiry_check_interval_ms),
            ("pool_capacity", self.pool_capacity as u64),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some(&(field, _)) => Err(ConfigError { field }),
            None => Ok(()),
        }
    }

    pub fn commit_timeout(&self) -> Duration {
        Duration::from_millis(self.commit_timeout_ms)
    }

    pub fn expiry_check_interval(&self) -> Duration {
        Duration::from_millis(self.expiry_check_interval_ms)
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Client driver retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Resends of one logical request before giving up.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub base_backoff_ms: u64,
    /// Upper bound on a single backoff delay.
    pub max_backoff_ms: u64,
    /// How long the transport waits for a reply before reporting a timeout.
    pub request_timeout_ms: u64,
    /// Received command results the client lets pile up before the next
    /// submit acknowledges them with a keep-alive. Keep this below the
    /// cluster's `max_cached_results`.
    pub max_unacknowledged: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 3_200,
            request_timeout_ms: 1_000,
            max_unacknowledged: 32,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_backoff_ms == 0 {
            return Err(ConfigError { field: "base_backoff_ms" });
        }
        if self.max_backoff_ms == 0 {
            return Err(ConfigError { field: "max_backoff_ms" });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError { field: "request_timeout_ms" });
        }
        if self.max_unacknowledged == 0 {
            return Err(ConfigError { field: "max_unacknowledged" });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry `attempt` (zero-based): `base * 2^min(attempt, 5)`,
    /// capped at `max_backoff_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 2u64.pow(attempt.min(5));
        Duration::from_millis(self.base_backoff_ms.saturating_mul(multiplier).min(self.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_value_rejected() {
        let config = SessionConfig {
            gap_timeout_ms: 0,
            ..SessionConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError { field: "gap_timeout_ms" }));
    }

    #[test]
    fn test_client_zero_value_rejected() {
        let config = ClientConfig {
            max_unacknowledged: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError { field: "max_unacknowledged" }));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = ClientConfig::default();
        assert_eq!(config.backoff(0), Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(5), Duration::from_millis(3_200));
        assert_eq!(config.backoff(9), Duration::from_millis(3_200));
    }
}
