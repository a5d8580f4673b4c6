//! # config
//!
//! why: keep every timing and sizing knob of the engine in one validated place
//! relations: consumed by node.rs, election.rs timers and the runtime's tick loop
//! what: RaftConfig with defaults, json loading and validation

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Engine configuration. All durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Lower bound of the randomized election timeout.
    pub election_timeout_min: u64,
    /// Upper bound (inclusive) of the randomized election timeout.
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats. Must be below the election timeout.
    pub heartbeat_interval: u64,
    /// Logical time advanced by one call to `tick()`.
    pub tick_ms: u64,
    /// Maximum entries carried by a single AppendEntries.
    pub max_entries_per_append: u64,
    /// Entries applied since the last snapshot before a new one is taken.
    pub snapshot_threshold: u64,
    /// Run a pre-vote round before incrementing the term.
    pub pre_vote: bool,
    /// Leader steps down when it loses contact with a majority.
    pub check_quorum: bool,
    /// Seed for the election timer. `None` seeds from entropy.
    pub rng_seed: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            tick_ms: 10,
            max_entries_per_append: 64,
            snapshot_threshold: 1000,
            pre_vote: false,
            check_quorum: true,
            rng_seed: None,
        }
    }
}

impl RaftConfig {
    /// Parse a config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("election_timeout_min", self.election_timeout_min),
            ("heartbeat_interval", self.heartbeat_interval),
            ("tick_ms", self.tick_ms),
            ("max_entries_per_append", self.max_entries_per_append),
            ("snapshot_threshold", self.snapshot_threshold),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.election_timeout_min > self.election_timeout_max {
            return Err(ConfigError::ElectionRange {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                min: self.election_timeout_min,
            });
        }
        if self.tick_ms > self.heartbeat_interval {
            return Err(ConfigError::TickTooCoarse {
                tick: self.tick_ms,
                heartbeat: self.heartbeat_interval,
            });
        }
        Ok(())
    }
}
