//! Configuration types for the ownership service.

use crate::error::{Error, Result};
use crate::selection::StrategyConfig;
use crate::types::MemberName;
use std::time::Duration;

/// Main configuration for one ownership shard replica.
#[derive(Debug, Clone)]
pub struct OwnershipConfig {
    /// Name of the local member.
    pub member_name: MemberName,

    /// Name of the shard, used in logs.
    pub shard_name: String,

    /// Maximum number of modifications in a single submitted batch.
    pub max_batch_size: usize,

    /// Consensus timing, used for commit retry cadence.
    pub raft: RaftTimingConfig,

    /// How long to wait for a submitted batch before treating it as failed.
    pub commit_timeout: Duration,

    /// Per entity type owner selection strategies.
    pub strategies: StrategyConfig,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            member_name: MemberName::new("member-1"),
            shard_name: "entity-ownership".to_string(),
            max_batch_size: 1000,
            raft: RaftTimingConfig::default(),
            commit_timeout: Duration::from_secs(30),
            strategies: StrategyConfig::default(),
        }
    }
}

impl OwnershipConfig {
    /// Create a new configuration for the given member.
    pub fn new(member_name: impl Into<MemberName>) -> Self {
        Self {
            member_name: member_name.into(),
            ..Default::default()
        }
    }

    /// Set the shard name.
    pub fn with_shard_name(mut self, name: impl Into<String>) -> Self {
        self.shard_name = name.into();
        self
    }

    /// Set the maximum batch size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set consensus timing.
    pub fn with_raft_config(mut self, raft: RaftTimingConfig) -> Self {
        self.raft = raft;
        self
    }

    /// Set the commit timeout.
    pub fn with_commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Set the selection strategies.
    pub fn with_strategies(mut self, strategies: StrategyConfig) -> Self {
        self.strategies = strategies;
        self
    }

    /// Check the configuration for values the shard cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.member_name.as_str().is_empty() {
            return Err(Error::Config("member_name must not be empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if self.commit_timeout.is_zero() {
            return Err(Error::Config("commit_timeout must be non-zero".into()));
        }
        if self.raft.election_timeout().is_zero() {
            return Err(Error::Config("election timeout must be non-zero".into()));
        }
        Ok(())
    }
}

/// Consensus timing settings relevant to the ownership layer.
#[derive(Debug, Clone)]
pub struct RaftTimingConfig {
    /// Leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Election timeout as a multiple of the heartbeat interval.
    pub election_timeout_factor: u32,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            election_timeout_factor: 2,
        }
    }
}

impl RaftTimingConfig {
    /// Election timeout, the interval between commit retries.
    pub fn election_timeout(&self) -> Duration {
        self.heartbeat_interval * self.election_timeout_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OwnershipConfig::default();
        assert_eq!(config.shard_name, "entity-ownership");
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.raft.election_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = OwnershipConfig::new("member-3")
            .with_max_batch_size(10)
            .with_commit_timeout(Duration::from_secs(5));

        assert_eq!(config.member_name.as_str(), "member-3");
        assert_eq!(config.max_batch_size, 10);
        assert_eq!(config.commit_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(OwnershipConfig::new("").validate().is_err());
        assert!(OwnershipConfig::new("m").with_max_batch_size(0).validate().is_err());

        let raft = RaftTimingConfig {
            heartbeat_interval: Duration::ZERO,
            election_timeout_factor: 2,
        };
        assert!(OwnershipConfig::new("m").with_raft_config(raft).validate().is_err());
    }
}
