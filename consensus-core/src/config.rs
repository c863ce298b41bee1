//! Consensus configuration.
//!
//! Timing parameters, the part size, the WAL limits and the skip-round
//! policy. All step timeouts are in milliseconds; the propose timeout grows
//! linearly with the round to give later proposers more time.

use {
    crate::{part_set::DEFAULT_BLOCK_PART_SIZE, wal::WalConfig},
    std::time::Duration,
    thiserror::Error,
};

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// Network id; echoed by skip-transaction votes.
    pub nid: u32,

    /// Target payload size of one block part.
    pub block_part_size: usize,

    /// Base timeout for the propose step in milliseconds.
    pub timeout_propose_ms: u64,

    /// Additional propose timeout per round.
    pub timeout_propose_delta_ms: u64,

    /// Timeout of the prevote-wait step.
    pub timeout_prevote_ms: u64,

    /// Timeout of the precommit-wait step.
    pub timeout_precommit_ms: u64,

    /// Pause in the new-height step before the next propose.
    pub timeout_commit_ms: u64,

    /// Rounds after which stalled validators start voting the nid echo to
    /// skip the blocking transaction. `None` disables skip voting.
    pub skip_round_limit: Option<u32>,

    /// Wait for pending transactions before proposing at a new height.
    pub wait_transactions: bool,

    /// Cost bound (bytes) of the early block-part cache.
    pub part_cache_cost_limit: usize,

    /// Heights ahead of the current one whose messages are queued.
    pub future_height_limit: u64,

    /// Write-ahead-log limits.
    pub wal: WalConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            nid: 1,
            block_part_size: DEFAULT_BLOCK_PART_SIZE,
            timeout_propose_ms: 1000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_precommit_ms: 1000,
            timeout_commit_ms: 1000,
            skip_round_limit: None,
            wait_transactions: false,
            part_cache_cost_limit: 4 * 1024 * 1024,
            future_height_limit: 4,
            wal: WalConfig::default(),
        }
    }
}

impl ConsensusConfig {
    /// Propose timeout for a round: base plus delta per round.
    pub fn timeout_propose(&self, round: u32) -> Duration {
        Duration::from_millis(
            self.timeout_propose_ms + self.timeout_propose_delta_ms * round as u64,
        )
    }

    pub fn timeout_prevote(&self) -> Duration {
        Duration::from_millis(self.timeout_prevote_ms)
    }

    pub fn timeout_precommit(&self) -> Duration {
        Duration::from_millis(self.timeout_precommit_ms)
    }

    pub fn timeout_commit(&self) -> Duration {
        Duration::from_millis(self.timeout_commit_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_part_size == 0 {
            return Err(ConfigError::InvalidPartSize);
        }
        if self.timeout_propose_ms == 0 {
            return Err(ConfigError::InvalidTimeout("timeout_propose_ms"));
        }
        if self.timeout_prevote_ms == 0 {
            return Err(ConfigError::InvalidTimeout("timeout_prevote_ms"));
        }
        if self.timeout_precommit_ms == 0 {
            return Err(ConfigError::InvalidTimeout("timeout_precommit_ms"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("block_part_size must be > 0")]
    InvalidPartSize,
    #[error("{0} must be > 0")]
    InvalidTimeout(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = ConsensusConfig::default();
        config.validate().unwrap();
        assert_eq!(config.block_part_size, 100 * 1024);
    }

    #[test]
    fn test_propose_timeout_grows_with_round() {
        let config = ConsensusConfig::default();
        assert_eq!(config.timeout_propose(0), Duration::from_millis(1000));
        assert_eq!(config.timeout_propose(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_invalid_part_size() {
        let config = ConsensusConfig {
            block_part_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPartSize)
        ));
    }

    #[test]
    fn test_invalid_timeout() {
        let config = ConsensusConfig {
            timeout_prevote_ms: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTimeout(_))));
    }
}
