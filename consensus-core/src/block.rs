//! Block manager seam.
//!
//! Block construction, validation, finalization and storage are external;
//! the state machine consumes them through this trait. Candidates occupy a
//! single validated-block slot in the engine and are dropped when replaced.

use {
    crate::{commit_vote::CommitVoteList, validator_set::ValidatorSet, vote::NtsVoteBase},
    solana_hash::Hash,
    thiserror::Error,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("block rejected: {0}")]
    Rejected(String),
    #[error("no block at height {0}")]
    NotFound(u64),
    #[error("block manager failure: {0}")]
    Internal(String),
}

/// A block that passed validation, with the metadata consensus needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCandidate {
    pub height: u64,
    pub id: Hash,
    pub bytes: Vec<u8>,
    /// Validator set for the next height.
    pub next_validators: ValidatorSet,
    /// NTS sections this block publishes, in section order.
    pub nts_vote_bases: Vec<NtsVoteBase>,
}

/// The narrow contract the consensus core holds against the block layer.
pub trait BlockManager: Send {
    /// Build a block for `height` on top of the previous commit.
    fn propose(
        &mut self,
        height: u64,
        prev_votes: &CommitVoteList,
    ) -> Result<BlockCandidate, BlockError>;

    /// Validate serialized block bytes received from peers.
    fn import(&mut self, height: u64, bytes: &[u8]) -> Result<BlockCandidate, BlockError>;

    /// Persist a decided block together with its commit votes.
    fn finalize(
        &mut self,
        candidate: &BlockCandidate,
        votes: &CommitVoteList,
    ) -> Result<(), BlockError>;

    /// Whether the mempool holds anything worth proposing.
    fn has_pending_transactions(&self) -> bool {
        true
    }
}


#[cfg(test)]
mod tests {
    use {super::testing::MemoryBlockManager, super::*, crate::validator_set::ValidatorSet};

    #[test]
    fn test_memory_block_manager_round_trip() {
        let mut bm = MemoryBlockManager::new(ValidatorSet::new(vec![]));
        let candidate = bm.propose(3, &CommitVoteList::empty()).unwrap();
        assert_eq!(candidate.height, 3);
        let imported = bm.import(3, &candidate.bytes).unwrap();
        assert_eq!(imported.id, candidate.id);
        bm.finalize(&imported, &CommitVoteList::empty()).unwrap();
        assert_eq!(bm.finalized, vec![(3, candidate.id)]);
    }

    #[test]
    fn test_memory_block_manager_rejects_garbage() {
        let mut bm = MemoryBlockManager::new(ValidatorSet::new(vec![]));
        assert!(matches!(
            bm.import(3, b"not the block"),
            Err(BlockError::Rejected(_))
        ));
    }
}
