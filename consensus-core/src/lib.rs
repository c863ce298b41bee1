//! Tessera BFT consensus core.
//!
//! A Tendermint-style replicated state machine that drives a permissioned
//! validator set through propose → prevote → precommit to agree, one height
//! at a time, on an ordered sequence of blocks:
//!
//! 1. **Propose** — the round-robin proposer fragments its block into
//!    Merkle-proved parts and announces the part-set id.
//! 2. **Prevote** — validators vote on the proposal (or nil) once the parts
//!    assemble and the block validates.
//! 3. **Precommit** — a two-thirds prevote decision locks the block and is
//!    answered with precommits.
//! 4. **Commit** — a two-thirds precommit decision finalizes the block; its
//!    commit votes travel with the next block.
//!
//! Every significant transition is written ahead to a CRC-checksummed,
//! rotating WAL, so a crashed validator replays into the same externally
//! visible state (same signatures; peers deduplicate). Block construction,
//! validation and storage stay behind the [`block::BlockManager`] seam; the
//! wallet is any [`solana_signer::Signer`]; networking lives in the
//! companion `tessera-consensus-net` crate.

pub mod bit_array;
pub mod block;
mod cache;
pub mod commit_vote;
pub mod config;
pub mod engine;
pub mod evidence;
pub mod height_vote_set;
pub mod part_set;
pub mod proposer;
pub mod service;
pub mod timeout;
pub mod types;
pub mod validator_set;
pub mod vote;
pub mod vote_list;
pub mod vote_set;
pub mod wal;

// Re-exports for convenience
pub use {
    bit_array::BitArray,
    block::{BlockCandidate, BlockError, BlockManager},
    commit_vote::{CommitVoteList, ProofContext, SkipCommitVoteList},
    config::ConsensusConfig,
    engine::{read_wal, ConsensusEngine, ConsensusError, RecoveredWal},
    evidence::{DoubleSignConflict, DoubleSignDetector},
    height_vote_set::HeightVoteSet,
    part_set::{Part, PartSet, PartSetBuffer, PartSetError, PartSetId, PartSetIdAndAppData},
    proposer::{is_proposer, proposer_for_round},
    service::{ConsensusEvent, ConsensusService},
    timeout::TimeoutScheduler,
    types::{
        BlockPartMessage, CommitWalRecord, CommittedBlock, ConsensusMessage, EngineOutput,
        EngineRequest, LockWalRecord, PeerRoundState, ProposalMessage, RoundWalRecord, SkipPatch,
        Step,
    },
    validator_set::ValidatorSet,
    vote::{NtsVoteBase, RoundDecision, Vote, VoteType},
    vote_list::VoteList,
    vote_set::VoteSet,
    wal::{ConsensusWal, WalConfig, WalError, WalReader, WalWriter},
};
