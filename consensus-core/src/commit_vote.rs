//! Commit-vote lists.
//!
//! The precommits that finalized a block travel with the next block as a
//! compact single-round list. Verification rebuilds each full precommit
//! from the block's identity and checks signer membership, distinctness and
//! the two-thirds threshold. The skip variant carries nid-echo votes and
//! needs only one third plus one.

use {
    crate::{
        bit_array::BitArray,
        part_set::PartSetIdAndAppData,
        validator_set::ValidatorSet,
        vote::{nid_block_id, NtsVoteBase, RoundDecision, Vote, VoteType},
        vote_list::VoteList,
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    thiserror::Error,
};

/// Verifies NTS proof parts against the proof context carried by the
/// previous block's result. Out-of-scope machinery lives behind this seam.
pub trait ProofContext {
    fn verify_proof_part(&self, base: &NtsVoteBase, proof_part: &[u8], voter: &Pubkey) -> bool;
}

/// A proof context for chains that publish no BTP messages; accepts only
/// the absence of proof parts.
pub struct NoProofContext;

impl ProofContext for NoProofContext {
    fn verify_proof_part(&self, _base: &NtsVoteBase, _proof_part: &[u8], _voter: &Pubkey) -> bool {
        false
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommitVoteError {
    #[error("empty vote input")]
    Empty,
    #[error("votes disagree on the round decision")]
    MixedDecisions,
    #[error("vote {0} is not a precommit")]
    NotPrecommit(usize),
    #[error("signature of item {0} does not verify")]
    BadSignature(usize),
    #[error("signer {0} is not a validator")]
    NotValidator(Pubkey),
    #[error("duplicated signer {0}")]
    DuplicatedSigner(Pubkey),
    #[error("votes ({voted}) <= 2/3 of validators ({validators})")]
    NotEnoughVotes { voted: usize, validators: usize },
    #[error("skip votes ({voted}) <= 1/3 of validators ({validators})")]
    NotEnoughSkipVotes { voted: usize, validators: usize },
    #[error("skip votes span multiple rounds")]
    MixedRounds,
    #[error("NTS proof part of item {0} does not verify")]
    BadProofPart(usize),
}

/// One signer's contribution to a commit-vote list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVoteItem {
    pub voter: Pubkey,
    pub timestamp: i64,
    pub signature: Signature,
    pub nts_proof_parts: Vec<Vec<u8>>,
}

/// The precommits that finalized one block, stripped to one round and one
/// part-set id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitVoteList {
    pub round: u32,
    pub block_part_set_id: Option<PartSetIdAndAppData>,
    pub items: Vec<CommitVoteItem>,
}

impl CommitVoteList {
    /// An empty list, valid only for the genesis block.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compress precommit votes that share one round decision.
    pub fn from_votes(votes: &[Vote]) -> Result<Self, CommitVoteError> {
        let first = votes.first().ok_or(CommitVoteError::Empty)?;
        let digest = first.decision_digest();
        let mut items = Vec::with_capacity(votes.len());
        for (i, vote) in votes.iter().enumerate() {
            if vote.vote_type != VoteType::Precommit {
                return Err(CommitVoteError::NotPrecommit(i));
            }
            if vote.decision_digest() != digest || vote.round != first.round {
                return Err(CommitVoteError::MixedDecisions);
            }
            items.push(CommitVoteItem {
                voter: vote.voter,
                timestamp: vote.timestamp,
                signature: vote.signature,
                nts_proof_parts: vote.nts_proof_parts.clone(),
            });
        }
        Ok(Self {
            round: first.round,
            block_part_set_id: first.decision.part_set_id,
            items,
        })
    }

    /// Rebuild the full precommit for item `i` against a block identity.
    pub fn vote_at(
        &self,
        index: usize,
        height: u64,
        block_id: Hash,
        nts_vote_bases: &[NtsVoteBase],
    ) -> Option<Vote> {
        let item = self.items.get(index)?;
        Some(Vote {
            height,
            round: self.round,
            vote_type: VoteType::Precommit,
            decision: RoundDecision {
                block_id: Some(block_id),
                part_set_id: self.block_part_set_id,
                nts_vote_bases: nts_vote_bases.to_vec(),
            },
            timestamp: item.timestamp,
            nts_proof_parts: item.nts_proof_parts.clone(),
            voter: item.voter,
            signature: item.signature,
        })
    }

    /// Verify the list against the block it claims to finalize.
    ///
    /// Returns the mask of validator slots that signed. An empty list is
    /// accepted only for height 0 or an empty validator set.
    pub fn verify(
        &self,
        height: u64,
        block_id: Hash,
        nts_vote_bases: &[NtsVoteBase],
        validators: &ValidatorSet,
        proof_context: &dyn ProofContext,
    ) -> Result<BitArray, CommitVoteError> {
        if height == 0 || validators.is_empty() {
            return if self.items.is_empty() {
                Ok(BitArray::new(validators.len()))
            } else {
                Err(CommitVoteError::NotEnoughVotes {
                    voted: self.items.len(),
                    validators: validators.len(),
                })
            };
        }
        let mut mask = BitArray::new(validators.len());
        for (i, item) in self.items.iter().enumerate() {
            let vote = self
                .vote_at(i, height, block_id, nts_vote_bases)
                .ok_or(CommitVoteError::Empty)?;
            vote.verify()
                .map_err(|_| CommitVoteError::BadSignature(i))?;
            let index = validators
                .index_of(&item.voter)
                .ok_or(CommitVoteError::NotValidator(item.voter))?;
            if mask.get(index) {
                return Err(CommitVoteError::DuplicatedSigner(item.voter));
            }
            mask.set(index);
            for (base, part) in nts_vote_bases.iter().zip(&item.nts_proof_parts) {
                if !proof_context.verify_proof_part(base, part, &item.voter) {
                    return Err(CommitVoteError::BadProofPart(i));
                }
            }
        }
        if self.items.len() <= validators.two_thirds_threshold() {
            return Err(CommitVoteError::NotEnoughVotes {
                voted: self.items.len(),
                validators: validators.len(),
            });
        }
        Ok(mask)
    }

    /// Expand back into a full vote list (WAL replay, peer catch-up).
    pub fn to_vote_list(
        &self,
        height: u64,
        block_id: Hash,
        nts_vote_bases: &[NtsVoteBase],
    ) -> VoteList {
        let mut list = VoteList::new();
        for i in 0..self.items.len() {
            if let Some(vote) = self.vote_at(i, height, block_id, nts_vote_bases) {
                list.add(&vote);
            }
        }
        list
    }

    /// Median of the item timestamps; the finalized block's time source.
    pub fn timestamp(&self) -> i64 {
        if self.items.is_empty() {
            return 0;
        }
        let mut ts: Vec<i64> = self.items.iter().map(|item| item.timestamp).collect();
        ts.sort_unstable();
        let n = ts.len();
        if n % 2 == 1 {
            ts[n / 2]
        } else {
            (ts[n / 2 - 1] + ts[n / 2]) / 2
        }
    }
}

/// Votes that skip a stalled transaction: nid echoes with no part set,
/// all from one round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipCommitVoteList {
    pub round: u32,
    pub vote_type: VoteType,
    pub items: Vec<CommitVoteItem>,
}

impl SkipCommitVoteList {
    /// Compress votes carrying the nid echo. All votes must share one
    /// round and one decision.
    pub fn from_votes(votes: &[Vote]) -> Result<Self, CommitVoteError> {
        let first = votes.first().ok_or(CommitVoteError::Empty)?;
        let digest = first.decision_digest();
        let mut items = Vec::with_capacity(votes.len());
        for vote in votes {
            if vote.round != first.round || vote.vote_type != first.vote_type {
                return Err(CommitVoteError::MixedRounds);
            }
            if vote.decision_digest() != digest {
                return Err(CommitVoteError::MixedDecisions);
            }
            items.push(CommitVoteItem {
                voter: vote.voter,
                timestamp: vote.timestamp,
                signature: vote.signature,
                nts_proof_parts: Vec::new(),
            });
        }
        Ok(Self {
            round: first.round,
            vote_type: first.vote_type,
            items,
        })
    }

    /// Verify against the stalled height. Signer rules match the block
    /// list; the threshold is one third.
    pub fn verify(
        &self,
        height: u64,
        nid: u32,
        validators: &ValidatorSet,
    ) -> Result<BitArray, CommitVoteError> {
        let mut mask = BitArray::new(validators.len());
        let decision = RoundDecision::skip(nid_block_id(nid));
        for (i, item) in self.items.iter().enumerate() {
            let vote = Vote {
                height,
                round: self.round,
                vote_type: self.vote_type,
                decision: decision.clone(),
                timestamp: item.timestamp,
                nts_proof_parts: Vec::new(),
                voter: item.voter,
                signature: item.signature,
            };
            vote.verify()
                .map_err(|_| CommitVoteError::BadSignature(i))?;
            let index = validators
                .index_of(&item.voter)
                .ok_or(CommitVoteError::NotValidator(item.voter))?;
            if mask.get(index) {
                return Err(CommitVoteError::DuplicatedSigner(item.voter));
            }
            mask.set(index);
        }
        if self.items.len() <= validators.one_third_threshold() {
            return Err(CommitVoteError::NotEnoughSkipVotes {
                voted: self.items.len(),
                validators: validators.len(),
            });
        }
        Ok(mask)
    }
}
