//! Compressed vote bundles.
//!
//! Catch-up traffic moves many votes that differ only in voter, timestamp
//! and signature. A `VoteList` stores each distinct vote base (height,
//! round, type, decision) once and references it from compact items; the
//! list round-trips to exactly the votes that were added.

use {
    crate::vote::{RoundDecision, Vote, VoteType},
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    solana_signature::Signature,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VotePrototype {
    height: u64,
    round: u32,
    vote_type: VoteType,
    decision: RoundDecision,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct VoteListItem {
    prototype: u16,
    voter: Pubkey,
    timestamp: i64,
    signature: Signature,
    nts_proof_parts: Vec<Vec<u8>>,
}

/// A sequence of votes, prototype-compressed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteList {
    prototypes: Vec<VotePrototype>,
    items: Vec<VoteListItem>,
}

impl VoteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn add(&mut self, vote: &Vote) {
        let proto = VotePrototype {
            height: vote.height,
            round: vote.round,
            vote_type: vote.vote_type,
            decision: vote.decision.clone(),
        };
        let idx = match self.prototypes.iter().position(|p| *p == proto) {
            Some(i) => i,
            None => {
                self.prototypes.push(proto);
                self.prototypes.len() - 1
            }
        };
        self.items.push(VoteListItem {
            prototype: idx as u16,
            voter: vote.voter,
            timestamp: vote.timestamp,
            signature: vote.signature,
            nts_proof_parts: vote.nts_proof_parts.clone(),
        });
    }

    /// Reconstruct the i-th vote.
    pub fn get(&self, index: usize) -> Option<Vote> {
        let item = self.items.get(index)?;
        let proto = self.prototypes.get(item.prototype as usize)?;
        Some(Vote {
            height: proto.height,
            round: proto.round,
            vote_type: proto.vote_type,
            decision: proto.decision.clone(),
            timestamp: item.timestamp,
            nts_proof_parts: item.nts_proof_parts.clone(),
            voter: item.voter,
            signature: item.signature,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Vote> + '_ {
        (0..self.items.len()).filter_map(|i| self.get(i))
    }

    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Vote>) -> Self {
        let mut list = Self::new();
        for vote in votes {
            list.add(vote);
        }
        list
    }
}
