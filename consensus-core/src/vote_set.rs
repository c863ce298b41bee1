//! Per-round vote tally.
//!
//! A `VoteSet` holds one slot per validator for a single (height, round,
//! vote type) and counts occurrences of each round-decision digest. The
//! counters, the presence mask and the slots move together: at most one
//! vote per slot is ever counted, and replacing a slot's vote updates the
//! tally atomically.

use {
    crate::{
        bit_array::BitArray,
        part_set::PartSetIdAndAppData,
        vote::{RoundDecision, Vote},
    },
    solana_hash::Hash,
    std::collections::HashMap,
};

#[derive(Debug, Clone)]
struct DigestCounter {
    decision: RoundDecision,
    count: usize,
}

/// Vote slots plus a digest tally for one (height, round, type).
#[derive(Debug, Clone)]
pub struct VoteSet {
    votes: Vec<Option<Vote>>,
    mask: BitArray,
    counters: HashMap<Hash, DigestCounter>,
    /// Digest with the highest counter, kept current on every bump.
    max_digest: Option<Hash>,
}

impl VoteSet {
    pub fn new(n_validators: usize) -> Self {
        Self {
            votes: vec![None; n_validators],
            mask: BitArray::new(n_validators),
            counters: HashMap::new(),
            max_digest: None,
        }
    }

    pub fn n_validators(&self) -> usize {
        self.votes.len()
    }

    /// Number of counted votes.
    pub fn count(&self) -> usize {
        self.mask.count()
    }

    pub fn mask(&self) -> &BitArray {
        &self.mask
    }

    pub fn get(&self, index: usize) -> Option<&Vote> {
        self.votes.get(index).and_then(|v| v.as_ref())
    }

    /// Add or replace the vote in `index`'s slot.
    ///
    /// Returns `true` iff the tally changed. A duplicate of the slot's
    /// current decision is a no-op, and once a digest holds a two-thirds
    /// decision, slots that voted for it are never overwritten.
    pub fn add(&mut self, index: usize, vote: Vote) -> bool {
        if index >= self.votes.len() {
            return false;
        }
        let digest = vote.decision_digest();
        if let Some(existing) = &self.votes[index] {
            let old_digest = existing.decision_digest();
            if old_digest == digest {
                return false;
            }
            if let Some(winner) = self.over_two_thirds_digest() {
                if old_digest == winner {
                    return false;
                }
            }
            self.decrement(&old_digest);
        }
        self.increment(digest, &vote.decision);
        self.mask.set(index);
        self.votes[index] = Some(vote);
        true
    }

    /// `count > 2n/3` over all decisions combined.
    pub fn has_over_two_thirds(&self) -> bool {
        self.count() > self.votes.len() * 2 / 3
    }

    fn over_two_thirds_digest(&self) -> Option<Hash> {
        let digest = self.max_digest?;
        let counter = self.counters.get(&digest)?;
        (counter.count > self.votes.len() * 2 / 3).then_some(digest)
    }

    /// The decision holding more than two thirds of the slots, if any.
    /// A nil decision is a valid winner (polka for nil).
    pub fn over_two_thirds_decision(&self) -> Option<&RoundDecision> {
        let digest = self.over_two_thirds_digest()?;
        self.counters.get(&digest).map(|c| &c.decision)
    }

    /// Part-set id of the winning decision: `Some(None)` is a polka for
    /// nil, `None` means no decision yet.
    pub fn over_two_thirds_part_set_id(&self) -> Option<Option<PartSetIdAndAppData>> {
        self.over_two_thirds_decision()
            .map(|decision| decision.part_set_id)
    }

    /// Votes present here but absent from `peer_mask`.
    pub fn votes_not_in(&self, peer_mask: &BitArray) -> Vec<&Vote> {
        self.votes
            .iter()
            .enumerate()
            .filter(|(i, _)| self.mask.get(*i) && !peer_mask.get(*i))
            .filter_map(|(_, v)| v.as_ref())
            .collect()
    }

    /// Votes whose decision is the skip echo for `nid_id` (nil part set).
    pub fn round_evidences(&self, nid_id: &Hash) -> Vec<&Vote> {
        self.votes
            .iter()
            .flatten()
            .filter(|v| v.decision.part_set_id.is_none() && v.decision.block_id == Some(*nid_id))
            .collect()
    }

    /// Clones of the votes matching the winning non-nil decision, for a
    /// commit-vote list. `None` without a concrete winner.
    pub fn commit_votes(&self) -> Option<Vec<Vote>> {
        let digest = self.over_two_thirds_digest()?;
        let decision = &self.counters.get(&digest)?.decision;
        if decision.is_nil() {
            return None;
        }
        Some(
            self.votes
                .iter()
                .flatten()
                .filter(|v| v.decision_digest() == digest)
                .cloned()
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vote> {
        self.votes.iter().flatten()
    }

    pub fn iter_indexed(&self) -> impl Iterator<Item = (usize, &Vote)> {
        self.votes
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_ref().map(|v| (i, v)))
    }

    fn increment(&mut self, digest: Hash, decision: &RoundDecision) {
        let counter = self
            .counters
            .entry(digest)
            .or_insert_with(|| DigestCounter {
                decision: decision.clone(),
                count: 0,
            });
        counter.count += 1;
        let count = counter.count;
        let max_count = self
            .max_digest
            .and_then(|d| self.counters.get(&d))
            .map(|c| c.count)
            .unwrap_or(0);
        if count >= max_count {
            self.max_digest = Some(digest);
        }
    }

    fn decrement(&mut self, digest: &Hash) {
        let emptied = match self.counters.get_mut(digest) {
            Some(counter) => {
                counter.count -= 1;
                counter.count == 0
            }
            None => false,
        };
        if emptied {
            self.counters.remove(digest);
        }
        if self.max_digest == Some(*digest) {
            self.max_digest = self
                .counters
                .iter()
                .max_by_key(|(_, c)| c.count)
                .map(|(d, _)| *d);
        }
    }

    #[cfg(test)]
    fn counter_sum(&self) -> usize {
        self.counters.values().map(|c| c.count).sum()
    }

    #[cfg(test)]
    fn max_counter(&self) -> usize {
        self.counters.values().map(|c| c.count).max().unwrap_or(0)
    }
}
