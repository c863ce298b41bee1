//! Vote sets for every round of one height.
//!
//! The state machine tallies prevotes and precommits per round; peers may
//! be several rounds ahead or behind, so every round's sets are kept until
//! pruned. One round can be protected from pruning (the commit round, whose
//! precommits answer catch-up peers).

use {
    crate::{
        bit_array::BitArray,
        vote::{Vote, VoteType},
        vote_set::VoteSet,
    },
    solana_hash::Hash,
    std::collections::BTreeMap,
};

#[derive(Debug, Clone)]
pub struct RoundVotes {
    pub prevotes: VoteSet,
    pub precommits: VoteSet,
}

impl RoundVotes {
    fn new(n_validators: usize) -> Self {
        Self {
            prevotes: VoteSet::new(n_validators),
            precommits: VoteSet::new(n_validators),
        }
    }
}

/// Round → (prevotes, precommits) for one height.
#[derive(Debug, Clone)]
pub struct HeightVoteSet {
    n_validators: usize,
    rounds: BTreeMap<u32, RoundVotes>,
}

impl HeightVoteSet {
    pub fn new(n_validators: usize) -> Self {
        Self {
            n_validators,
            rounds: BTreeMap::new(),
        }
    }

    pub fn n_validators(&self) -> usize {
        self.n_validators
    }

    /// The vote set for `(round, vote_type)`, created on first use.
    pub fn votes_mut(&mut self, round: u32, vote_type: VoteType) -> &mut VoteSet {
        let entry = self
            .rounds
            .entry(round)
            .or_insert_with(|| RoundVotes::new(self.n_validators));
        match vote_type {
            VoteType::Prevote => &mut entry.prevotes,
            VoteType::Precommit => &mut entry.precommits,
        }
    }

    pub fn votes(&self, round: u32, vote_type: VoteType) -> Option<&VoteSet> {
        self.rounds.get(&round).map(|rv| match vote_type {
            VoteType::Prevote => &rv.prevotes,
            VoteType::Precommit => &rv.precommits,
        })
    }

    /// Route a vote into the slot for `index`.
    pub fn add(&mut self, index: usize, vote: Vote) -> bool {
        self.votes_mut(vote.round, vote.vote_type).add(index, vote)
    }

    /// Votes at `round` that the peer masks report missing. `pv_missing` and
    /// `pc_missing` select which prevote/precommit slots to include.
    pub fn missing_votes(
        &self,
        round: u32,
        pv_missing: &BitArray,
        pc_missing: &BitArray,
    ) -> Vec<Vote> {
        let Some(rv) = self.rounds.get(&round) else {
            return Vec::new();
        };
        let mut out: Vec<Vote> = Vec::new();
        for (idx, vote) in rv.prevotes.iter_indexed() {
            if pv_missing.get(idx) {
                out.push(vote.clone());
            }
        }
        for (idx, vote) in rv.precommits.iter_indexed() {
            if pc_missing.get(idx) {
                out.push(vote.clone());
            }
        }
        out
    }

    /// Skip-transaction evidence. Rounds `>= min_round` are scanned for a
    /// prevote set holding more than `threshold` (n/3) votes for the
    /// `nid_id` echo; the first such round's votes are returned. A single
    /// round keeps the evidence verifiable as one compact vote list.
    pub fn round_evidences(
        &self,
        min_round: u32,
        nid_id: &Hash,
        threshold: usize,
    ) -> Option<Vec<Vote>> {
        for rv in self.rounds.range(min_round..).map(|(_, rv)| rv) {
            let echoes: Vec<Vote> = rv
                .prevotes
                .round_evidences(nid_id)
                .into_iter()
                .cloned()
                .collect();
            if echoes.len() > threshold {
                return Some(echoes);
            }
        }
        None
    }

    /// Drop all rounds below `below`, except `protected`.
    pub fn prune(&mut self, below: u32, protected: u32) {
        self.rounds
            .retain(|&round, _| round >= below || round == protected);
    }

    /// Smallest round strictly above `above` whose combined distinct voter
    /// mass exceeds `threshold` (2n/3). Used for round skipping.
    pub fn round_with_vote_mass(&self, above: u32, threshold: usize) -> Option<u32> {
        for (&round, rv) in self.rounds.range(above.saturating_add(1)..) {
            let mut mask = rv.prevotes.mask().clone();
            mask.or_assign(rv.precommits.mask());
            if mask.count() > threshold {
                return Some(round);
            }
        }
        None
    }

    pub fn rounds(&self) -> impl Iterator<Item = (&u32, &RoundVotes)> {
        self.rounds.iter()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            part_set::{part_set_from_bytes, PartSetIdAndAppData},
            vote::{nid_block_id, RoundDecision},
        },
        solana_keypair::Keypair,
        solana_sha256_hasher::hashv,
    };

    fn decision_for(tag: &[u8]) -> RoundDecision {
        let ps = part_set_from_bytes(8, tag);
        RoundDecision::for_block(hashv(&[tag]), PartSetIdAndAppData::new(ps.id(), 0))
    }

    fn vote(kp: &Keypair, round: u32, vt: VoteType, decision: RoundDecision) -> Vote {
        Vote::new_signed(kp, vt, 1, round, decision, 0, vec![])
    }

    #[test]
    fn test_rounds_created_on_demand() {
        let mut hvs = HeightVoteSet::new(4);
        assert!(hvs.votes(0, VoteType::Prevote).is_none());
        hvs.votes_mut(2, VoteType::Precommit);
        assert!(hvs.votes(2, VoteType::Precommit).is_some());
        assert!(hvs.votes(2, VoteType::Prevote).is_some());
    }

    #[test]
    fn test_add_routes_by_round_and_type() {
        let kps: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let mut hvs = HeightVoteSet::new(4);
        let d = decision_for(b"x");
        hvs.add(0, vote(&kps[0], 0, VoteType::Prevote, d.clone()));
        hvs.add(1, vote(&kps[1], 1, VoteType::Precommit, d));
        assert_eq!(hvs.votes(0, VoteType::Prevote).unwrap().count(), 1);
        assert_eq!(hvs.votes(0, VoteType::Precommit).map(|v| v.count()), Some(0));
        assert_eq!(hvs.votes(1, VoteType::Precommit).unwrap().count(), 1);
    }

    #[test]
    fn test_missing_votes_honors_masks() {
        let kps: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let mut hvs = HeightVoteSet::new(4);
        let d = decision_for(b"x");
        for (i, kp) in kps.iter().enumerate() {
            hvs.add(i, vote(kp, 0, VoteType::Prevote, d.clone()));
        }
        hvs.add(0, vote(&kps[0], 0, VoteType::Precommit, d));

        // Peer is missing prevotes 2 and 3 and every precommit.
        let mut pv_missing = BitArray::new(4);
        pv_missing.set(2);
        pv_missing.set(3);
        let mut pc_missing = BitArray::new(4);
        pc_missing.flip();

        let missing = hvs.missing_votes(0, &pv_missing, &pc_missing);
        let prevotes = missing
            .iter()
            .filter(|v| v.vote_type == VoteType::Prevote)
            .count();
        let precommits = missing
            .iter()
            .filter(|v| v.vote_type == VoteType::Precommit)
            .count();
        assert_eq!(prevotes, 2);
        assert_eq!(precommits, 1);
    }

    #[test]
    fn test_round_evidences_finds_qualifying_round() {
        let kps: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let nid = nid_block_id(1);
        let mut hvs = HeightVoteSet::new(4);
        // Round 1 has only one echo; round 2 has two.
        hvs.add(0, vote(&kps[0], 1, VoteType::Prevote, RoundDecision::skip(nid)));
        hvs.add(0, vote(&kps[0], 2, VoteType::Prevote, RoundDecision::skip(nid)));
        hvs.add(1, vote(&kps[1], 2, VoteType::Prevote, RoundDecision::skip(nid)));
        // threshold n/3 = 1, need > 1 voters in a single round.
        let ev = hvs.round_evidences(1, &nid, 1).unwrap();
        assert_eq!(ev.len(), 2);
        assert!(ev.iter().all(|v| v.round == 2));
        // Rounds below min_round are ignored.
        assert!(hvs.round_evidences(3, &nid, 1).is_none());
    }

    #[test]
    fn test_prune_keeps_protected_round() {
        let mut hvs = HeightVoteSet::new(4);
        for r in 0..5 {
            hvs.votes_mut(r, VoteType::Prevote);
        }
        hvs.prune(4, 1);
        let kept: Vec<u32> = hvs.rounds().map(|(r, _)| *r).collect();
        assert_eq!(kept, vec![1, 4]);
    }

    #[test]
    fn test_round_with_vote_mass() {
        let kps: Vec<Keypair> = (0..4).map(|_| Keypair::new()).collect();
        let mut hvs = HeightVoteSet::new(4);
        let d = decision_for(b"x");
        // Round 3 accumulates three distinct voters across both types.
        hvs.add(0, vote(&kps[0], 3, VoteType::Prevote, d.clone()));
        hvs.add(1, vote(&kps[1], 3, VoteType::Prevote, d.clone()));
        hvs.add(2, vote(&kps[2], 3, VoteType::Precommit, d));
        assert_eq!(hvs.round_with_vote_mass(0, 2), Some(3));
        assert_eq!(hvs.round_with_vote_mass(3, 2), None);
    }
}
