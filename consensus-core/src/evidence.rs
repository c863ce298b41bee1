//! Double-sign detection.
//!
//! A validator must not sign two different proposals at the same
//! (height, round), nor two votes of the same type with different round
//! decisions. First signatures are remembered in a size-capped cache with
//! random eviction; a conflicting second signature yields a conflict pair
//! that can be submitted for slashing. The RNG is injectable so eviction is
//! deterministic under test.

use {
    crate::vote::{Vote, VoteType},
    rand::{rngs::SmallRng, Rng, SeedableRng},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signature::Signature,
    std::collections::HashMap,
};

const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// What kind of message was double-signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsType {
    Proposal,
    Vote,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DsKey {
    ds_type: DsType,
    vote_type: Option<VoteType>,
    address: Pubkey,
    height: u64,
    round: u32,
}

#[derive(Debug, Clone)]
struct DsEntry {
    digest: Hash,
    signature: Signature,
}

/// A detected conflict: one signer, one coordinate, two digests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoubleSignConflict {
    pub ds_type: DsType,
    pub vote_type: Option<VoteType>,
    pub signer: Pubkey,
    pub height: u64,
    pub round: u32,
    pub first_digest: Hash,
    pub first_signature: Signature,
    pub second_digest: Hash,
    pub second_signature: Signature,
}

/// Size-capped map that evicts a uniformly random entry when full.
#[derive(Debug)]
struct RandomEvictionCache<K, V> {
    map: HashMap<K, V>,
    keys: Vec<K>,
    capacity: usize,
    rng: SmallRng,
}

impl<K: std::hash::Hash + Eq + Clone, V> RandomEvictionCache<K, V> {
    fn new(capacity: usize, rng: SmallRng) -> Self {
        Self {
            map: HashMap::with_capacity(capacity),
            keys: Vec::with_capacity(capacity),
            capacity,
            rng,
        }
    }

    fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if self.map.contains_key(&key) {
            self.map.insert(key, value);
            return;
        }
        if self.keys.len() >= self.capacity && !self.keys.is_empty() {
            let victim = self.rng.random_range(0..self.keys.len());
            let evicted = self.keys.swap_remove(victim);
            self.map.remove(&evicted);
        }
        self.keys.push(key.clone());
        self.map.insert(key, value);
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Detects and records double-sign conflicts.
#[derive(Debug)]
pub struct DoubleSignDetector {
    cache: RandomEvictionCache<DsKey, DsEntry>,
    conflicts: Vec<DoubleSignConflict>,
}

impl DoubleSignDetector {
    pub fn new() -> Self {
        Self::with_rng(DEFAULT_CACHE_CAPACITY, SmallRng::from_os_rng())
    }

    /// Capacity- and RNG-injected constructor for deterministic tests.
    pub fn with_rng(capacity: usize, rng: SmallRng) -> Self {
        Self {
            cache: RandomEvictionCache::new(capacity, rng),
            conflicts: Vec::new(),
        }
    }

    /// Record a vote signature; returns a conflict if this signer already
    /// signed a different decision at the same coordinate.
    pub fn record_vote(&mut self, vote: &Vote) -> Option<DoubleSignConflict> {
        self.record(
            DsKey {
                ds_type: DsType::Vote,
                vote_type: Some(vote.vote_type),
                address: vote.voter,
                height: vote.height,
                round: vote.round,
            },
            vote.decision_digest(),
            vote.signature,
        )
    }

    /// Record a proposal signature by its message digest.
    pub fn record_proposal(
        &mut self,
        proposer: Pubkey,
        height: u64,
        round: u32,
        digest: Hash,
        signature: Signature,
    ) -> Option<DoubleSignConflict> {
        self.record(
            DsKey {
                ds_type: DsType::Proposal,
                vote_type: None,
                address: proposer,
                height,
                round,
            },
            digest,
            signature,
        )
    }

    fn record(
        &mut self,
        key: DsKey,
        digest: Hash,
        signature: Signature,
    ) -> Option<DoubleSignConflict> {
        if let Some(entry) = self.cache.get(&key) {
            if entry.digest == digest {
                return None;
            }
            let conflict = DoubleSignConflict {
                ds_type: key.ds_type,
                vote_type: key.vote_type,
                signer: key.address,
                height: key.height,
                round: key.round,
                first_digest: entry.digest,
                first_signature: entry.signature,
                second_digest: digest,
                second_signature: signature,
            };
            self.conflicts.push(conflict.clone());
            return Some(conflict);
        }
        self.cache.insert(key, DsEntry { digest, signature });
        None
    }

    pub fn conflicts(&self) -> &[DoubleSignConflict] {
        &self.conflicts
    }

    /// Take all recorded conflicts for submission.
    pub fn drain_conflicts(&mut self) -> Vec<DoubleSignConflict> {
        std::mem::take(&mut self.conflicts)
    }

    pub fn has_evidence_against(&self, signer: &Pubkey) -> bool {
        self.conflicts.iter().any(|c| c.signer == *signer)
    }

    pub fn tracked(&self) -> usize {
        self.cache.len()
    }
}

impl Default for DoubleSignDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            part_set::{part_set_from_bytes, PartSetIdAndAppData},
            vote::RoundDecision,
        },
        solana_keypair::Keypair,
        solana_sha256_hasher::hashv,
        solana_signer::Signer,
    };

    fn decision_for(tag: &[u8]) -> RoundDecision {
        let ps = part_set_from_bytes(8, tag);
        RoundDecision::for_block(hashv(&[tag]), PartSetIdAndAppData::new(ps.id(), 0))
    }

    fn vote(kp: &Keypair, h: u64, r: u32, vt: VoteType, d: RoundDecision) -> Vote {
        Vote::new_signed(kp, vt, h, r, d, 0, vec![])
    }

    fn detector() -> DoubleSignDetector {
        DoubleSignDetector::with_rng(64, SmallRng::seed_from_u64(7))
    }

    #[test]
    fn test_conflicting_precommits_detected() {
        let kp = Keypair::new();
        let mut det = detector();
        let v1 = vote(&kp, 5, 0, VoteType::Precommit, decision_for(b"a"));
        let v2 = vote(&kp, 5, 0, VoteType::Precommit, decision_for(b"b"));
        assert!(det.record_vote(&v1).is_none());
        let conflict = det.record_vote(&v2).unwrap();
        assert_eq!(conflict.signer, kp.pubkey());
        assert_eq!(conflict.height, 5);
        assert_eq!(conflict.round, 0);
        assert_ne!(conflict.first_digest, conflict.second_digest);
        assert!(det.has_evidence_against(&kp.pubkey()));
    }

    #[test]
    fn test_duplicate_vote_is_not_evidence() {
        let kp = Keypair::new();
        let mut det = detector();
        let v = vote(&kp, 5, 0, VoteType::Prevote, decision_for(b"a"));
        assert!(det.record_vote(&v).is_none());
        assert!(det.record_vote(&v).is_none());
        assert!(det.conflicts().is_empty());
    }

    #[test]
    fn test_types_and_rounds_are_separate_keys() {
        let kp = Keypair::new();
        let mut det = detector();
        let a = decision_for(b"a");
        let b = decision_for(b"b");
        assert!(det
            .record_vote(&vote(&kp, 5, 0, VoteType::Prevote, a.clone()))
            .is_none());
        // Different type, different round, different height: all fine.
        assert!(det
            .record_vote(&vote(&kp, 5, 0, VoteType::Precommit, b.clone()))
            .is_none());
        assert!(det
            .record_vote(&vote(&kp, 5, 1, VoteType::Prevote, b.clone()))
            .is_none());
        assert!(det
            .record_vote(&vote(&kp, 6, 0, VoteType::Prevote, b))
            .is_none());
        assert!(det.conflicts().is_empty());
    }

    #[test]
    fn test_nil_vs_value_is_evidence() {
        let kp = Keypair::new();
        let mut det = detector();
        let v1 = vote(&kp, 5, 0, VoteType::Prevote, RoundDecision::nil());
        let v2 = vote(&kp, 5, 0, VoteType::Prevote, decision_for(b"a"));
        assert!(det.record_vote(&v1).is_none());
        assert!(det.record_vote(&v2).is_some());
    }

    #[test]
    fn test_proposal_double_sign() {
        let kp = Keypair::new();
        let mut det = detector();
        let d1 = hashv(&[b"proposal one"]);
        let d2 = hashv(&[b"proposal two"]);
        assert!(det
            .record_proposal(kp.pubkey(), 5, 0, d1, Signature::default())
            .is_none());
        let conflict = det
            .record_proposal(kp.pubkey(), 5, 0, d2, Signature::default())
            .unwrap();
        assert_eq!(conflict.ds_type, DsType::Proposal);
        assert_eq!(conflict.vote_type, None);
    }

    #[test]
    fn test_cache_capacity_enforced() {
        let kp = Keypair::new();
        let mut det = DoubleSignDetector::with_rng(8, SmallRng::seed_from_u64(1));
        for h in 0..100u64 {
            det.record_vote(&vote(&kp, h, 0, VoteType::Prevote, decision_for(b"a")));
        }
        assert!(det.tracked() <= 8);
    }

    #[test]
    fn test_eviction_is_deterministic_with_seeded_rng() {
        let kp = Keypair::new();
        let run = |seed: u64| {
            let mut det = DoubleSignDetector::with_rng(4, SmallRng::seed_from_u64(seed));
            for h in 0..20u64 {
                det.record_vote(&vote(&kp, h, 0, VoteType::Prevote, decision_for(b"a")));
            }
            // Which first-signatures survived decides which heights can
            // still produce conflicts.
            let mut hits = Vec::new();
            for h in 0..20u64 {
                if det
                    .record_vote(&vote(&kp, h, 0, VoteType::Prevote, decision_for(b"b")))
                    .is_some()
                {
                    hits.push(h);
                }
            }
            hits
        };
        assert_eq!(run(3), run(3));
    }

    #[test]
    fn test_drain_conflicts() {
        let kp = Keypair::new();
        let mut det = detector();
        det.record_vote(&vote(&kp, 5, 0, VoteType::Prevote, decision_for(b"a")));
        det.record_vote(&vote(&kp, 5, 0, VoteType::Prevote, decision_for(b"b")));
        assert_eq!(det.drain_conflicts().len(), 1);
        assert!(det.conflicts().is_empty());
    }
}
