//! Validator list management.
//!
//! An ordered list of validator identities with constant-time index lookup.
//! The order is the one carried by the finalized block that installed the
//! set; every node must use the same order for proposer rotation and for
//! vote-slot indexing.

use {
    serde::{Deserialize, Serialize},
    solana_pubkey::Pubkey,
    std::collections::HashMap,
};

/// An ordered set of validators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Pubkey>,
    #[serde(skip)]
    index: HashMap<Pubkey, usize>,
}

impl ValidatorSet {
    /// Create a validator set, preserving order and dropping duplicates.
    pub fn new(validators: Vec<Pubkey>) -> Self {
        let mut unique = Vec::with_capacity(validators.len());
        let mut index = HashMap::with_capacity(validators.len());
        for pk in validators {
            if !index.contains_key(&pk) {
                index.insert(pk, unique.len());
                unique.push(pk);
            }
        }
        Self {
            validators: unique,
            index,
        }
    }

    /// Rebuild the lookup table after deserialization.
    pub fn reindex(&mut self) {
        self.index = self
            .validators
            .iter()
            .enumerate()
            .map(|(i, pk)| (*pk, i))
            .collect();
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Slot index of a validator, or `None` if not in the set.
    pub fn index_of(&self, pubkey: &Pubkey) -> Option<usize> {
        self.index.get(pubkey).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Pubkey> {
        self.validators.get(index)
    }

    pub fn contains(&self, pubkey: &Pubkey) -> bool {
        self.index.contains_key(pubkey)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pubkey> {
        self.validators.iter()
    }

    /// Count strictly required for a two-thirds decision: `count > 2n/3`.
    pub fn two_thirds_threshold(&self) -> usize {
        self.validators.len() * 2 / 3
    }

    /// Count strictly required for skip evidence: `count > n/3`.
    pub fn one_third_threshold(&self) -> usize {
        self.validators.len() / 3
    }
}

impl PartialEq for ValidatorSet {
    fn eq(&self, other: &Self) -> bool {
        self.validators == other.validators
    }
}

impl Eq for ValidatorSet {}

#[cfg(test)]
mod tests {
    use {super::*, solana_keypair::Keypair, solana_signer::Signer};

    fn make_pubkeys(n: usize) -> Vec<Pubkey> {
        (0..n).map(|_| Keypair::new().pubkey()).collect()
    }

    #[test]
    fn test_order_preserved() {
        let pks = make_pubkeys(4);
        let vs = ValidatorSet::new(pks.clone());
        for (i, pk) in pks.iter().enumerate() {
            assert_eq!(vs.get(i), Some(pk));
            assert_eq!(vs.index_of(pk), Some(i));
        }
    }

    #[test]
    fn test_duplicates_dropped() {
        let pks = make_pubkeys(2);
        let vs = ValidatorSet::new(vec![pks[0], pks[1], pks[0]]);
        assert_eq!(vs.len(), 2);
        assert_eq!(vs.index_of(&pks[0]), Some(0));
    }

    #[test]
    fn test_unknown_validator() {
        let vs = ValidatorSet::new(make_pubkeys(3));
        let stranger = Keypair::new().pubkey();
        assert_eq!(vs.index_of(&stranger), None);
        assert!(!vs.contains(&stranger));
    }

    #[test]
    fn test_thresholds() {
        let vs = ValidatorSet::new(make_pubkeys(4));
        // 4 validators: a decision needs more than 2, skip evidence more than 1.
        assert_eq!(vs.two_thirds_threshold(), 2);
        assert_eq!(vs.one_third_threshold(), 1);

        let vs7 = ValidatorSet::new(make_pubkeys(7));
        assert_eq!(vs7.two_thirds_threshold(), 4);
        assert_eq!(vs7.one_third_threshold(), 2);
    }

    #[test]
    fn test_reindex_after_deserialize() {
        let pks = make_pubkeys(3);
        let vs = ValidatorSet::new(pks.clone());
        let bytes = bincode::serialize(&vs).unwrap();
        let mut back: ValidatorSet = bincode::deserialize(&bytes).unwrap();
        back.reindex();
        assert_eq!(back, vs);
        assert_eq!(back.index_of(&pks[2]), Some(2));
    }
}
