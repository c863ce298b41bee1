//! Cost-bounded LRU for early block parts.
//!
//! Parts can arrive before the proposal that names their part set. They are
//! parked here, keyed by the first proof hash and the part index, until a
//! matching part set exists. The cost bound is the total payload bytes.

use {
    crate::part_set::Part,
    solana_hash::Hash,
    std::collections::{HashMap, VecDeque},
};

pub(crate) type PartKey = (Hash, u16);

/// Key for a part: its first proof hash (or default for single-part sets)
/// plus its index.
pub(crate) fn part_key(part: &Part) -> PartKey {
    (part.proof_anchor(), part.index())
}

#[derive(Debug)]
pub(crate) struct PartCache {
    entries: HashMap<PartKey, Part>,
    order: VecDeque<PartKey>,
    cost: usize,
    cost_limit: usize,
}

impl PartCache {
    pub fn new(cost_limit: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cost: 0,
            cost_limit,
        }
    }

    pub fn insert(&mut self, key: PartKey, part: Part) {
        if let Some(old) = self.entries.remove(&key) {
            self.cost -= old.data().len();
            self.order.retain(|k| *k != key);
        }
        self.cost += part.data().len();
        self.order.push_back(key);
        self.entries.insert(key, part);
        while self.cost > self.cost_limit {
            let Some(victim) = self.order.pop_front() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.cost -= evicted.data().len();
            }
        }
    }

    /// Remove and return every cached part that proves against `id`.
    /// Membership is decided by proof verification, so unrelated or forged
    /// parts stay cached.
    pub fn take_matching(&mut self, id: &crate::part_set::PartSetId) -> Vec<Part> {
        let keys: Vec<PartKey> = self
            .entries
            .iter()
            .filter(|(_, part)| part.verify(id).is_ok())
            .map(|(key, _)| *key)
            .collect();
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(part) = self.entries.remove(&key) {
                self.cost -= part.data().len();
                self.order.retain(|k| *k != key);
                out.push(part);
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn cost(&self) -> usize {
        self.cost
    }
}
