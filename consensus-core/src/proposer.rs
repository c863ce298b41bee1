//! Proposer selection.
//!
//! Deterministic round-robin over the validator list: the proposer for
//! `(height, round)` is `validators[(height + round) mod n]`. Every node
//! must agree on the proposer for any coordinate, so selection depends only
//! on the shared validator order.

use {crate::validator_set::ValidatorSet, solana_pubkey::Pubkey};

/// The proposer for the given height and round, or `None` for an empty set.
pub fn proposer_for_round(
    validator_set: &ValidatorSet,
    height: u64,
    round: u32,
) -> Option<Pubkey> {
    if validator_set.is_empty() {
        return None;
    }
    let idx = (height.wrapping_add(round as u64) % validator_set.len() as u64) as usize;
    validator_set.get(idx).copied()
}

/// Check if `identity` proposes at `(height, round)`.
pub fn is_proposer(
    validator_set: &ValidatorSet,
    identity: &Pubkey,
    height: u64,
    round: u32,
) -> bool {
    proposer_for_round(validator_set, height, round)
        .map(|p| p == *identity)
        .unwrap_or(false)
}
