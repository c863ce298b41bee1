//! Typed consensus votes.
//!
//! A vote binds a validator to a *round decision*: the triple of block id,
//! block part-set id (with the NTS vote count packed alongside), and the
//! NTS vote bases. Two votes agree iff their round decisions hash to the
//! same digest; the digest is what the tally counts.

use {
    crate::part_set::PartSetIdAndAppData,
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hashv,
    solana_signature::Signature,
    solana_signer::Signer,
    std::time::{SystemTime, UNIX_EPOCH},
    thiserror::Error,
};

/// The two vote kinds of the three-phase protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    #[default]
    Prevote,
    Precommit,
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "prevote"),
            VoteType::Precommit => write!(f, "precommit"),
        }
    }
}

/// One network-type section a precommit vouches for (inter-chain proof
/// element; opaque to the tally beyond equality).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NtsVoteBase {
    pub network_type_id: u32,
    pub network_type_section_hash: Hash,
}

/// What a vote is *for*. `block_id == None` is a nil vote.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoundDecision {
    pub block_id: Option<Hash>,
    pub part_set_id: Option<PartSetIdAndAppData>,
    pub nts_vote_bases: Vec<NtsVoteBase>,
}

impl RoundDecision {
    pub fn nil() -> Self {
        Self::default()
    }

    pub fn for_block(block_id: Hash, part_set_id: PartSetIdAndAppData) -> Self {
        Self {
            block_id: Some(block_id),
            part_set_id: Some(part_set_id),
            nts_vote_bases: Vec::new(),
        }
    }

    /// A skip-transaction decision: the nid echo with no part set.
    pub fn skip(nid_id: Hash) -> Self {
        Self {
            block_id: Some(nid_id),
            part_set_id: None,
            nts_vote_bases: Vec::new(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.block_id.is_none()
    }

    /// The round-decision digest used for tallying.
    pub fn digest(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("round decision encodes");
        hashv(&[b"tessera/round-decision", &bytes])
    }
}

/// The block-id echo used by skip-transaction votes for network `nid`.
pub fn nid_block_id(nid: u32) -> Hash {
    hashv(&[b"tessera/nid", &nid.to_be_bytes()])
}

/// Current wall-clock in microseconds, the vote timestamp unit.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VoteError {
    #[error("signature does not verify against voter {0}")]
    InvalidSignature(Pubkey),
    #[error("NTS proof part count {parts} does not match vote base count {bases}")]
    ProofPartCount { parts: usize, bases: usize },
}

/// A signed prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u32,
    pub vote_type: VoteType,
    pub decision: RoundDecision,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    /// One proof part per NTS vote base, in base order.
    pub nts_proof_parts: Vec<Vec<u8>>,
    pub voter: Pubkey,
    pub signature: Signature,
}

impl Vote {
    /// Build and sign a vote with the node wallet.
    #[allow(clippy::too_many_arguments)]
    pub fn new_signed(
        wallet: &dyn Signer,
        vote_type: VoteType,
        height: u64,
        round: u32,
        decision: RoundDecision,
        timestamp: i64,
        nts_proof_parts: Vec<Vec<u8>>,
    ) -> Self {
        let voter = wallet.pubkey();
        let mut vote = Self {
            height,
            round,
            vote_type,
            decision,
            timestamp,
            nts_proof_parts,
            voter,
            signature: Signature::default(),
        };
        vote.signature = wallet.sign_message(&vote.signing_bytes());
        vote
    }

    /// The canonical bytes the signature covers. The voter identity is part
    /// of the preimage so a signature cannot be replayed under another key.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = bincode::serialize(&(
            self.height,
            self.round,
            self.vote_type,
            &self.decision,
            self.timestamp,
            self.voter,
        ))
        .expect("vote encodes");
        let mut bytes = Vec::with_capacity(body.len() + 12);
        bytes.extend_from_slice(b"tessera/vote");
        bytes.extend_from_slice(&body);
        bytes
    }

    /// Verify the signature and the NTS proof-part arity.
    pub fn verify(&self) -> Result<(), VoteError> {
        if self.nts_proof_parts.len() != self.decision.nts_vote_bases.len() {
            return Err(VoteError::ProofPartCount {
                parts: self.nts_proof_parts.len(),
                bases: self.decision.nts_vote_bases.len(),
            });
        }
        if !self
            .signature
            .verify(self.voter.as_ref(), &self.signing_bytes())
        {
            return Err(VoteError::InvalidSignature(self.voter));
        }
        Ok(())
    }

    pub fn decision_digest(&self) -> Hash {
        self.decision.digest()
    }

    pub fn is_nil(&self) -> bool {
        self.decision.is_nil()
    }
}
