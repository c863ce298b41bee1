//! State-machine types: steps, protocol messages, WAL records and the
//! engine's input/output surface.

use {
    crate::{
        bit_array::BitArray,
        commit_vote::{CommitVoteList, SkipCommitVoteList},
        part_set::{Part, PartSetIdAndAppData},
        vote::Vote,
    },
    serde::{Deserialize, Serialize},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_sha256_hasher::hashv,
    solana_signature::Signature,
    solana_signer::Signer,
};

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// The step within a height. Monotone within a height; a new round resets
/// to `Propose`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Before the first round of a height starts.
    PrePropose,
    /// Waiting for the round's proposal.
    Propose,
    /// Own prevote sent; collecting prevote mass.
    Prevote,
    /// Two thirds of prevotes seen; waiting for them to agree.
    PrevoteWait,
    /// Own precommit sent; collecting precommit mass.
    Precommit,
    /// Two thirds of precommits seen; waiting for them to agree.
    PrecommitWait,
    /// A block decision exists; assembling parts and finalizing.
    Commit,
    /// Block finalized; pausing before the next height.
    NewHeight,
    /// Waiting for transactions before proposing the next block.
    TransactionWait,
}

impl Step {
    fn order(self) -> u8 {
        match self {
            Step::PrePropose => 0,
            Step::Propose => 1,
            Step::Prevote => 2,
            Step::PrevoteWait => 3,
            Step::Precommit => 4,
            Step::PrecommitWait => 5,
            Step::Commit => 6,
            Step::NewHeight => 7,
            Step::TransactionWait => 8,
        }
    }
}

impl PartialOrd for Step {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Step {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order().cmp(&other.order())
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::PrePropose => "PrePropose",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
            Step::NewHeight => "NewHeight",
            Step::TransactionWait => "TransactionWait",
        };
        write!(f, "{name}")
    }
}

// ---------------------------------------------------------------------------
// Protocol messages
// ---------------------------------------------------------------------------

/// The round proposal: a reference to the proposed block's part set plus
/// the POL round justifying the block choice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalMessage {
    pub height: u64,
    pub round: u32,
    pub block_part_set_id: PartSetIdAndAppData,
    /// Round of the polka justifying this block, or -1.
    pub pol_round: i32,
    pub proposer: Pubkey,
    pub signature: Signature,
}

impl ProposalMessage {
    pub fn new_signed(
        wallet: &dyn Signer,
        height: u64,
        round: u32,
        block_part_set_id: PartSetIdAndAppData,
        pol_round: i32,
    ) -> Self {
        let mut msg = Self {
            height,
            round,
            block_part_set_id,
            pol_round,
            proposer: wallet.pubkey(),
            signature: Signature::default(),
        };
        msg.signature = wallet.sign_message(&msg.signing_bytes());
        msg
    }

    pub fn signing_bytes(&self) -> Vec<u8> {
        let body = bincode::serialize(&(
            self.height,
            self.round,
            &self.block_part_set_id,
            self.pol_round,
            self.proposer,
        ))
        .expect("proposal encodes");
        let mut bytes = Vec::with_capacity(body.len() + 16);
        bytes.extend_from_slice(b"tessera/proposal");
        bytes.extend_from_slice(&body);
        bytes
    }

    /// Content digest used for double-sign detection.
    pub fn digest(&self) -> Hash {
        hashv(&[&self.signing_bytes()])
    }

    pub fn verify(&self) -> bool {
        self.signature
            .verify(self.proposer.as_ref(), &self.signing_bytes())
    }
}

/// One verifiable block part in transit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPartMessage {
    pub height: u64,
    pub part: Part,
}

/// Everything the state machine sends or replays from its WAL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(ProposalMessage),
    BlockPart(BlockPartMessage),
    Vote(Vote),
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(m) => m.height,
            ConsensusMessage::BlockPart(m) => m.height,
            ConsensusMessage::Vote(v) => v.height,
        }
    }

    /// Short tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "proposal",
            ConsensusMessage::BlockPart(_) => "block_part",
            ConsensusMessage::Vote(_) => "vote",
        }
    }
}

// ---------------------------------------------------------------------------
// Peer round state
// ---------------------------------------------------------------------------

/// What a peer claims to have, guiding what to send next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRoundState {
    pub height: u64,
    pub round: u32,
    pub prevotes_mask: BitArray,
    pub precommits_mask: BitArray,
    /// Present while the sender assembles block parts (commit step).
    pub block_parts_mask: Option<BitArray>,
    /// True while the sender is fast-syncing.
    pub sync: bool,
}

// ---------------------------------------------------------------------------
// WAL records
// ---------------------------------------------------------------------------

/// Records of the `round` stream: own outbound messages and step marks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundWalRecord {
    Message(ConsensusMessage),
    State { height: u64, round: u32, step: Step },
}

/// Records of the `lock` stream. An unlock writes `locked_round == -1`
/// with no parts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockWalRecord {
    pub height: u64,
    pub locked_round: i32,
    pub block_id: Option<Hash>,
    pub part_set_id: Option<PartSetIdAndAppData>,
    pub parts: Vec<Part>,
}

/// Records of the `commit` stream, one per finalized height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWalRecord {
    pub height: u64,
    pub block_id: Hash,
    pub votes: CommitVoteList,
}

// ---------------------------------------------------------------------------
// Engine surface
// ---------------------------------------------------------------------------

/// Asynchronous work the engine asks the service to run. Every completion
/// entry point carries the coordinate captured here and no-ops when the
/// engine has moved on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineRequest {
    /// Build a block for `(height, round)` on top of the last commit.
    Propose { height: u64, round: u32 },
    /// Validate the assembled block bytes.
    Import {
        height: u64,
        round: u32,
        block: Vec<u8>,
    },
    /// Finalize the decided block.
    Finalize {
        height: u64,
        block: Vec<u8>,
        votes: CommitVoteList,
    },
    /// Block until the mempool has transactions for `height`.
    WaitTransactions { height: u64 },
}

/// A finalized block as reported to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlock {
    pub height: u64,
    pub block_id: Hash,
    pub votes: CommitVoteList,
}

/// Skip-transaction evidence ready for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkipPatch {
    pub height: u64,
    pub votes: SkipCommitVoteList,
}

/// Result of processing one engine input.
#[derive(Debug, Default)]
pub struct EngineOutput {
    /// Messages to broadcast to peers.
    pub messages: Vec<ConsensusMessage>,
    /// Asynchronous work for the service.
    pub requests: Vec<EngineRequest>,
    /// Set when this input finalized a block.
    pub committed: Option<CommittedBlock>,
    /// Skip-transaction evidence that became available.
    pub skip_patch: Option<SkipPatch>,
    /// The (height, round, step) coordinate changed; timers must be
    /// rescheduled and the syncer re-beaconed.
    pub step_changed: bool,
}

impl EngineOutput {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
            && self.requests.is_empty()
            && self.committed.is_none()
            && self.skip_patch.is_none()
            && !self.step_changed
    }

    pub fn merge(&mut self, other: EngineOutput) {
        self.messages.extend(other.messages);
        self.requests.extend(other.requests);
        if other.committed.is_some() {
            self.committed = other.committed;
        }
        if other.skip_patch.is_some() {
            self.skip_patch = other.skip_patch;
        }
        self.step_changed |= other.step_changed;
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::part_set::part_set_from_bytes, solana_keypair::Keypair};

    #[test]
    fn test_step_ordering() {
        assert!(Step::PrePropose < Step::Propose);
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::Prevote < Step::PrevoteWait);
        assert!(Step::PrevoteWait < Step::Precommit);
        assert!(Step::Precommit < Step::PrecommitWait);
        assert!(Step::PrecommitWait < Step::Commit);
        assert!(Step::Commit < Step::NewHeight);
        assert!(Step::NewHeight < Step::TransactionWait);
    }

    #[test]
    fn test_proposal_sign_verify() {
        let kp = Keypair::new();
        let ps = part_set_from_bytes(8, b"some block");
        let msg = ProposalMessage::new_signed(
            &kp,
            3,
            1,
            PartSetIdAndAppData::new(ps.id(), 0),
            -1,
        );
        assert!(msg.verify());
        let mut tampered = msg.clone();
        tampered.pol_round = 0;
        assert!(!tampered.verify());
        assert_ne!(msg.digest(), tampered.digest());
    }

    #[test]
    fn test_output_merge() {
        let mut a = EngineOutput::default();
        assert!(a.is_empty());
        let mut b = EngineOutput::default();
        b.step_changed = true;
        b.requests.push(EngineRequest::Propose {
            height: 1,
            round: 0,
        });
        a.merge(b);
        assert!(!a.is_empty());
        assert!(a.step_changed);
        assert_eq!(a.requests.len(), 1);
    }
}
