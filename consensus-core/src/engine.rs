//! The consensus state machine.
//!
//! Drives one validator through propose → prevote → precommit → commit for
//! one height at a time. The engine is deterministic: every input (message,
//! timeout, block-manager completion) produces an [`EngineOutput`] naming
//! the messages to broadcast and the asynchronous work to run. Blocking
//! work never happens inside the engine; completions carry the coordinate
//! captured at request time and are discarded when the machine has moved
//! on. WAL records are appended before the corresponding messages are
//! handed out, so a crash replays into the same externally visible state.

use {
    crate::{
        bit_array::BitArray,
        block::{BlockCandidate, BlockError},
        cache::{part_key, PartCache},
        commit_vote::{CommitVoteError, CommitVoteList, SkipCommitVoteList},
        config::ConsensusConfig,
        evidence::DoubleSignDetector,
        height_vote_set::HeightVoteSet,
        part_set::{part_set_from_bytes, PartSet, PartSetError, PartSetIdAndAppData},
        proposer,
        types::{
            BlockPartMessage, CommitWalRecord, CommittedBlock, ConsensusMessage, EngineOutput,
            EngineRequest, LockWalRecord, PeerRoundState, ProposalMessage, RoundWalRecord,
            SkipPatch, Step,
        },
        validator_set::ValidatorSet,
        vote::{nid_block_id, now_micros, NtsVoteBase, RoundDecision, Vote, VoteError, VoteType},
        vote_list::VoteList,
        wal::{ConsensusWal, WalError, WalReader, COMMIT_WAL, LOCK_WAL, ROUND_WAL},
    },
    log::{debug, info, warn},
    solana_hash::Hash,
    solana_pubkey::Pubkey,
    solana_signer::Signer,
    std::{
        collections::{BTreeMap, VecDeque},
        path::Path,
        sync::Arc,
    },
    thiserror::Error,
};

const COMMIT_CACHE_LIMIT: usize = 8;
const FUTURE_MESSAGE_LIMIT: usize = 1024;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("wal failure: {0}")]
    Wal(#[from] WalError),
    #[error(transparent)]
    Vote(#[from] VoteError),
    #[error("block part rejected: {0}")]
    PartSet(#[from] PartSetError),
    #[error("invalid proposal signature from {0}")]
    InvalidProposalSignature(Pubkey),
    #[error("proposal for {height}/{round} from {proposer}, who is not the proposer")]
    WrongProposer {
        proposer: Pubkey,
        height: u64,
        round: u32,
    },
    #[error("vote from unknown validator {0}")]
    UnknownVoter(Pubkey),
    #[error("block manager failure: {0}")]
    Block(#[from] BlockError),
    #[error("commit vote failure: {0}")]
    CommitVotes(#[from] CommitVoteError),
}

impl ConsensusError {
    /// Fatal errors halt consensus; the WAL replay on restart is the
    /// recovery path. Everything else is a droppable bad message.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConsensusError::Wal(_) | ConsensusError::Block(_) | ConsensusError::CommitVotes(_)
        )
    }
}

#[derive(Debug, Clone)]
struct CommitEntry {
    parts: PartSet,
    votes: CommitVoteList,
    block_id: Hash,
    nts_vote_bases: Vec<NtsVoteBase>,
}

/// WAL contents gathered before the engine starts.
#[derive(Default)]
pub struct RecoveredWal {
    pub commit: Option<CommitWalRecord>,
    pub lock: Option<LockWalRecord>,
    pub round: Vec<RoundWalRecord>,
}

/// Read and repair the three WAL streams under `dir`.
///
/// Torn tails are truncated so the writers reopened afterwards append to a
/// consistent log. A missing directory yields an empty recovery.
pub fn read_wal(dir: &Path) -> Result<RecoveredWal, WalError> {
    let mut recovered = RecoveredWal::default();
    read_stream(dir, COMMIT_WAL, |record| recovered.commit = Some(record))?;
    read_stream(dir, LOCK_WAL, |record| recovered.lock = Some(record))?;
    read_stream(dir, ROUND_WAL, |record| recovered.round.push(record))?;
    Ok(recovered)
}

// Read every record of one stream; a torn or undecodable tail truncates
// the stream, since everything before it is still authoritative.
fn read_stream<T: serde::de::DeserializeOwned>(
    dir: &Path,
    name: &str,
    mut apply: impl FnMut(T),
) -> Result<(), WalError> {
    let mut reader = match WalReader::open(&dir.join(name)) {
        Ok(reader) => reader,
        Err(WalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    loop {
        match reader.read_obj::<T>() {
            Ok(record) => apply(record),
            Err(WalError::Eof) => {
                reader.close();
                return Ok(());
            }
            Err(e) if e.is_recoverable() || matches!(e, WalError::Codec(_)) => {
                warn!("repairing {name} wal after torn tail: {e}");
                return reader.close_and_repair();
            }
            Err(e) => return Err(e),
        }
    }
}

/// Per-height/round/step consensus driver.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    wallet: Arc<dyn Signer + Send + Sync>,
    address: Pubkey,
    validators: ValidatorSet,
    pending_validators: Option<ValidatorSet>,

    height: u64,
    round: u32,
    step: Step,

    hvs: HeightVoteSet,
    proposal: Option<ProposalMessage>,
    proposal_parts: Option<PartSet>,
    /// The single validated-block slot; replaced candidates are dropped.
    validated: Option<BlockCandidate>,
    /// Part-set hash the validated candidate was assembled from.
    validated_parts_hash: Option<Hash>,

    locked_round: i32,
    locked_parts: Option<PartSet>,
    locked_psid: Option<PartSetIdAndAppData>,
    locked_block_id: Option<Hash>,

    commit_round: i32,
    import_requested: Option<Hash>,
    finalize_requested: bool,

    prev_block_id: Hash,
    prev_commit: CommitVoteList,

    commit_cache: BTreeMap<u64, CommitEntry>,
    part_cache: PartCache,
    future_messages: VecDeque<ConsensusMessage>,
    evidence: DoubleSignDetector,
    wal: Option<ConsensusWal>,

    sent_prevote: bool,
    sent_precommit: bool,
    skip_patch_sent: bool,
    syncing: bool,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        wallet: Arc<dyn Signer + Send + Sync>,
        validators: ValidatorSet,
        wal: Option<ConsensusWal>,
    ) -> Self {
        let address = wallet.pubkey();
        let n = validators.len();
        Self {
            part_cache: PartCache::new(config.part_cache_cost_limit),
            config,
            wallet,
            address,
            validators,
            pending_validators: None,
            height: 0,
            round: 0,
            step: Step::PrePropose,
            hvs: HeightVoteSet::new(n),
            proposal: None,
            proposal_parts: None,
            validated: None,
            validated_parts_hash: None,
            locked_round: -1,
            locked_parts: None,
            locked_psid: None,
            locked_block_id: None,
            commit_round: -1,
            import_requested: None,
            finalize_requested: false,
            prev_block_id: Hash::default(),
            prev_commit: CommitVoteList::empty(),
            commit_cache: BTreeMap::new(),
            future_messages: VecDeque::new(),
            evidence: DoubleSignDetector::new(),
            wal: None,
            sent_prevote: false,
            sent_precommit: false,
            skip_patch_sent: false,
            syncing: false,
        }
        .with_wal(wal)
    }

    fn with_wal(mut self, wal: Option<ConsensusWal>) -> Self {
        self.wal = wal;
        self
    }

    // -- Accessors --------------------------------------------------------

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn address(&self) -> &Pubkey {
        &self.address
    }

    pub fn validators(&self) -> &ValidatorSet {
        &self.validators
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn evidence(&self) -> &DoubleSignDetector {
        &self.evidence
    }

    pub fn evidence_mut(&mut self) -> &mut DoubleSignDetector {
        &mut self.evidence
    }

    pub fn locked_round(&self) -> i32 {
        self.locked_round
    }

    /// The commit votes that finalized the previous height.
    pub fn prev_commit(&self) -> &CommitVoteList {
        &self.prev_commit
    }

    /// Mark this node as fast-syncing; reflected in round-state beacons.
    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    /// Summary of what this node has, for round-state beacons.
    pub fn round_state(&self) -> PeerRoundState {
        let n = self.validators.len();
        let prevotes_mask = self
            .hvs
            .votes(self.round, VoteType::Prevote)
            .map(|vs| vs.mask().clone())
            .unwrap_or_else(|| BitArray::new(n));
        let precommits_mask = self
            .hvs
            .votes(self.round, VoteType::Precommit)
            .map(|vs| vs.mask().clone())
            .unwrap_or_else(|| BitArray::new(n));
        let block_parts_mask = if self.step >= Step::Commit {
            self.proposal_parts.as_ref().map(|p| p.mask().clone())
        } else {
            None
        };
        PeerRoundState {
            height: self.height,
            round: self.round,
            prevotes_mask,
            precommits_mask,
            block_parts_mask,
            sync: self.syncing,
        }
    }

    // -- Queries serving the syncer --------------------------------------

    /// Parts of the block committed at `height`, while still cached.
    pub fn commit_parts(&self, height: u64) -> Option<&PartSet> {
        if height == self.height && self.step >= Step::Commit {
            return self.proposal_parts.as_ref();
        }
        self.commit_cache.get(&height).map(|e| &e.parts)
    }

    /// Precommits that finalized `height`, as a full vote list.
    pub fn commit_precommits(&self, height: u64) -> Option<VoteList> {
        if height == self.height && self.step >= Step::Commit && self.commit_round >= 0 {
            return self
                .hvs
                .votes(self.commit_round as u32, VoteType::Precommit)
                .and_then(|vs| vs.commit_votes())
                .map(|votes| VoteList::from_votes(votes.iter()));
        }
        let entry = self.commit_cache.get(&height)?;
        Some(
            entry
                .votes
                .to_vote_list(height, entry.block_id, &entry.nts_vote_bases),
        )
    }

    /// Every precommit of `round` at the current height.
    pub fn precommits(&self, round: u32) -> VoteList {
        self.hvs
            .votes(round, VoteType::Precommit)
            .map(|vs| VoteList::from_votes(vs.iter()))
            .unwrap_or_default()
    }

    /// Votes of `round` that the given missing-masks select.
    pub fn votes_for_masks(
        &self,
        round: u32,
        pv_missing: &BitArray,
        pc_missing: &BitArray,
    ) -> VoteList {
        VoteList::from_votes(self.hvs.missing_votes(round, pv_missing, pc_missing).iter())
    }

    // -- Lifecycle --------------------------------------------------------

    /// Begin consensus at `height` on top of the given previous block.
    pub fn start(
        &mut self,
        height: u64,
        prev_block_id: Hash,
        prev_commit: CommitVoteList,
    ) -> Result<EngineOutput, ConsensusError> {
        info!("consensus start: height={height}");
        let mut out = EngineOutput::default();
        self.height = height;
        self.prev_block_id = prev_block_id;
        self.prev_commit = prev_commit;
        self.reset_height_state();
        self.enter_propose(0, &mut out)?;
        Ok(out)
    }

    /// Begin consensus with WAL contents from a previous run. The lock is
    /// restored first, then the recorded round messages are replayed; own
    /// messages are re-broadcast with their original signatures so peers
    /// deduplicate them.
    pub fn start_recovered(
        &mut self,
        height: u64,
        prev_block_id: Hash,
        prev_commit: CommitVoteList,
        recovered: RecoveredWal,
    ) -> Result<EngineOutput, ConsensusError> {
        let mut out = self.start(height, prev_block_id, prev_commit)?;

        if let Some(lock) = recovered.lock {
            if lock.height == height && lock.locked_round >= 0 {
                self.restore_lock(lock);
            }
        }

        for record in recovered.round {
            match record {
                RoundWalRecord::State { height: h, round, .. } => {
                    if h == height && round > self.round {
                        self.enter_propose(round, &mut out)?;
                    }
                }
                RoundWalRecord::Message(msg) => {
                    if msg.height() != height {
                        continue;
                    }
                    let own = self.is_own_message(&msg);
                    if own {
                        self.note_own_replay(&msg);
                        out.messages.push(msg.clone());
                    }
                    match self.dispatch(msg) {
                        Ok(o) => out.merge(o),
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => debug!("wal replay dropped message: {e}"),
                    }
                }
            }
        }
        Ok(out)
    }

    fn restore_lock(&mut self, lock: LockWalRecord) {
        let Some(psid) = lock.part_set_id else {
            return;
        };
        let mut parts = PartSet::from_id(&psid.id());
        for part in lock.parts {
            if let Err(e) = parts.add_part(part) {
                warn!("lock wal part rejected: {e}");
                return;
            }
        }
        self.locked_round = lock.locked_round;
        self.locked_psid = Some(psid);
        self.locked_block_id = lock.block_id;
        self.locked_parts = Some(parts);
    }

    fn is_own_message(&self, msg: &ConsensusMessage) -> bool {
        match msg {
            ConsensusMessage::Proposal(p) => p.proposer == self.address,
            ConsensusMessage::Vote(v) => v.voter == self.address,
            ConsensusMessage::BlockPart(_) => false,
        }
    }

    // A replayed own vote at the current coordinate means the step's vote
    // was already cast; never cast a fresh (differently timestamped) one.
    fn note_own_replay(&mut self, msg: &ConsensusMessage) {
        if let ConsensusMessage::Vote(v) = msg {
            if v.height == self.height && v.round >= self.round {
                self.round = v.round;
                match v.vote_type {
                    VoteType::Prevote => self.sent_prevote = true,
                    VoteType::Precommit => {
                        self.sent_prevote = true;
                        self.sent_precommit = true;
                    }
                }
            }
        }
    }

    /// Route any protocol message to its receive entry point.
    pub fn dispatch(&mut self, msg: ConsensusMessage) -> Result<EngineOutput, ConsensusError> {
        match msg {
            ConsensusMessage::Proposal(m) => self.receive_proposal(m),
            ConsensusMessage::BlockPart(m) => self.receive_block_part(m).map(|(out, _)| out),
            ConsensusMessage::Vote(v) => self.receive_vote(v),
        }
    }

    // -- Message receive paths -------------------------------------------

    pub fn receive_proposal(
        &mut self,
        msg: ProposalMessage,
    ) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        if !msg.verify() {
            return Err(ConsensusError::InvalidProposalSignature(msg.proposer));
        }
        if msg.height > self.height {
            self.queue_future(ConsensusMessage::Proposal(msg));
            return Ok(out);
        }
        if msg.height < self.height {
            return Ok(out);
        }
        if let Some(conflict) =
            self.evidence
                .record_proposal(msg.proposer, msg.height, msg.round, msg.digest(), msg.signature)
        {
            warn!(
                "double-signed proposal by {} at {}/{}",
                conflict.signer, conflict.height, conflict.round
            );
        }
        // Only the current round's proposal is held; peers re-gossip.
        if msg.round != self.round || self.step >= Step::Commit {
            return Ok(out);
        }
        let expected = proposer::proposer_for_round(&self.validators, self.height, self.round);
        if expected != Some(msg.proposer) {
            return Err(ConsensusError::WrongProposer {
                proposer: msg.proposer,
                height: msg.height,
                round: msg.round,
            });
        }
        if self.proposal.is_some() {
            return Ok(out);
        }

        let id = msg.block_part_set_id.id();
        let need_new = self
            .proposal_parts
            .as_ref()
            .map(|p| p.id() != id)
            .unwrap_or(true);
        if need_new {
            self.proposal_parts = Some(PartSet::from_id(&id));
            self.validated_parts_hash = None;
        }
        self.proposal = Some(msg);
        self.adopt_cached_parts();
        self.try_advance_propose(&mut out)?;
        Ok(out)
    }

    /// Returns the engine output plus the accepted part index, if any; the
    /// syncer uses the index to wake peers waiting on part masks.
    pub fn receive_block_part(
        &mut self,
        msg: BlockPartMessage,
    ) -> Result<(EngineOutput, Option<u16>), ConsensusError> {
        let mut out = EngineOutput::default();
        if msg.height > self.height {
            self.queue_future(ConsensusMessage::BlockPart(msg));
            return Ok((out, None));
        }
        if msg.height < self.height {
            return Ok((out, None));
        }
        let index = msg.part.index();
        let Some(parts) = self.proposal_parts.as_mut() else {
            // No part set known yet; park the part for the proposal.
            self.part_cache.insert(part_key(&msg.part), msg.part);
            return Ok((out, None));
        };
        match parts.add_part(msg.part) {
            Ok(()) => {}
            Err(PartSetError::AlreadyAdded(_)) => return Ok((out, None)),
            Err(e) => return Err(e.into()),
        }
        if self.step == Step::Commit {
            self.try_finalize(&mut out)?;
        } else {
            self.try_advance_propose(&mut out)?;
        }
        Ok((out, Some(index)))
    }

    pub fn receive_vote(&mut self, vote: Vote) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        vote.verify()?;
        if vote.height > self.height {
            self.queue_future(ConsensusMessage::Vote(vote));
            return Ok(out);
        }
        if vote.height < self.height {
            return Ok(out);
        }
        let Some(index) = self.validators.index_of(&vote.voter) else {
            return Err(ConsensusError::UnknownVoter(vote.voter));
        };
        if let Some(conflict) = self.evidence.record_vote(&vote) {
            warn!(
                "double-signed {} by {} at {}/{}",
                vote.vote_type, conflict.signer, conflict.height, conflict.round
            );
        }
        let round = vote.round;
        let vote_type = vote.vote_type;
        if !self.hvs.add(index, vote) {
            return Ok(out);
        }

        if vote_type == VoteType::Prevote {
            self.maybe_unlock(round)?;
        }

        // A future round gathering two-thirds vote mass pulls us forward.
        if self.step < Step::Commit && round > self.round {
            let threshold = self.validators.len() * 2 / 3;
            if let Some(r) = self.hvs.round_with_vote_mass(self.round, threshold) {
                debug!("round skip: {} -> {}", self.round, r);
                self.enter_propose(r, &mut out)?;
            }
        }

        if round == self.round && self.step < Step::Commit {
            match vote_type {
                VoteType::Prevote => {
                    self.try_advance_propose(&mut out)?;
                    self.check_prevote_progress(&mut out)?;
                }
                VoteType::Precommit => {
                    self.check_precommit_progress(&mut out)?;
                }
            }
        }
        self.check_any_commit(&mut out)?;
        self.maybe_skip_patch(&mut out);
        Ok(out)
    }

    // -- Block manager completions ---------------------------------------

    pub fn on_block_proposed(
        &mut self,
        height: u64,
        round: u32,
        result: Result<BlockCandidate, BlockError>,
    ) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        if height != self.height || round != self.round || self.step != Step::Propose {
            return Ok(out);
        }
        let candidate = match result {
            Ok(candidate) => candidate,
            Err(e) => {
                warn!("propose failed at {height}/{round}: {e}");
                return Ok(out);
            }
        };
        let parts = part_set_from_bytes(self.config.block_part_size, &candidate.bytes);
        let psid = PartSetIdAndAppData::new(parts.id(), candidate.nts_vote_bases.len() as u16);
        let proposal =
            ProposalMessage::new_signed(self.wallet.as_ref(), self.height, round, psid, -1);
        self.evidence.record_proposal(
            self.address,
            self.height,
            round,
            proposal.digest(),
            proposal.signature,
        );
        let msg = ConsensusMessage::Proposal(proposal.clone());
        self.wal_round_message(&msg)?;
        out.messages.push(msg);
        for idx in 0..parts.count() {
            if let Some(part) = parts.part(idx) {
                out.messages.push(ConsensusMessage::BlockPart(BlockPartMessage {
                    height: self.height,
                    part: part.clone(),
                }));
            }
        }
        self.validated_parts_hash = Some(parts.hash());
        self.validated = Some(candidate);
        self.proposal = Some(proposal);
        self.proposal_parts = Some(parts);
        self.enter_prevote(&mut out)?;
        Ok(out)
    }

    pub fn on_block_imported(
        &mut self,
        height: u64,
        round: u32,
        result: Result<BlockCandidate, BlockError>,
    ) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        if height != self.height {
            return Ok(out);
        }
        self.import_requested = None;
        match result {
            Ok(candidate) => {
                // Replace the single validated slot; the old candidate is
                // disposed here.
                self.validated_parts_hash = self.proposal_parts.as_ref().map(|p| p.hash());
                self.validated = Some(candidate);
                if self.step == Step::Commit {
                    self.try_finalize(&mut out)?;
                } else if self.step == Step::Propose && round == self.round {
                    self.enter_prevote(&mut out)?;
                }
            }
            Err(e) => {
                warn!("import failed at {height}/{round}: {e}");
                if self.step == Step::Propose && round == self.round {
                    // The proposal did not validate; prevote nil.
                    self.enter_prevote(&mut out)?;
                }
            }
        }
        Ok(out)
    }

    pub fn on_block_finalized(
        &mut self,
        height: u64,
        result: Result<(), BlockError>,
    ) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        if height != self.height || self.step != Step::Commit {
            return Ok(out);
        }
        result?;
        let Some(candidate) = self.validated.as_ref() else {
            return Ok(out);
        };
        let block_id = candidate.id;
        let next_validators = candidate.next_validators.clone();
        let nts_vote_bases = candidate.nts_vote_bases.clone();
        let votes = self.commit_votes()?;

        let record = CommitWalRecord {
            height,
            block_id,
            votes: votes.clone(),
        };
        if let Some(wal) = &self.wal {
            wal.commit.write_obj(&record)?;
            wal.commit.sync()?;
        }

        if let Some(parts) = &self.proposal_parts {
            self.commit_cache.insert(
                height,
                CommitEntry {
                    parts: parts.clone(),
                    votes: votes.clone(),
                    block_id,
                    nts_vote_bases,
                },
            );
            while self.commit_cache.len() > COMMIT_CACHE_LIMIT {
                let Some((&oldest, _)) = self.commit_cache.iter().next() else {
                    break;
                };
                self.commit_cache.remove(&oldest);
            }
        }

        info!("finalized height {height} block {block_id}");
        out.committed = Some(CommittedBlock {
            height,
            block_id,
            votes: votes.clone(),
        });
        self.prev_block_id = block_id;
        self.prev_commit = votes;
        if !next_validators.is_empty() {
            self.pending_validators = Some(next_validators);
        }
        self.set_step(Step::NewHeight, &mut out)?;
        Ok(out)
    }

    /// Resume proposing after a `WaitTransactions` request completed.
    pub fn on_transactions_available(&mut self) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        if self.step != Step::TransactionWait {
            return Ok(out);
        }
        self.enter_propose(0, &mut out)?;
        Ok(out)
    }

    // -- Timeouts ---------------------------------------------------------

    pub fn on_timeout(&mut self, step: Step, round: u32) -> Result<EngineOutput, ConsensusError> {
        let mut out = EngineOutput::default();
        // Stale firings: the coordinate moved while the timer was armed.
        if step != self.step || (step != Step::NewHeight && round != self.round) {
            return Ok(out);
        }
        match step {
            Step::Propose => self.enter_prevote(&mut out)?,
            Step::PrevoteWait => self.enter_precommit(&mut out)?,
            Step::PrecommitWait => self.enter_propose(self.round + 1, &mut out)?,
            Step::NewHeight => self.begin_next_height(&mut out)?,
            _ => {}
        }
        Ok(out)
    }

    // -- Internal transitions --------------------------------------------

    fn reset_height_state(&mut self) {
        let n = self.validators.len();
        self.round = 0;
        self.step = Step::PrePropose;
        self.hvs = HeightVoteSet::new(n);
        self.proposal = None;
        self.proposal_parts = None;
        self.validated = None;
        self.validated_parts_hash = None;
        self.locked_round = -1;
        self.locked_parts = None;
        self.locked_psid = None;
        self.locked_block_id = None;
        self.commit_round = -1;
        self.import_requested = None;
        self.finalize_requested = false;
        self.sent_prevote = false;
        self.sent_precommit = false;
        self.skip_patch_sent = false;
    }

    fn enter_propose(&mut self, round: u32, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        self.round = round;
        self.sent_prevote = false;
        self.sent_precommit = false;
        self.proposal = None;
        self.validated = None;
        self.validated_parts_hash = None;
        self.proposal_parts = self.locked_parts.clone();
        self.set_step(Step::Propose, out)?;
        debug!("enter propose {}/{}", self.height, round);

        if proposer::is_proposer(&self.validators, &self.address, self.height, round) {
            if self.locked_round >= 0 {
                // Re-propose the locked block; POL points at the lock round.
                if let Some(psid) = self.locked_psid {
                    let proposal = ProposalMessage::new_signed(
                        self.wallet.as_ref(),
                        self.height,
                        round,
                        psid,
                        self.locked_round,
                    );
                    self.evidence.record_proposal(
                        self.address,
                        self.height,
                        round,
                        proposal.digest(),
                        proposal.signature,
                    );
                    let msg = ConsensusMessage::Proposal(proposal.clone());
                    self.wal_round_message(&msg)?;
                    out.messages.push(msg);
                    if let Some(parts) = self.locked_parts.clone() {
                        for idx in 0..parts.count() {
                            if let Some(part) = parts.part(idx) {
                                out.messages.push(ConsensusMessage::BlockPart(
                                    BlockPartMessage {
                                        height: self.height,
                                        part: part.clone(),
                                    },
                                ));
                            }
                        }
                    }
                    self.proposal = Some(proposal);
                    self.enter_prevote(out)?;
                    return Ok(());
                }
            } else {
                out.requests.push(EngineRequest::Propose {
                    height: self.height,
                    round,
                });
            }
        }

        // A polka may already exist when we join a round late.
        if self
            .hvs
            .votes(round, VoteType::Prevote)
            .map(|vs| vs.has_over_two_thirds())
            .unwrap_or(false)
        {
            self.enter_prevote(out)?;
        }
        Ok(())
    }

    fn adopt_cached_parts(&mut self) {
        let Some(parts) = self.proposal_parts.as_mut() else {
            return;
        };
        let id = parts.id();
        for part in self.part_cache.take_matching(&id) {
            if let Err(e) = parts.add_part(part) {
                debug!("cached part rejected: {e}");
            }
        }
    }

    /// In the propose step: move to prevote once the proposal is present,
    /// its POL (if any) is justified, its parts are complete and the block
    /// validated. Emits the import request when only validation is missing.
    fn try_advance_propose(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.step != Step::Propose {
            return Ok(());
        }
        let Some(proposal) = self.proposal.clone() else {
            return Ok(());
        };
        if proposal.pol_round >= 0 {
            let justified = self
                .hvs
                .votes(proposal.pol_round as u32, VoteType::Prevote)
                .and_then(|vs| vs.over_two_thirds_part_set_id())
                .map(|psid| psid == Some(proposal.block_part_set_id))
                .unwrap_or(false);
            if !justified {
                return Ok(());
            }
        }
        let Some(parts) = self.proposal_parts.as_ref() else {
            return Ok(());
        };
        if !parts.is_complete() {
            return Ok(());
        }
        let parts_hash = parts.hash();
        if self.validated.is_some() && self.validated_parts_hash == Some(parts_hash) {
            self.enter_prevote(out)?;
            return Ok(());
        }
        if self.locked_round >= 0 && self.locked_psid == Some(proposal.block_part_set_id) {
            // Voting the lock needs no revalidation.
            self.enter_prevote(out)?;
            return Ok(());
        }
        if self.import_requested != Some(parts_hash) {
            if let Some(block) = parts.assemble() {
                self.import_requested = Some(parts_hash);
                out.requests.push(EngineRequest::Import {
                    height: self.height,
                    round: self.round,
                    block,
                });
            }
        }
        Ok(())
    }

    fn enter_prevote(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.step >= Step::Prevote {
            return Ok(());
        }
        self.set_step(Step::Prevote, out)?;
        if !self.sent_prevote {
            self.sent_prevote = true;
            let decision = self.prevote_decision();
            self.cast_vote(VoteType::Prevote, decision, out)?;
        }
        self.check_prevote_progress(out)?;
        Ok(())
    }

    fn prevote_decision(&self) -> RoundDecision {
        if self.locked_round >= 0 {
            if let (Some(block_id), Some(psid)) = (self.locked_block_id, self.locked_psid) {
                return RoundDecision::for_block(block_id, psid);
            }
        }
        if let (Some(proposal), Some(parts)) = (&self.proposal, &self.proposal_parts) {
            if parts.is_complete() && self.validated_parts_hash == Some(parts.hash()) {
                if let Some(candidate) = &self.validated {
                    return RoundDecision::for_block(candidate.id, proposal.block_part_set_id);
                }
            }
        }
        if let Some(limit) = self.config.skip_round_limit {
            if self.round >= limit {
                return RoundDecision::skip(nid_block_id(self.config.nid));
            }
        }
        RoundDecision::nil()
    }

    fn cast_vote(
        &mut self,
        vote_type: VoteType,
        decision: RoundDecision,
        out: &mut EngineOutput,
    ) -> Result<(), ConsensusError> {
        // Non-validator observers follow the protocol without voting.
        let Some(own_index) = self.validators.index_of(&self.address) else {
            return Ok(());
        };
        let vote = Vote::new_signed(
            self.wallet.as_ref(),
            vote_type,
            self.height,
            self.round,
            decision,
            now_micros(),
            vec![],
        );
        let msg = ConsensusMessage::Vote(vote.clone());
        self.wal_round_message(&msg)?;
        self.evidence.record_vote(&vote);
        self.hvs.add(own_index, vote);
        out.messages.push(msg);
        Ok(())
    }

    fn check_prevote_progress(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        let (mass, decided) = match self.hvs.votes(self.round, VoteType::Prevote) {
            Some(vs) => (vs.has_over_two_thirds(), vs.over_two_thirds_decision().cloned()),
            None => return Ok(()),
        };
        if self.step == Step::Propose && mass {
            // Two thirds already prevoted this round; no point waiting for
            // the proposal.
            self.enter_prevote(out)?;
            return Ok(());
        }
        if self.step == Step::Prevote && mass {
            self.set_step(Step::PrevoteWait, out)?;
        }
        if self.step == Step::PrevoteWait && decided.is_some() {
            self.enter_precommit(out)?;
        }
        Ok(())
    }

    fn enter_precommit(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.step >= Step::Precommit {
            return Ok(());
        }
        self.set_step(Step::Precommit, out)?;
        let decided = self
            .hvs
            .votes(self.round, VoteType::Prevote)
            .and_then(|vs| vs.over_two_thirds_decision().cloned());

        let own = match decided {
            Some(decision) if decision.part_set_id.is_some() => {
                let psid = decision.part_set_id;
                let parts_ready = match (&self.proposal_parts, psid) {
                    (Some(parts), Some(want)) => parts.id() == want.id() && parts.is_complete(),
                    _ => false,
                };
                if parts_ready {
                    self.lock(self.round as i32, decision.clone())?;
                    decision
                } else if self.locked_psid == psid {
                    // Already locked on the polka's block.
                    self.locked_round = self.round as i32;
                    self.wal_lock()?;
                    decision
                } else {
                    RoundDecision::nil()
                }
            }
            Some(_) => {
                // Polka for nil: release any lock.
                self.unlock()?;
                RoundDecision::nil()
            }
            None => RoundDecision::nil(),
        };

        if !self.sent_precommit {
            self.sent_precommit = true;
            self.cast_vote(VoteType::Precommit, own, out)?;
        }
        self.check_precommit_progress(out)?;
        Ok(())
    }

    fn lock(&mut self, round: i32, decision: RoundDecision) -> Result<(), ConsensusError> {
        self.locked_round = round;
        self.locked_parts = self.proposal_parts.clone();
        self.locked_psid = decision.part_set_id;
        self.locked_block_id = decision.block_id;
        info!("locked on round {round}");
        self.wal_lock()?;
        Ok(())
    }

    fn unlock(&mut self) -> Result<(), ConsensusError> {
        if self.locked_round < 0 {
            return Ok(());
        }
        info!("unlock (was round {})", self.locked_round);
        self.locked_round = -1;
        self.locked_parts = None;
        self.locked_psid = None;
        self.locked_block_id = None;
        self.wal_lock()?;
        Ok(())
    }

    fn maybe_unlock(&mut self, vote_round: u32) -> Result<(), ConsensusError> {
        if self.locked_round < 0 || (vote_round as i32) <= self.locked_round {
            return Ok(());
        }
        let differs = self
            .hvs
            .votes(vote_round, VoteType::Prevote)
            .and_then(|vs| vs.over_two_thirds_decision())
            .map(|d| d.part_set_id != self.locked_psid)
            .unwrap_or(false);
        if differs {
            self.unlock()?;
        }
        Ok(())
    }

    fn check_precommit_progress(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        let (mass, decided) = match self.hvs.votes(self.round, VoteType::Precommit) {
            Some(vs) => (vs.has_over_two_thirds(), vs.over_two_thirds_decision().cloned()),
            None => return Ok(()),
        };
        if let Some(decision) = decided {
            if decision.part_set_id.is_some() {
                if self.step < Step::Commit {
                    self.enter_commit(decision, out)?;
                }
                return Ok(());
            }
            // Two thirds precommitted nil: this round is dead.
            if self.step == Step::Precommit || self.step == Step::PrecommitWait {
                self.enter_propose(self.round + 1, out)?;
                return Ok(());
            }
        }
        if mass && self.step == Step::Precommit {
            self.set_step(Step::PrecommitWait, out)?;
        }
        Ok(())
    }

    // A finished commit decision may sit at a round other than the current
    // one (we raced ahead or behind); any round's concrete precommit
    // decision moves the height into commit.
    fn check_any_commit(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.step >= Step::Commit {
            return Ok(());
        }
        let found = self.hvs.rounds().find_map(|(round, rv)| {
            rv.precommits
                .over_two_thirds_decision()
                .filter(|d| d.part_set_id.is_some())
                .map(|d| (*round, d.clone()))
        });
        if let Some((round, decision)) = found {
            self.round = round;
            self.enter_commit(decision, out)?;
        }
        Ok(())
    }

    fn enter_commit(
        &mut self,
        decision: RoundDecision,
        out: &mut EngineOutput,
    ) -> Result<(), ConsensusError> {
        if self.step >= Step::Commit {
            return Ok(());
        }
        let Some(psid) = decision.part_set_id else {
            return Ok(());
        };
        self.commit_round = self.round as i32;
        let id = psid.id();
        let have = self
            .proposal_parts
            .as_ref()
            .map(|p| p.id() == id)
            .unwrap_or(false);
        if !have {
            if self.locked_psid.map(|l| l.id()) == Some(id) {
                self.proposal_parts = self.locked_parts.clone();
            } else {
                self.proposal_parts = Some(PartSet::from_id(&id));
                self.validated_parts_hash = None;
                self.adopt_cached_parts();
            }
        }
        self.set_step(Step::Commit, out)?;
        info!(
            "enter commit {}/{} block {:?}",
            self.height, self.commit_round, decision.block_id
        );
        self.try_finalize(out)?;
        Ok(())
    }

    fn try_finalize(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        if self.step != Step::Commit || self.finalize_requested {
            return Ok(());
        }
        let Some(parts) = self.proposal_parts.as_ref() else {
            return Ok(());
        };
        if !parts.is_complete() {
            return Ok(());
        }
        let parts_hash = parts.hash();
        let validated = self.validated.is_some() && self.validated_parts_hash == Some(parts_hash);
        if !validated {
            if self.import_requested != Some(parts_hash) {
                if let Some(block) = parts.assemble() {
                    self.import_requested = Some(parts_hash);
                    out.requests.push(EngineRequest::Import {
                        height: self.height,
                        round: self.round,
                        block,
                    });
                }
            }
            return Ok(());
        }
        let votes = self.commit_votes()?;
        let Some(candidate) = self.validated.as_ref() else {
            return Ok(());
        };
        self.finalize_requested = true;
        out.requests.push(EngineRequest::Finalize {
            height: self.height,
            block: candidate.bytes.clone(),
            votes,
        });
        Ok(())
    }

    fn commit_votes(&self) -> Result<CommitVoteList, ConsensusError> {
        let votes = self
            .hvs
            .votes(self.commit_round.max(0) as u32, VoteType::Precommit)
            .and_then(|vs| vs.commit_votes())
            .unwrap_or_default();
        Ok(CommitVoteList::from_votes(&votes)?)
    }

    fn begin_next_height(&mut self, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        self.height += 1;
        if let Some(validators) = self.pending_validators.take() {
            if !validators.is_empty() {
                self.validators = validators;
            }
        }
        self.reset_height_state();
        let queued: Vec<ConsensusMessage> = self.future_messages.drain(..).collect();

        if self.config.wait_transactions {
            self.set_step(Step::TransactionWait, out)?;
            out.requests.push(EngineRequest::WaitTransactions {
                height: self.height,
            });
        } else {
            self.enter_propose(0, out)?;
        }

        for msg in queued {
            if msg.height() == self.height {
                match self.dispatch(msg) {
                    Ok(o) => out.merge(o),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => debug!("queued message dropped: {e}"),
                }
            } else if msg.height() > self.height {
                self.future_messages.push_back(msg);
            }
        }
        Ok(())
    }

    fn queue_future(&mut self, msg: ConsensusMessage) {
        let limit = self.height + self.config.future_height_limit;
        if msg.height() <= limit && self.future_messages.len() < FUTURE_MESSAGE_LIMIT {
            self.future_messages.push_back(msg);
        }
    }

    fn maybe_skip_patch(&mut self, out: &mut EngineOutput) {
        let Some(limit) = self.config.skip_round_limit else {
            return;
        };
        if self.skip_patch_sent || self.round < limit {
            return;
        }
        let nid_id = nid_block_id(self.config.nid);
        let threshold = self.validators.one_third_threshold();
        if let Some(votes) = self.hvs.round_evidences(limit, &nid_id, threshold) {
            match SkipCommitVoteList::from_votes(&votes) {
                Ok(list) => {
                    self.skip_patch_sent = true;
                    out.skip_patch = Some(SkipPatch {
                        height: self.height,
                        votes: list,
                    });
                }
                Err(e) => debug!("skip patch not built: {e}"),
            }
        }
    }

    fn set_step(&mut self, step: Step, out: &mut EngineOutput) -> Result<(), ConsensusError> {
        self.step = step;
        out.step_changed = true;
        if let Some(wal) = &self.wal {
            wal.round.write_obj(&RoundWalRecord::State {
                height: self.height,
                round: self.round,
                step,
            })?;
        }
        Ok(())
    }

    fn wal_round_message(&self, msg: &ConsensusMessage) -> Result<(), WalError> {
        if let Some(wal) = &self.wal {
            wal.round.write_obj(&RoundWalRecord::Message(msg.clone()))?;
        }
        Ok(())
    }

    fn wal_lock(&self) -> Result<(), WalError> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let parts = self
            .locked_parts
            .as_ref()
            .map(|ps| {
                (0..ps.count())
                    .filter_map(|i| ps.part(i).cloned())
                    .collect()
            })
            .unwrap_or_default();
        wal.lock.write_obj(&LockWalRecord {
            height: self.height,
            locked_round: self.locked_round,
            block_id: self.locked_block_id,
            part_set_id: self.locked_psid,
            parts,
        })?;
        Ok(())
    }
}
