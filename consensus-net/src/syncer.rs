//! Round-state gossip.
//!
//! One worker per peer wakes on demand and sends the single most useful
//! message given what the peer's last round-state summary says it already
//! has: commit votes and block parts for peers behind us, catch-up votes
//! for peers in earlier rounds, mask-selected votes for peers in our round.
//! A beacon broadcasts our own round state periodically and on step
//! changes. A peer reporting a height far ahead triggers fast-sync.

use {
    crate::{
        config::NetConfig,
        message::NetMessage,
        network::{Network, PeerId},
    },
    crossbeam_channel::{bounded, Receiver, Sender, TrySendError},
    log::{debug, info, warn},
    rand::{rngs::SmallRng, SeedableRng},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex,
        },
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
    tessera_consensus::{
        bit_array::BitArray,
        engine::{ConsensusEngine, ConsensusError},
        part_set::PartSet,
        types::{BlockPartMessage, EngineOutput, PeerRoundState, ProposalMessage, Step},
        vote::Vote,
        vote_list::VoteList,
    },
};

/// The narrow engine contract the syncer drives.
pub trait SyncEngine: Send {
    fn height(&self) -> u64;
    fn round(&self) -> u32;
    fn step(&self) -> Step;
    fn round_state(&self) -> PeerRoundState;

    /// Parts of the block committed at `height`, while cached.
    fn commit_parts(&self, height: u64) -> Option<PartSet>;
    /// Precommits that finalized `height`.
    fn commit_precommits(&self, height: u64) -> Option<VoteList>;
    /// Precommits of `round` at the current height.
    fn precommits(&self, round: u32) -> VoteList;
    /// Votes of `round` selected by missing-masks.
    fn votes_for_masks(&self, round: u32, pv: &BitArray, pc: &BitArray) -> VoteList;

    fn receive_proposal(&mut self, msg: ProposalMessage)
        -> Result<EngineOutput, ConsensusError>;
    fn receive_block_part(
        &mut self,
        msg: BlockPartMessage,
    ) -> Result<(EngineOutput, Option<u16>), ConsensusError>;
    fn receive_vote(&mut self, vote: Vote) -> Result<EngineOutput, ConsensusError>;
}

impl SyncEngine for ConsensusEngine {
    fn height(&self) -> u64 {
        ConsensusEngine::height(self)
    }

    fn round(&self) -> u32 {
        ConsensusEngine::round(self)
    }

    fn step(&self) -> Step {
        ConsensusEngine::step(self)
    }

    fn round_state(&self) -> PeerRoundState {
        ConsensusEngine::round_state(self)
    }

    fn commit_parts(&self, height: u64) -> Option<PartSet> {
        ConsensusEngine::commit_parts(self, height).cloned()
    }

    fn commit_precommits(&self, height: u64) -> Option<VoteList> {
        ConsensusEngine::commit_precommits(self, height)
    }

    fn precommits(&self, round: u32) -> VoteList {
        ConsensusEngine::precommits(self, round)
    }

    fn votes_for_masks(&self, round: u32, pv: &BitArray, pc: &BitArray) -> VoteList {
        ConsensusEngine::votes_for_masks(self, round, pv, pc)
    }

    fn receive_proposal(
        &mut self,
        msg: ProposalMessage,
    ) -> Result<EngineOutput, ConsensusError> {
        ConsensusEngine::receive_proposal(self, msg)
    }

    fn receive_block_part(
        &mut self,
        msg: BlockPartMessage,
    ) -> Result<(EngineOutput, Option<u16>), ConsensusError> {
        ConsensusEngine::receive_block_part(self, msg)
    }

    fn receive_vote(&mut self, vote: Vote) -> Result<EngineOutput, ConsensusError> {
        ConsensusEngine::receive_vote(self, vote)
    }
}

/// Notifications for the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncerEvent {
    /// A peer reported a height beyond the fast-sync threshold.
    PeerFarAhead { peer: PeerId, height: u64 },
}

struct PeerHandle {
    id: PeerId,
    wake_tx: Sender<()>,
    state: Mutex<Option<PeerRoundState>>,
    /// Height we last reported this peer as far-ahead for.
    reported_ahead: Mutex<u64>,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PeerHandle {
    fn wake(&self) {
        match self.wake_tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {}
        }
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.wake();
        if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
            let _ = thread.join();
        }
    }
}

struct SyncerShared<E: SyncEngine> {
    engine: Arc<Mutex<E>>,
    network: Arc<dyn Network>,
    config: NetConfig,
    outputs_tx: Sender<EngineOutput>,
    events_tx: Sender<SyncerEvent>,
    peers: Mutex<Vec<Arc<PeerHandle>>>,
    beacon_tx: Mutex<Option<Sender<()>>>,
    beacon_thread: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

/// Per-peer gossip driver.
pub struct Syncer<E: SyncEngine + 'static> {
    shared: Arc<SyncerShared<E>>,
}

impl<E: SyncEngine + 'static> Clone for Syncer<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: SyncEngine + 'static> Syncer<E> {
    pub fn new(
        engine: Arc<Mutex<E>>,
        network: Arc<dyn Network>,
        config: NetConfig,
        outputs_tx: Sender<EngineOutput>,
        events_tx: Sender<SyncerEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(SyncerShared {
                engine,
                network,
                config,
                outputs_tx,
                events_tx,
                peers: Mutex::new(Vec::new()),
                beacon_tx: Mutex::new(None),
                beacon_thread: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn one worker per connected peer plus the beacon.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in self.shared.network.peers() {
            self.spawn_peer(id);
        }
        self.spawn_beacon();
        self.send_round_state();
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.shared.beacon_tx.lock() {
            guard.take();
        }
        if let Some(thread) = self
            .shared
            .beacon_thread
            .lock()
            .ok()
            .and_then(|mut t| t.take())
        {
            let _ = thread.join();
        }
        let peers: Vec<Arc<PeerHandle>> = self
            .shared
            .peers
            .lock()
            .map(|mut p| p.drain(..).collect())
            .unwrap_or_default();
        for peer in peers {
            peer.stop();
        }
    }

    pub fn on_join(&self, id: PeerId) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        info!("syncer: peer joined {id}");
        self.spawn_peer(id);
        // Tell the newcomer where we are.
        let state = self.lock_engine().round_state();
        let _ = self
            .shared
            .network
            .unicast(&id, &NetMessage::RoundState(state));
    }

    pub fn on_leave(&self, id: &PeerId) {
        let peer = self.shared.peers.lock().ok().and_then(|mut peers| {
            peers
                .iter()
                .position(|p| p.id == *id)
                .map(|i| peers.swap_remove(i))
        });
        if let Some(peer) = peer {
            info!("syncer: peer left {id}");
            peer.stop();
        }
    }

    /// The engine's coordinate changed: re-beacon and re-evaluate peers.
    pub fn on_engine_step_change(&self) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        self.send_round_state();
        self.wake_all_peers();
    }

    /// Inbound dispatch from the network manager.
    pub fn on_receive(&self, from: PeerId, message: NetMessage) {
        if !self.shared.running.load(Ordering::Relaxed) {
            return;
        }
        match message {
            NetMessage::RoundState(state) => {
                self.check_far_ahead(&from, &state);
                if let Ok(peers) = self.shared.peers.lock() {
                    for peer in peers.iter() {
                        if peer.id == from {
                            if let Ok(mut slot) = peer.state.lock() {
                                *slot = Some(state.clone());
                            }
                            peer.wake();
                        }
                    }
                }
            }
            NetMessage::VoteList(list) => {
                let mut merged = EngineOutput::default();
                {
                    let mut engine = self.lock_engine();
                    for vote in list.iter() {
                        match engine.receive_vote(vote) {
                            Ok(out) => merged.merge(out),
                            Err(e) if e.is_fatal() => {
                                warn!("fatal error on vote list: {e}");
                                return;
                            }
                            Err(e) => debug!("vote from {from} dropped: {e}"),
                        }
                    }
                }
                self.forward(merged);
                self.wake_all_peers();
            }
            NetMessage::Vote(vote) => {
                let result = self.lock_engine().receive_vote(vote);
                self.handle_engine_result(from, result.map(|out| (out, true)));
            }
            NetMessage::Proposal(msg) => {
                let result = self.lock_engine().receive_proposal(msg);
                self.handle_engine_result(from, result.map(|out| (out, true)));
            }
            NetMessage::BlockPart(msg) => {
                let result = self.lock_engine().receive_block_part(msg);
                self.handle_engine_result(
                    from,
                    result.map(|(out, added)| (out, added.is_some())),
                );
            }
            other => debug!("syncer ignoring {} from {from}", other.kind()),
        }
    }

    fn handle_engine_result(
        &self,
        from: PeerId,
        result: Result<(EngineOutput, bool), ConsensusError>,
    ) {
        match result {
            Ok((out, changed)) => {
                self.forward(out);
                if changed {
                    self.wake_all_peers();
                }
            }
            Err(e) if e.is_fatal() => warn!("fatal engine error: {e}"),
            Err(e) => debug!("message from {from} dropped: {e}"),
        }
    }

    fn forward(&self, out: EngineOutput) {
        if out.is_empty() {
            return;
        }
        let step_changed = out.step_changed;
        if self.shared.outputs_tx.send(out).is_err() {
            warn!("engine output channel closed");
        }
        if step_changed {
            self.send_round_state();
        }
    }

    fn check_far_ahead(&self, from: &PeerId, state: &PeerRoundState) {
        let our_height = self.lock_engine().height();
        if state.height <= our_height + self.shared.config.fast_sync_threshold {
            return;
        }
        if let Ok(peers) = self.shared.peers.lock() {
            for peer in peers.iter() {
                if peer.id == *from {
                    if let Ok(mut reported) = peer.reported_ahead.lock() {
                        if *reported >= state.height {
                            return;
                        }
                        *reported = state.height;
                    }
                }
            }
        }
        let _ = self.shared.events_tx.send(SyncerEvent::PeerFarAhead {
            peer: *from,
            height: state.height,
        });
    }

    fn send_round_state(&self) {
        let state = self.lock_engine().round_state();
        if let Err(e) = self
            .shared
            .network
            .broadcast(&NetMessage::RoundState(state))
        {
            debug!("round-state broadcast failed: {e}");
        }
    }

    fn wake_all_peers(&self) {
        if let Ok(peers) = self.shared.peers.lock() {
            for peer in peers.iter() {
                peer.wake();
            }
        }
    }

    fn spawn_peer(&self, id: PeerId) {
        if let Ok(peers) = self.shared.peers.lock() {
            if peers.iter().any(|p| p.id == id) {
                return;
            }
        }
        let (wake_tx, wake_rx) = bounded(1);
        let handle = Arc::new(PeerHandle {
            id,
            wake_tx,
            state: Mutex::new(None),
            reported_ahead: Mutex::new(0),
            running: AtomicBool::new(true),
            thread: Mutex::new(None),
        });
        let shared = Arc::clone(&self.shared);
        let worker_handle = Arc::clone(&handle);
        let thread = Builder::new()
            .name(format!("tessSync-{}", &id.to_string()[..8.min(id.to_string().len())]))
            .spawn(move || peer_loop(shared, worker_handle, wake_rx))
            .expect("spawn peer worker");
        if let Ok(mut slot) = handle.thread.lock() {
            *slot = Some(thread);
        }
        if let Ok(mut peers) = self.shared.peers.lock() {
            peers.push(handle);
        }
    }

    fn spawn_beacon(&self) {
        let (tx, rx) = bounded::<()>(1);
        if let Ok(mut guard) = self.shared.beacon_tx.lock() {
            *guard = Some(tx);
        }
        let shared = Arc::clone(&self.shared);
        let interval = self.shared.config.round_state_interval;
        let thread = Builder::new()
            .name("tessSyncBeacon".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Ok(()) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
                if !shared.running.load(Ordering::Relaxed) {
                    return;
                }
                let state = match shared.engine.lock() {
                    Ok(engine) => engine.round_state(),
                    Err(_) => return,
                };
                let _ = shared.network.broadcast(&NetMessage::RoundState(state));
            })
            .expect("spawn beacon");
        if let Ok(mut slot) = self.shared.beacon_thread.lock() {
            *slot = Some(thread);
        }
    }

    fn lock_engine(&self) -> std::sync::MutexGuard<'_, E> {
        match self.shared.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn peer_loop<E: SyncEngine>(
    shared: Arc<SyncerShared<E>>,
    peer: Arc<PeerHandle>,
    wake_rx: Receiver<()>,
) {
    let mut rng = SmallRng::from_os_rng();
    let mut next_send_time: Option<Instant> = None;
    debug!("peer worker start: {}", peer.id);

    while wake_rx.recv().is_ok() {
        if !peer.running.load(Ordering::Relaxed) || !shared.running.load(Ordering::Relaxed) {
            break;
        }
        if let Some(at) = next_send_time {
            let now = Instant::now();
            if now < at {
                std::thread::sleep(at - now);
            }
        }

        let message = {
            let engine = match shared.engine.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut state = match peer.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            next_message(&*engine, &mut state, &mut rng)
        };

        let Some(message) = message else {
            next_send_time = None;
            continue;
        };

        let size = message
            .encode()
            .map(|bytes| bytes.len())
            .unwrap_or_default();
        if let Err(e) = shared.network.unicast(&peer.id, &message) {
            if e.is_temporary() {
                std::thread::sleep(shared.config.send_interval);
            } else {
                debug!("send to {} failed: {e}", peer.id);
            }
        }

        if shared.config.send_bps > 0 {
            let delta = Duration::from_secs_f64(size as f64 / shared.config.send_bps as f64);
            let base = next_send_time.unwrap_or_else(Instant::now);
            next_send_time = Some(base + delta);
        }
        peer.wake();
    }
    debug!("peer worker stop: {}", peer.id);
}

/// Choose the single most useful message for a peer, updating the local
/// copy of the peer's round state as content is handed out.
fn next_message<E: SyncEngine>(
    engine: &E,
    peer_state: &mut Option<PeerRoundState>,
    rng: &mut SmallRng,
) -> Option<NetMessage> {
    let state = peer_state.as_mut()?;

    // Peer is behind (or finishing the height we just committed): feed it
    // commit votes first, then block parts it is missing.
    if state.height < engine.height()
        || (state.height == engine.height() && engine.step() >= Step::Commit)
    {
        if state.block_parts_mask.is_none() {
            let votes = engine.commit_precommits(state.height)?;
            let parts = engine.commit_parts(state.height)?;
            state.block_parts_mask = Some(BitArray::new(parts.count() as usize));
            return Some(NetMessage::VoteList(votes));
        }
        let parts = engine.commit_parts(state.height)?;
        let sent_mask = state.block_parts_mask.as_mut()?;
        let mut candidates = sent_mask.clone();
        candidates.flip();
        candidates.and_assign(parts.mask());
        let idx = candidates.pick_random(rng)?;
        sent_mask.set(idx);
        let part = parts.part(idx as u16)?.clone();
        return Some(NetMessage::BlockPart(BlockPartMessage {
            height: state.height,
            part,
        }));
    }

    // Peer ahead of us: nothing we can offer (fast-sync is triggered from
    // the round-state handler).
    if state.height > engine.height() {
        return None;
    }

    if state.round < engine.round() {
        // Catch the peer up with the precommits that moved us past its
        // round; before our own prevote-wait the previous round's set is
        // the complete one.
        let votes = if engine.step() >= Step::PrevoteWait {
            engine.precommits(engine.round())
        } else {
            engine.precommits(engine.round().saturating_sub(1))
        };
        *peer_state = None;
        if votes.is_empty() {
            return None;
        }
        return Some(NetMessage::VoteList(votes));
    }

    if state.round == engine.round() {
        let mut pv_missing = state.prevotes_mask.clone();
        pv_missing.flip();
        let mut pc_missing = state.precommits_mask.clone();
        pc_missing.flip();
        let votes = engine.votes_for_masks(engine.round(), &pv_missing, &pc_missing);
        if !votes.is_empty() {
            *peer_state = None;
            return Some(NetMessage::VoteList(votes));
        }
    }

    None
}
