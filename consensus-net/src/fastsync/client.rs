//! Fast-sync client.
//!
//! Pulls finalized blocks `begin..=end` from peers with bounded
//! concurrency. Each fetcher owns one height against one peer: it sends a
//! `BlockRequest`, expects `BlockMetadata` (length −1 means the peer cannot
//! serve it) and then `BlockData` chunks summing to the announced length.
//! Results enter a sliding window and are delivered strictly in height
//! order; the consumer acknowledges each with `consume` or discards the
//! peer with `reject`, which reschedules everything that peer delivered.

use {
    crate::{
        config::NetConfig,
        fastsync::height_set::HeightSet,
        message::{BlockDataChunk, BlockMetadata, BlockRequest, NetMessage},
        network::{Network, PeerId},
    },
    crossbeam_channel::{bounded, Sender},
    log::{debug, warn},
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc, Mutex, MutexGuard,
        },
        thread::{Builder, JoinHandle},
        time::{Duration, Instant},
    },
    thiserror::Error,
};

/// How often fetcher deadlines and resends are checked.
const TICK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FastSyncError {
    #[error("a fetch is already in progress")]
    AlreadyInUse,
    #[error("no peers to fetch from")]
    NoPeers,
    #[error("no peer could deliver height {0}")]
    NoBlock(u64),
}

/// Receives fetched blocks in height order.
pub trait FetchCallback: Send + Sync {
    /// One block, strictly the next height. Call
    /// [`BlockResult::consume`] or [`BlockResult::reject`] to continue.
    fn on_block(&self, result: BlockResult);
    /// Fetch finished; `None` when every height was consumed.
    fn on_end(&self, error: Option<FastSyncError>);
}

/// A delivered block, pending the consumer's verdict.
pub struct BlockResult {
    pub peer: PeerId,
    pub height: u64,
    pub block: Vec<u8>,
    /// The commit proof from the server's metadata (commit-vote bytes).
    pub votes: Vec<u8>,
    client: FastSyncClient,
    fetch_seq: u16,
}

impl BlockResult {
    /// Accept the block; the window advances to the next height.
    pub fn consume(self) {
        self.client.consume_result(self.fetch_seq, self.height);
    }

    /// The block failed validation: drop the peer that delivered it and
    /// refetch its heights elsewhere.
    pub fn reject(self) {
        self.client.reject_result(self.fetch_seq, self.peer, self.height);
    }
}

enum FetchStep {
    WaitResp,
    WaitData,
}

struct Fetcher {
    height: u64,
    request_id: u32,
    step: FetchStep,
    deadline: Instant,
    /// Set when the request could not be sent yet (temporary error).
    resend_at: Option<Instant>,
    left: i64,
    proof: Vec<u8>,
    chunks: Vec<Vec<u8>>,
}

struct PeerSlot {
    id: PeerId,
    seq: u16,
    fetcher: Option<Fetcher>,
}

struct PendingBlock {
    peer: PeerId,
    block: Vec<u8>,
    votes: Vec<u8>,
}

struct FetchRequest {
    seq: u16,
    heights: HeightSet,
    callback: Arc<dyn FetchCallback>,
    peers: Vec<PeerSlot>,
    n_active: usize,
    consume_offset: u64,
    pending: Vec<Option<PendingBlock>>,
    notified: bool,
}

enum Notice {
    Block(Arc<dyn FetchCallback>, BlockResult),
    End(Arc<dyn FetchCallback>, Option<FastSyncError>),
}

struct ClientState {
    fetch_seq: u16,
    fr: Option<FetchRequest>,
}

struct ClientShared {
    network: Arc<dyn Network>,
    config: NetConfig,
    state: Mutex<ClientState>,
    running: AtomicBool,
    tick_stop: Mutex<Option<Sender<()>>>,
    tick_thread: Mutex<Option<JoinHandle<()>>>,
}

/// Block-pull client; clone handles share one fetch slot.
#[derive(Clone)]
pub struct FastSyncClient {
    shared: Arc<ClientShared>,
}

impl FastSyncClient {
    pub fn new(network: Arc<dyn Network>, config: NetConfig) -> Self {
        Self {
            shared: Arc::new(ClientShared {
                network,
                config,
                state: Mutex::new(ClientState {
                    fetch_seq: 0,
                    fr: None,
                }),
                running: AtomicBool::new(false),
                tick_stop: Mutex::new(None),
                tick_thread: Mutex::new(None),
            }),
        }
    }

    /// Start the timeout/resend ticker.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = bounded::<()>(1);
        if let Ok(mut slot) = self.shared.tick_stop.lock() {
            *slot = Some(tx);
        }
        let client = self.clone();
        let thread = Builder::new()
            .name("tessFastSync".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(TICK_INTERVAL) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => client.tick(),
                }
            })
            .expect("spawn fast-sync ticker");
        if let Ok(mut slot) = self.shared.tick_thread.lock() {
            *slot = Some(thread);
        }
    }

    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel();
        if let Ok(mut slot) = self.shared.tick_stop.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.send(());
            }
        }
        if let Some(thread) = self
            .shared
            .tick_thread
            .lock()
            .ok()
            .and_then(|mut t| t.take())
        {
            let _ = thread.join();
        }
    }

    /// Fetch blocks `begin..=end`, delivering them in order to `callback`.
    pub fn fetch_blocks(
        &self,
        begin: u64,
        end: u64,
        callback: Arc<dyn FetchCallback>,
    ) -> Result<(), FastSyncError> {
        let mut state = self.lock_state();
        if state.fr.is_some() {
            return Err(FastSyncError::AlreadyInUse);
        }
        let peer_ids = self.shared.network.peers();
        if peer_ids.is_empty() {
            return Err(FastSyncError::NoPeers);
        }
        state.fetch_seq = state.fetch_seq.wrapping_add(1);
        debug!("fetch_blocks {begin}..={end} across {} peers", peer_ids.len());
        let mut fr = FetchRequest {
            seq: state.fetch_seq,
            heights: HeightSet::new(begin, end),
            callback,
            peers: peer_ids
                .into_iter()
                .map(|id| PeerSlot {
                    id,
                    seq: 0,
                    fetcher: None,
                })
                .collect(),
            n_active: 0,
            consume_offset: begin,
            pending: (0..self.shared.config.max_pending_results)
                .map(|_| None)
                .collect(),
            notified: false,
        };
        self.reschedule(&mut fr, state.fetch_seq);
        state.fr = Some(fr);
        Ok(())
    }

    /// Abort the current fetch, telling servers to drop queued requests.
    /// No completion callback fires; the caller initiated this.
    pub fn cancel(&self) {
        let fr = {
            let mut state = self.lock_state();
            state.fr.take()
        };
        if let Some(fr) = fr {
            for slot in &fr.peers {
                if slot.fetcher.is_some() {
                    let _ = self
                        .shared
                        .network
                        .unicast(&slot.id, &NetMessage::CancelAllBlockRequests);
                }
            }
        }
    }

    /// A peer joined mid-fetch; give it work.
    pub fn on_join(&self, id: PeerId) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            let seq = state.fetch_seq;
            if let Some(fr) = state.fr.as_mut() {
                if !fr.peers.iter().any(|p| p.id == id) {
                    fr.peers.push(PeerSlot {
                        id,
                        seq: 0,
                        fetcher: None,
                    });
                    self.reschedule(fr, seq);
                    self.collect_notices(fr, &mut notices);
                }
            }
        }
        self.deliver(notices);
    }

    pub fn on_leave(&self, id: &PeerId) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            if let Some(mut fr) = state.fr.take() {
                if fr.peers.iter().any(|p| p.id == *id) {
                    self.drop_peer(&mut fr, id, true);
                }
                self.finish_or_keep(&mut state, fr, &mut notices);
            }
        }
        self.deliver(notices);
    }

    /// Inbound dispatch for fast-sync response messages.
    pub fn on_receive(&self, from: PeerId, message: NetMessage) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(mut fr) = state.fr.take() else {
                return;
            };
            match message {
                NetMessage::BlockMetadata(m) => self.on_metadata(&mut fr, from, m),
                NetMessage::BlockData(m) => self.on_data(&mut fr, from, m),
                other => debug!("fast-sync client ignoring {}", other.kind()),
            }
            self.finish_or_keep(&mut state, fr, &mut notices);
        }
        self.deliver(notices);
    }

    /// Periodic deadline and resend pass.
    pub fn tick(&self) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(mut fr) = state.fr.take() else {
                return;
            };
            let now = Instant::now();
            let mut timed_out: Vec<PeerId> = Vec::new();
            for slot in &mut fr.peers {
                let Some(fetcher) = slot.fetcher.as_mut() else {
                    continue;
                };
                if let Some(resend_at) = fetcher.resend_at {
                    if now >= resend_at {
                        let msg = NetMessage::BlockRequest(BlockRequest::new(
                            fetcher.request_id,
                            fetcher.height,
                        ));
                        match self.shared.network.unicast(&slot.id, &msg) {
                            Ok(()) => fetcher.resend_at = None,
                            Err(e) if e.is_temporary() => {
                                fetcher.resend_at =
                                    Some(now + self.shared.config.send_interval);
                            }
                            Err(_) => timed_out.push(slot.id),
                        }
                    }
                }
                if now >= fetcher.deadline {
                    timed_out.push(slot.id);
                }
            }
            for id in timed_out {
                debug!("fast-sync request to {id} timed out");
                self.drop_peer(&mut fr, &id, false);
            }
            self.finish_or_keep(&mut state, fr, &mut notices);
        }
        self.deliver(notices);
    }

    // ── Consumer verdicts ───────────────────────────────────────────────

    fn consume_result(&self, seq: u16, height: u64) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(mut fr) = state.fr.take() else {
                return;
            };
            if fr.seq != seq || fr.consume_offset != height {
                state.fr = Some(fr);
                return;
            }
            fr.consume_offset += 1;
            fr.pending.rotate_left(1);
            if let Some(last) = fr.pending.last_mut() {
                *last = None;
            }
            fr.notified = false;
            self.finish_or_keep(&mut state, fr, &mut notices);
        }
        self.deliver(notices);
    }

    fn reject_result(&self, seq: u16, peer: PeerId, height: u64) {
        let mut notices = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(mut fr) = state.fr.take() else {
                return;
            };
            if fr.seq != seq || fr.consume_offset != height {
                state.fr = Some(fr);
                return;
            }
            warn!("fast-sync block at {height} rejected; dropping peer {peer}");
            fr.pending[0] = None;
            fr.heights.add(height);
            fr.notified = false;
            self.drop_peer(&mut fr, &peer, false);
            self.finish_or_keep(&mut state, fr, &mut notices);
        }
        self.deliver(notices);
    }

    // ── Fetcher state ───────────────────────────────────────────────────

    fn on_metadata(&self, fr: &mut FetchRequest, from: PeerId, meta: BlockMetadata) {
        let Some(slot) = fr.peers.iter_mut().find(|p| p.id == from) else {
            return;
        };
        let Some(fetcher) = slot.fetcher.as_mut() else {
            return;
        };
        if fetcher.request_id != meta.request_id
            || !matches!(fetcher.step, FetchStep::WaitResp)
        {
            return;
        }
        if meta.block_length < 0 {
            debug!("peer {from} has no block at {}", fetcher.height);
            self.drop_peer(fr, &from, true);
            return;
        }
        fetcher.left = meta.block_length as i64;
        fetcher.proof = meta.proof.unwrap_or_default();
        fetcher.step = FetchStep::WaitData;
        if fetcher.left == 0 {
            self.complete_fetcher(fr, from);
        }
    }

    fn on_data(&self, fr: &mut FetchRequest, from: PeerId, chunk: BlockDataChunk) {
        let Some(slot) = fr.peers.iter_mut().find(|p| p.id == from) else {
            return;
        };
        let Some(fetcher) = slot.fetcher.as_mut() else {
            return;
        };
        if fetcher.request_id != chunk.request_id
            || !matches!(fetcher.step, FetchStep::WaitData)
        {
            return;
        }
        fetcher.left -= chunk.data.len() as i64;
        fetcher.chunks.push(chunk.data);
        if fetcher.left == 0 {
            self.complete_fetcher(fr, from);
        } else if fetcher.left < 0 {
            warn!("peer {from} sent more data than announced");
            self.drop_peer(fr, &from, false);
        }
    }

    fn complete_fetcher(&self, fr: &mut FetchRequest, from: PeerId) {
        let Some(slot) = fr.peers.iter_mut().find(|p| p.id == from) else {
            return;
        };
        let Some(fetcher) = slot.fetcher.take() else {
            return;
        };
        fr.n_active -= 1;
        let block: Vec<u8> = fetcher.chunks.concat();
        let offset = (fetcher.height - fr.consume_offset) as usize;
        if offset >= fr.pending.len() {
            // The window moved backwards under a reject; refetch.
            fr.heights.add(fetcher.height);
            return;
        }
        fr.pending[offset] = Some(PendingBlock {
            peer: from,
            block,
            votes: fetcher.proof,
        });
        let seq = fr.seq;
        self.reschedule(fr, seq);
    }

    /// Remove a peer entirely. Its in-flight height is re-added; unless the
    /// failure was a clean "no block", its undelivered results are dropped
    /// and re-added too.
    fn drop_peer(&self, fr: &mut FetchRequest, id: &PeerId, no_block: bool) {
        let Some(idx) = fr.peers.iter().position(|p| p.id == *id) else {
            return;
        };
        let slot = fr.peers.swap_remove(idx);
        if let Some(fetcher) = slot.fetcher {
            fr.n_active -= 1;
            fr.heights.add(fetcher.height);
        }
        if !no_block {
            for (i, entry) in fr.pending.iter_mut().enumerate() {
                if i == 0 && fr.notified {
                    // The consumer already holds this one.
                    continue;
                }
                if entry.as_ref().map(|p| p.peer == *id).unwrap_or(false) {
                    fr.heights.add(fr.consume_offset + i as u64);
                    *entry = None;
                }
            }
        }
        let seq = fr.seq;
        self.reschedule(fr, seq);
    }

    /// Hand the lowest outstanding heights to idle peers, within the
    /// concurrency cap and the delivery window.
    fn reschedule(&self, fr: &mut FetchRequest, seq: u16) {
        loop {
            if fr.n_active >= self.shared.config.max_active {
                return;
            }
            let Some(height) = fr.heights.lowest() else {
                return;
            };
            if height >= fr.consume_offset + fr.pending.len() as u64 {
                // Outside the delivery window; wait for consumes.
                return;
            }
            let Some(slot) = fr.peers.iter_mut().find(|p| p.fetcher.is_none()) else {
                return;
            };
            fr.heights.pop_lowest();
            let request_id = (seq as u32) << 16 | slot.seq as u32;
            slot.seq = slot.seq.wrapping_add(1);
            let mut fetcher = Fetcher {
                height,
                request_id,
                step: FetchStep::WaitResp,
                deadline: Instant::now() + self.shared.config.request_timeout,
                resend_at: None,
                left: 0,
                proof: Vec::new(),
                chunks: Vec::new(),
            };
            let msg = NetMessage::BlockRequest(BlockRequest::new(request_id, height));
            match self.shared.network.unicast(&slot.id, &msg) {
                Ok(()) => {}
                Err(e) if e.is_temporary() => {
                    fetcher.resend_at = Some(Instant::now() + self.shared.config.send_interval);
                }
                Err(e) => {
                    debug!("fast-sync request to {} failed: {e}", slot.id);
                    let id = slot.id;
                    fr.heights.add(height);
                    let Some(idx) = fr.peers.iter().position(|p| p.id == id) else {
                        return;
                    };
                    fr.peers.swap_remove(idx);
                    continue;
                }
            }
            slot.fetcher = Some(fetcher);
            fr.n_active += 1;
        }
    }

    /// Decide whether the fetch is finished; otherwise put it back and
    /// queue any due block notification.
    fn finish_or_keep(
        &self,
        state: &mut MutexGuard<'_, ClientState>,
        mut fr: FetchRequest,
        notices: &mut Vec<Notice>,
    ) {
        if fr.consume_offset > fr.heights.end() {
            notices.push(Notice::End(Arc::clone(&fr.callback), None));
            return;
        }
        if fr.n_active == 0 && fr.pending[0].is_none() {
            let could_schedule = !fr.heights.is_exhausted() && !fr.peers.is_empty();
            if !could_schedule {
                notices.push(Notice::End(
                    Arc::clone(&fr.callback),
                    Some(FastSyncError::NoBlock(fr.consume_offset)),
                ));
                return;
            }
            let seq = fr.seq;
            self.reschedule(&mut fr, seq);
            if fr.n_active == 0 {
                notices.push(Notice::End(
                    Arc::clone(&fr.callback),
                    Some(FastSyncError::NoBlock(fr.consume_offset)),
                ));
                return;
            }
        }
        self.collect_notices(&mut fr, notices);
        state.fr = Some(fr);
    }

    fn collect_notices(&self, fr: &mut FetchRequest, notices: &mut Vec<Notice>) {
        if fr.notified {
            return;
        }
        let Some(pending) = fr.pending[0].as_ref() else {
            return;
        };
        fr.notified = true;
        notices.push(Notice::Block(
            Arc::clone(&fr.callback),
            BlockResult {
                peer: pending.peer,
                height: fr.consume_offset,
                block: pending.block.clone(),
                votes: pending.votes.clone(),
                client: self.clone(),
                fetch_seq: fr.seq,
            },
        ));
    }

    // Callbacks run outside the state lock: `consume`/`reject` re-enter.
    fn deliver(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Block(cb, result) => cb.on_block(result),
                Notice::End(cb, error) => cb.on_end(error),
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
