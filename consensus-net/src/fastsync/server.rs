//! Fast-sync server.
//!
//! One worker per requesting peer owns a bounded queue of `BlockRequest`s
//! and the buffer of the block currently being streamed. For each request
//! it emits `BlockMetadata` followed by chunked `BlockData`; a missing
//! block or proof answers with length −1. `CancelAllBlockRequests` drops
//! the queue and the buffer.

use {
    crate::{
        config::NetConfig,
        message::{BlockDataChunk, BlockMetadata, BlockRequest, NetMessage},
        network::{Network, PeerId},
    },
    crossbeam_channel::{bounded, Receiver, Sender, TrySendError},
    dashmap::DashMap,
    log::{debug, warn},
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{Builder, JoinHandle},
    },
};

/// Block storage seam for serving fast-sync requests.
pub trait BlockProvider: Send + Sync {
    /// Serialized block at `height`, if finalized locally.
    fn block(&self, height: u64) -> Option<Vec<u8>>;

    /// Commit proof for `height` in the requested flavor.
    fn proof(&self, height: u64, proof_option: u32) -> Option<Vec<u8>>;
}

enum ServerMsg {
    Request(BlockRequest),
    Cancel,
}

struct ServerPeer {
    tx: Sender<ServerMsg>,
    thread: JoinHandle<()>,
}

/// Serves finalized blocks to catching-up peers.
pub struct FastSyncServer {
    network: Arc<dyn Network>,
    provider: Arc<dyn BlockProvider>,
    config: NetConfig,
    peers: DashMap<PeerId, ServerPeer>,
    running: Arc<AtomicBool>,
}

impl FastSyncServer {
    pub fn new(
        network: Arc<dyn Network>,
        provider: Arc<dyn BlockProvider>,
        config: NetConfig,
    ) -> Self {
        Self {
            network,
            provider,
            config,
            peers: DashMap::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let ids: Vec<PeerId> = self.peers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, peer)) = self.peers.remove(&id) {
                drop(peer.tx);
                let _ = peer.thread.join();
            }
        }
    }

    pub fn on_leave(&self, id: &PeerId) {
        if let Some((_, peer)) = self.peers.remove(id) {
            drop(peer.tx);
            let _ = peer.thread.join();
        }
    }

    /// Inbound dispatch for fast-sync request messages.
    pub fn on_receive(&self, from: PeerId, message: NetMessage) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let msg = match message {
            NetMessage::BlockRequest(req) => ServerMsg::Request(req),
            NetMessage::CancelAllBlockRequests => ServerMsg::Cancel,
            other => {
                debug!("fast-sync server ignoring {}", other.kind());
                return;
            }
        };
        let entry = self.peers.entry(from).or_insert_with(|| {
            let (tx, rx) = bounded(self.config.channel_buffer_size);
            let network = Arc::clone(&self.network);
            let provider = Arc::clone(&self.provider);
            let config = self.config.clone();
            let running = Arc::clone(&self.running);
            let thread = Builder::new()
                .name("tessFastSyncSrv".to_string())
                .spawn(move || serve_peer(from, rx, network, provider, config, running))
                .expect("spawn fast-sync server worker");
            ServerPeer { tx, thread }
        });
        match entry.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("fast-sync worker for {from} is saturated; dropping request")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl Drop for FastSyncServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Streaming {
    request_id: u32,
    buf: Vec<u8>,
    offset: usize,
}

fn serve_peer(
    peer: PeerId,
    rx: Receiver<ServerMsg>,
    network: Arc<dyn Network>,
    provider: Arc<dyn BlockProvider>,
    config: NetConfig,
    running: Arc<AtomicBool>,
) {
    let mut queue: VecDeque<BlockRequest> = VecDeque::new();
    let mut current: Option<Streaming> = None;
    // The produced-but-unsent message; kept across temporary send errors.
    let mut next_msg: Option<NetMessage> = None;
    debug!("fast-sync worker start for {peer}");

    loop {
        if !running.load(Ordering::Relaxed) {
            break;
        }
        let idle = queue.is_empty() && current.is_none() && next_msg.is_none();
        let msg = if idle {
            match rx.recv() {
                Ok(msg) => Some(msg),
                Err(_) => break,
            }
        } else {
            match rx.try_recv() {
                Ok(msg) => Some(msg),
                Err(crossbeam_channel::TryRecvError::Empty) => None,
                Err(crossbeam_channel::TryRecvError::Disconnected) => break,
            }
        };
        match msg {
            Some(ServerMsg::Request(req)) => {
                if queue.len() < config.request_queue_limit {
                    queue.push_back(req);
                } else {
                    debug!("request queue full for {peer}; dropping request");
                }
            }
            Some(ServerMsg::Cancel) => {
                debug!("cancel all block requests from {peer}");
                queue.clear();
                current = None;
                next_msg = None;
                continue;
            }
            None => {}
        }

        if next_msg.is_none() {
            next_msg = produce_next(&mut queue, &mut current, &*provider, &config, &peer);
        }
        let Some(outbound) = next_msg.take() else {
            continue;
        };
        match network.unicast(&peer, &outbound) {
            Ok(()) => {}
            Err(e) if e.is_temporary() => {
                next_msg = Some(outbound);
                std::thread::sleep(config.send_interval);
            }
            Err(e) => {
                warn!("fast-sync send to {peer} failed: {e}; dropping work");
                queue.clear();
                current = None;
            }
        }
    }
    debug!("fast-sync worker stop for {peer}");
}

/// Next message for the peer: the current block's next chunk, or the
/// metadata for the next queued request.
fn produce_next(
    queue: &mut VecDeque<BlockRequest>,
    current: &mut Option<Streaming>,
    provider: &dyn BlockProvider,
    config: &NetConfig,
    peer: &PeerId,
) -> Option<NetMessage> {
    if let Some(streaming) = current.as_mut() {
        let end = (streaming.offset + config.chunk_size).min(streaming.buf.len());
        let data = streaming.buf[streaming.offset..end].to_vec();
        let request_id = streaming.request_id;
        streaming.offset = end;
        if end == streaming.buf.len() {
            *current = None;
        }
        return Some(NetMessage::BlockData(BlockDataChunk { request_id, data }));
    }
    let req = queue.pop_front()?;
    match (
        provider.block(req.height),
        provider.proof(req.height, req.proof_option),
    ) {
        (Some(block), Some(proof)) => {
            let meta = BlockMetadata {
                request_id: req.request_id,
                block_length: block.len() as i32,
                proof: Some(proof),
            };
            *current = Some(Streaming {
                request_id: req.request_id,
                buf: block,
                offset: 0,
            });
            Some(NetMessage::BlockMetadata(meta))
        }
        _ => {
            debug!("no block or proof at {} for {peer}", req.height);
            Some(NetMessage::BlockMetadata(BlockMetadata {
                request_id: req.request_id,
                block_length: -1,
                proof: None,
            }))
        }
    }
}
