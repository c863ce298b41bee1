//! Block fast-sync.
//!
//! The request/response protocol a lagging node uses to catch up: the
//! client pulls finalized blocks and their commit proofs from peers in
//! strict height order; the server streams them in bounded chunks.

pub mod client;
pub mod height_set;
pub mod server;

pub use {
    client::{BlockResult, FastSyncClient, FastSyncError, FetchCallback},
    server::{BlockProvider, FastSyncServer},
};

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            config::NetConfig,
            message::NetMessage,
            network::{ChannelHub, ChannelNetwork, Inbound, PeerId},
        },
        crossbeam_channel::{bounded, Receiver, Sender},
        solana_keypair::Keypair,
        solana_signer::Signer,
        std::{
            collections::HashMap,
            sync::{
                atomic::{AtomicBool, Ordering},
                Arc, Mutex,
            },
            thread::JoinHandle,
            time::Duration,
        },
    };

    fn block_bytes(height: u64, tag: u8) -> Vec<u8> {
        let mut bytes = format!("block@{height}/").into_bytes();
        bytes.extend(std::iter::repeat_n(tag, 25 * 1024)); // several chunks
        bytes
    }

    struct MemoryProvider {
        blocks: HashMap<u64, Vec<u8>>,
    }

    impl MemoryProvider {
        fn range(from: u64, to: u64, tag: u8) -> Self {
            Self {
                blocks: (from..=to).map(|h| (h, block_bytes(h, tag))).collect(),
            }
        }
    }

    impl BlockProvider for MemoryProvider {
        fn block(&self, height: u64) -> Option<Vec<u8>> {
            self.blocks.get(&height).cloned()
        }

        fn proof(&self, height: u64, _proof_option: u32) -> Option<Vec<u8>> {
            self.blocks
                .contains_key(&height)
                .then(|| format!("proof@{height}").into_bytes())
        }
    }

    struct Recorder {
        expected: HashMap<u64, Vec<u8>>,
        consumed: Mutex<Vec<(u64, PeerId)>>,
        rejected: Mutex<Vec<(u64, PeerId)>>,
        end: Mutex<Option<Option<FastSyncError>>>,
        done_tx: Sender<()>,
    }

    impl Recorder {
        fn new(expected: HashMap<u64, Vec<u8>>) -> (Arc<Self>, Receiver<()>) {
            let (done_tx, done_rx) = bounded(1);
            (
                Arc::new(Self {
                    expected,
                    consumed: Mutex::new(Vec::new()),
                    rejected: Mutex::new(Vec::new()),
                    end: Mutex::new(None),
                    done_tx,
                }),
                done_rx,
            )
        }
    }

    impl FetchCallback for Recorder {
        fn on_block(&self, result: BlockResult) {
            let good = self.expected.get(&result.height) == Some(&result.block);
            if good {
                assert!(
                    result.votes.starts_with(b"proof@"),
                    "commit proof travels with the block"
                );
                self.consumed
                    .lock()
                    .unwrap()
                    .push((result.height, result.peer));
                result.consume();
            } else {
                self.rejected
                    .lock()
                    .unwrap()
                    .push((result.height, result.peer));
                result.reject();
            }
        }

        fn on_end(&self, error: Option<FastSyncError>) {
            *self.end.lock().unwrap() = Some(error);
            let _ = self.done_tx.send(());
        }
    }

    struct Router {
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl Router {
        /// Dispatch a node's inbound traffic to its client/server halves.
        fn spawn(
            rx: Receiver<Inbound>,
            client: Option<FastSyncClient>,
            server: Option<Arc<FastSyncServer>>,
        ) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_flag = Arc::clone(&stop);
            let thread = std::thread::spawn(move || loop {
                if stop_flag.load(Ordering::Relaxed) {
                    return;
                }
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(inbound) => match &inbound.message {
                        NetMessage::BlockRequest(_) | NetMessage::CancelAllBlockRequests => {
                            if let Some(server) = &server {
                                server.on_receive(inbound.from, inbound.message);
                            }
                        }
                        NetMessage::BlockMetadata(_) | NetMessage::BlockData(_) => {
                            if let Some(client) = &client {
                                client.on_receive(inbound.from, inbound.message);
                            }
                        }
                        _ => {}
                    },
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            });
            Self {
                stop,
                thread: Some(thread),
            }
        }
    }

    impl Drop for Router {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::Relaxed);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
        }
    }

    fn join_node(hub: &ChannelHub) -> (PeerId, ChannelNetwork, Receiver<Inbound>) {
        let id = Keypair::new().pubkey();
        let (net, rx) = hub.join(id, 4096);
        (id, net, rx)
    }

    fn start_server(net: ChannelNetwork, provider: MemoryProvider) -> Arc<FastSyncServer> {
        let server = Arc::new(FastSyncServer::new(
            Arc::new(net),
            Arc::new(provider),
            NetConfig::dev_default(),
        ));
        server.start();
        server
    }

    #[test]
    fn test_catch_up_in_order() {
        let hub = ChannelHub::new();
        let (_a_id, a_net, a_rx) = join_node(&hub);
        let (_b_id, b_net, b_rx) = join_node(&hub);

        let server = start_server(a_net, MemoryProvider::range(0, 10, 7));
        let _a_router = Router::spawn(a_rx, None, Some(Arc::clone(&server)));

        let client = FastSyncClient::new(Arc::new(b_net), NetConfig::dev_default());
        client.start();
        let _b_router = Router::spawn(b_rx, Some(client.clone()), None);

        let expected: HashMap<u64, Vec<u8>> =
            (1..=10).map(|h| (h, block_bytes(h, 7))).collect();
        let (recorder, done_rx) = Recorder::new(expected);
        client.fetch_blocks(1, 10, recorder.clone()).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(20))
            .expect("fetch completes");
        assert_eq!(*recorder.end.lock().unwrap(), Some(None));
        let consumed = recorder.consumed.lock().unwrap();
        let heights: Vec<u64> = consumed.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, (1..=10).collect::<Vec<u64>>());
        assert!(recorder.rejected.lock().unwrap().is_empty());

        client.stop();
        server.stop();
    }

    #[test]
    fn test_missing_block_ends_with_error() {
        let hub = ChannelHub::new();
        let (_a_id, a_net, a_rx) = join_node(&hub);
        let (_b_id, b_net, b_rx) = join_node(&hub);

        // Heights 1 and 2 exist; 3 does not.
        let server = start_server(a_net, MemoryProvider::range(1, 2, 9));
        let _a_router = Router::spawn(a_rx, None, Some(Arc::clone(&server)));

        let client = FastSyncClient::new(Arc::new(b_net), NetConfig::dev_default());
        client.start();
        let _b_router = Router::spawn(b_rx, Some(client.clone()), None);

        let expected: HashMap<u64, Vec<u8>> =
            (1..=2).map(|h| (h, block_bytes(h, 9))).collect();
        let (recorder, done_rx) = Recorder::new(expected);
        client.fetch_blocks(1, 5, recorder.clone()).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(20))
            .expect("fetch terminates");
        let end = recorder.end.lock().unwrap().clone();
        assert_eq!(end, Some(Some(FastSyncError::NoBlock(3))));
        let consumed = recorder.consumed.lock().unwrap();
        let heights: Vec<u64> = consumed.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, vec![1, 2]);

        client.stop();
        server.stop();
    }

    #[test]
    fn test_reject_fails_over_to_honest_peer() {
        let hub = ChannelHub::new();
        let (bad_id, bad_net, bad_rx) = join_node(&hub);
        let (_good_id, good_net, good_rx) = join_node(&hub);
        let (_b_id, b_net, b_rx) = join_node(&hub);

        // The bad peer serves blocks with the wrong content.
        let bad_server = start_server(bad_net, MemoryProvider::range(1, 6, 0xbb));
        let good_server = start_server(good_net, MemoryProvider::range(1, 6, 7));
        let _bad_router = Router::spawn(bad_rx, None, Some(Arc::clone(&bad_server)));
        let _good_router = Router::spawn(good_rx, None, Some(Arc::clone(&good_server)));

        let client = FastSyncClient::new(Arc::new(b_net), NetConfig::dev_default());
        client.start();
        let _b_router = Router::spawn(b_rx, Some(client.clone()), None);

        let expected: HashMap<u64, Vec<u8>> =
            (1..=6).map(|h| (h, block_bytes(h, 7))).collect();
        let (recorder, done_rx) = Recorder::new(expected);
        client.fetch_blocks(1, 6, recorder.clone()).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(30))
            .expect("fetch completes despite the bad peer");
        assert_eq!(*recorder.end.lock().unwrap(), Some(None));

        let consumed = recorder.consumed.lock().unwrap();
        let heights: Vec<u64> = consumed.iter().map(|(h, _)| *h).collect();
        assert_eq!(heights, (1..=6).collect::<Vec<u64>>());
        // Nothing consumed came from the rejected peer once it was caught.
        let rejected = recorder.rejected.lock().unwrap();
        for (height, peer) in rejected.iter() {
            assert_eq!(*peer, bad_id);
            // The same height was later served correctly.
            assert!(heights.contains(height));
        }

        client.stop();
        bad_server.stop();
        good_server.stop();
    }

    #[test]
    fn test_second_fetch_while_active_is_rejected() {
        let hub = ChannelHub::new();
        let (_a_id, a_net, a_rx) = join_node(&hub);
        let (_b_id, b_net, b_rx) = join_node(&hub);
        let server = start_server(a_net, MemoryProvider::range(1, 50, 1));
        let _a_router = Router::spawn(a_rx, None, Some(Arc::clone(&server)));

        let client = FastSyncClient::new(Arc::new(b_net), NetConfig::dev_default());
        client.start();
        let _b_router = Router::spawn(b_rx, Some(client.clone()), None);

        let (recorder, _done_rx) = Recorder::new(HashMap::new());
        let (recorder2, _done2) = Recorder::new(HashMap::new());
        client.fetch_blocks(1, 50, recorder).unwrap();
        assert_eq!(
            client.fetch_blocks(1, 50, recorder2).unwrap_err(),
            FastSyncError::AlreadyInUse
        );
        client.stop();
        server.stop();
    }

    #[test]
    fn test_no_peers() {
        let hub = ChannelHub::new();
        let (_b_id, b_net, _b_rx) = join_node(&hub);
        let client = FastSyncClient::new(Arc::new(b_net), NetConfig::dev_default());
        let (recorder, _done) = Recorder::new(HashMap::new());
        assert_eq!(
            client.fetch_blocks(1, 5, recorder).unwrap_err(),
            FastSyncError::NoPeers
        );
    }
}
