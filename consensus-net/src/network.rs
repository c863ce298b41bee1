//! The network seam.
//!
//! The syncer and the fast-sync protocols speak to peers through the
//! [`Network`] trait: unicast, broadcast, and the current peer list. The
//! process-wide network manager implements it; tests and single-process
//! clusters use the in-memory [`ChannelHub`].

use {
    crate::{
        error::{NetError, Result},
        message::NetMessage,
    },
    crossbeam_channel::{bounded, Receiver, Sender, TrySendError},
    dashmap::DashMap,
    solana_pubkey::Pubkey,
    std::sync::Arc,
};

/// Peers are addressed by their identity key.
pub type PeerId = Pubkey;

/// A delivered message together with its sender.
#[derive(Debug)]
pub struct Inbound {
    pub from: PeerId,
    pub message: NetMessage,
}

/// Narrow contract against the process-wide network manager.
pub trait Network: Send + Sync {
    /// Send to one peer. Full queues surface as [`NetError::Temporary`].
    fn unicast(&self, peer: &PeerId, message: &NetMessage) -> Result<()>;

    /// Send to every connected peer.
    fn broadcast(&self, message: &NetMessage) -> Result<()>;

    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;
}

// ── In-memory network ───────────────────────────────────────────────────────

/// Hub connecting in-process endpoints; a loopback network for tests and
/// simulations.
#[derive(Clone, Default)]
pub struct ChannelHub {
    nodes: Arc<DashMap<PeerId, Sender<Inbound>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint; the receiver yields everything sent to `id`.
    pub fn join(&self, id: PeerId, queue_depth: usize) -> (ChannelNetwork, Receiver<Inbound>) {
        let (tx, rx) = bounded(queue_depth);
        self.nodes.insert(id, tx);
        (
            ChannelNetwork {
                nodes: Arc::clone(&self.nodes),
                local: id,
            },
            rx,
        )
    }

    pub fn leave(&self, id: &PeerId) {
        self.nodes.remove(id);
    }
}

/// One endpoint's view of a [`ChannelHub`].
#[derive(Clone)]
pub struct ChannelNetwork {
    nodes: Arc<DashMap<PeerId, Sender<Inbound>>>,
    local: PeerId,
}

impl Network for ChannelNetwork {
    fn unicast(&self, peer: &PeerId, message: &NetMessage) -> Result<()> {
        let entry = self
            .nodes
            .get(peer)
            .ok_or(NetError::UnknownPeer(*peer))?;
        match entry.try_send(Inbound {
            from: self.local,
            message: message.clone(),
        }) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(NetError::Temporary(format!("queue to {peer} is full")))
            }
            Err(TrySendError::Disconnected(_)) => Err(NetError::UnknownPeer(*peer)),
        }
    }

    fn broadcast(&self, message: &NetMessage) -> Result<()> {
        for entry in self.nodes.iter() {
            if *entry.key() == self.local {
                continue;
            }
            // Best effort, like a datagram broadcast.
            let _ = entry.value().try_send(Inbound {
                from: self.local,
                message: message.clone(),
            });
        }
        Ok(())
    }

    fn peers(&self) -> Vec<PeerId> {
        self.nodes
            .iter()
            .map(|e| *e.key())
            .filter(|id| *id != self.local)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::message::BlockRequest, solana_keypair::Keypair, solana_signer::Signer};

    fn ids(n: usize) -> Vec<PeerId> {
        (0..n).map(|_| Keypair::new().pubkey()).collect()
    }

    #[test]
    fn test_unicast_and_peers() {
        let hub = ChannelHub::new();
        let ids = ids(2);
        let (net_a, _rx_a) = hub.join(ids[0], 16);
        let (_net_b, rx_b) = hub.join(ids[1], 16);

        assert_eq!(net_a.peers(), vec![ids[1]]);
        net_a
            .unicast(&ids[1], &NetMessage::BlockRequest(BlockRequest::new(1, 5)))
            .unwrap();
        let inbound = rx_b.recv().unwrap();
        assert_eq!(inbound.from, ids[0]);
        assert_eq!(inbound.message.kind(), "block_request");
    }

    #[test]
    fn test_unknown_peer() {
        let hub = ChannelHub::new();
        let ids = ids(2);
        let (net_a, _rx) = hub.join(ids[0], 16);
        assert!(matches!(
            net_a.unicast(&ids[1], &NetMessage::CancelAllBlockRequests),
            Err(NetError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_full_queue_is_temporary() {
        let hub = ChannelHub::new();
        let ids = ids(2);
        let (net_a, _rx_a) = hub.join(ids[0], 16);
        let (_net_b, _rx_b) = hub.join(ids[1], 1);
        let msg = NetMessage::CancelAllBlockRequests;
        net_a.unicast(&ids[1], &msg).unwrap();
        let err = net_a.unicast(&ids[1], &msg).unwrap_err();
        assert!(err.is_temporary());
    }

    #[test]
    fn test_broadcast_skips_self() {
        let hub = ChannelHub::new();
        let ids = ids(3);
        let (net_a, rx_a) = hub.join(ids[0], 16);
        let (_b, rx_b) = hub.join(ids[1], 16);
        let (_c, rx_c) = hub.join(ids[2], 16);
        net_a.broadcast(&NetMessage::CancelAllBlockRequests).unwrap();
        assert!(rx_b.recv().is_ok());
        assert!(rx_c.recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }
}
