//! Tessera Consensus Networking Layer
//!
//! Peer-to-peer plumbing for the `tessera-consensus` state machine:
//!
//! - **Gossip syncer** — per-peer workers exchange round-state summaries,
//!   missing votes and block parts for the ongoing height, pacing sends
//!   against a per-peer byte budget.
//! - **Block fast-sync** — a request/response protocol that lets a lagging
//!   node pull finalized blocks and their commit proofs from faster peers,
//!   with strictly ordered delivery and bad-peer failover.
//! - **Wire messages** — subprotocol-tagged envelopes, bincode-encoded and
//!   length-prefixed on the transport.
//! - **Transport** — length-prefixed TCP streams (QUIC upgrade path
//!   planned) behind the [`network::Network`] seam; an in-memory
//!   [`network::ChannelHub`] serves tests and single-process clusters.
//!
//! ## Crate modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`]    | `NetConfig` defaults and dev overrides |
//! | [`message`]   | Wire types, bincode ser/de, framing helpers |
//! | [`network`]   | `Network` trait, peer ids, in-memory hub |
//! | [`syncer`]    | Round-state gossip and vote/part feeding |
//! | [`fastsync`]  | Catch-up block transfer, client and server |
//! | [`transport`] | TCP listener, send/broadcast helpers |
//! | [`error`]     | Crate-wide error enum |

pub mod config;
pub mod error;
pub mod fastsync;
pub mod message;
pub mod network;
pub mod syncer;
pub mod transport;

pub use {
    config::NetConfig,
    error::{NetError, Result},
    fastsync::{
        BlockProvider, BlockResult, FastSyncClient, FastSyncError, FastSyncServer, FetchCallback,
    },
    message::NetMessage,
    network::{ChannelHub, ChannelNetwork, Network, PeerId},
    syncer::{SyncEngine, Syncer, SyncerEvent},
};
