//! Configuration for the consensus networking layer.

use std::{net::SocketAddr, time::Duration};

/// Tuning for the gossip syncer and the fast-sync protocols.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Local address the TCP transport binds to.
    /// Default: `0.0.0.0:9500`
    pub bind_addr: SocketAddr,

    /// Switch to fast-sync when a peer is this many heights ahead.
    pub fast_sync_threshold: u64,

    /// Fast-sync client: size of the in-order delivery window.
    pub max_pending_results: usize,

    /// Fast-sync client: concurrent block fetchers.
    pub max_active: usize,

    /// Fast-sync server: size of one `BlockData` chunk.
    pub chunk_size: usize,

    /// Fast-sync server: queued requests per peer before drops.
    pub request_queue_limit: usize,

    /// Fast-sync client: give up on a request after this long.
    pub request_timeout: Duration,

    /// Retry interval after a temporary send failure.
    pub send_interval: Duration,

    /// Period of the round-state beacon.
    pub round_state_interval: Duration,

    /// Per-peer outbound budget in bytes per second; zero or negative
    /// disables pacing.
    pub send_bps: i64,

    /// Maximum size of a single serialized message. Block parts dominate
    /// (~100 KiB); one part plus proof fits comfortably.
    pub max_message_size: usize,

    /// Size of the internal message channel buffers.
    pub channel_buffer_size: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9500".parse().expect("valid default bind addr"),
            fast_sync_threshold: 4,
            max_pending_results: 10,
            max_active: 3,
            chunk_size: 10 * 1024,
            request_queue_limit: 10,
            request_timeout: Duration::from_millis(3500),
            send_interval: Duration::from_millis(100),
            round_state_interval: Duration::from_millis(300),
            send_bps: 500 * 1024,
            max_message_size: 1_048_576,
            channel_buffer_size: 10_000,
        }
    }
}

impl NetConfig {
    /// Config for local tests: ephemeral port, short timers, no pacing.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".parse().expect("valid dev bind addr"),
            request_timeout: Duration::from_millis(500),
            send_interval: Duration::from_millis(20),
            round_state_interval: Duration::from_millis(50),
            send_bps: 0,
            channel_buffer_size: 1_000,
            ..Self::default()
        }
    }
}
