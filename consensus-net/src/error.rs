//! Error types for the consensus networking layer.

use thiserror::Error;

/// Errors that can occur in the consensus networking layer.
#[derive(Error, Debug)]
pub enum NetError {
    /// Failed to serialize or deserialize a message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Message exceeds the maximum allowed size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// The peer is not known to this node.
    #[error("unknown peer: {0}")]
    UnknownPeer(solana_pubkey::Pubkey),

    /// A send failed but may succeed shortly (full queue, congested link).
    /// Retried on the send-interval timer.
    #[error("temporary send failure: {0}")]
    Temporary(String),

    /// Transport-level I/O error.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The channel delivering messages to the consensus engine is closed.
    #[error("consensus channel closed")]
    ChannelClosed,

    /// The peer sent an invalid or corrupt message.
    #[error("invalid message from peer: {0}")]
    InvalidMessage(String),

    /// An envelope carried a subprotocol code this node does not speak.
    #[error("unknown subprotocol: {0:#06x}")]
    UnknownSubprotocol(u16),
}

impl NetError {
    /// True for failures worth retrying on the send-interval timer.
    pub fn is_temporary(&self) -> bool {
        matches!(self, NetError::Temporary(_))
    }
}

/// Convenience result type for consensus networking operations.
pub type Result<T> = std::result::Result<T, NetError>;
