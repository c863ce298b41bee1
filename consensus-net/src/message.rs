//! Wire messages and framing.
//!
//! Every message on a consensus channel is a subprotocol-tagged envelope:
//! `[subprotocol: u16-be][bincode payload]`. The transport adds a 4-byte
//! little-endian length prefix per frame. `BlockRequest` keeps backward
//! wire compatibility: a zero `proof_option` is encoded in the two-field v1
//! form, and the decoder accepts either form.

use {
    crate::error::{NetError, Result},
    serde::{Deserialize, Serialize},
    tessera_consensus::{
        types::{BlockPartMessage, PeerRoundState, ProposalMessage},
        vote::Vote,
        vote_list::VoteList,
    },
};

// ── Subprotocol codes ───────────────────────────────────────────────────────

pub const PROTO_PROPOSAL: u16 = 0x0100;
pub const PROTO_BLOCK_PART: u16 = 0x0200;
pub const PROTO_VOTE: u16 = 0x0300;
pub const PROTO_ROUND_STATE: u16 = 0x0400;
pub const PROTO_VOTE_LIST: u16 = 0x0500;
pub const PROTO_BLOCK_REQUEST: u16 = 0x0600;
pub const PROTO_BLOCK_METADATA: u16 = 0x0700;
pub const PROTO_BLOCK_DATA: u16 = 0x0800;
pub const PROTO_CANCEL_BLOCK_REQUESTS: u16 = 0x0900;

// ── Fast-sync messages ──────────────────────────────────────────────────────

/// Request for the finalized block at one height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRequest {
    pub request_id: u32,
    pub height: u64,
    /// Selects the proof flavor the server should attach; 0 is the plain
    /// commit-vote proof and is omitted on the wire (v1 form).
    pub proof_option: u32,
}

impl BlockRequest {
    pub fn new(request_id: u32, height: u64) -> Self {
        Self {
            request_id,
            height,
            proof_option: 0,
        }
    }

    /// Encode in the oldest form the content allows: two fields when
    /// `proof_option` is zero, three otherwise.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.proof_option == 0 {
            Ok(bincode::serialize(&(self.request_id, self.height))?)
        } else {
            Ok(bincode::serialize(&(
                self.request_id,
                self.height,
                self.proof_option,
            ))?)
        }
    }

    /// Decode either form; an absent `proof_option` defaults to 0.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if let Ok((request_id, height, proof_option)) =
            bincode::deserialize::<(u32, u64, u32)>(bytes)
        {
            return Ok(Self {
                request_id,
                height,
                proof_option,
            });
        }
        let (request_id, height) = bincode::deserialize::<(u32, u64)>(bytes)?;
        Ok(Self {
            request_id,
            height,
            proof_option: 0,
        })
    }

    /// Decode as a v1 reader would: only the two leading fields are read,
    /// anything after them is ignored.
    pub fn decode_v1(bytes: &[u8]) -> Result<Self> {
        let (request_id, height) = bincode::deserialize::<(u32, u64)>(bytes)?;
        Ok(Self {
            request_id,
            height,
            proof_option: 0,
        })
    }
}

/// Server's answer to a [`BlockRequest`]: the total serialized block length
/// and the commit proof. `block_length == -1` signals a missing block or
/// proof; no data follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub request_id: u32,
    pub block_length: i32,
    pub proof: Option<Vec<u8>>,
}

/// One chunk of a block's serialized bytes; chunks sum to `block_length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDataChunk {
    pub request_id: u32,
    pub data: Vec<u8>,
}

// ── Envelope ────────────────────────────────────────────────────────────────

/// Everything a consensus channel can carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetMessage {
    Proposal(ProposalMessage),
    BlockPart(BlockPartMessage),
    Vote(Vote),
    RoundState(PeerRoundState),
    VoteList(VoteList),
    BlockRequest(BlockRequest),
    BlockMetadata(BlockMetadata),
    BlockData(BlockDataChunk),
    CancelAllBlockRequests,
}

impl NetMessage {
    pub fn subprotocol(&self) -> u16 {
        match self {
            NetMessage::Proposal(_) => PROTO_PROPOSAL,
            NetMessage::BlockPart(_) => PROTO_BLOCK_PART,
            NetMessage::Vote(_) => PROTO_VOTE,
            NetMessage::RoundState(_) => PROTO_ROUND_STATE,
            NetMessage::VoteList(_) => PROTO_VOTE_LIST,
            NetMessage::BlockRequest(_) => PROTO_BLOCK_REQUEST,
            NetMessage::BlockMetadata(_) => PROTO_BLOCK_METADATA,
            NetMessage::BlockData(_) => PROTO_BLOCK_DATA,
            NetMessage::CancelAllBlockRequests => PROTO_CANCEL_BLOCK_REQUESTS,
        }
    }

    /// Return a human-readable tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            NetMessage::Proposal(_) => "proposal",
            NetMessage::BlockPart(_) => "block_part",
            NetMessage::Vote(_) => "vote",
            NetMessage::RoundState(_) => "round_state",
            NetMessage::VoteList(_) => "vote_list",
            NetMessage::BlockRequest(_) => "block_request",
            NetMessage::BlockMetadata(_) => "block_metadata",
            NetMessage::BlockData(_) => "block_data",
            NetMessage::CancelAllBlockRequests => "cancel_all_block_requests",
        }
    }

    /// Serialize into `[subprotocol][payload]` envelope bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = match self {
            NetMessage::Proposal(m) => bincode::serialize(m)?,
            NetMessage::BlockPart(m) => bincode::serialize(m)?,
            NetMessage::Vote(m) => bincode::serialize(m)?,
            NetMessage::RoundState(m) => bincode::serialize(m)?,
            NetMessage::VoteList(m) => bincode::serialize(m)?,
            NetMessage::BlockRequest(m) => m.encode()?,
            NetMessage::BlockMetadata(m) => bincode::serialize(m)?,
            NetMessage::BlockData(m) => bincode::serialize(m)?,
            NetMessage::CancelAllBlockRequests => Vec::new(),
        };
        let mut bytes = Vec::with_capacity(2 + payload.len());
        bytes.extend_from_slice(&self.subprotocol().to_be_bytes());
        bytes.extend_from_slice(&payload);
        Ok(bytes)
    }

    /// Decode an envelope produced by [`NetMessage::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(NetError::InvalidMessage("envelope too short".into()));
        }
        let subprotocol = u16::from_be_bytes([bytes[0], bytes[1]]);
        Self::decode_payload(subprotocol, &bytes[2..])
    }

    /// Decode a payload whose subprotocol arrived out of band.
    pub fn decode_payload(subprotocol: u16, payload: &[u8]) -> Result<Self> {
        Ok(match subprotocol {
            PROTO_PROPOSAL => NetMessage::Proposal(bincode::deserialize(payload)?),
            PROTO_BLOCK_PART => NetMessage::BlockPart(bincode::deserialize(payload)?),
            PROTO_VOTE => NetMessage::Vote(bincode::deserialize(payload)?),
            PROTO_ROUND_STATE => NetMessage::RoundState(bincode::deserialize(payload)?),
            PROTO_VOTE_LIST => NetMessage::VoteList(bincode::deserialize(payload)?),
            PROTO_BLOCK_REQUEST => NetMessage::BlockRequest(BlockRequest::decode(payload)?),
            PROTO_BLOCK_METADATA => NetMessage::BlockMetadata(bincode::deserialize(payload)?),
            PROTO_BLOCK_DATA => NetMessage::BlockData(bincode::deserialize(payload)?),
            PROTO_CANCEL_BLOCK_REQUESTS => NetMessage::CancelAllBlockRequests,
            other => return Err(NetError::UnknownSubprotocol(other)),
        })
    }

    /// Envelope plus a 4-byte little-endian length prefix.
    ///
    /// Wire format: `[len: u32-le][envelope: len bytes]`
    pub fn serialize_framed(&self, max_size: usize) -> Result<Vec<u8>> {
        let envelope = self.encode()?;
        if envelope.len() > max_size {
            return Err(NetError::MessageTooLarge {
                size: envelope.len(),
                max: max_size,
            });
        }
        let len = envelope.len() as u32;
        let mut buf = Vec::with_capacity(4 + envelope.len());
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&envelope);
        Ok(buf)
    }

    /// Read the length prefix from a 4-byte buffer.
    pub fn read_frame_len(header: &[u8; 4]) -> usize {
        u32::from_le_bytes(*header) as usize
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        solana_keypair::Keypair,
        tessera_consensus::{
            part_set::{part_set_from_bytes, PartSetIdAndAppData},
            vote::{RoundDecision, VoteType},
        },
    };

    #[test]
    fn test_block_request_v2_round_trip() {
        let v2 = BlockRequest {
            request_id: 0x0102_0304,
            height: 77,
            proof_option: 3,
        };
        let bytes = v2.encode().unwrap();
        assert_eq!(BlockRequest::decode(&bytes).unwrap(), v2);
    }

    #[test]
    fn test_block_request_v1_reader_drops_proof_option() {
        let v2 = BlockRequest {
            request_id: 9,
            height: 40,
            proof_option: 2,
        };
        let bytes = v2.encode().unwrap();
        let as_v1 = BlockRequest::decode_v1(&bytes).unwrap();
        assert_eq!(as_v1.request_id, 9);
        assert_eq!(as_v1.height, 40);
        assert_eq!(as_v1.proof_option, 0);
    }

    #[test]
    fn test_block_request_zero_option_encodes_as_v1() {
        let v2_zero = BlockRequest {
            request_id: 5,
            height: 10,
            proof_option: 0,
        };
        let v1 = BlockRequest::new(5, 10);
        assert_eq!(v2_zero.encode().unwrap(), v1.encode().unwrap());
        // And the short form decodes with the default option.
        assert_eq!(BlockRequest::decode(&v1.encode().unwrap()).unwrap(), v1);
    }

    #[test]
    fn test_envelope_round_trip_fast_sync() {
        for msg in [
            NetMessage::BlockRequest(BlockRequest::new(1, 2)),
            NetMessage::BlockMetadata(BlockMetadata {
                request_id: 1,
                block_length: -1,
                proof: None,
            }),
            NetMessage::BlockData(BlockDataChunk {
                request_id: 1,
                data: vec![1, 2, 3],
            }),
            NetMessage::CancelAllBlockRequests,
        ] {
            let bytes = msg.encode().unwrap();
            assert_eq!(NetMessage::decode(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn test_envelope_round_trip_consensus() {
        let kp = Keypair::new();
        let parts = part_set_from_bytes(64, b"a block to gossip around");
        let psid = PartSetIdAndAppData::new(parts.id(), 0);
        let proposal = tessera_consensus::types::ProposalMessage::new_signed(&kp, 4, 0, psid, -1);
        let vote = Vote::new_signed(
            &kp,
            VoteType::Prevote,
            4,
            0,
            RoundDecision::for_block(solana_sha256_hasher::hashv(&[b"id"]), psid),
            123,
            vec![],
        );
        let part_msg = tessera_consensus::types::BlockPartMessage {
            height: 4,
            part: parts.part(0).unwrap().clone(),
        };
        for msg in [
            NetMessage::Proposal(proposal),
            NetMessage::Vote(vote.clone()),
            NetMessage::BlockPart(part_msg),
            NetMessage::VoteList({
                let mut vl = VoteList::new();
                vl.add(&vote);
                vl
            }),
        ] {
            let bytes = msg.encode().unwrap();
            let back = NetMessage::decode(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn test_framing() {
        let msg = NetMessage::BlockRequest(BlockRequest::new(1, 100));
        let framed = msg.serialize_framed(1_048_576).unwrap();
        let len = NetMessage::read_frame_len(framed[..4].try_into().unwrap());
        assert_eq!(len, framed.len() - 4);
        let decoded = NetMessage::decode(&framed[4..4 + len]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_message_too_large() {
        let msg = NetMessage::BlockData(BlockDataChunk {
            request_id: 0,
            data: vec![0; 64],
        });
        assert!(matches!(
            msg.serialize_framed(8),
            Err(NetError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_subprotocol() {
        let bytes = [0xffu8, 0xff, 0, 0];
        assert!(matches!(
            NetMessage::decode(&bytes),
            Err(NetError::UnknownSubprotocol(0xffff))
        ));
    }
}
