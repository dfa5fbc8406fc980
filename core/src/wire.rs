//! Wire packets exchanged between nodes.
//!
//! Every packet is packed little-endian and starts with a 6-byte header
//! (`size: u32`, `type: u16`) where `size` covers the whole packet including
//! the header. The layouts are bit-exact; decoding never panics on malformed
//! input and instead returns a typed [`WireError`].

use crate::block::{Block, BlockHeader, Cosignature};
use crate::crypto::{Hash256, PublicKey, Signature};
use crate::BlockHeight;
use thiserror::Error;

pub const PACKET_HEADER_SIZE: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("buffer of {0} bytes is too short")]
    Truncated(usize),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u16),
    #[error("size field {size} does not match buffer length {actual}")]
    SizeMismatch { size: u32, actual: usize },
    #[error("malformed {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    PushBlock = 1,
    PushProposedBlock = 2,
    PushConfirmedBlock = 3,
    PushPrevoteMessages = 4,
    PushPrecommitMessages = 5,
    PullRemoteNodeState = 6,
    PullRemoteNodeStateResponse = 7,
    PullBlocksRequest = 8,
    PullBlocksResponse = 9,
}

impl TryFrom<u16> for PacketType {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        Ok(match value {
            1 => PacketType::PushBlock,
            2 => PacketType::PushProposedBlock,
            3 => PacketType::PushConfirmedBlock,
            4 => PacketType::PushPrevoteMessages,
            5 => PacketType::PushPrecommitMessages,
            6 => PacketType::PullRemoteNodeState,
            7 => PacketType::PullRemoteNodeStateResponse,
            8 => PacketType::PullBlocksRequest,
            9 => PacketType::PullBlocksResponse,
            other => return Err(WireError::UnknownPacketType(other)),
        })
    }
}

/// A framed packet: the typed header plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: Vec<u8>) -> Self {
        Packet {
            packet_type,
            payload,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let size = (PACKET_HEADER_SIZE + self.payload.len()) as u32;
        let mut bytes = Vec::with_capacity(size as usize);
        bytes.extend_from_slice(&size.to_le_bytes());
        bytes.extend_from_slice(&(self.packet_type as u16).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(WireError::Truncated(bytes.len()));
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        if size as usize != bytes.len() {
            return Err(WireError::SizeMismatch {
                size,
                actual: bytes.len(),
            });
        }
        let packet_type = u16::from_le_bytes(bytes[4..6].try_into().unwrap()).try_into()?;
        Ok(Packet {
            packet_type,
            payload: bytes[PACKET_HEADER_SIZE..].to_vec(),
        })
    }
}

/// The work state a node reports to its peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NodeWorkState {
    #[default]
    None = 0,
    Synchronizing = 1,
    Running = 2,
}

impl TryFrom<u8> for NodeWorkState {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => NodeWorkState::None,
            1 => NodeWorkState::Synchronizing,
            2 => NodeWorkState::Running,
            _ => return Err(WireError::Malformed("node work state")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommitteeMessageType {
    Prevote = 0,
    Precommit = 1,
}

impl TryFrom<u8> for CommitteeMessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            0 => CommitteeMessageType::Prevote,
            1 => CommitteeMessageType::Precommit,
            _ => return Err(WireError::Malformed("committee message type")),
        })
    }
}

/// A single prevote or precommit: the signer's cosignature over the proposed
/// block header plus a message signature over the vote itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitteeMessage {
    pub message_type: CommitteeMessageType,
    pub block_hash: Hash256,
    pub cosignature: Cosignature,
    pub message_signature: Signature,
}

impl CommitteeMessage {
    pub const ENCODED_SIZE: usize = 1 + 32 + 32 + 64 + 64;
    /// The prefix covered by `message_signature`: everything but the message
    /// signature itself.
    pub const SIGNED_SIZE: usize = 1 + 32 + 32 + 64;

    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::SIGNED_SIZE);
        bytes.push(self.message_type as u8);
        bytes.extend_from_slice(&self.block_hash.0);
        bytes.extend_from_slice(&self.cosignature.signer.0);
        bytes.extend_from_slice(&self.cosignature.signature.0);
        bytes
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.signed_bytes();
        bytes.extend_from_slice(&self.message_signature.0);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != Self::ENCODED_SIZE {
            return Err(WireError::Malformed("committee message"));
        }
        Ok(CommitteeMessage {
            message_type: bytes[0].try_into()?,
            block_hash: Hash256::from_slice(&bytes[1..33])
                .map_err(|_| WireError::Malformed("committee message"))?,
            cosignature: Cosignature {
                signer: PublicKey::from_slice(&bytes[33..65])
                    .map_err(|_| WireError::Malformed("committee message"))?,
                signature: Signature::from_slice(&bytes[65..129])
                    .map_err(|_| WireError::Malformed("committee message"))?,
            },
            message_signature: Signature::from_slice(&bytes[129..193])
                .map_err(|_| WireError::Malformed("committee message"))?,
        })
    }
}

/// Encodes a vote batch: `{count: u8}` followed by `count` messages.
pub fn encode_vote_packet(packet_type: PacketType, messages: &[CommitteeMessage]) -> Packet {
    let mut payload = Vec::with_capacity(1 + messages.len() * CommitteeMessage::ENCODED_SIZE);
    payload.push(messages.len() as u8);
    for message in messages {
        payload.extend_from_slice(&message.to_bytes());
    }
    Packet::new(packet_type, payload)
}

pub fn decode_vote_packet(payload: &[u8]) -> Result<Vec<CommitteeMessage>, WireError> {
    if payload.is_empty() {
        return Err(WireError::Truncated(0));
    }
    let count = payload[0] as usize;
    let body = &payload[1..];
    if body.len() != count * CommitteeMessage::ENCODED_SIZE {
        return Err(WireError::Malformed("vote batch"));
    }
    body.chunks(CommitteeMessage::ENCODED_SIZE)
        .map(CommitteeMessage::from_bytes)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRemoteNodeStateRequest {
    pub height: BlockHeight,
}

impl PullRemoteNodeStateRequest {
    pub fn to_packet(&self) -> Packet {
        Packet::new(
            PacketType::PullRemoteNodeState,
            self.height.to_le_bytes().to_vec(),
        )
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        let height: [u8; 8] = payload
            .try_into()
            .map_err(|_| WireError::Malformed("remote node state request"))?;
        Ok(PullRemoteNodeStateRequest {
            height: BlockHeight::from_le_bytes(height),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNodeStatePacket {
    pub height: BlockHeight,
    pub block_hash: Hash256,
    pub node_work_state: NodeWorkState,
    pub harvester_keys: Vec<PublicKey>,
}

impl RemoteNodeStatePacket {
    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(42 + self.harvester_keys.len() * 32);
        payload.extend_from_slice(&self.height.to_le_bytes());
        payload.extend_from_slice(&self.block_hash.0);
        payload.push(self.node_work_state as u8);
        payload.push(self.harvester_keys.len() as u8);
        for key in &self.harvester_keys {
            payload.extend_from_slice(&key.0);
        }
        Packet::new(PacketType::PullRemoteNodeStateResponse, payload)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() < 42 {
            return Err(WireError::Truncated(payload.len()));
        }
        let count = payload[41] as usize;
        if payload.len() != 42 + count * 32 {
            return Err(WireError::Malformed("remote node state response"));
        }
        let mut harvester_keys = Vec::with_capacity(count);
        for chunk in payload[42..].chunks(32) {
            harvester_keys
                .push(PublicKey::from_slice(chunk).expect("chunk length checked above"));
        }
        Ok(RemoteNodeStatePacket {
            height: BlockHeight::from_le_bytes(payload[0..8].try_into().unwrap()),
            block_hash: Hash256::from_slice(&payload[8..40])
                .map_err(|_| WireError::Malformed("remote node state response"))?,
            node_work_state: payload[40].try_into()?,
            harvester_keys,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullBlocksRequest {
    pub height: BlockHeight,
    pub num_blocks: u32,
    pub num_response_bytes: u32,
}

impl PullBlocksRequest {
    pub fn to_packet(&self) -> Packet {
        let mut payload = Vec::with_capacity(16);
        payload.extend_from_slice(&self.height.to_le_bytes());
        payload.extend_from_slice(&self.num_blocks.to_le_bytes());
        payload.extend_from_slice(&self.num_response_bytes.to_le_bytes());
        Packet::new(PacketType::PullBlocksRequest, payload)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        if payload.len() != 16 {
            return Err(WireError::Malformed("pull blocks request"));
        }
        Ok(PullBlocksRequest {
            height: BlockHeight::from_le_bytes(payload[0..8].try_into().unwrap()),
            num_blocks: u32::from_le_bytes(payload[8..12].try_into().unwrap()),
            num_response_bytes: u32::from_le_bytes(payload[12..16].try_into().unwrap()),
        })
    }
}

/// Fixed-size prefix of an encoded block: `size: u32`, the header fields,
/// the producer signature, and `payload_len: u32`.
const BLOCK_FIXED_SIZE: usize = 4 + BlockHeader::ENCODED_SIZE + 64 + 4;
const COSIGNATURE_SIZE: usize = 96;

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> &'a [u8] {
        let slice = &self.bytes[self.offset..self.offset + n];
        self.offset += n;
        slice
    }
}

impl Block {
    /// Total encoded size of this block on the wire.
    pub fn wire_size(&self) -> usize {
        BLOCK_FIXED_SIZE
            + self.transactions_payload.len()
            + self.cosignatures.len() * COSIGNATURE_SIZE
    }

    /// Encodes the block: size, header, signature, payload, then trailing
    /// cosignatures filling the remainder. A confirmed block is a proposed
    /// block with cosignatures appended and the size field rewritten.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let size = self.wire_size();
        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&(size as u32).to_le_bytes());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.signature.0);
        bytes.extend_from_slice(&(self.transactions_payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&self.transactions_payload);
        for cosignature in &self.cosignatures {
            bytes.extend_from_slice(&cosignature.signer.0);
            bytes.extend_from_slice(&cosignature.signature.0);
        }
        bytes
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < BLOCK_FIXED_SIZE {
            return Err(WireError::Truncated(bytes.len()));
        }
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if size != bytes.len() {
            return Err(WireError::SizeMismatch {
                size: size as u32,
                actual: bytes.len(),
            });
        }

        let mut reader = Reader {
            bytes,
            offset: 4,
        };
        let header = BlockHeader {
            height: u64::from_le_bytes(reader.take(8).try_into().unwrap()),
            timestamp: i64::from_le_bytes(reader.take(8).try_into().unwrap()),
            round: i64::from_le_bytes(reader.take(8).try_into().unwrap()),
            committee_phase_time_ms: u64::from_le_bytes(reader.take(8).try_into().unwrap()),
            difficulty: u64::from_le_bytes(reader.take(8).try_into().unwrap()),
            previous_hash: Hash256::from_slice(reader.take(32)).unwrap(),
            transactions_hash: Hash256::from_slice(reader.take(32)).unwrap(),
            signer: PublicKey::from_slice(reader.take(32)).unwrap(),
        };
        let signature = Signature::from_slice(reader.take(64)).unwrap();
        let payload_len = u32::from_le_bytes(reader.take(4).try_into().unwrap()) as usize;

        let rest = &bytes[reader.offset..];
        if rest.len() < payload_len || (rest.len() - payload_len) % COSIGNATURE_SIZE != 0 {
            return Err(WireError::Malformed("block"));
        }
        let transactions_payload = rest[..payload_len].to_vec();
        let cosignatures = rest[payload_len..]
            .chunks(COSIGNATURE_SIZE)
            .map(|chunk| Cosignature {
                signer: PublicKey::from_slice(&chunk[0..32]).unwrap(),
                signature: Signature::from_slice(&chunk[32..96]).unwrap(),
            })
            .collect();

        Ok(Block {
            header,
            signature,
            transactions_payload,
            cosignatures,
        })
    }
}

/// Encodes a pull-blocks response: blocks concatenated back to back.
pub fn encode_blocks(blocks: &[Block]) -> Packet {
    let mut payload = Vec::new();
    for block in blocks {
        payload.extend_from_slice(&block.to_wire_bytes());
    }
    Packet::new(PacketType::PullBlocksResponse, payload)
}

pub fn decode_blocks(payload: &[u8]) -> Result<Vec<Block>, WireError> {
    let mut blocks = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(WireError::Truncated(rest.len()));
        }
        let size = u32::from_le_bytes(rest[0..4].try_into().unwrap()) as usize;
        if size < BLOCK_FIXED_SIZE || size > rest.len() {
            return Err(WireError::Malformed("block range"));
        }
        blocks.push(Block::from_wire_bytes(&rest[..size])?);
        rest = &rest[size..];
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{cosign_block_header, sign_block_header};
    use crate::crypto::Keypair;

    fn test_block(cosigners: usize) -> Block {
        let producer = Keypair::from_seed([1; 32]);
        let header = BlockHeader {
            height: 9,
            timestamp: 123_456,
            round: 2,
            committee_phase_time_ms: 750,
            difficulty: 10,
            previous_hash: Hash256::hash(b"parent"),
            transactions_hash: Hash256::hash(b"txs"),
            signer: producer.public_key(),
        };
        let signature = sign_block_header(&producer, &header);
        let cosignatures = (0..cosigners)
            .map(|i| cosign_block_header(&Keypair::from_seed([10 + i as u8; 32]), &header))
            .collect();
        Block {
            header,
            signature,
            transactions_payload: vec![0xab; 33],
            cosignatures,
        }
    }

    #[test]
    fn packet_roundtrip() {
        let packet = Packet::new(PacketType::PushBlock, vec![1, 2, 3]);
        let bytes = packet.to_bytes();
        assert_eq!(bytes.len(), PACKET_HEADER_SIZE + 3);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), packet);
    }

    #[test]
    fn packet_rejects_bad_size_and_type() {
        let mut bytes = Packet::new(PacketType::PushBlock, vec![1, 2, 3]).to_bytes();
        bytes[0] ^= 1;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(WireError::SizeMismatch { .. })
        ));

        let mut bytes = Packet::new(PacketType::PushBlock, Vec::new()).to_bytes();
        bytes[4] = 0xff;
        assert!(matches!(
            Packet::from_bytes(&bytes),
            Err(WireError::UnknownPacketType(_))
        ));
    }

    #[test]
    fn block_roundtrip_with_cosignatures() {
        for cosigners in [0, 1, 3] {
            let block = test_block(cosigners);
            let bytes = block.to_wire_bytes();
            assert_eq!(bytes.len(), block.wire_size());
            assert_eq!(Block::from_wire_bytes(&bytes).unwrap(), block);
        }
    }

    #[test]
    fn block_rejects_truncated_bytes() {
        let bytes = test_block(1).to_wire_bytes();
        assert!(Block::from_wire_bytes(&bytes[..bytes.len() - 1]).is_err());
        // A partial cosignature is not a valid trailer either.
        let mut bytes = test_block(0).to_wire_bytes();
        let new_len = bytes.len() as u32 + 10;
        bytes[0..4].copy_from_slice(&new_len.to_le_bytes());
        bytes.extend_from_slice(&[0; 10]);
        assert_eq!(
            Block::from_wire_bytes(&bytes),
            Err(WireError::Malformed("block"))
        );
    }

    #[test]
    fn blocks_concatenate_and_decode() {
        let blocks = vec![test_block(0), test_block(2)];
        let packet = encode_blocks(&blocks);
        assert_eq!(packet.packet_type, PacketType::PullBlocksResponse);
        assert_eq!(decode_blocks(&packet.payload).unwrap(), blocks);
        assert!(decode_blocks(&packet.payload[..10]).is_err());
    }

    #[test]
    fn vote_batch_roundtrip() {
        let keypair = Keypair::from_seed([3; 32]);
        let block = test_block(0);
        let cosignature = cosign_block_header(&keypair, &block.header);
        let mut message = CommitteeMessage {
            message_type: CommitteeMessageType::Prevote,
            block_hash: block.hash(),
            cosignature,
            message_signature: Signature::zero(),
        };
        message.message_signature = keypair.sign(message.signed_bytes());

        let packet = encode_vote_packet(PacketType::PushPrevoteMessages, &[message]);
        let decoded = decode_vote_packet(&packet.payload).unwrap();
        assert_eq!(decoded, vec![message]);
        assert_eq!(decoded[0].to_bytes().len(), CommitteeMessage::ENCODED_SIZE);

        // The message signature covers everything but itself.
        assert!(keypair
            .public_key()
            .verify(decoded[0].signed_bytes(), &decoded[0].message_signature)
            .is_ok());
    }

    #[test]
    fn remote_node_state_roundtrip() {
        let state = RemoteNodeStatePacket {
            height: 77,
            block_hash: Hash256::hash(b"tip"),
            node_work_state: NodeWorkState::Running,
            harvester_keys: vec![
                Keypair::from_seed([5; 32]).public_key(),
                Keypair::from_seed([6; 32]).public_key(),
            ],
        };
        let packet = state.to_packet();
        assert_eq!(
            RemoteNodeStatePacket::from_payload(&packet.payload).unwrap(),
            state
        );

        let request = PullRemoteNodeStateRequest { height: 77 };
        let packet = request.to_packet();
        assert_eq!(
            PullRemoteNodeStateRequest::from_payload(&packet.payload).unwrap(),
            request
        );
    }

    #[test]
    fn pull_blocks_request_roundtrip() {
        let request = PullBlocksRequest {
            height: 100,
            num_blocks: 32,
            num_response_bytes: 1 << 20,
        };
        let packet = request.to_packet();
        assert_eq!(
            PullBlocksRequest::from_payload(&packet.payload).unwrap(),
            request
        );
    }
}
