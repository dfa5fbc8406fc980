//! The block model and the header signature/cosignature scheme.
//!
//! A block header is signed by its producer over the canonical header bytes,
//! while committee cosignatures are made over the header *hash* so that a
//! cosignature commits to exactly the same bytes on every node.

use crate::crypto::*;
use crate::{BlockHeight, Difficulty, RoundIndex, Timestamp};
use serde::{Deserialize, Serialize};

/// Domain separator for cosignatures, so a cosignature can never be confused
/// with a producer signature over a short message.
const COSIGNATURE_DOMAIN: &[u8] = b"vivace-block-cosignature";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct Cosignature {
    pub signer: PublicKey,
    pub signature: Signature,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct BlockHeader {
    /// The height of this block.
    pub height: BlockHeight,
    /// The timestamp of this block, which is the start of the round that
    /// produced it.
    pub timestamp: Timestamp,
    /// The committee round that produced this block.
    pub round: RoundIndex,
    /// The phase time the producing round ran with, in milliseconds.
    ///
    /// A value of zero means "the configured default"; the consensus layer
    /// substitutes it when computing the next round schedule.
    pub committee_phase_time_ms: u64,
    pub difficulty: Difficulty,
    /// The hash of the previous block.
    pub previous_hash: Hash256,
    /// The hash of the transaction payload.
    pub transactions_hash: Hash256,
    /// The block producer.
    pub signer: PublicKey,
}

impl BlockHeader {
    pub const ENCODED_SIZE: usize = 8 + 8 + 8 + 8 + 8 + 32 + 32 + 32;

    /// The canonical little-endian encoding that producer signatures and the
    /// block hash are computed over.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(Self::ENCODED_SIZE);
        bytes.extend_from_slice(&self.height.to_le_bytes());
        bytes.extend_from_slice(&self.timestamp.to_le_bytes());
        bytes.extend_from_slice(&self.round.to_le_bytes());
        bytes.extend_from_slice(&self.committee_phase_time_ms.to_le_bytes());
        bytes.extend_from_slice(&self.difficulty.to_le_bytes());
        bytes.extend_from_slice(&self.previous_hash.0);
        bytes.extend_from_slice(&self.transactions_hash.0);
        bytes.extend_from_slice(&self.signer.0);
        bytes
    }
}

impl ToHash256 for BlockHeader {
    fn to_hash256(&self) -> Hash256 {
        Hash256::hash(self.to_bytes())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Block {
    pub header: BlockHeader,
    /// The producer signature over the canonical header bytes.
    pub signature: Signature,
    /// The opaque transaction payload assembled by the block generator.
    pub transactions_payload: Vec<u8>,
    /// Committee cosignatures; empty on a freshly proposed block, filled in
    /// on a confirmed block.
    pub cosignatures: Vec<Cosignature>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.to_hash256()
    }
}

impl ToHash256 for Block {
    fn to_hash256(&self) -> Hash256 {
        self.header.to_hash256()
    }
}

pub fn sign_block_header(keypair: &Keypair, header: &BlockHeader) -> Signature {
    keypair.sign(header.to_bytes())
}

pub fn verify_block_header_signature(block: &Block) -> bool {
    block
        .header
        .signer
        .verify(block.header.to_bytes(), &block.signature)
        .is_ok()
}

fn cosignature_message(header: &BlockHeader) -> Vec<u8> {
    let mut message = COSIGNATURE_DOMAIN.to_vec();
    message.extend_from_slice(&header.to_hash256().0);
    message
}

pub fn cosign_block_header(keypair: &Keypair, header: &BlockHeader) -> Cosignature {
    Cosignature {
        signer: keypair.public_key(),
        signature: keypair.sign(cosignature_message(header)),
    }
}

pub fn verify_block_header_cosignature(header: &BlockHeader, cosignature: &Cosignature) -> bool {
    cosignature
        .signer
        .verify(cosignature_message(header), &cosignature.signature)
        .is_ok()
}
