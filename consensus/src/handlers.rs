//! Inbound packet handlers and the validation/delivery callbacks handed to
//! the reliable-broadcast layer.
//!
//! Handlers are idempotent, validate and dedupe their input, and deposit
//! into the per-round data without ever blocking on machine state. Invalid
//! input is logged here and dropped; the vote store itself rejects silently.

use crate::committee::CommitteeManager;
use crate::data::ProposalOutcome;
use crate::fsm::FsmShared;
use crate::votes::{validate_block_cosignatures, AddVoteOutcome};
use std::sync::Arc;
use vivace_core::{
    decode_vote_packet, verify_block_header_signature, Block, CommitteeMessageType, Packet,
    PacketType, PullRemoteNodeStateRequest, RemoteNodeStatePacket,
};

/// Verdict returned to the broadcast layer before a payload is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationVerdict {
    Valid,
    Invalid,
    /// The payload targets a future height; deliver it again later.
    Paused,
    /// This node is shutting down.
    Stopped,
}

/// Local-delivery callback: routes a delivered packet into the matching
/// handler.
pub(crate) fn deliver<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, packet: &Packet) {
    if shared.stopped() {
        return;
    }
    match packet.packet_type {
        PacketType::PushBlock | PacketType::PushProposedBlock => push_block(shared, packet),
        PacketType::PushConfirmedBlock => push_confirmed_block(shared, packet),
        PacketType::PushPrevoteMessages => {
            push_votes(shared, packet, CommitteeMessageType::Prevote)
        }
        PacketType::PushPrecommitMessages => {
            push_votes(shared, packet, CommitteeMessageType::Precommit)
        }
        PacketType::PullBlocksResponse => pull_blocks_response(shared, packet),
        other => log::trace!("ignoring inbound {other:?}"),
    }
}

fn push_block<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, packet: &Packet) {
    let block = match Block::from_wire_bytes(&packet.payload) {
        Ok(block) => block,
        Err(error) => {
            log::warn!("rejecting invalid block packet: {error}");
            return;
        }
    };

    if !shared.data.is_block_broadcast_enabled() {
        log::trace!("rejecting block, broadcast is not enabled");
        return;
    }
    if block.header.height != shared.data.current_height() {
        log::debug!(
            "received block for height {} while at {}",
            block.header.height,
            shared.data.current_height()
        );
        shared.data.set_unexpected_block_height(true);
        return;
    }

    if !shared.data.is_proposed_signature_validated(&block.signature) {
        let proposer = shared.deps.manager.lock().committee().block_proposer;
        if block.header.signer != proposer {
            log::warn!(
                "rejecting block, signer {} invalid, expected {proposer}",
                block.header.signer
            );
            return;
        }
        if !verify_block_header_signature(&block) {
            log::warn!("rejecting block, signature invalid");
            return;
        }
        shared.data.add_validated_proposed_signature(block.signature);
    }

    match shared.data.try_set_proposed_block(Arc::new(block)) {
        ProposalOutcome::Accepted => log::trace!("accepted proposal"),
        ProposalOutcome::Duplicate => log::trace!("rejecting proposal, there is one already"),
        ProposalOutcome::Conflicting => {
            log::warn!("received a second, distinct proposal; keeping the first")
        }
    }
}

fn push_confirmed_block<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, packet: &Packet) {
    let block = match Block::from_wire_bytes(&packet.payload) {
        Ok(block) => block,
        Err(error) => {
            log::warn!("rejecting invalid confirmed block packet: {error}");
            return;
        }
    };

    if block.header.height != shared.data.current_height() {
        log::debug!(
            "received confirmed block for height {} while at {}",
            block.header.height,
            shared.data.current_height()
        );
        shared.data.set_unexpected_block_height(true);
        return;
    }
    if shared.data.confirmed_block().is_some() {
        log::trace!("rejecting confirmed block, there is one already");
        return;
    }

    if !shared.data.is_confirmed_signature_validated(&block.signature) {
        let valid = {
            let manager = shared.deps.manager.lock();
            validate_block_cosignatures(&block, &*manager, &shared.config)
        };
        if !valid {
            return;
        }
        shared
            .data
            .add_validated_confirmed_signature(block.signature);
    }

    shared.data.try_set_confirmed_block(Arc::new(block));
}

fn push_votes<M: CommitteeManager>(
    shared: &Arc<FsmShared<M>>,
    packet: &Packet,
    kind: CommitteeMessageType,
) {
    let name = match kind {
        CommitteeMessageType::Prevote => "prevote message",
        CommitteeMessageType::Precommit => "precommit message",
    };
    let messages = match decode_vote_packet(&packet.payload) {
        Ok(messages) => messages,
        Err(error) => {
            log::warn!("rejecting invalid vote packet: {error}");
            return;
        }
    };

    for message in messages {
        if message.message_type != kind {
            log::warn!("rejecting {name}, type does not match packet");
            continue;
        }
        let signer = message.cosignature.signer;
        if shared.data.proposed_block().is_none() {
            log::warn!("rejecting {name}, no proposed block");
            continue;
        }
        if message.block_hash != shared.data.proposed_block_hash() {
            log::warn!("rejecting {name}, block hash invalid");
            continue;
        }
        if signer
            .verify(message.signed_bytes(), &message.message_signature)
            .is_err()
        {
            log::warn!("rejecting {name}, message signature invalid");
            continue;
        }

        // Committee membership and the cosignature itself are checked by
        // the vote store, which rejects silently; logging happens here.
        let outcome = {
            let manager = shared.deps.manager.lock();
            shared.data.add_vote(message, &*manager, &shared.config)
        };
        match outcome {
            AddVoteOutcome::Invalid => {
                log::warn!("rejecting {name} of {signer}, signer or cosignature invalid")
            }
            AddVoteOutcome::Duplicate => log::trace!("already has vote of {signer} ({name})"),
            AddVoteOutcome::Added | AddVoteOutcome::QuorumReached => {
                log::debug!("collected {} {name}(s)", shared.data.vote_count(kind))
            }
        }
    }
}

fn pull_blocks_response<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, packet: &Packet) {
    let Some(sender) = shared.pending_blocks.lock().take() else {
        log::trace!("ignoring unsolicited blocks response");
        return;
    };
    let _ = sender.send(vivace_core::decode_blocks(&packet.payload));
}

/// Answers a peer's remote-node-state query with our view of the chain at
/// `min(requested, local)` and the keys this node signs with.
pub(crate) fn remote_node_state<M: CommitteeManager>(
    shared: &Arc<FsmShared<M>>,
    request: &PullRemoteNodeStateRequest,
) -> Option<Packet> {
    let last = shared.deps.supplier.last_block_element();
    let target = last.block.header.height.min(request.height);
    let element = if target == last.block.header.height {
        last
    } else {
        shared.deps.supplier.block_element_at(target)?
    };

    let mut harvester_keys = vec![shared.deps.boot_key];
    harvester_keys.extend(shared.deps.local_keys.iter().map(|k| k.public_key()));

    Some(
        RemoteNodeStatePacket {
            height: element.block.header.height,
            block_hash: element.entity_hash,
            node_work_state: shared.work_state(),
            harvester_keys,
        }
        .to_packet(),
    )
}

/// Pre-delivery validation callback for the broadcast layer. Expensive
/// signature checks are cached per round, so the later delivery path skips
/// re-verification.
pub(crate) fn validate<M: CommitteeManager>(
    shared: &Arc<FsmShared<M>>,
    packet: &Packet,
) -> ValidationVerdict {
    if shared.stopped() {
        return ValidationVerdict::Stopped;
    }
    match packet.packet_type {
        PacketType::PushBlock | PacketType::PushProposedBlock => {
            let Ok(block) = Block::from_wire_bytes(&packet.payload) else {
                return ValidationVerdict::Invalid;
            };
            let current = shared.data.current_height();
            if block.header.height > current {
                return ValidationVerdict::Paused;
            }
            if block.header.height < current {
                return ValidationVerdict::Invalid;
            }
            if shared.data.is_proposed_signature_validated(&block.signature) {
                return ValidationVerdict::Valid;
            }
            let proposer = shared.deps.manager.lock().committee().block_proposer;
            if block.header.signer == proposer && verify_block_header_signature(&block) {
                shared.data.add_validated_proposed_signature(block.signature);
                ValidationVerdict::Valid
            } else {
                ValidationVerdict::Invalid
            }
        }
        PacketType::PushConfirmedBlock => {
            let Ok(block) = Block::from_wire_bytes(&packet.payload) else {
                return ValidationVerdict::Invalid;
            };
            let current = shared.data.current_height();
            if block.header.height > current {
                return ValidationVerdict::Paused;
            }
            if block.header.height < current {
                return ValidationVerdict::Invalid;
            }
            if shared.data.is_confirmed_signature_validated(&block.signature) {
                return ValidationVerdict::Valid;
            }
            let valid = {
                let manager = shared.deps.manager.lock();
                validate_block_cosignatures(&block, &*manager, &shared.config)
            };
            if valid {
                shared
                    .data
                    .add_validated_confirmed_signature(block.signature);
                ValidationVerdict::Valid
            } else {
                ValidationVerdict::Invalid
            }
        }
        _ => ValidationVerdict::Valid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitteeConfig;
    use crate::fsm::{Collaborators, ConsensusFsm, SingleBlockProfile};
    use crate::interfaces::SystemTimeSource;
    use crate::test_util::*;
    use vivace_core::{
        cosign_block_header, encode_vote_packet, Hash256, Keypair, Signature,
    };

    type TestFsm = ConsensusFsm<SingleBlockProfile, FixedCommitteeManager>;

    fn fsm_at_height_one() -> (TestFsm, Vec<Keypair>) {
        let keypairs: Vec<Keypair> = (1..=3).map(|i| Keypair::from_seed([i; 32])).collect();
        let members: Vec<_> = keypairs.iter().map(|k| k.public_key()).collect();
        let chain = MockChain::with_genesis(0, 0);
        let deps = Collaborators {
            manager: parking_lot::Mutex::new(
                FixedCommitteeManager::equal_weights(members.clone()).at_round(0),
            ),
            retriever: StaticRetriever::new(Vec::new()),
            supplier: chain.clone(),
            generator: std::sync::Arc::new(PayloadGenerator {
                payload: Vec::new(),
            }),
            consumer: RecordingConsumer::new(chain),
            broadcast: LoopbackBroadcast::new(members[1], members.iter().copied().collect()),
            sender: RecordingSender::new(),
            importance: std::sync::Arc::new(FixedImportance(1)),
            views: std::sync::Arc::new(NoBans),
            difficulty: std::sync::Arc::new(ConstantDifficulty(1)),
            time: std::sync::Arc::new(SystemTimeSource),
            local_keys: vec![std::sync::Arc::new(keypairs[1].clone())],
            boot_key: members[1],
        };
        let config = CommitteeConfig {
            committee_approval: 0.5,
            ..CommitteeConfig::default()
        };
        let fsm = ConsensusFsm::new(config, deps);
        fsm.shared.data.set_current_height(1);
        fsm.shared.data.set_block_broadcast_enabled(true);
        fsm.shared.data.set_committee(None, Vec::new(), 3.0);
        (fsm, keypairs)
    }

    fn vote(
        keypair: &Keypair,
        block: &Block,
        kind: CommitteeMessageType,
    ) -> vivace_core::CommitteeMessage {
        let mut message = vivace_core::CommitteeMessage {
            message_type: kind,
            block_hash: block.hash(),
            cosignature: cosign_block_header(keypair, &block.header),
            message_signature: Signature::zero(),
        };
        message.message_signature = keypair.sign(message.signed_bytes());
        message
    }

    #[test]
    fn proposal_is_accepted_once_and_only_at_the_current_height() {
        let (fsm, keypairs) = fsm_at_height_one();
        let block = build_test_block(&keypairs[0], 1, 0);
        fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));
        assert_eq!(fsm.shared.data.proposed_block().unwrap().hash(), block.hash());

        // A duplicate delivery is a no-op (P7).
        fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));
        assert!(!fsm.shared.data.proposal_multiple());

        // A block for another height only flags the mismatch.
        let wrong_height = build_test_block(&keypairs[0], 2, 0);
        fsm.deliver(&Packet::new(
            PacketType::PushBlock,
            wrong_height.to_wire_bytes(),
        ));
        assert!(fsm.shared.data.unexpected_block_height());
        assert_eq!(fsm.shared.data.proposed_block().unwrap().hash(), block.hash());
    }

    #[test]
    fn proposal_from_a_non_proposer_is_rejected() {
        let (fsm, keypairs) = fsm_at_height_one();
        let block = build_test_block(&keypairs[2], 1, 0);
        fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));
        assert!(fsm.shared.data.proposed_block().is_none());
    }

    #[test]
    fn votes_are_validated_and_deduped() {
        let (fsm, keypairs) = fsm_at_height_one();
        let block = build_test_block(&keypairs[0], 1, 0);
        fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));

        let kind = CommitteeMessageType::Prevote;
        let good = vote(&keypairs[2], &block, kind);
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &[good]));
        assert_eq!(fsm.shared.data.vote_count(kind), 1);

        // Delivered again: still one vote (P5).
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &[good]));
        assert_eq!(fsm.shared.data.vote_count(kind), 1);

        // Signer outside the committee.
        let outsider = Keypair::from_seed([9; 32]);
        let bad = vote(&outsider, &block, kind);
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &[bad]));
        assert_eq!(fsm.shared.data.vote_count(kind), 1);

        // Vote for a different block hash.
        let mut stale = vote(&keypairs[1], &block, kind);
        stale.block_hash = Hash256::hash(b"other");
        stale.message_signature = keypairs[1].sign(stale.signed_bytes());
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &[stale]));
        assert_eq!(fsm.shared.data.vote_count(kind), 1);

        // Tampered message signature.
        let mut forged = vote(&keypairs[1], &block, kind);
        forged.message_signature = Signature::zero();
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &[forged]));
        assert_eq!(fsm.shared.data.vote_count(kind), 1);
    }

    #[test]
    fn quorum_signal_fires_through_the_vote_handler() {
        let (fsm, keypairs) = fsm_at_height_one();
        let block = build_test_block(&keypairs[0], 1, 0);
        fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));

        // Approval 0.5 of weight 3 needs 1.5: two votes suffice.
        let kind = CommitteeMessageType::Prevote;
        let votes = [
            vote(&keypairs[1], &block, kind),
            vote(&keypairs[2], &block, kind),
        ];
        fsm.deliver(&encode_vote_packet(PacketType::PushPrevoteMessages, &votes));
        assert!(fsm.shared.data.prevotes_sufficient());
    }

    #[test]
    fn validation_verdicts_follow_the_height_window() {
        let (fsm, keypairs) = fsm_at_height_one();

        let current = build_test_block(&keypairs[0], 1, 0);
        assert_eq!(
            fsm.validate(&Packet::new(PacketType::PushBlock, current.to_wire_bytes())),
            ValidationVerdict::Valid
        );

        let future = build_test_block(&keypairs[0], 2, 0);
        assert_eq!(
            fsm.validate(&Packet::new(PacketType::PushBlock, future.to_wire_bytes())),
            ValidationVerdict::Paused
        );

        let stale = build_test_block(&keypairs[0], 0, 0);
        assert_eq!(
            fsm.validate(&Packet::new(PacketType::PushBlock, stale.to_wire_bytes())),
            ValidationVerdict::Invalid
        );

        let forged = build_test_block(&keypairs[2], 1, 0);
        assert_eq!(
            fsm.validate(&Packet::new(PacketType::PushBlock, forged.to_wire_bytes())),
            ValidationVerdict::Invalid
        );

        assert_eq!(
            fsm.validate(&Packet::new(PacketType::PushBlock, vec![1, 2, 3])),
            ValidationVerdict::Invalid
        );
    }

    #[test]
    fn confirmed_block_requires_valid_cosignatures() {
        let (fsm, keypairs) = fsm_at_height_one();
        let mut block = build_test_block(&keypairs[0], 1, 0);

        // Without any cosignatures the approval threshold is missed.
        fsm.deliver(&Packet::new(
            PacketType::PushConfirmedBlock,
            block.to_wire_bytes(),
        ));
        assert!(fsm.shared.data.confirmed_block().is_none());

        block.cosignatures = keypairs[1..]
            .iter()
            .map(|keypair| cosign_block_header(keypair, &block.header))
            .collect();
        fsm.deliver(&Packet::new(
            PacketType::PushConfirmedBlock,
            block.to_wire_bytes(),
        ));
        assert!(fsm.shared.data.confirmed_block().is_some());
    }
}
