//! The per-round vote store and the block cosignature predicate.

use crate::committee::{Committee, CommitteeManager};
use crate::config::CommitteeConfig;
use std::collections::BTreeMap;
use vivace_core::{
    verify_block_header_cosignature, verify_block_header_signature, Block, CommitteeMessage,
    CommitteeMessageType, PublicKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddVoteOutcome {
    Added,
    Duplicate,
    /// The signer is outside the committee or the cosignature does not
    /// verify; the vote is dropped silently. The caller is responsible for
    /// logging.
    Invalid,
    /// The vote was added and tipped the weighted sum over the approval
    /// threshold.
    QuorumReached,
}

/// Collects prevotes and precommits keyed by signer, with a weighted-sum
/// quorum test over the committee manager's opaque weight algebra.
///
/// The precommit quorum only fires on top of a prevote quorum: precommits
/// collected earlier are accepted and held, and are released when the
/// prevote quorum forms. With `stage_own_precommits` set, a precommit this
/// node broadcast for itself is additionally counted only once the
/// broadcast layer has echoed it back.
#[derive(Debug, Default)]
pub struct VoteStore {
    prevotes: BTreeMap<PublicKey, CommitteeMessage>,
    precommits: BTreeMap<PublicKey, CommitteeMessage>,
    staged_precommits: BTreeMap<PublicKey, CommitteeMessage>,
    prevotes_sufficient: bool,
    precommits_sufficient: bool,
    stage_own_precommits: bool,
}

impl VoteStore {
    pub fn new(stage_own_precommits: bool) -> Self {
        VoteStore {
            stage_own_precommits,
            ..VoteStore::default()
        }
    }

    fn map(&self, kind: CommitteeMessageType) -> &BTreeMap<PublicKey, CommitteeMessage> {
        match kind {
            CommitteeMessageType::Prevote => &self.prevotes,
            CommitteeMessageType::Precommit => &self.precommits,
        }
    }

    pub fn has_vote(&self, signer: &PublicKey, kind: CommitteeMessageType) -> bool {
        self.map(kind).contains_key(signer)
    }

    pub fn vote_count(&self, kind: CommitteeMessageType) -> usize {
        self.map(kind).len()
    }

    pub fn votes(&self, kind: CommitteeMessageType) -> Vec<CommitteeMessage> {
        self.map(kind).values().copied().collect()
    }

    pub fn prevotes_sufficient(&self) -> bool {
        self.prevotes_sufficient
    }

    pub fn precommits_sufficient(&self) -> bool {
        self.precommits_sufficient
    }

    /// Holds an own precommit until the broadcast layer echoes it back.
    pub fn stage_for_broadcast(&mut self, message: CommitteeMessage) {
        if message.message_type == CommitteeMessageType::Precommit {
            self.staged_precommits
                .entry(message.cosignature.signer)
                .or_insert(message);
        }
    }

    pub fn sum_weight<M: CommitteeManager>(
        &self,
        kind: CommitteeMessageType,
        manager: &M,
        config: &CommitteeConfig,
    ) -> M::Weight {
        let mut sum = manager.zero_weight();
        for signer in self.map(kind).keys() {
            let weight = manager.weight(signer, config);
            manager.add(&mut sum, &weight);
        }
        sum
    }

    pub fn quorum_reached<M: CommitteeManager>(
        &self,
        kind: CommitteeMessageType,
        manager: &M,
        config: &CommitteeConfig,
        total: &M::Weight,
    ) -> bool {
        let sum = self.sum_weight(kind, manager, config);
        let mut required = total.clone();
        manager.mul(&mut required, config.committee_approval);
        let sufficient = manager.ge(&sum, &required);
        log::debug!(
            "sum of {} votes {}sufficient [{}, {}], vote count {}",
            match kind {
                CommitteeMessageType::Prevote => "prevote",
                CommitteeMessageType::Precommit => "precommit",
            },
            if sufficient { "" } else { "in" },
            sum,
            required,
            self.map(kind).len()
        );
        sufficient
    }

    /// Inserts a vote after validating the signer and the cosignature
    /// against the proposed block. Set semantics by signer; insertion order
    /// is irrelevant. Returns `QuorumReached` exactly once per kind per
    /// round.
    pub fn add<M: CommitteeManager>(
        &mut self,
        message: CommitteeMessage,
        block: &Block,
        committee: &Committee,
        manager: &M,
        config: &CommitteeConfig,
        total: Option<&M::Weight>,
    ) -> AddVoteOutcome {
        let signer = message.cosignature.signer;
        if !committee.contains(&signer) {
            return AddVoteOutcome::Invalid;
        }
        if !verify_block_header_cosignature(&block.header, &message.cosignature) {
            return AddVoteOutcome::Invalid;
        }

        match message.message_type {
            CommitteeMessageType::Prevote => {
                if self.prevotes.contains_key(&signer) {
                    return AddVoteOutcome::Duplicate;
                }
                self.prevotes.insert(signer, message);
                if !self.prevotes_sufficient {
                    if let Some(total) = total {
                        if self.quorum_reached(CommitteeMessageType::Prevote, manager, config, total)
                        {
                            self.prevotes_sufficient = true;
                            // Precommits held back for this quorum count now.
                            if !self.precommits_sufficient && self.staged_precommits.is_empty() {
                                self.precommits_sufficient = self.quorum_reached(
                                    CommitteeMessageType::Precommit,
                                    manager,
                                    config,
                                    total,
                                );
                            }
                            return AddVoteOutcome::QuorumReached;
                        }
                    }
                }
                AddVoteOutcome::Added
            }
            CommitteeMessageType::Precommit => {
                self.staged_precommits.remove(&signer);
                if self.precommits.contains_key(&signer) {
                    return AddVoteOutcome::Duplicate;
                }
                self.precommits.insert(signer, message);
                if !self.precommits_sufficient
                    && self.prevotes_sufficient
                    && self.staged_precommits.is_empty()
                {
                    if let Some(total) = total {
                        if self.quorum_reached(
                            CommitteeMessageType::Precommit,
                            manager,
                            config,
                            total,
                        ) {
                            self.precommits_sufficient = true;
                            return AddVoteOutcome::QuorumReached;
                        }
                    }
                }
                AddVoteOutcome::Added
            }
        }
    }

    /// Recomputes both sufficiency flags from the collected votes. The flags
    /// are sticky: once a quorum has been observed it stays observed until
    /// the store is cleared. A precommit quorum is only ever reported on top
    /// of a prevote quorum.
    pub fn recompute<M: CommitteeManager>(
        &mut self,
        manager: &M,
        config: &CommitteeConfig,
        total: Option<&M::Weight>,
    ) {
        let Some(total) = total else { return };
        self.prevotes_sufficient = self.prevotes_sufficient
            || self.quorum_reached(CommitteeMessageType::Prevote, manager, config, total);
        self.precommits_sufficient = self.precommits_sufficient
            || (self.prevotes_sufficient
                && self.quorum_reached(CommitteeMessageType::Precommit, manager, config, total));
    }

    pub fn clear(&mut self) {
        self.prevotes.clear();
        self.precommits.clear();
        self.staged_precommits.clear();
        self.prevotes_sufficient = false;
        self.precommits_sufficient = false;
    }
}

/// Checks a received block's producer and cosignatures against the committee
/// the selector currently stands at:
/// the signer must be the selected proposer, every cosigner must be in the
/// committee with a valid cosignature, the cosigned weight (proposer
/// included) must reach the approval threshold, and the cosignature count
/// must not exceed the committee size.
pub fn validate_block_cosignatures<M: CommitteeManager>(
    block: &Block,
    manager: &M,
    config: &CommitteeConfig,
) -> bool {
    let committee = manager.committee();
    if block.header.signer != committee.block_proposer {
        log::warn!(
            "rejecting block, signer {} invalid, expected {}",
            block.header.signer,
            committee.block_proposer
        );
        return false;
    }

    if !verify_block_header_signature(block) {
        log::warn!("rejecting block, signature invalid");
        return false;
    }

    if block.cosignatures.len() > committee.cosigners.len() + 1 {
        log::warn!("rejecting block, number of cosignatures exceeded committee number");
        return false;
    }

    let mut actual = manager.weight(&committee.block_proposer, config);
    for cosignature in &block.cosignatures {
        if !committee.cosigners.contains(&cosignature.signer) {
            log::warn!("rejecting block, invalid cosigner {}", cosignature.signer);
            return false;
        }
        if !verify_block_header_cosignature(&block.header, cosignature) {
            log::warn!("rejecting block, cosignature invalid");
            return false;
        }
        let weight = manager.weight(&cosignature.signer, config);
        manager.add(&mut actual, &weight);
    }

    let mut required = manager.total_committee_weight(config);
    manager.mul(&mut required, config.committee_approval);
    if !manager.ge(&actual, &required) {
        log::warn!(
            "rejecting block, sum of votes insufficient: {} < {}",
            actual,
            required
        );
        return false;
    }

    true
}
