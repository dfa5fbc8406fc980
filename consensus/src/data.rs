//! Mutable per-round state shared between the consensus strand and the
//! inbound message handlers.
//!
//! A single mutex protects the record; completion signals are always sent
//! after the lock has been released, so a receiver resuming on another task
//! never contends with the signalling thread.

use crate::committee::CommitteeManager;
use crate::config::CommitteeConfig;
use crate::round::CommitteeRound;
use crate::votes::{AddVoteOutcome, VoteStore};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::oneshot;
use vivace_core::{
    Block, BlockHeight, CommitteeMessage, CommitteeMessageType, Hash256, Keypair, PublicKey,
    Signature, Timestamp,
};

/// Transient bookkeeping between the local-chain check and block download.
/// `node_identity_keys` is ordered by decreasing importance of the peers'
/// chain claims.
#[derive(Debug, Clone, Default)]
pub struct ChainSyncData {
    pub network_height: BlockHeight,
    pub local_height: BlockHeight,
    pub node_identity_keys: Vec<PublicKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOutcome {
    Accepted,
    /// The same proposal was delivered again; a no-op.
    Duplicate,
    /// A second, distinct proposal was observed. The first one is kept.
    Conflicting,
}

struct Inner<W> {
    round: CommitteeRound,
    current_height: BlockHeight,
    block_proposer: Option<Arc<Keypair>>,
    local_committee: Vec<Arc<Keypair>>,
    total_vote_weight: Option<W>,
    proposed_block: Option<Arc<Block>>,
    proposed_block_hash: Hash256,
    proposal_multiple: bool,
    confirmed_block: Option<Arc<Block>>,
    unexpected_block_height: bool,
    block_broadcast_enabled: bool,
    votes: VoteStore,
    validated_proposed_signatures: BTreeSet<Signature>,
    validated_confirmed_signatures: BTreeSet<Signature>,
    block_tx: Option<oneshot::Sender<bool>>,
    confirmed_tx: Option<oneshot::Sender<bool>>,
    prevotes_tx: Option<oneshot::Sender<bool>>,
    precommits_tx: Option<oneshot::Sender<bool>>,
}

impl<W> Inner<W> {
    fn new(stage_own_precommits: bool) -> Self {
        Inner {
            round: CommitteeRound::default(),
            current_height: 0,
            block_proposer: None,
            local_committee: Vec::new(),
            total_vote_weight: None,
            proposed_block: None,
            proposed_block_hash: Hash256::zero(),
            proposal_multiple: false,
            confirmed_block: None,
            unexpected_block_height: false,
            block_broadcast_enabled: false,
            votes: VoteStore::new(stage_own_precommits),
            validated_proposed_signatures: BTreeSet::new(),
            validated_confirmed_signatures: BTreeSet::new(),
            block_tx: None,
            confirmed_tx: None,
            prevotes_tx: None,
            precommits_tx: None,
        }
    }
}

/// Lifecycle-bound record for one `(height, round)` attempt.
pub struct RoundData<W> {
    inner: Mutex<Inner<W>>,
    stage_own_precommits: bool,
}

fn signal(sender: Option<oneshot::Sender<bool>>, value: bool) {
    if let Some(sender) = sender {
        let _ = sender.send(value);
    }
}

impl<W: Clone> RoundData<W> {
    pub fn new(stage_own_precommits: bool) -> Self {
        RoundData {
            inner: Mutex::new(Inner::new(stage_own_precommits)),
            stage_own_precommits,
        }
    }

    /// Clears everything bound to the current round, keeping the height.
    /// Pending waiters are released with `false`.
    pub fn reset_for_round(&self, now: Timestamp) {
        let (block_tx, confirmed_tx, prevotes_tx, precommits_tx) = {
            let mut inner = self.inner.lock();
            let current_height = inner.current_height;
            let pending = (
                inner.block_tx.take(),
                inner.confirmed_tx.take(),
                inner.prevotes_tx.take(),
                inner.precommits_tx.take(),
            );
            *inner = Inner::new(self.stage_own_precommits);
            inner.current_height = current_height;
            inner.round.round_start = now;
            pending
        };
        signal(block_tx, false);
        signal(confirmed_tx, false);
        signal(prevotes_tx, false);
        signal(precommits_tx, false);
    }

    pub fn round(&self) -> CommitteeRound {
        self.inner.lock().round
    }

    pub fn set_round(&self, round: CommitteeRound) {
        self.inner.lock().round = round;
    }

    pub fn current_height(&self) -> BlockHeight {
        self.inner.lock().current_height
    }

    pub fn set_current_height(&self, height: BlockHeight) {
        self.inner.lock().current_height = height;
    }

    pub fn increment_height(&self) {
        self.inner.lock().current_height += 1;
    }

    pub fn set_committee(
        &self,
        block_proposer: Option<Arc<Keypair>>,
        local_committee: Vec<Arc<Keypair>>,
        total_vote_weight: W,
    ) {
        let mut inner = self.inner.lock();
        inner.block_proposer = block_proposer;
        inner.local_committee = local_committee;
        inner.total_vote_weight = Some(total_vote_weight);
    }

    pub fn block_proposer(&self) -> Option<Arc<Keypair>> {
        self.inner.lock().block_proposer.clone()
    }

    pub fn local_committee(&self) -> Vec<Arc<Keypair>> {
        self.inner.lock().local_committee.clone()
    }

    pub fn proposed_block(&self) -> Option<Arc<Block>> {
        self.inner.lock().proposed_block.clone()
    }

    pub fn proposed_block_hash(&self) -> Hash256 {
        self.inner.lock().proposed_block_hash
    }

    pub fn proposal_multiple(&self) -> bool {
        self.inner.lock().proposal_multiple
    }

    /// Installs a proposal. The first proposal wins; a repeat of the same
    /// block is a no-op and a distinct one only marks `proposal_multiple`.
    pub fn try_set_proposed_block(&self, block: Arc<Block>) -> ProposalOutcome {
        let hash = block.hash();
        let (outcome, waiter) = {
            let mut inner = self.inner.lock();
            if inner.proposed_block.is_none() {
                inner.proposed_block = Some(block);
                inner.proposed_block_hash = hash;
                (ProposalOutcome::Accepted, inner.block_tx.take())
            } else if inner.proposed_block_hash == hash {
                (ProposalOutcome::Duplicate, None)
            } else {
                inner.proposal_multiple = true;
                (ProposalOutcome::Conflicting, None)
            }
        };
        signal(waiter, true);
        outcome
    }

    pub fn confirmed_block(&self) -> Option<Arc<Block>> {
        self.inner.lock().confirmed_block.clone()
    }

    /// Installs a confirmed block; repeats are no-ops.
    pub fn try_set_confirmed_block(&self, block: Arc<Block>) -> ProposalOutcome {
        let (outcome, waiter) = {
            let mut inner = self.inner.lock();
            if inner.confirmed_block.is_some() {
                (ProposalOutcome::Duplicate, None)
            } else {
                inner.confirmed_block = Some(block);
                (ProposalOutcome::Accepted, inner.confirmed_tx.take())
            }
        };
        signal(waiter, true);
        outcome
    }

    pub fn unexpected_block_height(&self) -> bool {
        self.inner.lock().unexpected_block_height
    }

    pub fn set_unexpected_block_height(&self, value: bool) {
        self.inner.lock().unexpected_block_height = value;
    }

    pub fn is_block_broadcast_enabled(&self) -> bool {
        self.inner.lock().block_broadcast_enabled
    }

    pub fn set_block_broadcast_enabled(&self, value: bool) {
        self.inner.lock().block_broadcast_enabled = value;
    }

    pub fn start_wait_for_block(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().block_tx = Some(tx);
        rx
    }

    pub fn start_wait_for_confirmed_block(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().confirmed_tx = Some(tx);
        rx
    }

    pub fn start_wait_for_prevotes(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().prevotes_tx = Some(tx);
        rx
    }

    pub fn start_wait_for_precommits(&self) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().precommits_tx = Some(tx);
        rx
    }

    pub fn has_vote(&self, signer: &PublicKey, kind: CommitteeMessageType) -> bool {
        self.inner.lock().votes.has_vote(signer, kind)
    }

    pub fn vote_count(&self, kind: CommitteeMessageType) -> usize {
        self.inner.lock().votes.vote_count(kind)
    }

    pub fn votes(&self, kind: CommitteeMessageType) -> Vec<CommitteeMessage> {
        self.inner.lock().votes.votes(kind)
    }

    pub fn stage_precommits(&self, messages: &[CommitteeMessage]) {
        let mut inner = self.inner.lock();
        for message in messages {
            inner.votes.stage_for_broadcast(*message);
        }
    }

    /// Deposits a vote, validating it against the proposed block and the
    /// current committee, and fires the matching quorum signals. A prevote
    /// quorum can release precommits collected earlier, so both signals are
    /// derived from the sufficiency transitions rather than the outcome.
    pub fn add_vote<M: CommitteeManager<Weight = W>>(
        &self,
        message: CommitteeMessage,
        manager: &M,
        config: &CommitteeConfig,
    ) -> AddVoteOutcome {
        let committee = manager.committee();
        let (outcome, prevote_waiter, precommit_waiter) = {
            let mut inner = self.inner.lock();
            let Some(block) = inner.proposed_block.clone() else {
                return AddVoteOutcome::Invalid;
            };
            let total = inner.total_vote_weight.clone();
            let prevotes_before = inner.votes.prevotes_sufficient();
            let precommits_before = inner.votes.precommits_sufficient();
            let outcome =
                inner
                    .votes
                    .add(message, &block, &committee, manager, config, total.as_ref());
            let prevote_waiter = if !prevotes_before && inner.votes.prevotes_sufficient() {
                inner.prevotes_tx.take()
            } else {
                None
            };
            let precommit_waiter = if !precommits_before && inner.votes.precommits_sufficient() {
                inner.precommits_tx.take()
            } else {
                None
            };
            (outcome, prevote_waiter, precommit_waiter)
        };
        signal(prevote_waiter, true);
        signal(precommit_waiter, true);
        outcome
    }

    pub fn recompute_vote_sums<M: CommitteeManager<Weight = W>>(
        &self,
        manager: &M,
        config: &CommitteeConfig,
    ) {
        let mut inner = self.inner.lock();
        let total = inner.total_vote_weight.clone();
        inner.votes.recompute(manager, config, total.as_ref());
    }

    pub fn prevotes_sufficient(&self) -> bool {
        self.inner.lock().votes.prevotes_sufficient()
    }

    pub fn precommits_sufficient(&self) -> bool {
        self.inner.lock().votes.precommits_sufficient()
    }

    pub fn is_proposed_signature_validated(&self, signature: &Signature) -> bool {
        self.inner
            .lock()
            .validated_proposed_signatures
            .contains(signature)
    }

    pub fn add_validated_proposed_signature(&self, signature: Signature) {
        self.inner
            .lock()
            .validated_proposed_signatures
            .insert(signature);
    }

    pub fn is_confirmed_signature_validated(&self, signature: &Signature) -> bool {
        self.inner
            .lock()
            .validated_confirmed_signatures
            .contains(signature)
    }

    pub fn add_validated_confirmed_signature(&self, signature: Signature) {
        self.inner
            .lock()
            .validated_confirmed_signatures
            .insert(signature);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::build_test_block;
    use vivace_core::Keypair;

    fn data() -> RoundData<f64> {
        let data = RoundData::new(true);
        data.set_current_height(1);
        data
    }

    #[test]
    fn first_proposal_wins() {
        let data = data();
        let keypair = Keypair::from_seed([1; 32]);
        let first = Arc::new(build_test_block(&keypair, 1, 0));
        let second = Arc::new(build_test_block(&Keypair::from_seed([2; 32]), 1, 0));

        assert_eq!(
            data.try_set_proposed_block(first.clone()),
            ProposalOutcome::Accepted
        );
        assert_eq!(
            data.try_set_proposed_block(second),
            ProposalOutcome::Conflicting
        );
        assert!(data.proposal_multiple());
        assert_eq!(data.proposed_block().unwrap().hash(), first.hash());
    }

    #[test]
    fn duplicate_proposal_is_a_no_op() {
        let data = data();
        let keypair = Keypair::from_seed([1; 32]);
        let block = Arc::new(build_test_block(&keypair, 1, 0));

        assert_eq!(
            data.try_set_proposed_block(block.clone()),
            ProposalOutcome::Accepted
        );
        assert_eq!(
            data.try_set_proposed_block(block),
            ProposalOutcome::Duplicate
        );
        assert!(!data.proposal_multiple());
    }

    #[tokio::test]
    async fn proposal_fires_the_waiting_signal() {
        let data = data();
        let rx = data.start_wait_for_block();
        let block = Arc::new(build_test_block(&Keypair::from_seed([1; 32]), 1, 0));
        data.try_set_proposed_block(block);
        assert_eq!(rx.await, Ok(true));
    }

    #[tokio::test]
    async fn reset_releases_waiters_with_false() {
        let data = data();
        let rx = data.start_wait_for_prevotes();
        data.reset_for_round(1_000);
        assert_eq!(rx.await, Ok(false));
        assert_eq!(data.current_height(), 1, "height survives a round reset");
        assert!(data.proposed_block().is_none());
    }
}
