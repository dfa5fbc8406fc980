//! Mock collaborators and fixtures shared by the unit and integration
//! tests.

use crate::committee::{Committee, CommitteeManager};
use crate::config::CommitteeConfig;
use crate::interfaces::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use vivace_core::{
    sign_block_header, Block, BlockHeader, BlockHeight, Difficulty, Hash256, Keypair,
    NodeWorkState, Packet, PublicKey, RoundIndex, Timestamp,
};

/// Deterministic committee over a fixed member list: member 0 proposes and
/// the rest cosign, at every round.
pub struct FixedCommitteeManager {
    members: Vec<PublicKey>,
    weights: BTreeMap<PublicKey, f64>,
    round: RoundIndex,
}

impl FixedCommitteeManager {
    pub fn equal_weights(members: Vec<PublicKey>) -> Self {
        let weights = members.iter().map(|key| (*key, 1.0)).collect();
        FixedCommitteeManager {
            members,
            weights,
            round: -1,
        }
    }

    /// Advances the selector to the given round, as the clock would.
    pub fn at_round(mut self, round: RoundIndex) -> Self {
        while self.round < round {
            self.round += 1;
        }
        self
    }
}

impl CommitteeManager for FixedCommitteeManager {
    type Weight = f64;

    fn reset(&mut self) {
        self.round = -1;
    }

    fn select_committee(&mut self, _config: &CommitteeConfig) {
        self.round += 1;
    }

    fn committee(&self) -> Committee {
        if self.round < 0 || self.members.is_empty() {
            return Committee {
                round: self.round,
                block_proposer: PublicKey::zero(),
                cosigners: BTreeSet::new(),
            };
        }
        let block_proposer = self.members[0];
        let cosigners = self
            .members
            .iter()
            .copied()
            .filter(|key| *key != block_proposer)
            .collect();
        Committee {
            round: self.round,
            block_proposer,
            cosigners,
        }
    }

    fn weight(&self, key: &PublicKey, _config: &CommitteeConfig) -> f64 {
        self.weights.get(key).copied().unwrap_or(0.0)
    }

    fn zero_weight(&self) -> f64 {
        0.0
    }

    fn add(&self, total: &mut f64, weight: &f64) {
        *total += weight;
    }

    fn mul(&self, weight: &mut f64, scalar: f64) {
        *weight *= scalar;
    }

    fn ge(&self, lhs: &f64, rhs: &f64) -> bool {
        lhs >= rhs
    }
}

/// A clock driven by the tokio timer, so paused-time tests auto-advance it.
pub struct VirtualClock {
    epoch: tokio::time::Instant,
    base: Timestamp,
}

impl VirtualClock {
    pub fn starting_at(base: Timestamp) -> Self {
        VirtualClock {
            epoch: tokio::time::Instant::now(),
            base,
        }
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Timestamp {
        self.base + self.epoch.elapsed().as_millis() as Timestamp
    }
}

/// An in-memory chain of block elements.
pub struct MockChain {
    elements: Mutex<Vec<BlockElement>>,
}

impl MockChain {
    pub fn with_genesis(timestamp: Timestamp, committee_phase_time_ms: u64) -> Arc<Self> {
        let header = BlockHeader {
            height: 0,
            timestamp,
            round: 0,
            committee_phase_time_ms,
            difficulty: 0,
            previous_hash: Hash256::zero(),
            transactions_hash: Hash256::zero(),
            signer: PublicKey::zero(),
        };
        let block = Arc::new(Block {
            header,
            signature: vivace_core::Signature::zero(),
            transactions_payload: Vec::new(),
            cosignatures: Vec::new(),
        });
        let entity_hash = block.hash();
        Arc::new(MockChain {
            elements: Mutex::new(vec![BlockElement { block, entity_hash }]),
        })
    }

    pub fn push(&self, block: Arc<Block>) {
        let entity_hash = block.hash();
        self.elements.lock().push(BlockElement { block, entity_hash });
    }

    pub fn height(&self) -> BlockHeight {
        self.elements
            .lock()
            .last()
            .map(|element| element.block.header.height)
            .unwrap_or(0)
    }
}

impl BlockElementSupplier for MockChain {
    fn last_block_element(&self) -> BlockElement {
        self.elements
            .lock()
            .last()
            .expect("mock chain always has a genesis")
            .clone()
    }

    fn block_element_at(&self, height: BlockHeight) -> Option<BlockElement> {
        self.elements
            .lock()
            .iter()
            .find(|element| element.block.header.height == height)
            .cloned()
    }
}

pub struct StaticRetriever {
    pub states: Mutex<Vec<RemoteNodeState>>,
}

impl StaticRetriever {
    pub fn new(states: Vec<RemoteNodeState>) -> Arc<Self> {
        Arc::new(StaticRetriever {
            states: Mutex::new(states),
        })
    }
}

#[async_trait]
impl RemoteNodeStateRetriever for StaticRetriever {
    async fn retrieve(&self) -> Vec<RemoteNodeState> {
        self.states.lock().clone()
    }
}

/// Produces a block with a fixed payload for whatever header it is given.
pub struct PayloadGenerator {
    pub payload: Vec<u8>,
}

impl BlockGenerator for PayloadGenerator {
    fn generate(
        &self,
        mut header: BlockHeader,
        _max_transactions: u32,
        _stop: &(dyn Fn() -> bool + Sync),
    ) -> Option<Block> {
        header.transactions_hash = Hash256::hash(&self.payload);
        Some(Block {
            header,
            signature: vivace_core::Signature::zero(),
            transactions_payload: self.payload.clone(),
            cosignatures: Vec::new(),
        })
    }
}

/// Records committed blocks and appends them to the backing chain.
pub struct RecordingConsumer {
    chain: Arc<MockChain>,
    pub committed: Mutex<Vec<Arc<Block>>>,
    pub fail: AtomicBool,
}

impl RecordingConsumer {
    pub fn new(chain: Arc<MockChain>) -> Arc<Self> {
        Arc::new(RecordingConsumer {
            chain,
            committed: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn committed_heights(&self) -> Vec<BlockHeight> {
        self.committed
            .lock()
            .iter()
            .map(|block| block.header.height)
            .collect()
    }
}

#[async_trait]
impl BlockRangeConsumer for RecordingConsumer {
    async fn commit_range(&self, blocks: Vec<Arc<Block>>) -> CommitResult {
        if self.fail.load(Ordering::SeqCst) {
            return CommitResult {
                status: CompletionStatus::Aborted,
                code: 1,
            };
        }
        for block in blocks {
            self.chain.push(Arc::clone(&block));
            self.committed.lock().push(block);
        }
        CommitResult {
            status: CompletionStatus::Normal,
            code: 0,
        }
    }
}

type DeliveryFn = Box<dyn Fn(&Packet) + Send + Sync>;

/// A broadcast layer that immediately delivers every packet back to the
/// local node (the self-echo every BRB provides), and records what was
/// sent.
pub struct LoopbackBroadcast {
    id: PublicKey,
    view: Mutex<View>,
    member: AtomicBool,
    delivery: Mutex<Option<DeliveryFn>>,
    pub sent: Mutex<Vec<Packet>>,
}

impl LoopbackBroadcast {
    pub fn new(id: PublicKey, view: View) -> Arc<Self> {
        Arc::new(LoopbackBroadcast {
            id,
            view: Mutex::new(view),
            member: AtomicBool::new(true),
            delivery: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_delivery(&self, delivery: DeliveryFn) {
        *self.delivery.lock() = Some(delivery);
    }

    pub fn set_member(&self, member: bool) {
        self.member.store(member, Ordering::SeqCst);
    }

    pub fn sent_types(&self) -> Vec<vivace_core::PacketType> {
        self.sent.lock().iter().map(|p| p.packet_type).collect()
    }
}

#[async_trait]
impl Broadcast for LoopbackBroadcast {
    fn id(&self) -> ProcessId {
        self.id
    }

    fn update_view(&self, _now: Timestamp, _height: BlockHeight, _register: bool) -> bool {
        self.member.load(Ordering::SeqCst)
    }

    fn current_view(&self) -> View {
        self.view.lock().clone()
    }

    async fn broadcast(&self, packet: Packet, _view: View) {
        self.sent.lock().push(packet.clone());
        if let Some(delivery) = &*self.delivery.lock() {
            delivery(&packet);
        }
    }
}

type EnqueueFn = Box<dyn Fn(&Packet, &View) + Send + Sync>;

/// Records enqueued unicasts; an optional callback lets a test answer pull
/// requests.
pub struct RecordingSender {
    pub sent: Mutex<Vec<(Packet, View)>>,
    pub removed: Mutex<Vec<ProcessId>>,
    pub unreachable: AtomicUsize,
    on_enqueue: Mutex<Option<EnqueueFn>>,
}

impl RecordingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingSender {
            sent: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            unreachable: AtomicUsize::new(0),
            on_enqueue: Mutex::new(None),
        })
    }

    pub fn set_on_enqueue(&self, on_enqueue: EnqueueFn) {
        *self.on_enqueue.lock() = Some(on_enqueue);
    }
}

impl MessageSender for RecordingSender {
    fn enqueue(&self, packet: Packet, targets: &View) {
        self.sent.lock().push((packet.clone(), targets.clone()));
        if let Some(on_enqueue) = &*self.on_enqueue.lock() {
            on_enqueue(&packet, targets);
        }
    }

    fn remove_node(&self, id: &ProcessId) {
        self.removed.lock().push(*id);
    }

    fn unreachable_count(&self, _view: &View) -> usize {
        self.unreachable.load(Ordering::SeqCst)
    }

    fn find_nodes(&self, _view: &View) {}

    fn clear_queue(&self) {}
}

pub struct FixedImportance(pub u64);

impl ImportanceGetter for FixedImportance {
    fn importance(&self, _key: &PublicKey) -> u64 {
        self.0
    }
}

pub struct MapImportance(pub BTreeMap<PublicKey, u64>);

impl ImportanceGetter for MapImportance {
    fn importance(&self, key: &PublicKey) -> u64 {
        self.0.get(key).copied().unwrap_or(0)
    }
}

pub struct NoBans;

impl ViewFetcher for NoBans {
    fn ban_period(&self, _id: &ProcessId) -> u64 {
        0
    }
}

pub struct ConstantDifficulty(pub Difficulty);

impl DifficultyProvider for ConstantDifficulty {
    fn difficulty(&self, _height: BlockHeight, _timestamp: Timestamp) -> Option<Difficulty> {
        Some(self.0)
    }
}

/// A signed block over an empty-ish payload, for tests that need a block
/// without driving the generator.
pub fn build_test_block(keypair: &Keypair, height: BlockHeight, round: RoundIndex) -> Block {
    let payload = b"test-payload".to_vec();
    let header = BlockHeader {
        height,
        timestamp: 0,
        round,
        committee_phase_time_ms: 1_000,
        difficulty: 1,
        previous_hash: Hash256::zero(),
        transactions_hash: Hash256::hash(&payload),
        signer: keypair.public_key(),
    };
    let signature = sign_block_header(keypair, &header);
    Block {
        header,
        signature,
        transactions_payload: payload,
        cosignatures: Vec::new(),
    }
}

/// A remote node state claiming the given tip.
pub fn remote_state(
    node_key: PublicKey,
    height: BlockHeight,
    block_hash: Hash256,
    work_state: NodeWorkState,
) -> RemoteNodeState {
    RemoteNodeState {
        height,
        block_hash,
        work_state,
        node_key,
        harvester_keys: vec![node_key],
    }
}
