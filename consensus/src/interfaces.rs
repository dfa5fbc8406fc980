//! Contracts of the external collaborators the consensus core drives.
//!
//! Everything behind these traits is out of scope for the core: storage,
//! transaction execution, the reliable-broadcast transport, the transaction
//! pool and key management all live on the other side.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use vivace_core::{
    Block, BlockHeader, BlockHeight, Difficulty, Hash256, NodeWorkState, Packet, PublicKey,
    Timestamp,
};

/// Identity of a process in the reliable-broadcast overlay.
pub type ProcessId = PublicKey;
/// The set of processes currently considered members of the overlay.
pub type View = BTreeSet<ProcessId>;

/// The chain tip (or a historical block) together with its entity hash.
#[derive(Debug, Clone)]
pub struct BlockElement {
    pub block: Arc<Block>,
    pub entity_hash: Hash256,
}

/// A peer's answer to a remote-node-state query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNodeState {
    pub height: BlockHeight,
    pub block_hash: Hash256,
    pub work_state: NodeWorkState,
    pub node_key: PublicKey,
    pub harvester_keys: Vec<PublicKey>,
}

/// Queries a configured set of remote peers for their chain state.
/// May return an empty vector when no peer answers in time.
#[async_trait]
pub trait RemoteNodeStateRetriever: Send + Sync + 'static {
    async fn retrieve(&self) -> Vec<RemoteNodeState>;
}

/// Supplies block elements from local storage.
pub trait BlockElementSupplier: Send + Sync + 'static {
    fn last_block_element(&self) -> BlockElement;

    fn block_element_at(&self, height: BlockHeight) -> Option<BlockElement>;
}

/// Assembles a block body for the given header. Must honor `stop` for
/// cooperative termination while fetching transactions.
pub trait BlockGenerator: Send + Sync + 'static {
    fn generate(
        &self,
        header: BlockHeader,
        max_transactions: u32,
        stop: &(dyn Fn() -> bool + Sync),
    ) -> Option<Block>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Normal,
    Aborted,
}

/// Outcome of handing a block range to the consumer. `Aborted` means the
/// commit was rejected; `code` carries the consumer's validation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitResult {
    pub status: CompletionStatus,
    pub code: u32,
}

impl CommitResult {
    pub fn is_success(&self) -> bool {
        self.status != CompletionStatus::Aborted
    }
}

/// Hands blocks over for execution and storage. Not safe for concurrent
/// commits; the core serializes calls.
#[async_trait]
pub trait BlockRangeConsumer: Send + Sync + 'static {
    async fn commit_range(&self, blocks: Vec<Arc<Block>>) -> CommitResult;
}

/// The Byzantine-reliable-broadcast process the core piggy-backs on.
///
/// `broadcast` eventually delivers the packet to every non-faulty process in
/// the view; before delivery the transport consults the core's validation
/// callback, and on local delivery it invokes the deliver callback.
#[async_trait]
pub trait Broadcast: Send + Sync + 'static {
    /// This process's identity in the overlay.
    fn id(&self) -> ProcessId;

    /// Refreshes the membership view for the given time and height.
    /// With `register` set, attempts to join when not a member.
    /// Returns whether this process is currently in the view.
    fn update_view(&self, now: Timestamp, height: BlockHeight, register: bool) -> bool;

    fn current_view(&self) -> View;

    async fn broadcast(&self, packet: Packet, view: View);
}

/// Unicasts typed packets to sets of node identities.
pub trait MessageSender: Send + Sync + 'static {
    fn enqueue(&self, packet: Packet, targets: &View);

    fn remove_node(&self, id: &ProcessId);

    /// Number of processes in `view` with no live connection.
    fn unreachable_count(&self, view: &View) -> usize;

    /// Kicks off discovery of the given processes so connections exist by
    /// the time votes need to flow.
    fn find_nodes(&self, view: &View);

    fn clear_queue(&self);
}

/// Per-key importance, used to rank peers when choosing whose chain-height
/// claim to trust.
pub trait ImportanceGetter: Send + Sync + 'static {
    fn importance(&self, key: &PublicKey) -> u64;
}

/// Exposes broadcast-overlay ban state.
pub trait ViewFetcher: Send + Sync + 'static {
    /// Remaining ban period of the process, in blocks. Zero means not
    /// banned.
    fn ban_period(&self, id: &ProcessId) -> u64;
}

/// Computes the difficulty of the next block from the difficulty cache.
pub trait DifficultyProvider: Send + Sync + 'static {
    fn difficulty(&self, height: BlockHeight, timestamp: Timestamp) -> Option<Difficulty>;
}

/// The wall clock. Abstracted so tests can run on a virtual clock.
pub trait TimeSource: Send + Sync + 'static {
    /// Current UNIX time in milliseconds.
    fn now(&self) -> Timestamp;
}

/// The system clock.
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is before the UNIX epoch")
            .as_millis() as Timestamp
    }
}
