//! The consensus state machine: event types, the per-profile transition
//! tables and the single-threaded strand that drives them.
//!
//! All state transitions happen on the strand (one task draining an event
//! queue). Entry actions are spawned as background tasks holding a weak
//! handle; every continuation upgrades the handle and checks the stopped
//! flag before touching state, so nothing mutates the machine after
//! `shutdown`.

use crate::actions;
use crate::committee::CommitteeManager;
use crate::config::CommitteeConfig;
use crate::data::{ChainSyncData, RoundData};
use crate::handlers::{self, ValidationVerdict};
use crate::interfaces::*;
use crate::FatalError;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use vivace_core::{
    Block, Keypair, NodeWorkState, Packet, PublicKey, PullRemoteNodeStateRequest, Timestamp,
    WireError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    LocalChainCheck,
    /// Terminal error state; entering it surfaces
    /// [`FatalError::InvalidLocalChain`] out of the drive loop.
    InvalidLocalChain,
    BlocksDownloading,
    RoundDetection,
    ConnectionChecking,
    ProposerSelection,
    BlockGeneration,
    /// Single-block pipeline: waiting for the round's block.
    BlockWaiting,
    /// Two-phase pipeline: waiting for the round's proposal.
    ProposalWaiting,
    Prevote,
    Precommit,
    Commit,
    OnHold,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    NetworkHeightDetectionFailure,
    NetworkHeightLessThanLocal,
    NetworkHeightGreaterThanLocal,
    NetworkHeightEqualToLocal,
    NotRegisteredInBroadcast,
    BroadcastProcessBanned,
    DownloadBlocksSucceeded,
    DownloadBlocksFailed,
    RoundDetectionCompleted,
    ConnectionNumberSufficient,
    ConnectionNumberInsufficient,
    GenerateBlock,
    WaitForBlock,
    BlockGenerationSucceeded,
    BlockGenerationFailed,
    BlockReceived,
    ProposalReceived,
    BlockNotReceived { sync_with_network: bool },
    UnexpectedBlockHeight,
    PrevotesSufficient,
    PrevotesInsufficient,
    PrecommitsSufficient,
    PrecommitsInsufficient,
    CommitBlockSucceeded,
    CommitBlockFailed,
    Hold,
    Stop,
    Fatal(FatalError),
}

/// Round-number bookkeeping run on the strand before entering the next
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Advance the round by one at the same height.
    IncrementRound,
    /// Advance the height and zero the round after a successful commit.
    ResetRound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: State,
    pub side: Option<SideEffect>,
}

impl Transition {
    pub fn to(next: State) -> Self {
        Transition { next, side: None }
    }

    pub fn with(next: State, side: SideEffect) -> Self {
        Transition {
            next,
            side: Some(side),
        }
    }
}

/// Behavior bound to a state's entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    CheckLocalChain,
    DownloadBlocks,
    DetectRound,
    DetectStage,
    CheckConnections,
    SelectProposer,
    GenerateBlock,
    ProposeBlock,
    WaitForBlock,
    WaitForProposal,
    CollectPrevotes,
    CollectPrecommits,
    CommitBlock,
    CommitConfirmedBlock,
}

/// Transitions shared by both pipelines.
fn common_transition(state: State, event: &Event) -> Option<Transition> {
    use Event as E;
    use State as S;
    Some(match (state, event) {
        (S::Initial, E::Start) => Transition::to(S::LocalChainCheck),

        (S::LocalChainCheck, E::Start)
        | (S::LocalChainCheck, E::NetworkHeightDetectionFailure)
        | (S::LocalChainCheck, E::NotRegisteredInBroadcast)
        | (S::LocalChainCheck, E::BroadcastProcessBanned) => Transition::to(S::LocalChainCheck),
        (S::LocalChainCheck, E::NetworkHeightLessThanLocal) => {
            Transition::to(S::InvalidLocalChain)
        }
        (S::LocalChainCheck, E::NetworkHeightGreaterThanLocal) => {
            Transition::to(S::BlocksDownloading)
        }
        (S::LocalChainCheck, E::NetworkHeightEqualToLocal) => Transition::to(S::RoundDetection),

        (S::BlocksDownloading, E::DownloadBlocksSucceeded)
        | (S::BlocksDownloading, E::DownloadBlocksFailed) => Transition::to(S::LocalChainCheck),

        (S::RoundDetection, E::RoundDetectionCompleted) => Transition::to(S::ConnectionChecking),

        (S::ConnectionChecking, E::ConnectionNumberSufficient) => {
            Transition::to(S::ProposerSelection)
        }
        (S::ConnectionChecking, E::ConnectionNumberInsufficient) => {
            Transition::to(S::LocalChainCheck)
        }

        (S::ProposerSelection, E::GenerateBlock) => Transition::to(S::BlockGeneration),
        (S::ProposerSelection, E::NotRegisteredInBroadcast)
        | (S::ProposerSelection, E::BroadcastProcessBanned) => Transition::to(S::LocalChainCheck),

        (S::Commit, E::CommitBlockSucceeded) => {
            Transition::with(S::ConnectionChecking, SideEffect::ResetRound)
        }
        (S::Commit, E::CommitBlockFailed) => {
            Transition::with(S::ConnectionChecking, SideEffect::IncrementRound)
        }

        (S::LocalChainCheck, E::Hold)
        | (S::BlocksDownloading, E::Hold)
        | (S::Commit, E::Hold) => Transition::to(S::OnHold),

        _ => return None,
    })
}

/// Selects which pipeline runs between proposer selection and commit.
///
/// The two profiles share the reconciliation and scheduling states and
/// differ only in how a block becomes committable: directly on receipt, or
/// through the prevote/precommit quorums.
pub trait VotingProfile: Send + Sync + 'static {
    const NAME: &'static str;

    fn transition(state: State, event: &Event) -> Option<Transition>;

    fn entry_action(state: State) -> Option<ActionKind>;
}

/// Commit a received block directly: one block per round, no voting phases.
pub struct SingleBlockProfile;

impl VotingProfile for SingleBlockProfile {
    const NAME: &'static str = "single-block";

    fn transition(state: State, event: &Event) -> Option<Transition> {
        use Event as E;
        use State as S;
        let transition = match (state, event) {
            (S::ProposerSelection, E::WaitForBlock) => Transition::to(S::BlockWaiting),
            (S::BlockGeneration, E::BlockGenerationSucceeded)
            | (S::BlockGeneration, E::BlockGenerationFailed) => Transition::to(S::BlockWaiting),
            (S::BlockWaiting, E::BlockReceived) => Transition::to(S::Commit),
            (S::BlockWaiting, E::UnexpectedBlockHeight) => Transition::to(S::LocalChainCheck),
            (
                S::BlockWaiting,
                E::BlockNotReceived {
                    sync_with_network: true,
                },
            ) => Transition::to(S::LocalChainCheck),
            (
                S::BlockWaiting,
                E::BlockNotReceived {
                    sync_with_network: false,
                },
            ) => Transition::with(S::ConnectionChecking, SideEffect::IncrementRound),
            _ => return common_transition(state, event),
        };
        Some(transition)
    }

    fn entry_action(state: State) -> Option<ActionKind> {
        Some(match state {
            State::LocalChainCheck => ActionKind::CheckLocalChain,
            State::BlocksDownloading => ActionKind::DownloadBlocks,
            State::RoundDetection => ActionKind::DetectRound,
            State::ConnectionChecking => ActionKind::CheckConnections,
            State::ProposerSelection => ActionKind::SelectProposer,
            State::BlockGeneration => ActionKind::GenerateBlock,
            State::BlockWaiting => ActionKind::WaitForBlock,
            State::Commit => ActionKind::CommitBlock,
            _ => return None,
        })
    }
}

/// The four-phase pipeline: proposal, weighted prevotes, weighted
/// precommits, then commit of the confirmed block.
pub struct TwoPhaseProfile;

impl VotingProfile for TwoPhaseProfile {
    const NAME: &'static str = "two-phase";

    fn transition(state: State, event: &Event) -> Option<Transition> {
        use Event as E;
        use State as S;
        let transition = match (state, event) {
            (S::ProposerSelection, E::WaitForBlock) => Transition::to(S::ProposalWaiting),
            (S::BlockGeneration, E::BlockGenerationSucceeded) => Transition::to(S::Prevote),
            (S::BlockGeneration, E::BlockGenerationFailed) => Transition::to(S::ProposalWaiting),
            (S::ProposalWaiting, E::ProposalReceived) => Transition::to(S::Prevote),
            (S::ProposalWaiting, E::UnexpectedBlockHeight) => Transition::to(S::LocalChainCheck),
            (
                S::ProposalWaiting,
                E::BlockNotReceived {
                    sync_with_network: true,
                },
            ) => Transition::to(S::LocalChainCheck),
            (
                S::ProposalWaiting,
                E::BlockNotReceived {
                    sync_with_network: false,
                },
            ) => Transition::with(S::ConnectionChecking, SideEffect::IncrementRound),
            (S::Prevote, E::PrevotesSufficient) => Transition::to(S::Precommit),
            (S::Prevote, E::PrevotesInsufficient) => {
                Transition::with(S::ConnectionChecking, SideEffect::IncrementRound)
            }
            (S::Precommit, E::PrecommitsSufficient) => Transition::to(S::Commit),
            (S::Precommit, E::PrecommitsInsufficient) => {
                Transition::with(S::ConnectionChecking, SideEffect::IncrementRound)
            }
            (S::Commit, E::UnexpectedBlockHeight) => Transition::to(S::LocalChainCheck),
            _ => return common_transition(state, event),
        };
        Some(transition)
    }

    fn entry_action(state: State) -> Option<ActionKind> {
        Some(match state {
            State::LocalChainCheck => ActionKind::CheckLocalChain,
            State::BlocksDownloading => ActionKind::DownloadBlocks,
            State::RoundDetection => ActionKind::DetectStage,
            State::ConnectionChecking => ActionKind::CheckConnections,
            State::ProposerSelection => ActionKind::SelectProposer,
            State::BlockGeneration => ActionKind::ProposeBlock,
            State::ProposalWaiting => ActionKind::WaitForProposal,
            State::Prevote => ActionKind::CollectPrevotes,
            State::Precommit => ActionKind::CollectPrecommits,
            State::Commit => ActionKind::CommitConfirmedBlock,
            _ => return None,
        })
    }
}

/// The external collaborators the core drives, plus this node's keys.
pub struct Collaborators<M: CommitteeManager> {
    pub manager: Mutex<M>,
    pub retriever: Arc<dyn RemoteNodeStateRetriever>,
    pub supplier: Arc<dyn BlockElementSupplier>,
    pub generator: Arc<dyn BlockGenerator>,
    pub consumer: Arc<dyn BlockRangeConsumer>,
    pub broadcast: Arc<dyn Broadcast>,
    pub sender: Arc<dyn MessageSender>,
    pub importance: Arc<dyn ImportanceGetter>,
    pub views: Arc<dyn ViewFetcher>,
    pub difficulty: Arc<dyn DifficultyProvider>,
    pub time: Arc<dyn TimeSource>,
    /// The unlocked harvester keys of this node.
    pub local_keys: Vec<Arc<Keypair>>,
    /// This node's boot key, reported in remote-node-state responses.
    pub boot_key: PublicKey,
}

pub(crate) struct FsmShared<M: CommitteeManager> {
    pub(crate) config: CommitteeConfig,
    pub(crate) deps: Collaborators<M>,
    pub(crate) data: RoundData<M::Weight>,
    pub(crate) chain_sync: Mutex<Option<ChainSyncData>>,
    pub(crate) pending_blocks: Mutex<Option<oneshot::Sender<Result<Vec<Block>, WireError>>>>,
    work_state: Mutex<NodeWorkState>,
    pub(crate) state: Mutex<State>,
    stopped: AtomicBool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Serializes block commits into the range consumer, which is not safe
    /// for concurrent commits.
    pub(crate) commit_lock: tokio::sync::Mutex<()>,
}

impl<M: CommitteeManager> FsmShared<M> {
    pub(crate) fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.deps.time.now()
    }

    pub(crate) fn work_state(&self) -> NodeWorkState {
        *self.work_state.lock()
    }

    pub(crate) fn set_work_state(&self, state: NodeWorkState) {
        *self.work_state.lock() = state;
    }

    pub(crate) fn post(&self, event: Event) {
        // The receiver only disappears when the strand has exited.
        let _ = self.events_tx.send(event);
    }

    /// Runs a continuation at the given wall-clock time. The continuation
    /// holds a weak handle and is dropped silently after shutdown.
    pub(crate) fn run_at<F>(self: &Arc<Self>, timestamp: Timestamp, f: F)
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let delay = {
                let Some(shared) = weak.upgrade() else { return };
                (timestamp - shared.now()).max(0) as u64
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let Some(shared) = weak.upgrade() else { return };
            if shared.stopped() {
                return;
            }
            f(shared);
        });
    }

    /// Posts an event at an offset from the current round's start, the
    /// reference point of every in-round timer.
    pub(crate) fn post_at_round_offset(self: &Arc<Self>, offset_ms: u64, event: Event) {
        let at = self.data.round().round_start + offset_ms as Timestamp;
        self.run_at(at, move |shared| shared.post(event));
    }

    /// Waits for a one-shot completion signal up to the given deadline.
    /// `None` means the deadline passed first.
    pub(crate) async fn wait_signal(
        &self,
        rx: oneshot::Receiver<bool>,
        deadline: Timestamp,
    ) -> Option<bool> {
        let delay = (deadline - self.now()).max(0) as u64;
        tokio::select! {
            result = rx => result.ok(),
            () = tokio::time::sleep(Duration::from_millis(delay)) => None,
        }
    }
}

/// The per-node consensus orchestrator.
///
/// `run` drives the machine until shutdown or a fatal error; handlers
/// (`deliver`, `validate`, `remote_node_state`) are safe to call from any
/// thread and never block on machine state.
pub struct ConsensusFsm<P: VotingProfile, M: CommitteeManager> {
    pub(crate) shared: Arc<FsmShared<M>>,
    _profile: PhantomData<P>,
}

impl<P: VotingProfile, M: CommitteeManager> Clone for ConsensusFsm<P, M> {
    fn clone(&self) -> Self {
        ConsensusFsm {
            shared: Arc::clone(&self.shared),
            _profile: PhantomData,
        }
    }
}

impl<P: VotingProfile, M: CommitteeManager> ConsensusFsm<P, M> {
    pub fn new(config: CommitteeConfig, deps: Collaborators<M>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let data = RoundData::new(config.stage_own_precommits);
        ConsensusFsm {
            shared: Arc::new(FsmShared {
                config,
                deps,
                data,
                chain_sync: Mutex::new(None),
                pending_blocks: Mutex::new(None),
                work_state: Mutex::new(NodeWorkState::None),
                state: Mutex::new(State::Initial),
                stopped: AtomicBool::new(false),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                commit_lock: tokio::sync::Mutex::new(()),
            }),
            _profile: PhantomData,
        }
    }

    pub fn state(&self) -> State {
        *self.shared.state.lock()
    }

    pub fn node_work_state(&self) -> NodeWorkState {
        self.shared.work_state()
    }

    pub fn current_height(&self) -> vivace_core::BlockHeight {
        self.shared.data.current_height()
    }

    pub fn current_round(&self) -> crate::round::CommitteeRound {
        self.shared.data.round()
    }

    /// Local-delivery callback of the broadcast layer; also accepts packets
    /// received over plain unicast (pull responses).
    pub fn deliver(&self, packet: &Packet) {
        handlers::deliver(&self.shared, packet);
    }

    /// Pre-delivery validation callback handed to the broadcast layer.
    pub fn validate(&self, packet: &Packet) -> ValidationVerdict {
        handlers::validate(&self.shared, packet)
    }

    /// Answers a remote-node-state query from a peer.
    pub fn remote_node_state(&self, request: &PullRemoteNodeStateRequest) -> Option<Packet> {
        handlers::remote_node_state(&self.shared, request)
    }

    /// Requests a graceful stop. `run` returns once the strand has drained.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.data.reset_for_round(self.shared.now());
        self.shared.post(Event::Stop);
    }

    /// Drives the state machine until shutdown (Ok) or a fatal condition.
    /// May only be called once.
    pub async fn run(&self) -> Result<(), FatalError> {
        let mut events = self
            .shared
            .events_rx
            .lock()
            .take()
            .expect("ConsensusFsm::run may only be called once");
        log::debug!("starting {} consensus fsm", P::NAME);
        self.shared.post(Event::Start);

        while let Some(event) = events.recv().await {
            match event {
                Event::Stop => {
                    *self.shared.state.lock() = State::Stopped;
                    break;
                }
                Event::Fatal(error) => {
                    log::error!("fatal consensus error: {error}");
                    return Err(error);
                }
                event => {
                    if self.shared.stopped() {
                        continue;
                    }
                    let current = *self.shared.state.lock();
                    let Some(transition) = P::transition(current, &event) else {
                        log::trace!("no transition for {event:?} in {current:?}");
                        continue;
                    };
                    if let Some(side) = transition.side {
                        actions::apply_side_effect(&self.shared, side);
                    }
                    log::debug!("{current:?} + {event:?} -> {:?}", transition.next);
                    *self.shared.state.lock() = transition.next;
                    if transition.next == State::InvalidLocalChain {
                        log::error!("local chain is invalid and needs to be reset");
                        return Err(FatalError::InvalidLocalChain);
                    }
                    if let Some(kind) = P::entry_action(transition.next) {
                        actions::spawn_action(&self.shared, kind);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Committee view of the broadcast overlay minus this process.
pub(crate) fn view_without_self(view: &BTreeSet<PublicKey>, id: &PublicKey) -> BTreeSet<PublicKey> {
    let mut others = view.clone();
    others.remove(id);
    others
}
