//! End-to-end tests driving the consensus machine against mock
//! collaborators on a paused tokio clock.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use vivace_consensus::interfaces::BlockElementSupplier;
use vivace_consensus::test_util::*;
use vivace_consensus::*;
use vivace_core::{
    cosign_block_header, sign_block_header, Block, BlockHeader, Hash256, Keypair, NodeWorkState,
    Packet, PacketType, PublicKey, PullRemoteNodeStateRequest, RemoteNodeStatePacket, Timestamp,
};

const GENESIS_TIME: Timestamp = 1_000_000;
const PHASE_TIME_MS: u64 = 1_000;

fn test_config() -> CommitteeConfig {
    CommitteeConfig {
        committee_phase_time_ms: PHASE_TIME_MS,
        min_committee_phase_time_ms: 500,
        max_committee_phase_time_ms: 10_000,
        chain_height_request_interval_ms: 500,
        silence_interval_ms: 50,
        committee_approval: 0.67,
        check_network_height_interval: 30,
        ..CommitteeConfig::default()
    }
}

struct TestNode<P: VotingProfile> {
    fsm: ConsensusFsm<P, FixedCommitteeManager>,
    chain: Arc<MockChain>,
    consumer: Arc<RecordingConsumer>,
    broadcast: Arc<LoopbackBroadcast>,
    sender: Arc<RecordingSender>,
    retriever: Arc<StaticRetriever>,
    keypairs: Vec<Keypair>,
}

/// Stands up a three-member committee {A, B, C} with A as the proposer.
/// `local` selects which of the keys this node holds.
fn build_node<P: VotingProfile>(
    config: CommitteeConfig,
    local: &[usize],
    states: Option<Vec<vivace_consensus::interfaces::RemoteNodeState>>,
    importance: Arc<dyn vivace_consensus::interfaces::ImportanceGetter>,
) -> TestNode<P> {
    let _ = env_logger::builder().is_test(true).try_init();
    let keypairs: Vec<Keypair> = (1..=3).map(|i| Keypair::from_seed([i; 32])).collect();
    let members: Vec<PublicKey> = keypairs.iter().map(|k| k.public_key()).collect();

    let chain = MockChain::with_genesis(GENESIS_TIME, 0);
    let genesis_hash = chain.last_block_element().entity_hash;
    let states = states.unwrap_or_else(|| {
        members
            .iter()
            .map(|key| remote_state(*key, 0, genesis_hash, NodeWorkState::Running))
            .collect()
    });

    let local_keys: Vec<Arc<Keypair>> = local
        .iter()
        .map(|index| Arc::new(keypairs[*index].clone()))
        .collect();
    let boot_key = Keypair::from_seed([42; 32]).public_key();
    let self_id = local_keys
        .first()
        .map(|k| k.public_key())
        .unwrap_or(boot_key);

    let retriever = StaticRetriever::new(states);
    let consumer = RecordingConsumer::new(Arc::clone(&chain));
    let broadcast = LoopbackBroadcast::new(self_id, members.iter().copied().collect());
    let sender = RecordingSender::new();

    let deps = Collaborators {
        manager: Mutex::new(FixedCommitteeManager::equal_weights(members)),
        retriever: retriever.clone(),
        supplier: chain.clone(),
        generator: Arc::new(PayloadGenerator {
            payload: b"txs".to_vec(),
        }),
        consumer: consumer.clone(),
        broadcast: broadcast.clone(),
        sender: sender.clone(),
        importance,
        views: Arc::new(NoBans),
        difficulty: Arc::new(ConstantDifficulty(1)),
        time: Arc::new(VirtualClock::starting_at(GENESIS_TIME)),
        local_keys,
        boot_key,
    };

    let fsm = ConsensusFsm::<P, _>::new(config, deps);
    let deliver = fsm.clone();
    broadcast.set_delivery(Box::new(move |packet| deliver.deliver(packet)));

    TestNode {
        fsm,
        chain,
        consumer,
        broadcast,
        sender,
        retriever,
        keypairs,
    }
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

fn block_for_round_zero(node: &TestNode<SingleBlockProfile>, proposer: usize) -> Block {
    let payload = b"remote-txs".to_vec();
    let header = BlockHeader {
        height: 1,
        timestamp: GENESIS_TIME,
        round: 0,
        committee_phase_time_ms: PHASE_TIME_MS,
        difficulty: 1,
        previous_hash: node.chain.last_block_element().entity_hash,
        transactions_hash: Hash256::hash(&payload),
        signer: node.keypairs[proposer].public_key(),
    };
    let signature = sign_block_header(&node.keypairs[proposer], &header);
    Block {
        header,
        signature,
        transactions_payload: payload,
        cosignatures: Vec::new(),
    }
}

#[tokio::test(start_paused = true)]
async fn non_producer_commits_received_block() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1], // we are B; A proposes
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("block waiting", || fsm.state() == State::BlockWaiting).await;
    assert_eq!(fsm.current_height(), 1);
    assert_eq!(fsm.node_work_state(), NodeWorkState::Running);

    let block = block_for_round_zero(&node, 0);
    fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));

    wait_until("commit and round reset", || fsm.current_height() == 2).await;
    assert_eq!(node.consumer.committed_heights(), vec![1]);
    assert_eq!(node.chain.height(), 1);
    assert_eq!(fsm.current_round().round, 0);

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
    assert_eq!(fsm.state(), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn missing_proposer_increments_the_round() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("round increment", || fsm.current_round().round == 1).await;
    assert!(node.consumer.committed_heights().is_empty());
    assert_eq!(fsm.current_height(), 1, "height does not advance");

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn producer_generates_and_commits_its_own_block() {
    // This node holds the proposer key A; the loopback broadcast echoes the
    // generated block back after the silence interval.
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[0],
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("own block committed", || fsm.current_height() == 2).await;
    let committed = node.consumer.committed.lock().clone();
    assert_eq!(committed.len(), 1);
    assert_eq!(
        committed[0].header.signer,
        node.keypairs[0].public_key(),
        "the committed block is our own"
    );
    assert!(node
        .broadcast
        .sent_types()
        .contains(&PacketType::PushBlock));

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn network_ahead_triggers_fork_recovery_download() {
    // Scenario: the network is at height 2 with two hash groups; the group
    // with the higher total importance (A's) wins and serves the blocks.
    let keypairs: Vec<Keypair> = (1..=3).map(|i| Keypair::from_seed([i; 32])).collect();
    let tip_x = Hash256::hash(b"fork-x");
    let tip_y = Hash256::hash(b"fork-y");
    let states = vec![
        remote_state(keypairs[0].public_key(), 2, tip_x, NodeWorkState::Running),
        remote_state(keypairs[2].public_key(), 2, tip_y, NodeWorkState::Running),
    ];
    let importance = MapImportance(BTreeMap::from([
        (keypairs[0].public_key(), 500),
        (keypairs[2].public_key(), 300),
    ]));

    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        Some(states),
        Arc::new(importance),
    );
    let fsm = node.fsm.clone();

    // Answer pull-blocks requests with two properly cosigned blocks.
    let chain = node.chain.clone();
    let respond_fsm = node.fsm.clone();
    let signers = node.keypairs.clone();
    node.sender.set_on_enqueue(Box::new(move |packet, _| {
        if packet.packet_type != PacketType::PullBlocksRequest {
            return;
        }
        let mut previous_hash = chain.last_block_element().entity_hash;
        let mut blocks = Vec::new();
        for height in 1..=2u64 {
            let payload = format!("txs-{height}").into_bytes();
            let header = BlockHeader {
                height,
                timestamp: GENESIS_TIME,
                round: 0,
                committee_phase_time_ms: PHASE_TIME_MS,
                difficulty: 1,
                previous_hash,
                transactions_hash: Hash256::hash(&payload),
                signer: signers[0].public_key(),
            };
            let signature = sign_block_header(&signers[0], &header);
            let cosignatures = signers[1..]
                .iter()
                .map(|keypair| cosign_block_header(keypair, &header))
                .collect();
            let block = Block {
                header,
                signature,
                transactions_payload: payload,
                cosignatures,
            };
            previous_hash = block.hash();
            blocks.push(block);
        }
        respond_fsm.deliver(&vivace_core::encode_blocks(&blocks));
    }));

    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("chain synchronized to height 2", || node.chain.height() == 2).await;
    assert_eq!(node.consumer.committed_heights(), vec![1, 2]);

    // The download went to the higher-importance group only.
    let pulls: Vec<_> = node
        .sender
        .sent
        .lock()
        .iter()
        .filter(|(packet, _)| packet.packet_type == PacketType::PullBlocksRequest)
        .map(|(_, targets)| targets.clone())
        .collect();
    assert!(!pulls.is_empty());
    assert_eq!(
        pulls[0],
        BTreeSet::from([node.keypairs[0].public_key()]),
        "blocks are pulled from the winning hash group"
    );

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn parent_block_in_the_future_is_fatal() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        None,
        Arc::new(FixedImportance(100)),
    );
    // Replace the tip with a block whose timestamp lies ahead of the clock.
    let mut corrupted = build_test_block(&node.keypairs[0], 0, 0);
    corrupted.header.timestamp = GENESIS_TIME + 60_000;
    node.chain.push(Arc::new(corrupted));
    // Keep the retriever agreeing with the (corrupted) tip.
    let tip_hash = node.chain.last_block_element().entity_hash;
    *node.retriever.states.lock() = node
        .keypairs
        .iter()
        .map(|k| remote_state(k.public_key(), 0, tip_hash, NodeWorkState::Running))
        .collect();

    let runner = node.fsm.clone();
    let result = tokio::spawn(async move { runner.run().await })
        .await
        .unwrap();
    assert!(matches!(result, Err(FatalError::InvalidTime(_))));
}

#[tokio::test(start_paused = true)]
async fn network_behind_local_is_fatal() {
    // The peers answer with height 0 while our chain stands at height 1.
    let keypairs: Vec<Keypair> = (1..=3).map(|i| Keypair::from_seed([i; 32])).collect();
    let states = keypairs
        .iter()
        .map(|k| remote_state(k.public_key(), 0, Hash256::hash(b"old"), NodeWorkState::Running))
        .collect();
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        Some(states),
        Arc::new(FixedImportance(100)),
    );
    node.chain
        .push(Arc::new(build_test_block(&node.keypairs[0], 1, 0)));

    let runner = node.fsm.clone();
    let result = tokio::spawn(async move { runner.run().await })
        .await
        .unwrap();
    assert_eq!(result, Err(FatalError::InvalidLocalChain));
}

#[tokio::test(start_paused = true)]
async fn lost_broadcast_membership_retries_until_registered() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        None,
        Arc::new(FixedImportance(100)),
    );
    node.broadcast.set_member(false);
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    // Without membership the machine keeps cycling through the local-chain
    // check and never reaches a round.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fsm.state(), State::LocalChainCheck);
    assert!(node.consumer.committed_heights().is_empty());

    // Once registration succeeds the normal pipeline resumes.
    node.broadcast.set_member(true);
    wait_until("block waiting after re-registration", || {
        fsm.state() == State::BlockWaiting
    })
    .await;

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn no_mutation_after_shutdown() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("block waiting", || fsm.state() == State::BlockWaiting).await;
    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));

    // A late block delivery must not be accepted any more.
    let block = block_for_round_zero(&node, 0);
    fsm.deliver(&Packet::new(PacketType::PushBlock, block.to_wire_bytes()));
    assert_eq!(
        fsm.validate(&Packet::new(PacketType::PushBlock, Vec::new())),
        ValidationVerdict::Stopped
    );
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(node.consumer.committed_heights().is_empty());
    assert_eq!(fsm.state(), State::Stopped);
}

#[tokio::test(start_paused = true)]
async fn remote_node_state_reports_tip_and_keys() {
    let node = build_node::<SingleBlockProfile>(
        test_config(),
        &[1],
        None,
        Arc::new(FixedImportance(100)),
    );
    let response = node
        .fsm
        .remote_node_state(&PullRemoteNodeStateRequest { height: 5 })
        .expect("genesis is always available");
    assert_eq!(response.packet_type, PacketType::PullRemoteNodeStateResponse);
    let state = RemoteNodeStatePacket::from_payload(&response.payload).unwrap();
    assert_eq!(state.height, 0);
    assert_eq!(
        state.block_hash,
        node.chain.last_block_element().entity_hash
    );
    // Boot key first, then the unlocked harvester keys.
    assert_eq!(state.harvester_keys.len(), 2);
    assert_eq!(state.harvester_keys[1], node.keypairs[1].public_key());
}

#[tokio::test(start_paused = true)]
async fn two_phase_pipeline_commits_with_quorum() {
    // One node holds all three committee keys, so its own echoed votes form
    // the quorum: propose, prevote, staged precommit, confirmed commit.
    let node = build_node::<TwoPhaseProfile>(
        test_config(),
        &[0, 1, 2],
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("confirmed block committed", || fsm.current_height() == 2).await;
    let committed = node.consumer.committed.lock().clone();
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].header.height, 1);
    assert_eq!(
        committed[0].cosignatures.len(),
        2,
        "confirmed block carries the cosigners' precommit cosignatures"
    );

    let sent = node.broadcast.sent_types();
    for expected in [
        PacketType::PushProposedBlock,
        PacketType::PushPrevoteMessages,
        PacketType::PushPrecommitMessages,
        PacketType::PushConfirmedBlock,
    ] {
        assert!(sent.contains(&expected), "missing {expected:?} broadcast");
    }

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}

#[tokio::test(start_paused = true)]
async fn two_phase_without_quorum_increments_the_round() {
    // We hold only one of three equally weighted keys; 0.67 approval can
    // never be reached, so every round must end in an increment.
    let node = build_node::<TwoPhaseProfile>(
        test_config(),
        &[0],
        None,
        Arc::new(FixedImportance(100)),
    );
    let fsm = node.fsm.clone();
    let runner = node.fsm.clone();
    let handle = tokio::spawn(async move { runner.run().await });

    wait_until("round increment", || fsm.current_round().round >= 1).await;
    assert!(node.consumer.committed_heights().is_empty());
    assert_eq!(fsm.current_height(), 1);

    fsm.shutdown();
    assert_eq!(handle.await.unwrap(), Ok(()));
}
