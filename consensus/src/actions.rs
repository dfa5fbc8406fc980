//! Concrete behaviors bound to the state machine's states.
//!
//! Actions run as spawned tasks off the strand and communicate back purely
//! through events. Every await is followed by a stopped-flag check so no
//! action touches state after shutdown.

use crate::clock;
use crate::committee::CommitteeManager;
use crate::data::ChainSyncData;
use crate::fsm::{view_without_self, ActionKind, Event, FsmShared, SideEffect};
use crate::round::{CommitteePhase, CommitteeRound};
use crate::votes::validate_block_cosignatures;
use crate::FatalError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use vivace_core::{
    cosign_block_header, encode_vote_packet, sign_block_header, Block, BlockHeader,
    CommitteeMessage, CommitteeMessageType, Hash256, NodeWorkState, Packet, PacketType, PublicKey,
    PullBlocksRequest, Signature, Timestamp,
};

/// Wall-clock bound on a single peer's pull-blocks response.
const PULL_BLOCKS_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) fn spawn_action<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, kind: ActionKind) {
    let weak = Arc::downgrade(shared);
    tokio::spawn(async move {
        let Some(shared) = weak.upgrade() else { return };
        if shared.stopped() {
            return;
        }
        match kind {
            ActionKind::CheckLocalChain => check_local_chain(shared).await,
            ActionKind::DownloadBlocks => download_blocks(shared).await,
            ActionKind::DetectRound => detect_round(shared, false),
            ActionKind::DetectStage => detect_round(shared, true),
            ActionKind::CheckConnections => check_connections(shared),
            ActionKind::SelectProposer => select_proposer(shared),
            ActionKind::GenerateBlock => generate_block(shared, false).await,
            ActionKind::ProposeBlock => generate_block(shared, true).await,
            ActionKind::WaitForBlock => wait_for_block(shared, false).await,
            ActionKind::WaitForProposal => wait_for_block(shared, true).await,
            ActionKind::CollectPrevotes => collect_votes(shared, CommitteeMessageType::Prevote).await,
            ActionKind::CollectPrecommits => {
                collect_votes(shared, CommitteeMessageType::Precommit).await
            }
            ActionKind::CommitBlock => commit_block(shared).await,
            ActionKind::CommitConfirmedBlock => commit_confirmed_block(shared).await,
        }
    });
}

/// Round-number bookkeeping run synchronously on the strand.
pub(crate) fn apply_side_effect<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, side: SideEffect) {
    match side {
        SideEffect::IncrementRound => {
            let current = shared.data.round();
            let next = clock::next_round_on_increment(&current, &shared.config);
            shared.data.reset_for_round(shared.now());
            shared.data.set_round(next);
            log::debug!("incremented round {}", next.round);
        }
        SideEffect::ResetRound => {
            let current = shared.data.round();
            let next = clock::next_round_on_reset(&current, &shared.config);
            shared.data.reset_for_round(shared.now());
            shared.deps.manager.lock().reset();
            shared.data.increment_height();
            shared.data.set_round(next);
            log::debug!(
                "advanced to block {} round 0",
                shared.data.current_height()
            );
        }
    }
}

async fn check_local_chain<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let config = &shared.config;
    let local_height = shared
        .deps
        .supplier
        .last_block_element()
        .block
        .header
        .height;
    if config.max_chain_height > 0 && local_height >= config.max_chain_height {
        shared.post(Event::Hold);
        return;
    }

    shared.set_work_state(NodeWorkState::Synchronizing);
    *shared.chain_sync.lock() = None;
    shared.data.reset_for_round(shared.now());

    let in_broadcast_view =
        shared
            .deps
            .broadcast
            .update_view(shared.now(), local_height + 1, false);

    let mut states = shared.deps.retriever.retrieve().await;
    if shared.stopped() {
        return;
    }

    if states.is_empty() {
        log::debug!("got no remote node states");
        shared.post_at_round_offset(
            config.chain_height_request_interval_ms,
            Event::NetworkHeightDetectionFailure,
        );
        return;
    }

    states.sort_by(|a, b| (b.height, b.block_hash).cmp(&(a.height, a.block_hash)));
    let network_height = states[0].height;
    *shared.chain_sync.lock() = Some(ChainSyncData {
        network_height,
        local_height,
        node_identity_keys: Vec::new(),
    });

    if network_height < local_height {
        shared.post_at_round_offset(
            config.round_time_ms(config.min_committee_phase_time_ms),
            Event::NetworkHeightLessThanLocal,
        );
    } else if network_height > local_height {
        // Group the claims by their tip hash and trust the group backing the
        // most importance; honest forks lose deterministically.
        let mut groups: BTreeMap<Hash256, (u64, Vec<PublicKey>)> = BTreeMap::new();
        for state in &states {
            if state.height < network_height {
                break;
            }
            let group = groups.entry(state.block_hash).or_default();
            group.0 += shared.deps.importance.importance(&state.node_key);
            for key in &state.harvester_keys {
                group.0 += shared.deps.importance.importance(key);
            }
            group.1.push(state.node_key);
        }
        let node_identity_keys = groups
            .into_values()
            .max_by_key(|(importance, _)| *importance)
            .map(|(_, keys)| keys)
            .unwrap_or_default();
        if let Some(sync) = shared.chain_sync.lock().as_mut() {
            sync.node_identity_keys = node_identity_keys;
        }
        shared.post(Event::NetworkHeightGreaterThanLocal);
    } else {
        // Approval rating: does enough importance-weighted opinion agree
        // with our tip that we can stop synchronizing?
        let local_hash = shared.deps.supplier.last_block_element().entity_hash;
        let mut approval_rating = 0f64;
        let mut total_rating = 0f64;
        for state in &states {
            let importance: u64 = state
                .harvester_keys
                .iter()
                .map(|key| shared.deps.importance.importance(key))
                .sum();
            let alpha = if state.block_hash != local_hash {
                0.0
            } else if state.work_state != NodeWorkState::Running {
                config.not_running_contribution
            } else {
                1.0
            };
            let weight = ((importance + config.base_total_importance) as f64).log10();
            approval_rating += alpha * weight;
            total_rating += weight;
        }

        if approval_rating / total_rating >= config.end_sync_approval {
            if in_broadcast_view {
                shared.post(Event::NetworkHeightEqualToLocal);
            } else {
                shared
                    .deps
                    .broadcast
                    .update_view(shared.now(), local_height + 1, true);
                let banned = shared.deps.views.ban_period(&shared.deps.broadcast.id()) > 0;
                let event = if banned {
                    Event::BroadcastProcessBanned
                } else {
                    log::debug!("not registered in the broadcast system");
                    Event::NotRegisteredInBroadcast
                };
                shared.post_at_round_offset(config.chain_height_request_interval_ms, event);
            }
        } else {
            log::debug!("approval rating not sufficient");
            shared.post_at_round_offset(
                config.chain_height_request_interval_ms,
                Event::NetworkHeightDetectionFailure,
            );
        }
    }
}

async fn download_blocks<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let config = &shared.config;
    let Some(sync) = shared.chain_sync.lock().clone() else {
        shared.post_at_round_offset(
            config.chain_height_request_interval_ms,
            Event::DownloadBlocksFailed,
        );
        return;
    };

    let mut start_height = sync.local_height + 1;
    let target_height = sync
        .network_height
        .min(sync.local_height + config.max_blocks_per_sync_attempt as u64);

    shared.deps.sender.clear_queue();
    'peers: for peer in &sync.node_identity_keys {
        let (tx, rx) = oneshot::channel();
        *shared.pending_blocks.lock() = Some(tx);
        let request = PullBlocksRequest {
            height: start_height,
            num_blocks: (target_height - start_height + 1) as u32,
            num_response_bytes: config.max_chain_bytes_per_sync_attempt,
        };
        shared
            .deps
            .sender
            .enqueue(request.to_packet(), &BTreeSet::from([*peer]));

        let response = tokio::time::timeout(PULL_BLOCKS_TIMEOUT, rx).await;
        *shared.pending_blocks.lock() = None;
        if shared.stopped() {
            return;
        }
        let blocks = match response {
            Ok(Ok(Ok(blocks))) => blocks,
            Ok(Ok(Err(error))) => {
                log::warn!("{peer} returned malformed blocks response: {error}");
                shared.deps.sender.remove_node(peer);
                continue;
            }
            Ok(Err(_)) | Err(_) => {
                log::warn!("pull blocks request to {peer} timed out");
                continue;
            }
        };
        if blocks.is_empty() {
            continue;
        }

        for block in blocks {
            let block = Arc::new(block);
            let valid = {
                let mut manager = shared.deps.manager.lock();
                manager.reset();
                while manager.committee().round < block.header.round {
                    manager.select_committee(config);
                }
                log::debug!(
                    "block {}: selected committee for round {}",
                    block.header.height,
                    block.header.round
                );
                validate_block_cosignatures(&block, &*manager, config)
            };

            let committed = if valid {
                let _guard = shared.commit_lock.lock().await;
                let result = shared.deps.consumer.commit_range(vec![block.clone()]).await;
                if result.is_success() {
                    log::info!(
                        "successfully committed block (height {}, signer {})",
                        block.header.height,
                        block.header.signer
                    );
                } else {
                    log::warn!(
                        "block (height {}) commit failed due to {}",
                        block.header.height,
                        result.code
                    );
                }
                result.is_success()
            } else {
                false
            };
            if shared.stopped() {
                return;
            }

            if !committed {
                // Retry from the failed block with the next peer.
                start_height = block.header.height;
                continue 'peers;
            }

            if config.max_chain_height > 0 && block.header.height >= config.max_chain_height {
                shared.post(Event::Hold);
                return;
            }
        }

        shared.post(Event::DownloadBlocksSucceeded);
        return;
    }

    shared.post_at_round_offset(
        config.chain_height_request_interval_ms,
        Event::DownloadBlocksFailed,
    );
}

fn detect_round<M: CommitteeManager>(shared: Arc<FsmShared<M>>, phased: bool) {
    let config = &shared.config;
    *shared.chain_sync.lock() = None;
    shared.set_work_state(NodeWorkState::Running);

    let element = shared.deps.supplier.last_block_element();
    let parent = &element.block.header;
    let now = shared.now();

    let round = {
        let mut manager = shared.deps.manager.lock();
        manager.reset();
        let result = if phased {
            clock::detect_stage(parent, now, config, &mut || manager.select_committee(config))
                .map(CommitteeRound::from)
        } else {
            clock::detect_round(parent, now, config, &mut || manager.select_committee(config))
                .map(|round| {
                    CommitteeRound::new(
                        round.round,
                        round.round_start,
                        round.round_time_ms / config.committee_phase_count,
                    )
                })
        };
        match result {
            Ok(round) => {
                let selector_round = manager.committee().round;
                if selector_round != round.round {
                    shared.post(Event::Fatal(FatalError::InvariantViolation(format!(
                        "committee selector stands at round {selector_round}, clock at {}",
                        round.round
                    ))));
                    return;
                }
                round
            }
            Err(error) => {
                shared.post(Event::Fatal(FatalError::InvalidTime(error)));
                return;
            }
        }
    };

    let current_height = parent.height + 1;
    log::debug!(
        "detected round: block {current_height}, start time {}, phase time {}ms, round {}, start phase {}",
        round.round_start,
        round.phase_time_ms,
        round.round,
        round.start_phase
    );
    shared.data.set_round(round);
    shared.data.set_current_height(current_height);

    // The machine enters the round once it actually begins.
    shared.post_at_round_offset(0, Event::RoundDetectionCompleted);
}

fn check_connections<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let view = shared.deps.broadcast.current_view();
    let max_unreachable = if view.is_empty() {
        0
    } else {
        (view.len() - 1) / 3
    };
    let others = view_without_self(&view, &shared.deps.broadcast.id());
    let unreachable = shared.deps.sender.unreachable_count(&others);
    if unreachable > max_unreachable {
        log::warn!("unreachable node count {unreachable} exceeds the limit {max_unreachable}");
        shared.post(Event::ConnectionNumberInsufficient);
    } else {
        shared.post(Event::ConnectionNumberSufficient);
    }
}

fn select_proposer<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let config = &shared.config;
    shared.data.set_unexpected_block_height(false);
    let round = shared.data.round();
    let current_height = shared.data.current_height();

    let in_view =
        shared
            .deps
            .broadcast
            .update_view(round.round_start, current_height, true);
    if !in_view {
        let banned = shared.deps.views.ban_period(&shared.deps.broadcast.id()) > 0;
        shared.post(if banned {
            Event::BroadcastProcessBanned
        } else {
            Event::NotRegisteredInBroadcast
        });
        return;
    }

    let committee = {
        let mut manager = shared.deps.manager.lock();
        let selector_round = manager.committee().round;
        if selector_round > round.round {
            shared.post(Event::Fatal(FatalError::InvariantViolation(format!(
                "committee selector at round {selector_round} is ahead of round {}",
                round.round
            ))));
            return;
        }
        while manager.committee().round < round.round {
            manager.select_committee(config);
        }
        manager.committee()
    };
    shared.data.set_block_broadcast_enabled(true);
    log::debug!(
        "block {current_height}: selected committee for round {}, proposer {}",
        round.round,
        committee.block_proposer
    );

    let block_proposer = shared
        .deps
        .local_keys
        .iter()
        .find(|keypair| keypair.public_key() == committee.block_proposer)
        .cloned();
    let local_committee: Vec<_> = shared
        .deps
        .local_keys
        .iter()
        .filter(|keypair| committee.contains(&keypair.public_key()))
        .cloned()
        .collect();
    let total_vote_weight = shared.deps.manager.lock().total_committee_weight(config);
    let is_block_proposer = block_proposer.is_some();
    shared
        .data
        .set_committee(block_proposer, local_committee, total_vote_weight);

    let now = shared.now();
    let skip_block_production = (now - round.round_start) > round.phase_time_ms as Timestamp;
    log::debug!(
        "proposer selection result: block {current_height}, is block proposer = {is_block_proposer}, round start {}, round time = {}ms",
        round.round_start,
        round.round_time_ms(config.committee_phase_count)
    );

    if is_block_proposer && !skip_block_production && round.start_phase == CommitteePhase::Propose
    {
        shared.post(Event::GenerateBlock);
    } else {
        if is_block_proposer {
            log::debug!("skipping block production, current time is too far in the round");
        }
        shared.post(Event::WaitForBlock);
    }

    // Refresh peer discovery so the broadcast layer has enough connections
    // by vote-collection time.
    let broadcast = Arc::clone(&shared.deps.broadcast);
    let sender = Arc::clone(&shared.deps.sender);
    shared.run_at(
        round.round_start + round.phase_time_ms as Timestamp,
        move |_shared| {
            sender.find_nodes(&broadcast.current_view());
        },
    );
}

async fn generate_block<M: CommitteeManager>(shared: Arc<FsmShared<M>>, proposal: bool) {
    let config = &shared.config;
    let round = shared.data.round();
    let element = shared.deps.supplier.last_block_element();
    let parent = &element.block.header;

    if !config.enable_fast_finality {
        log::warn!("skipping block propose attempt, fast finality is disabled");
        shared.post(Event::BlockGenerationFailed);
        return;
    }

    let height = parent.height + 1;
    let timestamp = round.round_start;
    let Some(difficulty) = shared.deps.difficulty.difficulty(height, timestamp) else {
        log::debug!("skipping block propose attempt due to error calculating difficulty");
        shared.post(Event::BlockGenerationFailed);
        return;
    };
    let Some(proposer) = shared.data.block_proposer() else {
        log::warn!("skipping block propose attempt, no unlocked proposer key");
        shared.post(Event::BlockGenerationFailed);
        return;
    };

    let header = BlockHeader {
        height,
        timestamp,
        round: round.round,
        committee_phase_time_ms: round.phase_time_ms,
        difficulty,
        previous_hash: element.entity_hash,
        transactions_hash: Hash256::zero(),
        signer: proposer.public_key(),
    };

    // Reserve two thirds of the round for propagation.
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        shared.run_at(
            round.round_start
                + (round.round_time_ms(config.committee_phase_count) / 3) as Timestamp,
            move |_shared| stop.store(true, Ordering::Relaxed),
        );
    }
    log::debug!("generating block {height} for round {}", round.round);
    let stop_fn = {
        let stop = Arc::clone(&stop);
        move || stop.load(Ordering::Relaxed)
    };
    let block = shared
        .deps
        .generator
        .generate(header, config.max_transactions_per_block, &stop_fn);
    if shared.stopped() {
        return;
    }

    let Some(mut block) = block else {
        shared.post(Event::BlockGenerationFailed);
        return;
    };
    block.signature = sign_block_header(&proposer, &block.header);
    let bytes = block.to_wire_bytes();

    if proposal {
        // The proposer installs its own proposal directly; the broadcast
        // echo then dedupes against it.
        shared.data.add_validated_proposed_signature(block.signature);
        shared.data.try_set_proposed_block(Arc::new(block));
        let packet = Packet::new(PacketType::PushProposedBlock, bytes);
        let view = shared.deps.broadcast.current_view();
        shared.deps.broadcast.broadcast(packet, view).await;
    } else {
        // Hold the block back for the silence interval so cosigners reach
        // their waiting state before it arrives.
        let packet = Packet::new(PacketType::PushBlock, bytes);
        let broadcast = Arc::clone(&shared.deps.broadcast);
        shared.run_at(
            round.round_start + config.silence_interval_ms as Timestamp,
            move |_shared| {
                tokio::spawn(async move {
                    let view = broadcast.current_view();
                    broadcast.broadcast(packet, view).await;
                });
            },
        );
    }
    shared.post(Event::BlockGenerationSucceeded);
}

async fn wait_for_block<M: CommitteeManager>(shared: Arc<FsmShared<M>>, proposal: bool) {
    let config = &shared.config;
    let round = shared.data.round();
    let received_event = if proposal {
        Event::ProposalReceived
    } else {
        Event::BlockReceived
    };

    if shared.data.proposed_block().is_some() {
        shared.post(received_event);
        return;
    }

    let rx = shared.data.start_wait_for_block();
    // A proposal may have slipped in between the check above and the wait
    // registration.
    if shared.data.proposed_block().is_some() {
        shared.post(received_event);
        return;
    }
    let deadline = if proposal {
        round.phase_end(CommitteePhase::Propose)
    } else {
        round.round_end(config.committee_phase_count)
    };
    let received = shared.wait_signal(rx, deadline).await;
    if shared.stopped() {
        return;
    }

    if received == Some(true) && shared.data.proposed_block().is_some() {
        shared.post(received_event);
        return;
    }

    if shared.data.unexpected_block_height() {
        shared.data.set_block_broadcast_enabled(false);
        shared.post(Event::UnexpectedBlockHeight);
        return;
    }

    let sync_with_network = shared.data.proposed_block().is_some()
        || (round.round > 0 && round.round % config.check_network_height_interval == 0);
    if sync_with_network {
        shared.data.set_block_broadcast_enabled(false);
    }
    shared.post(Event::BlockNotReceived { sync_with_network });
}

/// Prevote/precommit phase entry: cosign and broadcast our own votes, then
/// wait for the weighted quorum until the phase ends.
async fn collect_votes<M: CommitteeManager>(
    shared: Arc<FsmShared<M>>,
    kind: CommitteeMessageType,
) {
    let config = &shared.config;
    let round = shared.data.round();
    let (insufficient, sufficient, phase) = match kind {
        CommitteeMessageType::Prevote => (
            Event::PrevotesInsufficient,
            Event::PrevotesSufficient,
            CommitteePhase::Prevote,
        ),
        CommitteeMessageType::Precommit => (
            Event::PrecommitsInsufficient,
            Event::PrecommitsSufficient,
            CommitteePhase::Precommit,
        ),
    };

    let Some(block) = shared.data.proposed_block() else {
        log::warn!("cannot vote, no proposed block");
        shared.post(insufficient);
        return;
    };

    // Build and broadcast one vote per local committee key.
    let local_committee = shared.data.local_committee();
    let block_hash = shared.data.proposed_block_hash();
    let mut messages = Vec::with_capacity(local_committee.len());
    for keypair in &local_committee {
        let mut message = CommitteeMessage {
            message_type: kind,
            block_hash,
            cosignature: cosign_block_header(keypair, &block.header),
            message_signature: Signature::zero(),
        };
        message.message_signature = keypair.sign(message.signed_bytes());
        messages.push(message);
    }
    log::debug!("added {} {phase} votes", messages.len());
    if !messages.is_empty() {
        if kind == CommitteeMessageType::Precommit && config.stage_own_precommits {
            shared.data.stage_precommits(&messages);
        }
        let packet_type = match kind {
            CommitteeMessageType::Prevote => PacketType::PushPrevoteMessages,
            CommitteeMessageType::Precommit => PacketType::PushPrecommitMessages,
        };
        let packet = encode_vote_packet(packet_type, &messages);
        let view = shared.deps.broadcast.current_view();
        shared.deps.broadcast.broadcast(packet, view).await;
        if shared.stopped() {
            return;
        }
    }

    // The store only ever reports a precommit quorum on top of a prevote
    // quorum.
    let quorum = |shared: &FsmShared<M>| match kind {
        CommitteeMessageType::Prevote => shared.data.prevotes_sufficient(),
        CommitteeMessageType::Precommit => shared.data.precommits_sufficient(),
    };

    if quorum(&shared) {
        shared.post(sufficient);
        return;
    }

    let rx = match kind {
        CommitteeMessageType::Prevote => shared.data.start_wait_for_prevotes(),
        CommitteeMessageType::Precommit => shared.data.start_wait_for_precommits(),
    };
    let signalled = shared.wait_signal(rx, round.phase_end(phase)).await;
    if shared.stopped() {
        return;
    }
    if signalled == Some(true) && quorum(&shared) {
        shared.post(sufficient);
        return;
    }

    {
        let manager = shared.deps.manager.lock();
        shared.data.recompute_vote_sums(&*manager, config);
    }
    shared.post(if quorum(&shared) { sufficient } else { insufficient });
}

async fn commit_range<M: CommitteeManager>(shared: &Arc<FsmShared<M>>, block: Arc<Block>) -> bool {
    let _guard = shared.commit_lock.lock().await;
    let result = shared
        .deps
        .consumer
        .commit_range(vec![Arc::clone(&block)])
        .await;
    if result.is_success() {
        log::info!(
            "successfully committed block {} produced by {}",
            block.header.height,
            block.header.signer
        );
    } else {
        log::warn!(
            "commit of block {} produced by {} failed due to {}",
            block.header.height,
            block.header.signer,
            result.code
        );
    }
    result.is_success()
}

async fn commit_block<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let config = &shared.config;
    let round = shared.data.round();
    let Some(block) = shared.data.proposed_block() else {
        log::warn!("commit failed, no block");
        shared.post(Event::CommitBlockFailed);
        return;
    };

    let success = commit_range(&shared, Arc::clone(&block)).await;
    if shared.stopped() {
        return;
    }

    let event = commit_outcome_event(config, success, block.header.height);
    let round_end = round.round_end(config.committee_phase_count);
    shared.run_at(round_end, move |shared| shared.post(event));
}

async fn commit_confirmed_block<M: CommitteeManager>(shared: Arc<FsmShared<M>>) {
    let config = &shared.config;
    let round = shared.data.round();

    // The proposer assembles the confirmed block from the collected
    // precommit cosignatures and broadcasts it.
    if let (Some(proposer), Some(block)) =
        (shared.data.block_proposer(), shared.data.proposed_block())
    {
        let votes = shared.data.votes(CommitteeMessageType::Precommit);
        let mut confirmed = (*block).clone();
        confirmed.cosignatures = votes
            .iter()
            .filter(|message| message.cosignature.signer != proposer.public_key())
            .map(|message| message.cosignature)
            .collect();
        let confirmed = Arc::new(confirmed);
        shared
            .data
            .add_validated_confirmed_signature(confirmed.signature);
        shared.data.try_set_confirmed_block(Arc::clone(&confirmed));
        let packet = Packet::new(PacketType::PushConfirmedBlock, confirmed.to_wire_bytes());
        let view = shared.deps.broadcast.current_view();
        shared.deps.broadcast.broadcast(packet, view).await;
        if shared.stopped() {
            return;
        }
    }

    let confirmed = match shared.data.confirmed_block() {
        Some(block) => Some(block),
        None => {
            let rx = shared.data.start_wait_for_confirmed_block();
            let deadline = round.phase_end(CommitteePhase::Commit);
            shared.wait_signal(rx, deadline).await;
            shared.data.confirmed_block()
        }
    };
    if shared.stopped() {
        return;
    }

    let Some(block) = confirmed else {
        if shared.data.unexpected_block_height() {
            shared.post(Event::UnexpectedBlockHeight);
        } else {
            log::debug!("no confirmed block received before commit phase end");
            shared.post(Event::CommitBlockFailed);
        }
        return;
    };

    let success = commit_range(&shared, Arc::clone(&block)).await;
    if shared.stopped() {
        return;
    }

    let event = commit_outcome_event(config, success, block.header.height);
    let round_end = round.phase_end(CommitteePhase::Commit);
    shared.run_at(round_end, move |shared| shared.post(event));
}

fn commit_outcome_event(
    config: &crate::config::CommitteeConfig,
    success: bool,
    height: u64,
) -> Event {
    if success && config.max_chain_height > 0 && height >= config.max_chain_height {
        Event::Hold
    } else if success {
        Event::CommitBlockSucceeded
    } else {
        Event::CommitBlockFailed
    }
}
