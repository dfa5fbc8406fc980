use serde::{Deserialize, Serialize};

/// How the phase time evolves across rounds and heights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BlockTimeUpdateStrategy {
    /// The phase time is carried forward unchanged.
    #[default]
    None,
    /// The first round of a height resets to the minimum phase time;
    /// every unfilled round grows it again.
    IncreaseCoefficient,
    /// The first round of a height shrinks the parent's phase time by one
    /// step; every unfilled round grows it again.
    IncreaseDecreaseCoefficient,
}

/// The flat configuration surface read by the consensus core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitteeConfig {
    /// Number of phases per round. The protocol is defined for 4.
    pub committee_phase_count: u64,
    /// Default phase time, used when a parent block carries none.
    pub committee_phase_time_ms: u64,
    pub min_committee_phase_time_ms: u64,
    pub max_committee_phase_time_ms: u64,
    /// Multiplicative step applied when a round goes unfilled.
    pub phase_time_increase_coefficient: f64,
    /// Multiplicative step applied when a height is filled.
    pub phase_time_decrease_coefficient: f64,
    /// Retry interval for chain-height detection and block download.
    pub chain_height_request_interval_ms: u64,
    /// Delay between generating a block and broadcasting it, so cosigners
    /// reach their waiting state first.
    pub silence_interval_ms: u64,
    /// Minimum approval rating required to finish synchronizing.
    pub end_sync_approval: f64,
    /// Additive base applied to importances before the logarithmic weighting
    /// of the approval rating.
    pub base_total_importance: u64,
    /// Rating contribution of a peer that shares our tip but is not running.
    pub not_running_contribution: f64,
    /// Fraction of the total committee weight required for a quorum.
    pub committee_approval: f64,
    /// Every this many unfilled rounds, fall back to a full network-height
    /// check instead of starting the next round.
    pub check_network_height_interval: i64,
    pub block_time_update_strategy: BlockTimeUpdateStrategy,
    pub max_blocks_per_sync_attempt: u32,
    pub max_chain_bytes_per_sync_attempt: u32,
    pub enable_fast_finality: bool,
    pub max_transactions_per_block: u32,
    /// If non-zero, hold the node once the chain reaches this height.
    pub max_chain_height: u64,
    /// Count an own precommit toward the quorum only once it has been echoed
    /// back by the broadcast layer.
    pub stage_own_precommits: bool,
}

impl Default for CommitteeConfig {
    fn default() -> Self {
        CommitteeConfig {
            committee_phase_count: 4,
            committee_phase_time_ms: 5_000,
            min_committee_phase_time_ms: 1_000,
            max_committee_phase_time_ms: 60_000,
            phase_time_increase_coefficient: 1.1,
            phase_time_decrease_coefficient: 0.9,
            chain_height_request_interval_ms: 5_000,
            silence_interval_ms: 100,
            end_sync_approval: 0.45,
            base_total_importance: 100,
            not_running_contribution: 0.5,
            committee_approval: 0.67,
            check_network_height_interval: 30,
            block_time_update_strategy: BlockTimeUpdateStrategy::None,
            max_blocks_per_sync_attempt: 128,
            max_chain_bytes_per_sync_attempt: 10 * 1024 * 1024,
            enable_fast_finality: true,
            max_transactions_per_block: 6_000,
            max_chain_height: 0,
            stage_own_precommits: true,
        }
    }
}

impl CommitteeConfig {
    /// Round time corresponding to the given phase time.
    pub fn round_time_ms(&self, phase_time_ms: u64) -> u64 {
        self.committee_phase_count * phase_time_ms
    }
}
