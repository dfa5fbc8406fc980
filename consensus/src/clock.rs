//! The round clock: computes which round (and phase) is active from the
//! parent block, the wall clock and the block-time update policy, and the
//! round schedule changes applied on increment/reset.
//!
//! The committee selector must be driven in lock-step with the clock: the
//! `on_round` callback is invoked exactly once per round the clock stands up,
//! including round 0.

use crate::config::{BlockTimeUpdateStrategy, CommitteeConfig};
use crate::round::{CommitteePhase, CommitteeRound, CommitteeStage, FinalityRound};
use thiserror::Error;
use vivace_core::{BlockHeader, Timestamp};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// The parent block is in the future, indicating clock or chain
    /// corruption.
    #[error("parent block timestamp {parent} is ahead of current time {now}")]
    InvalidTime { parent: Timestamp, now: Timestamp },
}

pub fn increase_phase_time(phase_time_ms: u64, config: &CommitteeConfig) -> u64 {
    let next = (phase_time_ms as f64 * config.phase_time_increase_coefficient).round() as u64;
    next.clamp(
        config.min_committee_phase_time_ms,
        config.max_committee_phase_time_ms,
    )
}

pub fn decrease_phase_time(phase_time_ms: u64, config: &CommitteeConfig) -> u64 {
    let next = (phase_time_ms as f64 * config.phase_time_decrease_coefficient).round() as u64;
    next.clamp(
        config.min_committee_phase_time_ms,
        config.max_committee_phase_time_ms,
    )
}

/// A zero phase time in a parent block means "the configured default".
fn parent_phase_time(parent: &BlockHeader, config: &CommitteeConfig) -> u64 {
    if parent.committee_phase_time_ms != 0 {
        parent.committee_phase_time_ms
    } else {
        config.committee_phase_time_ms
    }
}

/// Phase time of the first round of the next height, per update strategy.
fn initial_phase_time(parent: &BlockHeader, config: &CommitteeConfig) -> u64 {
    let phase_time = parent_phase_time(parent, config);
    match config.block_time_update_strategy {
        BlockTimeUpdateStrategy::None => phase_time,
        BlockTimeUpdateStrategy::IncreaseCoefficient => config.min_committee_phase_time_ms,
        BlockTimeUpdateStrategy::IncreaseDecreaseCoefficient => {
            decrease_phase_time(phase_time, config)
        }
    }
}

struct Advance {
    round: i64,
    round_start: Timestamp,
    phase_time_ms: u64,
}

/// Shared advance loop: stands up rounds until the one covering `horizon`.
fn advance_rounds(
    parent: &BlockHeader,
    now: Timestamp,
    horizon: Timestamp,
    config: &CommitteeConfig,
    on_round: &mut dyn FnMut(),
) -> Result<Advance, ClockError> {
    if parent.timestamp > now {
        return Err(ClockError::InvalidTime {
            parent: parent.timestamp,
            now,
        });
    }

    let phase_count = config.committee_phase_count;
    let mut round_start = parent.timestamp
        + (phase_count * parent.committee_phase_time_ms) as Timestamp;
    let mut phase_time_ms = initial_phase_time(parent, config);
    let mut next_round_start = round_start + (phase_count * phase_time_ms) as Timestamp;
    let mut round = 0i64;
    on_round();

    while next_round_start <= horizon {
        round += 1;
        round_start = next_round_start;
        if config.block_time_update_strategy != BlockTimeUpdateStrategy::None {
            phase_time_ms = increase_phase_time(phase_time_ms, config);
        }
        next_round_start += (phase_count * phase_time_ms) as Timestamp;
        on_round();
    }

    Ok(Advance {
        round,
        round_start,
        phase_time_ms,
    })
}

/// Four-phase variant: advances rounds while `next_round_start <= now` and
/// returns the active round as one four-phase interval.
pub fn detect_round(
    parent: &BlockHeader,
    now: Timestamp,
    config: &CommitteeConfig,
    on_round: &mut dyn FnMut(),
) -> Result<FinalityRound, ClockError> {
    let advance = advance_rounds(parent, now, now, config, on_round)?;
    Ok(FinalityRound {
        round: advance.round,
        round_start: advance.round_start,
        round_time_ms: config.committee_phase_count * advance.phase_time_ms,
    })
}

/// Phase-detection variant: advances rounds while
/// `next_round_start <= now + silence_interval` and additionally reports the
/// phase the node lands in.
pub fn detect_stage(
    parent: &BlockHeader,
    now: Timestamp,
    config: &CommitteeConfig,
    on_round: &mut dyn FnMut(),
) -> Result<CommitteeStage, ClockError> {
    let horizon = now + config.silence_interval_ms as Timestamp;
    let advance = advance_rounds(parent, now, horizon, config, on_round)?;

    let phase = if now >= advance.round_start && advance.phase_time_ms > 0 {
        let index = (now - advance.round_start) as u64 / advance.phase_time_ms + 1;
        CommitteePhase::from_index(index.min(config.committee_phase_count))
            .unwrap_or(CommitteePhase::Propose)
    } else {
        CommitteePhase::Propose
    };

    Ok(CommitteeStage {
        round: advance.round as u16,
        phase,
        round_start: advance.round_start,
        phase_time_ms: advance.phase_time_ms,
    })
}

/// Schedule of the next round at the same height: round + 1, starting where
/// the current round ends, with the phase time grown per strategy.
pub fn next_round_on_increment(
    current: &CommitteeRound,
    config: &CommitteeConfig,
) -> CommitteeRound {
    let round_start = current.round_end(config.committee_phase_count);
    let phase_time_ms = match config.block_time_update_strategy {
        BlockTimeUpdateStrategy::None => current.phase_time_ms,
        BlockTimeUpdateStrategy::IncreaseCoefficient
        | BlockTimeUpdateStrategy::IncreaseDecreaseCoefficient => {
            increase_phase_time(current.phase_time_ms, config)
        }
    };
    CommitteeRound::new(current.round + 1, round_start, phase_time_ms)
}

/// Schedule of round 0 at the next height, entered after a successful commit.
pub fn next_round_on_reset(current: &CommitteeRound, config: &CommitteeConfig) -> CommitteeRound {
    let round_start = current.round_end(config.committee_phase_count);
    let phase_time_ms = match config.block_time_update_strategy {
        BlockTimeUpdateStrategy::None => current.phase_time_ms,
        BlockTimeUpdateStrategy::IncreaseCoefficient => config.min_committee_phase_time_ms,
        BlockTimeUpdateStrategy::IncreaseDecreaseCoefficient => {
            decrease_phase_time(current.phase_time_ms, config)
        }
    };
    CommitteeRound::new(0, round_start, phase_time_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vivace_core::{Hash256, PublicKey};

    fn parent(timestamp: Timestamp, phase_time_ms: u64) -> BlockHeader {
        BlockHeader {
            height: 10,
            timestamp,
            round: 0,
            committee_phase_time_ms: phase_time_ms,
            difficulty: 1,
            previous_hash: Hash256::zero(),
            transactions_hash: Hash256::zero(),
            signer: PublicKey::zero(),
        }
    }

    fn config() -> CommitteeConfig {
        CommitteeConfig {
            committee_phase_time_ms: 1_000,
            min_committee_phase_time_ms: 500,
            max_committee_phase_time_ms: 4_000,
            silence_interval_ms: 0,
            ..CommitteeConfig::default()
        }
    }

    #[test]
    fn rejects_parent_in_the_future() {
        let mut selections = 0;
        let result = detect_round(&parent(10_000, 1_000), 9_999, &config(), &mut || {
            selections += 1
        });
        assert_eq!(
            result,
            Err(ClockError::InvalidTime {
                parent: 10_000,
                now: 9_999
            })
        );
        assert_eq!(selections, 0);
    }

    #[test]
    fn constant_strategy_round_trip() {
        // With strategy `None` and parent phase time 1000ms, round r starts
        // at parent + (r + 1) * 4000ms and lasts 4000ms.
        for k in 0..5i64 {
            let now = 4_000 * (k + 1) + 500;
            let mut selections = 0;
            let round = detect_round(&parent(0, 1_000), now, &config(), &mut || {
                selections += 1
            })
            .unwrap();
            assert_eq!(round.round, k);
            assert_eq!(round.round_start, 4_000 * (k + 1));
            assert_eq!(round.round_time_ms, 4_000);
            assert_eq!(selections, k + 1, "one selection per round stood up");
        }
    }

    #[test]
    fn round_number_is_monotonic_in_time() {
        let mut previous = -1;
        for now in (0..60_000).step_by(700) {
            let round = detect_round(&parent(0, 1_000), now, &config(), &mut || {}).unwrap();
            assert!(round.round >= previous);
            previous = round.round;
        }
    }

    #[test]
    fn before_round_zero_the_start_is_in_the_future() {
        let round = detect_round(&parent(0, 1_000), 1_500, &config(), &mut || {}).unwrap();
        assert_eq!(round.round, 0);
        assert_eq!(round.round_start, 4_000);
    }

    #[test]
    fn zero_parent_phase_time_uses_configured_default() {
        // Round 0 starts right at the parent timestamp and runs with the
        // configured default phase time.
        let round = detect_round(&parent(5_000, 0), 5_100, &config(), &mut || {}).unwrap();
        assert_eq!(round.round, 0);
        assert_eq!(round.round_start, 5_000);
        assert_eq!(round.round_time_ms, 4_000);
    }

    #[test]
    fn increase_strategy_resets_then_grows() {
        let config = CommitteeConfig {
            block_time_update_strategy: BlockTimeUpdateStrategy::IncreaseCoefficient,
            phase_time_increase_coefficient: 2.0,
            ..config()
        };
        // Round 0 runs at the minimum (500ms => 2000ms round); round 1 at
        // 1000ms phase time; round 2 at 2000ms.
        let round = detect_round(&parent(0, 1_000), 4_100, &config, &mut || {}).unwrap();
        assert_eq!(round.round, 0);
        assert_eq!(round.round_start, 4_000);
        assert_eq!(round.round_time_ms, 2_000);

        let round = detect_round(&parent(0, 1_000), 6_000, &config, &mut || {}).unwrap();
        assert_eq!(round.round, 1);
        assert_eq!(round.round_start, 6_000);
        assert_eq!(round.round_time_ms, 4_000);

        let round = detect_round(&parent(0, 1_000), 10_000, &config, &mut || {}).unwrap();
        assert_eq!(round.round, 2);
        assert_eq!(round.round_start, 10_000);
        assert_eq!(round.round_time_ms, 8_000);
    }

    #[test]
    fn increase_decrease_strategy_shrinks_the_first_round() {
        let config = CommitteeConfig {
            block_time_update_strategy: BlockTimeUpdateStrategy::IncreaseDecreaseCoefficient,
            phase_time_decrease_coefficient: 0.5,
            ..config()
        };
        let round = detect_round(&parent(0, 2_000), 8_100, &config, &mut || {}).unwrap();
        // Round 0 starts at 8000 and runs with the decreased phase time.
        assert_eq!(round.round, 0);
        assert_eq!(round.round_start, 8_000);
        assert_eq!(round.round_time_ms, 4_000);
    }

    #[test]
    fn stage_detection_reports_the_phase() {
        let cases = [
            (4_100, CommitteePhase::Propose),
            (5_100, CommitteePhase::Prevote),
            (6_100, CommitteePhase::Precommit),
            (7_100, CommitteePhase::Commit),
        ];
        for (now, expected) in cases {
            let stage = detect_stage(&parent(0, 1_000), now, &config(), &mut || {}).unwrap();
            assert_eq!(stage.round, 0);
            assert_eq!(stage.phase, expected, "at time {now}");
        }

        // Before round 0 begins the phase is clamped to propose.
        let stage = detect_stage(&parent(0, 1_000), 3_000, &config(), &mut || {}).unwrap();
        assert_eq!(stage.phase, CommitteePhase::Propose);
    }

    #[test]
    fn stage_detection_honours_the_silence_interval() {
        let config = CommitteeConfig {
            silence_interval_ms: 200,
            ..config()
        };
        // At 7900 the next round (start 8000) is within the silence horizon,
        // so the clock already advances to it.
        let stage = detect_stage(&parent(0, 1_000), 7_900, &config, &mut || {}).unwrap();
        assert_eq!(stage.round, 1);
        assert_eq!(stage.phase, CommitteePhase::Propose);
    }

    #[test]
    fn increment_keeps_round_time_under_constant_strategy() {
        let current = CommitteeRound::new(2, 20_000, 1_000);
        let next = next_round_on_increment(&current, &config());
        assert_eq!(next.round, 3);
        assert_eq!(next.round_start, 24_000);
        assert_eq!(next.phase_time_ms, 1_000);
    }

    #[test]
    fn reset_applies_the_strategy() {
        let current = CommitteeRound::new(2, 20_000, 1_000);

        let next = next_round_on_reset(&current, &config());
        assert_eq!((next.round, next.phase_time_ms), (0, 1_000));

        let increase = CommitteeConfig {
            block_time_update_strategy: BlockTimeUpdateStrategy::IncreaseCoefficient,
            ..config()
        };
        let next = next_round_on_reset(&current, &increase);
        assert_eq!(next.phase_time_ms, increase.min_committee_phase_time_ms);

        let shrink = CommitteeConfig {
            block_time_update_strategy: BlockTimeUpdateStrategy::IncreaseDecreaseCoefficient,
            phase_time_decrease_coefficient: 0.5,
            ..config()
        };
        let next = next_round_on_reset(&current, &shrink);
        assert_eq!(next.phase_time_ms, 500);
    }

    #[test]
    fn phase_time_steps_are_clamped() {
        let config = config();
        assert_eq!(increase_phase_time(3_900, &config), 4_000);
        assert_eq!(decrease_phase_time(520, &config), 500);
    }
}
