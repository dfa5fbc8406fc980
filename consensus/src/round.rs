//! Round and phase bookkeeping types.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use vivace_core::{RoundIndex, Timestamp};

/// The ordered phases of a committee round.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum CommitteePhase {
    #[default]
    None = 0,
    Propose = 1,
    Prevote = 2,
    Precommit = 3,
    Commit = 4,
}

impl CommitteePhase {
    pub fn from_index(index: u64) -> Option<Self> {
        Some(match index {
            1 => CommitteePhase::Propose,
            2 => CommitteePhase::Prevote,
            3 => CommitteePhase::Precommit,
            4 => CommitteePhase::Commit,
            _ => return None,
        })
    }

    /// Milliseconds from round start to the end of this phase.
    pub fn end_offset_ms(self, phase_time_ms: u64) -> u64 {
        self as u64 * phase_time_ms
    }
}

impl fmt::Display for CommitteePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitteePhase::None => "none",
            CommitteePhase::Propose => "propose",
            CommitteePhase::Prevote => "prevote",
            CommitteePhase::Precommit => "precommit",
            CommitteePhase::Commit => "commit",
        };
        write!(f, "{name}")
    }
}

/// A position within the voting schedule, totally ordered by
/// `(round, phase)`. The timing fields are carried along for scheduling and
/// do not participate in the ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommitteeStage {
    pub round: u16,
    pub phase: CommitteePhase,
    pub round_start: Timestamp,
    pub phase_time_ms: u64,
}

impl PartialEq for CommitteeStage {
    fn eq(&self, other: &Self) -> bool {
        (self.round, self.phase) == (other.round, other.phase)
    }
}

impl Eq for CommitteeStage {}

impl Ord for CommitteeStage {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.round, self.phase).cmp(&(other.round, other.phase))
    }
}

impl PartialOrd for CommitteeStage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The round-centric schedule used by the single-block pipeline, where a
/// round is treated as one four-phase interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalityRound {
    pub round: RoundIndex,
    pub round_start: Timestamp,
    pub round_time_ms: u64,
}

/// The full per-round schedule kept in the round data: round number, the
/// phase the node entered the round at, and the timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitteeRound {
    pub round: RoundIndex,
    pub start_phase: CommitteePhase,
    pub round_start: Timestamp,
    pub phase_time_ms: u64,
}

impl CommitteeRound {
    pub fn new(round: RoundIndex, round_start: Timestamp, phase_time_ms: u64) -> Self {
        CommitteeRound {
            round,
            start_phase: CommitteePhase::Propose,
            round_start,
            phase_time_ms,
        }
    }

    pub fn round_time_ms(&self, phase_count: u64) -> u64 {
        phase_count * self.phase_time_ms
    }

    pub fn round_end(&self, phase_count: u64) -> Timestamp {
        self.round_start + self.round_time_ms(phase_count) as Timestamp
    }

    /// Wall-clock end of the given phase within this round.
    pub fn phase_end(&self, phase: CommitteePhase) -> Timestamp {
        self.round_start + phase.end_offset_ms(self.phase_time_ms) as Timestamp
    }

    pub fn as_finality_round(&self, phase_count: u64) -> FinalityRound {
        FinalityRound {
            round: self.round,
            round_start: self.round_start,
            round_time_ms: self.round_time_ms(phase_count),
        }
    }
}

impl From<CommitteeStage> for CommitteeRound {
    fn from(stage: CommitteeStage) -> Self {
        CommitteeRound {
            round: stage.round as RoundIndex,
            start_phase: stage.phase,
            round_start: stage.round_start,
            phase_time_ms: stage.phase_time_ms,
        }
    }
}

impl Default for CommitteeRound {
    fn default() -> Self {
        CommitteeRound {
            round: -1,
            start_phase: CommitteePhase::None,
            round_start: 0,
            phase_time_ms: 0,
        }
    }
}
