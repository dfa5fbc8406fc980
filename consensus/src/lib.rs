//! The Vivace fast-finality consensus core.
//!
//! A per-height, per-round state machine drives a committee of block
//! producers through proposal, weighted voting and commit, with
//! deterministic recovery after partial failures and deterministic progress
//! in the absence of a quorum.
//!
//! The core consists of the round clock ([`clock`]), the weighted vote
//! store ([`votes`]), the per-round data record ([`data`]), the state
//! machine itself ([`fsm`]) and the inbound packet handlers ([`handlers`]).
//! Everything else (storage, execution, the broadcast transport, the
//! transaction pool) is an external collaborator behind the traits in
//! [`interfaces`].

pub mod clock;
pub mod committee;
pub mod config;
pub mod data;
pub mod fsm;
pub mod handlers;
pub mod interfaces;
pub mod round;
pub mod votes;

/// Mock collaborators for tests. Only built with the `test-util` feature
/// (enabled by this crate's own test targets), never in a normal build.
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;

mod actions;

use thiserror::Error;

pub use clock::ClockError;
pub use committee::{Committee, CommitteeManager};
pub use config::{BlockTimeUpdateStrategy, CommitteeConfig};
pub use fsm::{
    Collaborators, ConsensusFsm, Event, SingleBlockProfile, State, TwoPhaseProfile, VotingProfile,
};
pub use handlers::ValidationVerdict;

/// The only errors that escape the consensus strand; everything else is an
/// event inside the machine. The host must treat these as unrecoverable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    /// The network is behind this node; the local chain must be reset
    /// manually.
    #[error("local chain is invalid and needs to be reset")]
    InvalidLocalChain,
    #[error(transparent)]
    InvalidTime(#[from] ClockError),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}
