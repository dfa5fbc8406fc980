//! The committee abstraction consumed by the consensus core.
//!
//! Committee selection itself is an external concern; the core only requires
//! that the selector is deterministic, advances one round per
//! `select_committee` call, and exposes a weight algebra over an opaque
//! weight type.

use crate::config::CommitteeConfig;
use std::collections::BTreeSet;
use std::fmt;
use vivace_core::{PublicKey, RoundIndex};

/// The block proposer and cosigners selected for one round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committee {
    pub round: RoundIndex,
    pub block_proposer: PublicKey,
    pub cosigners: BTreeSet<PublicKey>,
}

impl Committee {
    /// Whether the key belongs to this committee, proposer included.
    pub fn contains(&self, key: &PublicKey) -> bool {
        self.block_proposer == *key || self.cosigners.contains(key)
    }
}

/// Deterministic per-round committee selection plus the weight algebra the
/// core needs: `zero`, `add`, `mul` by a scalar, `ge` and rendering for
/// diagnostics (via `Display` on the weight type).
///
/// The selector is single-writer: only the consensus strand advances it.
pub trait CommitteeManager: Send + Sync + 'static {
    /// The harvester weight. Either numeric or opaque; the core only uses
    /// the algebra below.
    type Weight: Clone + Send + Sync + fmt::Display + 'static;

    /// Rewinds the selector to the state right after the last committed
    /// block.
    fn reset(&mut self);

    /// Advances the selection by exactly one round. Idempotent within a
    /// round only in the sense that the resulting committee is a pure
    /// function of (chain tip, round).
    fn select_committee(&mut self, config: &CommitteeConfig);

    /// The committee of the round the selector currently stands at.
    fn committee(&self) -> Committee;

    fn weight(&self, key: &PublicKey, config: &CommitteeConfig) -> Self::Weight;

    fn zero_weight(&self) -> Self::Weight;

    fn add(&self, total: &mut Self::Weight, weight: &Self::Weight);

    fn mul(&self, weight: &mut Self::Weight, scalar: f64);

    /// `lhs >= rhs` in the weight order.
    fn ge(&self, lhs: &Self::Weight, rhs: &Self::Weight) -> bool;

    /// Sum of the proposer's and all cosigners' weights for the current
    /// committee.
    fn total_committee_weight(&self, config: &CommitteeConfig) -> Self::Weight {
        let committee = self.committee();
        let mut total = self.weight(&committee.block_proposer, config);
        for cosigner in &committee.cosigners {
            let weight = self.weight(cosigner, config);
            self.add(&mut total, &weight);
        }
        total
    }
}
