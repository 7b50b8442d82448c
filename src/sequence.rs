//! Circular arithmetic over the bounded sequence id space.
//!
//! Ids live in `[0, SEQ_SPACE)` and wrap. Two ids are only ever compared
//! through their signed circular distance; plain subtraction is wrong as soon
//! as the issuance counter laps the bound.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of the id space: `2^53 - 1`.
pub const SEQ_SPACE: u64 = (1 << 53) - 1;

/// A sequence id handed out by [`Sequencer::register`](crate::Sequencer::register).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(from = "u64", into = "u64")]
pub struct SeqId(u64);

impl SeqId {
    /// The id `0`.
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Build an id from a raw value, reduced into the id space.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw % SEQ_SPACE)
    }

    /// Get the raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The id `k` steps after this one.
    #[must_use]
    pub const fn advance(self, k: u64) -> Self {
        Self(advance_index(self.0, k))
    }

    /// The id directly after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        self.advance(1)
    }

    /// Signed circular distance from `self` to `other`.
    ///
    /// Positive when `other` was issued after `self`.
    #[must_use]
    pub const fn offset_to(self, other: Self) -> i64 {
        offset(self.0, other.0)
    }
}

impl From<u64> for SeqId {
    fn from(raw: u64) -> Self {
        Self::new(raw)
    }
}

impl From<SeqId> for u64 {
    fn from(id: SeqId) -> Self {
        id.0
    }
}

impl fmt::Display for SeqId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq:{}", self.0)
    }
}

/// `base + k`, wrapped by subtracting the space bound.
#[must_use]
pub const fn advance_index(base: u64, k: u64) -> u64 {
    let base = base % SEQ_SPACE;
    let k = k % SEQ_SPACE;
    // Both operands are below 2^53, so the sum cannot overflow.
    let sum = base + k;
    if sum < SEQ_SPACE { sum } else { sum - SEQ_SPACE }
}

/// Signed circular distance from `base` to `relative`.
///
/// Picks the shorter of the forward and backward distances.
#[must_use]
#[allow(clippy::cast_possible_wrap)]
pub const fn offset(base: u64, relative: u64) -> i64 {
    let space = SEQ_SPACE as i64;
    let d = (relative % SEQ_SPACE) as i64 - (base % SEQ_SPACE) as i64;
    let v = d.abs();
    let w = space - v;

    if v < w { d } else { w * -d.signum() }
}
