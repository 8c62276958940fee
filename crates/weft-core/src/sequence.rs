//! Per-direction parcel sequence numbering.
//!
//! A [`SequenceNumber`] counts parcels in one direction along one route. It
//! is assigned at the sending terminal and never renumbered by intermediate
//! hops, so equality and ordering are meaningful end to end.

use core::fmt;

use serde::{Deserialize, Serialize};

/// A monotonic 64-bit parcel counter, scoped to one direction of one route.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[must_use]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// The next sequence number. Returns `None` on u64 overflow, which no
    /// well-behaved route can reach.
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }

    /// Number of elements in the half-open interval `[self, end)`.
    ///
    /// Returns 0 when `end` is not ahead of `self`.
    pub fn distance_to(self, end: SequenceNumber) -> u64 {
        end.0.saturating_sub(self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl From<u64> for SequenceNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_value() {
        assert!(SequenceNumber(3) < SequenceNumber(4));
        assert!(SequenceNumber(4) <= SequenceNumber(4));
        assert_eq!(SequenceNumber::ZERO, SequenceNumber(0));
    }

    #[test]
    fn next_increments() {
        assert_eq!(SequenceNumber(7).next(), Some(SequenceNumber(8)));
    }

    #[test]
    fn next_detects_overflow() {
        assert_eq!(SequenceNumber(u64::MAX).next(), None);
    }

    #[test]
    fn distance_to_forward() {
        assert_eq!(SequenceNumber(3).distance_to(SequenceNumber(10)), 7);
    }

    #[test]
    fn distance_to_backward_is_zero() {
        assert_eq!(SequenceNumber(10).distance_to(SequenceNumber(3)), 0);
        assert_eq!(SequenceNumber(5).distance_to(SequenceNumber(5)), 0);
    }

    #[test]
    fn display_is_plain_value() {
        assert_eq!(format!("{}", SequenceNumber(42)), "42");
        assert_eq!(format!("{:?}", SequenceNumber(42)), "Seq(42)");
    }
}
