//! Identifier newtypes for nodes, sublinks, and shared buffers.
//!
//! These wrappers keep the various 64-bit identifiers from being mixed up at
//! call sites, and give [`NodeName`] a stable wire and display form.

use core::fmt;

use serde::{Deserialize, Serialize};

/// A 64-bit identifier scoped to one node link, selecting a specific router
/// at the far end.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[must_use]
pub struct SublinkId(pub u64);

impl SublinkId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SublinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SublinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sublink({})", self.0)
    }
}

/// Identifier of one shared buffer within a link's memory pool.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
#[must_use]
pub struct BufferId(pub u64);

impl BufferId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({})", self.0)
    }
}

/// A 128-bit node identity, randomly generated at node startup.
///
/// Names are compared for exact equality only. The zero name is reserved as
/// the "invalid" placeholder and never assigned to a live node.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[must_use]
pub struct NodeName([u8; 16]);

impl NodeName {
    pub const INVALID: NodeName = NodeName([0; 16]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random name.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Split into two u64 words (big-endian halves) for lock-free
    /// publication through a pair of atomics.
    pub fn to_words(self) -> (u64, u64) {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&self.0[..8]);
        lo.copy_from_slice(&self.0[8..]);
        (u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }

    /// Inverse of [`NodeName::to_words`].
    pub fn from_words(hi: u64, lo: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        Self(bytes)
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeName(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_names_are_valid_and_distinct() {
        let a = NodeName::generate();
        let b = NodeName::generate();
        assert!(a.is_valid());
        assert!(b.is_valid());
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_name_is_all_zero() {
        assert!(!NodeName::INVALID.is_valid());
        assert_eq!(NodeName::from_bytes([0; 16]), NodeName::INVALID);
    }

    #[test]
    fn word_split_round_trips() {
        let name = NodeName::from_bytes([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d,
            0x0e, 0x0f, 0x10,
        ]);
        let (hi, lo) = name.to_words();
        assert_eq!(hi, 0x0102030405060708);
        assert_eq!(lo, 0x090a0b0c0d0e0f10);
        assert_eq!(NodeName::from_words(hi, lo), name);
    }

    #[test]
    fn display_is_lower_hex() {
        let name = NodeName::from_bytes([0xab; 16]);
        assert_eq!(format!("{name}"), "ab".repeat(16));
        assert_eq!(format!("{name:?}"), "NodeName(abababab..)");
    }

    #[test]
    fn sublink_display() {
        assert_eq!(format!("{}", SublinkId(17)), "17");
        assert_eq!(format!("{:?}", BufferId(3)), "Buffer(3)");
    }
}
