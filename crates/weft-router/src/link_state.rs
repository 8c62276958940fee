//! Shared state for central links.
//!
//! A [`RouterLinkState`] is one small record visible to both sides of a
//! central link. In the cross-node case it lives in a shared memory
//! fragment, so every field is an atomic and every update uses explicit
//! acquire/release pairing. It serves three purposes: advertising each
//! side's stability, mutual exclusion for bypass initiation, and carrying
//! the node name authorized to request a bypass.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weft_core::{BufferId, LinkSide, NodeName};

/// Neither side has any decaying links adjacent to the route.
const SIDE_A_STABLE: u32 = 1 << 0;
const SIDE_B_STABLE: u32 = 1 << 1;

/// Exclusive lock, taken by one side to initiate bypass or closure.
const LOCKED_BY_A: u32 = 1 << 2;
const LOCKED_BY_B: u32 = 1 << 3;

/// Set by a side that failed to take the lock and wants a flush once the
/// holder releases it.
const WAITING_A: u32 = 1 << 4;
const WAITING_B: u32 = 1 << 5;

/// Set by a side that wants notification when the peer consumes parcels.
const MONITOR_A: u32 = 1 << 6;
const MONITOR_B: u32 = 1 << 7;

const STABLE: u32 = SIDE_A_STABLE | SIDE_B_STABLE;
const LOCKED: u32 = LOCKED_BY_A | LOCKED_BY_B;

fn stable_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => SIDE_A_STABLE,
        LinkSide::B => SIDE_B_STABLE,
    }
}

fn lock_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => LOCKED_BY_A,
        LinkSide::B => LOCKED_BY_B,
    }
}

fn waiting_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => WAITING_A,
        LinkSide::B => WAITING_B,
    }
}

fn monitor_bit(side: LinkSide) -> u32 {
    match side {
        LinkSide::A => MONITOR_A,
        LinkSide::B => MONITOR_B,
    }
}

/// Snapshot of one side's inbound queue, published for the peer's
/// remote-queue trap conditions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueState {
    pub num_parcels: u64,
    pub num_bytes: u64,
}

impl QueueState {
    fn pack(self) -> u64 {
        let parcels = self.num_parcels.min(u32::MAX as u64);
        let bytes = self.num_bytes.min(u32::MAX as u64);
        (parcels << 32) | bytes
    }

    fn unpack(word: u64) -> Self {
        Self {
            num_parcels: word >> 32,
            num_bytes: word & u32::MAX as u64,
        }
    }
}

/// The shared record behind a central link.
#[derive(Debug, Default)]
pub struct RouterLinkState {
    status: AtomicU32,
    bypass_source_hi: AtomicU64,
    bypass_source_lo: AtomicU64,
    queue_state_a: AtomicU64,
    queue_state_b: AtomicU64,
}

impl RouterLinkState {
    /// A fresh state with neither side stable yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh state with both sides already stable. Used for links created
    /// in a position where no decay can be pending, e.g. an initial portal
    /// pair.
    pub fn new_stable() -> Self {
        let state = Self::default();
        state.status.store(STABLE, Ordering::Relaxed);
        state
    }

    /// Mark one side stable. Monotonic: the bit is never cleared.
    pub fn set_side_stable(&self, side: LinkSide) {
        self.status.fetch_or(stable_bit(side), Ordering::Release);
    }

    /// Whether both sides have marked themselves stable.
    pub fn is_stable(&self) -> bool {
        self.status.load(Ordering::Acquire) & STABLE == STABLE
    }

    pub fn is_side_stable(&self, side: LinkSide) -> bool {
        self.status.load(Ordering::Acquire) & stable_bit(side) != 0
    }

    /// Try to take the exclusive lock from `side`.
    ///
    /// Succeeds only when both sides are stable and nobody holds the lock.
    /// When the opposite side holds the lock, the caller's waiting bit is
    /// set so the holder can wake it after unlocking.
    pub fn try_lock(&self, side: LinkSide) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            if current & STABLE != STABLE {
                return false;
            }
            if current & LOCKED != 0 {
                self.status.fetch_or(waiting_bit(side), Ordering::AcqRel);
                return false;
            }
            match self.status.compare_exchange_weak(
                current,
                current | lock_bit(side),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn unlock(&self, side: LinkSide) {
        self.status.fetch_and(!lock_bit(side), Ordering::AcqRel);
    }

    pub fn is_locked_by(&self, side: LinkSide) -> bool {
        self.status.load(Ordering::Acquire) & lock_bit(side) != 0
    }

    /// Clear `side`'s waiting bit, returning whether it was set.
    pub fn reset_waiting_bit(&self, side: LinkSide) -> bool {
        let bit = waiting_bit(side);
        self.status.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Publish the node name allowed to initiate bypass. Must only be called
    /// by the side currently holding the lock; the release stores pair with
    /// the acquire loads in [`RouterLinkState::allowed_bypass_request_source`].
    pub fn set_allowed_bypass_request_source(&self, source: NodeName) {
        let (hi, lo) = source.to_words();
        self.bypass_source_hi.store(hi, Ordering::Release);
        self.bypass_source_lo.store(lo, Ordering::Release);
    }

    pub fn allowed_bypass_request_source(&self) -> NodeName {
        let hi = self.bypass_source_hi.load(Ordering::Acquire);
        let lo = self.bypass_source_lo.load(Ordering::Acquire);
        NodeName::from_words(hi, lo)
    }

    /// Validate a bypass request arriving from `source`, as seen by `side`:
    /// the opposite side must hold the lock and have authorized `source`.
    pub fn can_node_request_bypass(&self, side: LinkSide, source: NodeName) -> bool {
        self.is_locked_by(side.opposite()) && self.allowed_bypass_request_source() == source
    }

    /// Ask to be notified when the opposite side reports consumption.
    pub fn set_monitoring_peer(&self, side: LinkSide, enable: bool) {
        if enable {
            self.status.fetch_or(monitor_bit(side), Ordering::AcqRel);
        } else {
            self.status.fetch_and(!monitor_bit(side), Ordering::AcqRel);
        }
    }

    /// Publish `side`'s inbound queue snapshot. Returns true when the
    /// opposite side asked to be notified about it.
    pub fn update_queue_state(&self, side: LinkSide, state: QueueState) -> bool {
        let slot = match side {
            LinkSide::A => &self.queue_state_a,
            LinkSide::B => &self.queue_state_b,
        };
        slot.store(state.pack(), Ordering::Release);
        self.status.load(Ordering::Acquire) & monitor_bit(side.opposite()) != 0
    }

    /// Read the opposite side's published queue snapshot.
    pub fn peer_queue_state(&self, side: LinkSide) -> QueueState {
        let slot = match side {
            LinkSide::A => &self.queue_state_b,
            LinkSide::B => &self.queue_state_a,
        };
        QueueState::unpack(slot.load(Ordering::Acquire))
    }
}

/// Location of a link-state record within a link's shared memory pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentDescriptor {
    pub buffer: BufferId,
    pub offset: u64,
}

/// A reference-counted handle to an allocated [`RouterLinkState`] fragment.
///
/// The descriptor travels on the wire; each node adopts it against its own
/// mapping of the pool. The state stays alive as long as any router holds a
/// central link referencing it.
#[derive(Debug, Clone)]
pub struct LinkStateFragment {
    descriptor: FragmentDescriptor,
    state: Arc<RouterLinkState>,
}

impl LinkStateFragment {
    pub fn new(descriptor: FragmentDescriptor, state: Arc<RouterLinkState>) -> Self {
        Self { descriptor, state }
    }

    pub fn descriptor(&self) -> FragmentDescriptor {
        self.descriptor
    }

    pub fn state(&self) -> &RouterLinkState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stability_is_monotonic_and_per_side() {
        let state = RouterLinkState::new();
        assert!(!state.is_stable());
        state.set_side_stable(LinkSide::A);
        assert!(state.is_side_stable(LinkSide::A));
        assert!(!state.is_stable());
        state.set_side_stable(LinkSide::B);
        assert!(state.is_stable());
    }

    #[test]
    fn lock_requires_stability() {
        let state = RouterLinkState::new();
        assert!(!state.try_lock(LinkSide::A));
        state.set_side_stable(LinkSide::A);
        assert!(!state.try_lock(LinkSide::A));
        state.set_side_stable(LinkSide::B);
        assert!(state.try_lock(LinkSide::A));
    }

    #[test]
    fn lock_is_mutually_exclusive() {
        let state = RouterLinkState::new_stable();
        assert!(state.try_lock(LinkSide::A));
        assert!(!state.try_lock(LinkSide::B));
        assert!(state.is_locked_by(LinkSide::A));
        assert!(!state.is_locked_by(LinkSide::B));
        state.unlock(LinkSide::A);
        assert!(state.try_lock(LinkSide::B));
    }

    #[test]
    fn blocked_locker_parks_on_waiting_bit() {
        let state = RouterLinkState::new_stable();
        assert!(state.try_lock(LinkSide::A));
        assert!(!state.try_lock(LinkSide::B));
        state.unlock(LinkSide::A);
        assert!(state.reset_waiting_bit(LinkSide::B));
        assert!(!state.reset_waiting_bit(LinkSide::B));
        assert!(!state.reset_waiting_bit(LinkSide::A));
    }

    #[test]
    fn bypass_authorization_round_trip() {
        let state = RouterLinkState::new_stable();
        let source = NodeName::generate();
        assert!(state.try_lock(LinkSide::A));
        state.set_allowed_bypass_request_source(source);
        assert!(state.can_node_request_bypass(LinkSide::B, source));
        assert!(!state.can_node_request_bypass(LinkSide::A, source));
        assert!(!state.can_node_request_bypass(LinkSide::B, NodeName::generate()));
        state.unlock(LinkSide::A);
        assert!(!state.can_node_request_bypass(LinkSide::B, source));
    }

    #[test]
    fn queue_state_publication_and_monitoring() {
        let state = RouterLinkState::new_stable();
        let snapshot = QueueState {
            num_parcels: 3,
            num_bytes: 128,
        };
        assert!(!state.update_queue_state(LinkSide::A, snapshot));
        assert_eq!(state.peer_queue_state(LinkSide::B), snapshot);
        state.set_monitoring_peer(LinkSide::B, true);
        assert!(state.update_queue_state(LinkSide::A, snapshot));
        state.set_monitoring_peer(LinkSide::B, false);
        assert!(!state.update_queue_state(LinkSide::A, snapshot));
    }

    #[test]
    fn queue_state_saturates_at_u32() {
        let snapshot = QueueState {
            num_parcels: u64::MAX,
            num_bytes: u64::MAX,
        };
        let packed = QueueState::unpack(snapshot.pack());
        assert_eq!(packed.num_parcels, u32::MAX as u64);
        assert_eq!(packed.num_bytes, u32::MAX as u64);
    }
}
