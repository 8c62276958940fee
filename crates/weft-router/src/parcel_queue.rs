//! Sequence-ordered parcel buffering.
//!
//! A [`ParcelQueue`] holds parcels keyed by [`SequenceNumber`], absorbing
//! out-of-order arrivals and releasing them strictly in order. It also tracks
//! the *final sequence length*, the point past which no parcel will ever
//! arrive, which is how route closure and disconnection are expressed to
//! each direction of traffic.

use std::collections::VecDeque;

use weft_core::SequenceNumber;

use crate::parcel::{Parcel, ParcelObject};

/// A sparse, in-order parcel buffer for one direction of one route.
#[derive(Debug, Default)]
pub struct ParcelQueue {
    /// Sequence number of the entry at the front of `entries`; the smallest
    /// number not yet popped.
    base: SequenceNumber,
    /// Sparse storage indexed by `sequence_number - base`.
    entries: VecDeque<Option<Parcel>>,
    /// Number of `Some` entries currently stored (contiguous or not).
    num_entries: usize,
    /// Once set, no sequence number >= this will ever be accepted.
    final_length: Option<SequenceNumber>,
}

impl ParcelQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebase an empty, untouched queue at `n`. Used when a router is
    /// reconstructed from a descriptor mid-sequence.
    pub fn reset_initial_sequence_number(&mut self, n: SequenceNumber) {
        debug_assert!(self.entries.is_empty() && self.final_length.is_none());
        self.base = n;
    }

    /// The smallest sequence number not yet popped.
    pub fn current_sequence_number(&self) -> SequenceNumber {
        self.base
    }

    /// The sequence length implied by the contiguous run at the head:
    /// `current_sequence_number + number of contiguously available parcels`.
    pub fn current_sequence_length(&self) -> SequenceNumber {
        SequenceNumber(self.base.value() + self.num_available() as u64)
    }

    pub fn final_sequence_length(&self) -> Option<SequenceNumber> {
        self.final_length
    }

    /// Number of parcels available for in-order consumption right now.
    pub fn num_available(&self) -> usize {
        self.entries.iter().take_while(|e| e.is_some()).count()
    }

    /// Total unconsumed bytes across the available run.
    pub fn total_available_bytes(&self) -> usize {
        self.entries
            .iter()
            .map_while(|e| e.as_ref().map(Parcel::data_len))
            .sum()
    }

    /// True when the queue holds no parcels at all, sparse or available.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Whether the parcel at `current_sequence_number` is present.
    pub fn has_next_element(&self) -> bool {
        matches!(self.entries.front(), Some(Some(_)))
    }

    /// Whether any parcel may still arrive: the final length is unset, or
    /// the contiguously received span has not reached it yet.
    pub fn expects_more_elements(&self) -> bool {
        match self.final_length {
            Some(final_length) => self.current_sequence_length() < final_length,
            None => true,
        }
    }

    /// Whether the final length is set and everything up to it was popped.
    pub fn is_sequence_fully_consumed(&self) -> bool {
        self.final_length == Some(self.base) && !self.has_next_element()
    }

    /// Insert the parcel at sequence number `n`.
    ///
    /// Fails when `n` was already popped or pushed, or when the sequence is
    /// finalized at or below `n`.
    pub fn push(&mut self, n: SequenceNumber, parcel: Parcel) -> Result<(), Parcel> {
        if n < self.base {
            return Err(parcel);
        }
        if let Some(final_length) = self.final_length {
            if n >= final_length {
                return Err(parcel);
            }
        }

        let index = n.value() - self.base.value();
        let index = match usize::try_from(index) {
            Ok(index) => index,
            Err(_) => return Err(parcel),
        };
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        let slot = &mut self.entries[index];
        if slot.is_some() {
            return Err(parcel);
        }
        *slot = Some(parcel);
        self.num_entries += 1;
        Ok(())
    }

    /// Pop the next in-order parcel, if present.
    pub fn pop(&mut self) -> Option<Parcel> {
        match self.entries.front_mut() {
            Some(slot @ Some(_)) => {
                let parcel = slot.take();
                self.entries.pop_front();
                self.num_entries -= 1;
                self.base = SequenceNumber(self.base.value() + 1);
                parcel
            }
            _ => None,
        }
    }

    /// The next in-order parcel, without popping it.
    pub fn next_element(&self) -> Option<&Parcel> {
        self.entries.front().and_then(Option::as_ref)
    }

    /// Consume `num_bytes` of data and `num_objects` attached objects from
    /// the head parcel, popping it once it is fully consumed.
    ///
    /// Returns the objects taken and whether the parcel was popped.
    pub fn consume(
        &mut self,
        num_bytes: usize,
        num_objects: usize,
    ) -> Option<(Vec<ParcelObject>, bool)> {
        let head = self.entries.front_mut()?.as_mut()?;
        head.consume_data(num_bytes);
        let objects = head.take_front_objects(num_objects);
        let done = head.is_fully_consumed();
        if done {
            self.pop();
        }
        Some((objects, done))
    }

    /// If the queue is completely empty and `n` is the current sequence
    /// number, advance past it and return true. This lets a sender transmit
    /// directly without staging the parcel here first.
    pub fn maybe_skip_sequence_number(&mut self, n: SequenceNumber) -> bool {
        if !self.is_empty() || self.base != n {
            return false;
        }
        if let Some(final_length) = self.final_length {
            if n >= final_length {
                return false;
            }
        }
        self.entries.pop_front();
        self.base = SequenceNumber(self.base.value() + 1);
        true
    }

    /// Record that no sequence number >= `length` will ever arrive.
    ///
    /// Fails if a final length was already set, if the head has already
    /// advanced past `length`, or if a parcel at or beyond `length` is
    /// already queued.
    pub fn set_final_sequence_length(&mut self, length: SequenceNumber) -> bool {
        if self.final_length.is_some() || length < self.base {
            return false;
        }
        let highest_pushed = self
            .entries
            .iter()
            .rposition(Option::is_some)
            .map(|index| self.base.value() + index as u64 + 1);
        if let Some(highest) = highest_pushed {
            if length.value() < highest {
                return false;
            }
        }
        self.final_length = Some(length);
        true
    }

    /// Terminate the sequence at the contiguously received length, dropping
    /// any sparse parcels held beyond it. Used on hard disconnect.
    pub fn force_terminate_sequence(&mut self) {
        let length = self.current_sequence_length();
        let available = self.num_available();
        for slot in self.entries.iter_mut().skip(available) {
            if slot.take().is_some() {
                self.num_entries -= 1;
            }
        }
        self.entries.truncate(available);
        self.final_length = Some(length);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn parcel(tag: &'static [u8]) -> Parcel {
        Parcel::new(Bytes::from_static(tag))
    }

    #[test]
    fn in_order_push_pop() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.push(SequenceNumber(1), parcel(b"b")).is_ok());
        assert!(q.has_next_element());
        assert_eq!(q.pop().map(|p| p.data().clone()), Some(Bytes::from_static(b"a")));
        assert_eq!(q.pop().map(|p| p.data().clone()), Some(Bytes::from_static(b"b")));
        assert!(q.pop().is_none());
        assert_eq!(q.current_sequence_number(), SequenceNumber(2));
    }

    #[test]
    fn out_of_order_arrivals_release_in_order() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(2), parcel(b"c")).is_ok());
        assert!(!q.has_next_element());
        assert_eq!(q.num_available(), 0);
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert_eq!(q.num_available(), 1);
        assert!(q.push(SequenceNumber(1), parcel(b"b")).is_ok());
        assert_eq!(q.num_available(), 3);
        assert_eq!(q.current_sequence_length(), SequenceNumber(3));
        for expected in [b"a", b"b", b"c"] {
            assert_eq!(q.pop().map(|p| p.data().clone()), Some(Bytes::from_static(expected)));
        }
    }

    #[test]
    fn duplicate_and_stale_pushes_fail() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.push(SequenceNumber(0), parcel(b"dup")).is_err());
        let _ = q.pop();
        assert!(q.push(SequenceNumber(0), parcel(b"late")).is_err());
    }

    #[test]
    fn push_at_or_past_final_length_fails() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.set_final_sequence_length(SequenceNumber(2)));
        assert!(q.push(SequenceNumber(1), parcel(b"b")).is_ok());
        assert!(q.push(SequenceNumber(2), parcel(b"c")).is_err());
        assert!(q.push(SequenceNumber(7), parcel(b"d")).is_err());
    }

    #[test]
    fn final_length_rejected_below_queued_parcel() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(3), parcel(b"sparse")).is_ok());
        assert!(!q.set_final_sequence_length(SequenceNumber(3)));
        assert!(q.set_final_sequence_length(SequenceNumber(4)));
        assert!(!q.set_final_sequence_length(SequenceNumber(5)));
    }

    #[test]
    fn final_length_rejected_below_base() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        let _ = q.pop();
        assert!(!q.set_final_sequence_length(SequenceNumber(0)));
        assert!(q.set_final_sequence_length(SequenceNumber(1)));
    }

    #[test]
    fn fully_consumed_requires_final_and_drained() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.set_final_sequence_length(SequenceNumber(1)));
        assert!(!q.is_sequence_fully_consumed());
        assert!(!q.expects_more_elements());
        let _ = q.pop();
        assert!(q.is_sequence_fully_consumed());
    }

    #[test]
    fn expects_more_until_final_span_received() {
        let mut q = ParcelQueue::new();
        assert!(q.set_final_sequence_length(SequenceNumber(2)));
        assert!(q.expects_more_elements());
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.expects_more_elements());
        assert!(q.push(SequenceNumber(1), parcel(b"b")).is_ok());
        assert!(!q.expects_more_elements());
    }

    #[test]
    fn skip_only_when_empty_and_current() {
        let mut q = ParcelQueue::new();
        assert!(q.maybe_skip_sequence_number(SequenceNumber(0)));
        assert_eq!(q.current_sequence_number(), SequenceNumber(1));
        assert!(!q.maybe_skip_sequence_number(SequenceNumber(0)));
        assert!(q.push(SequenceNumber(1), parcel(b"a")).is_ok());
        assert!(!q.maybe_skip_sequence_number(SequenceNumber(1)));
    }

    #[test]
    fn skip_blocked_by_sparse_entry() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(5), parcel(b"future")).is_ok());
        assert!(!q.maybe_skip_sequence_number(SequenceNumber(0)));
    }

    #[test]
    fn force_terminate_keeps_available_run() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"a")).is_ok());
        assert!(q.push(SequenceNumber(1), parcel(b"b")).is_ok());
        assert!(q.push(SequenceNumber(4), parcel(b"sparse")).is_ok());
        q.force_terminate_sequence();
        assert_eq!(q.final_sequence_length(), Some(SequenceNumber(2)));
        assert_eq!(q.num_available(), 2);
        assert!(q.pop().is_some());
        assert!(q.pop().is_some());
        assert!(q.is_sequence_fully_consumed());
    }

    #[test]
    fn force_terminate_on_empty_queue() {
        let mut q = ParcelQueue::new();
        q.force_terminate_sequence();
        assert_eq!(q.final_sequence_length(), Some(SequenceNumber(0)));
        assert!(q.is_sequence_fully_consumed());
    }

    #[test]
    fn consume_partial_then_pop() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"abcd")).is_ok());
        let (objects, popped) = q.consume(2, 0).expect("head available");
        assert!(objects.is_empty());
        assert!(!popped);
        assert_eq!(q.total_available_bytes(), 2);
        let (_, popped) = q.consume(2, 0).expect("head available");
        assert!(popped);
        assert_eq!(q.current_sequence_number(), SequenceNumber(1));
    }

    #[test]
    fn reset_initial_sequence_number_rebases() {
        let mut q = ParcelQueue::new();
        q.reset_initial_sequence_number(SequenceNumber(7));
        assert_eq!(q.current_sequence_number(), SequenceNumber(7));
        assert!(q.push(SequenceNumber(6), parcel(b"old")).is_err());
        assert!(q.push(SequenceNumber(7), parcel(b"new")).is_ok());
    }

    #[test]
    fn byte_accounting_tracks_available_run_only() {
        let mut q = ParcelQueue::new();
        assert!(q.push(SequenceNumber(0), parcel(b"ab")).is_ok());
        assert!(q.push(SequenceNumber(2), parcel(b"cdef")).is_ok());
        assert_eq!(q.total_available_bytes(), 2);
        assert!(q.push(SequenceNumber(1), parcel(b"c")).is_ok());
        assert_eq!(q.total_available_bytes(), 7);
    }
}
