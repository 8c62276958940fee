//! Route edges: a router's connection to one neighbor, through at most two
//! links at a time.
//!
//! While a link handoff is in progress the edge holds both the new
//! (*primary*) link and the old (*decaying*) one. Two sequence-number
//! boundaries split responsibility between them: parcels below
//! `length_to_decaying` still travel on the decaying link, parcels at or
//! above it on the primary. The decaying link is released only once both
//! directions have crossed their boundary, which is what makes a handoff
//! invisible to parcel ordering.

use std::sync::Arc;

use weft_core::SequenceNumber;

use crate::link::RouterLink;
use crate::router::Router;

#[derive(Default)]
pub struct RouteEdge {
    primary_link: Option<Arc<dyn RouterLink>>,
    decaying_link: Option<Arc<dyn RouterLink>>,
    /// Set when decay was requested before any primary link existed; the
    /// next link installed lands directly in the decaying slot.
    decay_deferred: bool,
    /// Final number of parcels to transmit over the decaying link.
    length_to_decaying: Option<SequenceNumber>,
    /// Final number of parcels expected from the decaying link.
    length_from_decaying: Option<SequenceNumber>,
}

impl RouteEdge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn primary_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.primary_link.as_ref()
    }

    pub fn decaying_link(&self) -> Option<&Arc<dyn RouterLink>> {
        self.decaying_link.as_ref()
    }

    /// No handoff in progress on this edge.
    pub fn is_stable(&self) -> bool {
        self.decaying_link.is_none() && !self.decay_deferred
    }

    /// Install a link. If decay was deferred, the link goes straight into
    /// the decaying slot.
    pub fn set_primary_link(&mut self, link: Arc<dyn RouterLink>) {
        if self.decay_deferred {
            self.decay_deferred = false;
            debug_assert!(self.decaying_link.is_none());
            self.decaying_link = Some(link);
        } else {
            debug_assert!(self.primary_link.is_none());
            self.primary_link = Some(link);
        }
    }

    pub fn release_primary_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.primary_link.take()
    }

    pub fn release_decaying_link(&mut self) -> Option<Arc<dyn RouterLink>> {
        self.decaying_link.take()
    }

    /// Move the primary link into the decaying slot (or defer if there is
    /// none yet). Fails when a decay is already in progress.
    pub fn begin_primary_link_decay(&mut self) -> bool {
        if self.decaying_link.is_some() || self.decay_deferred {
            return false;
        }
        match self.primary_link.take() {
            Some(link) => self.decaying_link = Some(link),
            None => self.decay_deferred = true,
        }
        true
    }

    pub fn set_length_to_decaying_link(&mut self, length: SequenceNumber) {
        debug_assert!(self.length_to_decaying.is_none());
        self.length_to_decaying = Some(length);
    }

    pub fn set_length_from_decaying_link(&mut self, length: SequenceNumber) {
        debug_assert!(self.length_from_decaying.is_none());
        self.length_from_decaying = Some(length);
    }

    pub fn length_to_decaying_link(&self) -> Option<SequenceNumber> {
        self.length_to_decaying
    }

    pub fn length_from_decaying_link(&self) -> Option<SequenceNumber> {
        self.length_from_decaying
    }

    /// Whether the parcel numbered `n` must travel on the decaying link.
    ///
    /// True while a decaying link exists and `n` is below the outgoing
    /// boundary; an unset boundary keeps everything on the decaying link.
    pub fn should_transmit_on_decaying(&self, n: SequenceNumber) -> bool {
        self.decaying_link.is_some()
            && self.length_to_decaying.map_or(true, |boundary| n < boundary)
    }

    /// Drop the decaying link once `sent` parcels have gone to it and
    /// `received` parcels have come from it. Returns whether the decay
    /// finished just now.
    pub fn maybe_finish_decay(
        &mut self,
        sent: SequenceNumber,
        received: SequenceNumber,
    ) -> bool {
        if self.decaying_link.is_none() {
            return false;
        }
        let (Some(length_to), Some(length_from)) =
            (self.length_to_decaying, self.length_from_decaying)
        else {
            return false;
        };
        if sent < length_to || received < length_from {
            return false;
        }
        self.decaying_link = None;
        self.length_to_decaying = None;
        self.length_from_decaying = None;
        true
    }

    /// The primary link's peer router, when local.
    pub fn local_peer(&self) -> Option<Arc<Router>> {
        self.primary_link.as_ref().and_then(|link| link.local_peer())
    }

    /// The decaying link's peer router, when local.
    pub fn decaying_local_peer(&self) -> Option<Arc<Router>> {
        self.decaying_link.as_ref().and_then(|link| link.local_peer())
    }
}

impl std::fmt::Debug for RouteEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEdge")
            .field("primary", &self.primary_link.is_some())
            .field("decaying", &self.decaying_link.is_some())
            .field("decay_deferred", &self.decay_deferred)
            .field("length_to_decaying", &self.length_to_decaying)
            .field("length_from_decaying", &self.length_from_decaying)
            .finish()
    }
}
