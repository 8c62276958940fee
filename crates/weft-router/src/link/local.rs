//! Links between two routers in the same process.
//!
//! Both halves of a local link share one [`SharedState`] holding the link
//! state record and a slot per side for the attached router. Operations on
//! one half call the opposite router's `accept_*` entry points directly, so
//! callers must never hold a router mutex across them.

use std::sync::Arc;

use parking_lot::Mutex;

use weft_core::{LinkSide, LinkType, NodeName, SequenceNumber, SublinkId};

use crate::link::{RemoteRouterLink, RouterLink};
use crate::link_state::{LinkStateFragment, QueueState, RouterLinkState};
use crate::parcel::Parcel;
use crate::router::{FlushBehavior, Router};

/// Whether a new local link starts with both sides stable.
///
/// An initial portal pair has nothing decaying anywhere, so its link starts
/// stable. Links created during a bypass start unstable and each side marks
/// itself stable once its decaying links are gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialStability {
    Unstable,
    Stable,
}

struct SideSlots {
    a: Option<Arc<Router>>,
    b: Option<Arc<Router>>,
}

struct SharedState {
    link_type: LinkType,
    link_state: RouterLinkState,
    routers: Mutex<SideSlots>,
}

impl SharedState {
    fn router(&self, side: LinkSide) -> Option<Arc<Router>> {
        let slots = self.routers.lock();
        match side {
            LinkSide::A => slots.a.clone(),
            LinkSide::B => slots.b.clone(),
        }
    }

    fn clear(&self, side: LinkSide) {
        let mut slots = self.routers.lock();
        match side {
            LinkSide::A => slots.a = None,
            LinkSide::B => slots.b = None,
        }
    }
}

/// One side's handle on an intra-process link.
pub struct LocalRouterLink {
    side: LinkSide,
    shared: Arc<SharedState>,
}

impl LocalRouterLink {
    /// Create the two halves of a local link between `routers.0` (side A)
    /// and `routers.1` (side B). Local links only ever sit in central or
    /// bridge position.
    pub fn create_pair(
        link_type: LinkType,
        routers: (Arc<Router>, Arc<Router>),
        initial_stability: InitialStability,
    ) -> (Arc<dyn RouterLink>, Arc<dyn RouterLink>) {
        debug_assert!(matches!(link_type, LinkType::Central | LinkType::Bridge));
        let link_state = match initial_stability {
            InitialStability::Stable => RouterLinkState::new_stable(),
            InitialStability::Unstable => RouterLinkState::new(),
        };
        let shared = Arc::new(SharedState {
            link_type,
            link_state,
            routers: Mutex::new(SideSlots {
                a: Some(routers.0),
                b: Some(routers.1),
            }),
        });
        let a = Arc::new(LocalRouterLink {
            side: LinkSide::A,
            shared: shared.clone(),
        });
        let b = Arc::new(LocalRouterLink {
            side: LinkSide::B,
            shared,
        });
        (a, b)
    }

    fn peer(&self) -> Option<Arc<Router>> {
        self.shared.router(self.side.opposite())
    }

    fn unsupported(&self, operation: &'static str) {
        debug_assert!(false, "{operation} is never sent over a local link");
        tracing::error!(operation, link = %self.describe(), "unsupported local link operation");
    }
}

impl RouterLink for LocalRouterLink {
    fn link_type(&self) -> LinkType {
        self.shared.link_type
    }

    fn local_peer(&self) -> Option<Arc<Router>> {
        self.peer()
    }

    fn as_remote(&self) -> Option<&RemoteRouterLink> {
        None
    }

    fn accept_parcel(&self, parcel: Parcel) {
        let Some(peer) = self.peer() else {
            return;
        };
        match self.shared.link_type {
            // On a central link the peer is the other end of the route, so
            // the parcel heads toward its terminal.
            LinkType::Central => {
                peer.accept_inbound_parcel(parcel);
            }
            // On a bridge the parcel crosses into the merged route and
            // continues outward from the peer.
            LinkType::Bridge => {
                peer.accept_outbound_parcel(parcel);
            }
            LinkType::PeripheralInward | LinkType::PeripheralOutward => {
                self.unsupported("accept_parcel on a peripheral local link");
            }
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        if let Some(peer) = self.peer() {
            peer.accept_route_closure_from(self.shared.link_type, sequence_length);
        }
    }

    fn accept_route_disconnected(&self) {
        if let Some(peer) = self.peer() {
            peer.accept_route_disconnected_from(self.shared.link_type);
        }
    }

    fn mark_side_stable(&self) {
        self.shared.link_state.set_side_stable(self.side);
    }

    fn try_lock_for_bypass(&self, source: NodeName) -> bool {
        if !self.shared.link_state.try_lock(self.side) {
            return false;
        }
        self.shared.link_state.set_allowed_bypass_request_source(source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.shared.link_state.try_lock(self.side)
    }

    fn unlock(&self) {
        self.shared.link_state.unlock(self.side);
    }

    fn flush_other_side_if_waiting(&self) -> bool {
        let other_side = self.side.opposite();
        if !self.shared.link_state.reset_waiting_bit(other_side) {
            return false;
        }
        if let Some(peer) = self.shared.router(other_side) {
            peer.flush(FlushBehavior::ForceBypassAttempt);
        }
        true
    }

    fn can_node_request_bypass(&self, source: NodeName) -> bool {
        self.shared
            .link_state
            .can_node_request_bypass(self.side, source)
    }

    fn update_inbound_queue_state(&self, state: QueueState) -> bool {
        self.shared.link_state.update_queue_state(self.side, state)
    }

    fn peer_queue_state(&self) -> QueueState {
        self.shared.link_state.peer_queue_state(self.side)
    }

    fn enable_peer_monitoring(&self, enable: bool) {
        self.shared.link_state.set_monitoring_peer(self.side, enable);
    }

    fn notify_data_consumed(&self) {
        if let Some(peer) = self.peer() {
            peer.notify_peer_consumed_data();
        }
    }

    fn bypass_peer(&self, _target_node: NodeName, _target_sublink: SublinkId) {
        self.unsupported("bypass_peer");
    }

    fn stop_proxying(
        &self,
        _inbound_sequence_length: SequenceNumber,
        _outbound_sequence_length: SequenceNumber,
    ) {
        self.unsupported("stop_proxying");
    }

    fn proxy_will_stop(&self, _inbound_sequence_length: SequenceNumber) {
        self.unsupported("proxy_will_stop");
    }

    fn bypass_peer_with_link(
        &self,
        _new_sublink: SublinkId,
        _link_state: LinkStateFragment,
        _inbound_sequence_length: SequenceNumber,
    ) {
        self.unsupported("bypass_peer_with_link");
    }

    fn stop_proxying_to_local_peer(&self, _outbound_sequence_length: SequenceNumber) {
        self.unsupported("stop_proxying_to_local_peer");
    }

    fn deactivate(&self) {
        self.shared.clear(self.side);
    }

    fn describe(&self) -> String {
        format!("local {} link (side {})", self.shared.link_type, self.side)
    }
}
