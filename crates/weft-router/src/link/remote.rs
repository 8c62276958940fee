//! Links between routers on different nodes.
//!
//! A remote link pairs a sublink id with the node link that carries it.
//! Every operation becomes one wire message; the far node's dispatcher
//! resolves the sublink back to a router and invokes the matching
//! `accept_*` entry point. Central remote links additionally reference a
//! [`RouterLinkState`](crate::link_state::RouterLinkState) fragment in the
//! node link's shared memory.

use std::sync::{Arc, Weak};

use weft_core::{LinkSide, LinkType, NodeName, SequenceNumber, SublinkId};

use crate::link::RouterLink;
use crate::link_state::{LinkStateFragment, QueueState, RouterLinkState};
use crate::message::{Message, WireObject};
use crate::node_link::NodeLink;
use crate::parcel::{Parcel, ParcelObject};

pub struct RemoteRouterLink {
    self_weak: Weak<RemoteRouterLink>,
    node_link: Arc<dyn NodeLink>,
    sublink: SublinkId,
    link_type: LinkType,
    side: LinkSide,
    /// Present iff this is a central link.
    link_state: Option<LinkStateFragment>,
}

impl RemoteRouterLink {
    pub fn new(
        node_link: Arc<dyn NodeLink>,
        sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
        link_type: LinkType,
        side: LinkSide,
    ) -> Arc<Self> {
        // Central links carry shared state; peripheral links never do.
        debug_assert_eq!(link_type.is_central(), link_state.is_some());
        Arc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            node_link,
            sublink,
            link_type,
            side,
            link_state,
        })
    }

    /// A fresh owning handle on this link.
    pub fn clone_arc(&self) -> Arc<RemoteRouterLink> {
        match self.self_weak.upgrade() {
            Some(link) => link,
            // `&self` implies a live strong reference.
            None => unreachable!("remote link borrowed without a strong reference"),
        }
    }

    pub fn node_link(&self) -> &Arc<dyn NodeLink> {
        &self.node_link
    }

    pub fn sublink(&self) -> SublinkId {
        self.sublink
    }

    pub fn side(&self) -> LinkSide {
        self.side
    }

    fn state(&self) -> Option<&RouterLinkState> {
        self.link_state.as_ref().map(LinkStateFragment::state)
    }
}

impl RouterLink for RemoteRouterLink {
    fn link_type(&self) -> LinkType {
        self.link_type
    }

    fn local_peer(&self) -> Option<Arc<crate::router::Router>> {
        None
    }

    fn as_remote(&self) -> Option<&RemoteRouterLink> {
        Some(self)
    }

    fn accept_parcel(&self, mut parcel: Parcel) {
        // Serialize attached objects. Portals become router descriptors, and
        // their routers must not start proxying toward the destination until
        // the descriptor is on the wire.
        let objects = parcel.take_objects();
        let mut wire_objects = Vec::with_capacity(objects.len());
        let mut routers_to_proxy = Vec::new();
        for object in objects {
            match object {
                ParcelObject::Portal(router) => {
                    let descriptor = router.serialize_new_router(&self.node_link);
                    wire_objects.push(WireObject::Router(descriptor));
                    routers_to_proxy.push((router, descriptor));
                }
                ParcelObject::Blob(data) => wire_objects.push(WireObject::Blob(data)),
            }
        }

        tracing::trace!(
            parcel = %parcel.describe(),
            link = %self.describe(),
            "transmitting parcel"
        );
        self.node_link.transmit(Message::AcceptParcel {
            sublink: self.sublink,
            sequence_number: parcel.sequence_number(),
            data: parcel.data().clone(),
            objects: wire_objects,
        });

        // The descriptors are transmitted; the serialized routers may now
        // forward traffic to their new homes.
        for (router, descriptor) in routers_to_proxy {
            router.begin_proxying_to_new_router(&self.node_link, &descriptor);
        }
    }

    fn accept_route_closure(&self, sequence_length: SequenceNumber) {
        self.node_link.transmit(Message::RouteClosed {
            sublink: self.sublink,
            sequence_length,
        });
    }

    fn accept_route_disconnected(&self) {
        self.node_link.transmit(Message::RouteDisconnected {
            sublink: self.sublink,
        });
    }

    fn mark_side_stable(&self) {
        if let Some(state) = self.state() {
            state.set_side_stable(self.side);
        }
    }

    fn try_lock_for_bypass(&self, source: NodeName) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        if !state.try_lock(self.side) {
            return false;
        }
        state.set_allowed_bypass_request_source(source);
        true
    }

    fn try_lock_for_closure(&self) -> bool {
        self.state().is_some_and(|state| state.try_lock(self.side))
    }

    fn unlock(&self) {
        if let Some(state) = self.state() {
            state.unlock(self.side);
        }
    }

    fn flush_other_side_if_waiting(&self) -> bool {
        let Some(state) = self.state() else {
            return false;
        };
        if !state.reset_waiting_bit(self.side.opposite()) {
            return false;
        }
        self.node_link.transmit(Message::FlushRouter {
            sublink: self.sublink,
        });
        true
    }

    fn can_node_request_bypass(&self, source: NodeName) -> bool {
        self.state()
            .is_some_and(|state| state.can_node_request_bypass(self.side, source))
    }

    fn update_inbound_queue_state(&self, queue_state: QueueState) -> bool {
        self.state()
            .is_some_and(|state| state.update_queue_state(self.side, queue_state))
    }

    fn peer_queue_state(&self) -> QueueState {
        self.state()
            .map(|state| state.peer_queue_state(self.side))
            .unwrap_or_default()
    }

    fn enable_peer_monitoring(&self, enable: bool) {
        if let Some(state) = self.state() {
            state.set_monitoring_peer(self.side, enable);
        }
    }

    fn notify_data_consumed(&self) {
        self.node_link.transmit(Message::NotifyDataConsumed {
            sublink: self.sublink,
        });
    }

    fn bypass_peer(&self, target_node: NodeName, target_sublink: SublinkId) {
        self.node_link.transmit(Message::BypassPeer {
            sublink: self.sublink,
            target_node,
            target_sublink,
        });
    }

    fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    ) {
        self.node_link.transmit(Message::StopProxying {
            sublink: self.sublink,
            inbound_sequence_length,
            outbound_sequence_length,
        });
    }

    fn proxy_will_stop(&self, inbound_sequence_length: SequenceNumber) {
        self.node_link.transmit(Message::ProxyWillStop {
            sublink: self.sublink,
            inbound_sequence_length,
        });
    }

    fn bypass_peer_with_link(
        &self,
        new_sublink: SublinkId,
        link_state: LinkStateFragment,
        inbound_sequence_length: SequenceNumber,
    ) {
        self.node_link.transmit(Message::BypassPeerWithLink {
            sublink: self.sublink,
            new_sublink,
            link_state: link_state.descriptor(),
            inbound_sequence_length,
        });
    }

    fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber) {
        self.node_link.transmit(Message::StopProxyingToLocalPeer {
            sublink: self.sublink,
            outbound_sequence_length,
        });
    }

    fn deactivate(&self) {
        self.node_link.remove_remote_router_link(self.sublink);
    }

    fn describe(&self) -> String {
        format!(
            "{} link (side {}) on sublink {} from {:?} to {:?}",
            self.link_type,
            self.side,
            self.sublink,
            self.node_link.local_node_name(),
            self.node_link.remote_node_name(),
        )
    }
}
