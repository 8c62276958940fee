//! Polymorphic links between routers.
//!
//! A [`RouterLink`] is one router's handle on one conduit to another router.
//! The local variant calls the peer router directly; the remote variant
//! encodes each operation as a wire message on a node link. Links hold
//! strong references only *upward*, to the peer router or the node link,
//! never back to their owning router, which is what breaks the reference
//! cycle at route teardown.

mod local;
mod remote;

pub use local::{InitialStability, LocalRouterLink};
pub use remote::RemoteRouterLink;

use std::sync::Arc;

use weft_core::{LinkType, NodeName, SequenceNumber, SublinkId};

use crate::link_state::{LinkStateFragment, QueueState};
use crate::parcel::Parcel;
use crate::router::Router;

/// Capability set shared by both link variants.
///
/// Operations that only make sense between nodes (`bypass_peer`, the
/// stop-proxying family) are wire-message emitters on remote links and are
/// never invoked on local links.
pub trait RouterLink: Send + Sync {
    fn link_type(&self) -> LinkType;

    /// The peer router, when it lives in this process. Absent on remote
    /// links.
    fn local_peer(&self) -> Option<Arc<Router>>;

    /// Downcast used by bypass optimization paths. Absent on local links.
    fn as_remote(&self) -> Option<&RemoteRouterLink>;

    /// Deliver a parcel to the peer.
    fn accept_parcel(&self, parcel: Parcel);

    /// Tell the peer the sender's terminal closed its route at
    /// `sequence_length`.
    fn accept_route_closure(&self, sequence_length: SequenceNumber);

    /// Tell the peer the route lost a participant without closure.
    fn accept_route_disconnected(&self);

    /// Advertise this side as stable in the shared link state.
    fn mark_side_stable(&self);

    /// Lock the link for a bypass initiated by this side, authorizing
    /// `source` to carry it out. Requires both sides stable.
    fn try_lock_for_bypass(&self, source: NodeName) -> bool;

    /// Lock the link to serialize closure against a concurrent bypass.
    fn try_lock_for_closure(&self) -> bool;

    fn unlock(&self);

    /// Wake the peer if it parked on a waiting bit after losing the lock.
    /// Returns whether a wake was issued.
    fn flush_other_side_if_waiting(&self) -> bool;

    /// Whether `source` is the node the peer authorized to request bypass.
    fn can_node_request_bypass(&self, source: NodeName) -> bool;

    /// Publish this side's inbound queue snapshot. Returns true when the
    /// peer wants a consumption notification.
    fn update_inbound_queue_state(&self, state: QueueState) -> bool;

    /// The peer's published inbound queue snapshot.
    fn peer_queue_state(&self) -> QueueState;

    /// Enable or disable notifications about peer-side consumption.
    fn enable_peer_monitoring(&self, enable: bool);

    /// Notify the peer that this side consumed parcels it was monitoring.
    fn notify_data_consumed(&self);

    /// Ask the peer to bypass the router on this end of the link by linking
    /// directly to `target_node` via `target_sublink`.
    fn bypass_peer(&self, target_node: NodeName, target_sublink: SublinkId);

    /// Tell the bypassed proxy its final sequence lengths in each direction.
    fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    );

    /// Tell the peer that the proxy it still receives from will stop after
    /// `inbound_sequence_length`.
    fn proxy_will_stop(&self, inbound_sequence_length: SequenceNumber);

    /// Hand the peer a ready-made replacement link for a proxy bypass.
    fn bypass_peer_with_link(
        &self,
        new_sublink: SublinkId,
        link_state: LinkStateFragment,
        inbound_sequence_length: SequenceNumber,
    );

    /// Tell the proxy to stop forwarding to its local outward peer after
    /// `outbound_sequence_length`.
    fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber);

    /// Sever this link from its registry so it can be dropped.
    fn deactivate(&self);

    /// Short description for log lines.
    fn describe(&self) -> String;
}

/// Pointer identity across `Arc<dyn RouterLink>` handles.
pub fn links_equal(a: &Arc<dyn RouterLink>, b: &Arc<dyn RouterLink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Whether `link` is the same object as `target`.
pub fn is_link(link: &Arc<dyn RouterLink>, target: &RemoteRouterLink) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(link), target as *const RemoteRouterLink)
}
