//! Collaborator interfaces onto the node-to-node layer.
//!
//! The route core never owns a transport or a shared memory pool; it
//! consumes them through these traits. One [`NodeLink`] exists per connected
//! remote node, carrying any number of sublink-scoped router conversations
//! and a [`NodeLinkMemory`] pool shared with that node.

use std::sync::Arc;

use weft_core::{LinkSide, LinkType, NodeName, SublinkId};

use crate::link::RemoteRouterLink;
use crate::link_state::{FragmentDescriptor, LinkStateFragment};
use crate::message::Message;
use crate::router::Router;

/// Callback invoked when an asynchronous link-state allocation completes.
/// Receives `None` when the pool cannot grow.
pub type LinkStateCallback = Box<dyn FnOnce(Option<LinkStateFragment>) + Send>;

/// One node's handle on its connection to one remote node.
pub trait NodeLink: Send + Sync {
    fn local_node_name(&self) -> NodeName;

    fn remote_node_name(&self) -> NodeName;

    /// Register `router` to receive traffic on `sublink`, returning the new
    /// remote link. Returns `None` when the sublink is already taken (a
    /// validation signal, since well-behaved nodes never reuse sublink ids)
    /// or when this link is already defunct.
    fn add_remote_router_link(
        &self,
        sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
        link_type: LinkType,
        side: LinkSide,
        router: Arc<Router>,
    ) -> Option<Arc<RemoteRouterLink>>;

    /// Drop the binding for `sublink`, if any.
    fn remove_remote_router_link(&self, sublink: SublinkId);

    /// The (link, router) pair bound to `sublink`.
    fn get_sublink(&self, sublink: SublinkId) -> Option<(Arc<RemoteRouterLink>, Arc<Router>)>;

    /// The router bound to `sublink`.
    fn get_router(&self, sublink: SublinkId) -> Option<Arc<Router>> {
        self.get_sublink(sublink).map(|(_, router)| router)
    }

    /// Queue a message for the remote node.
    fn transmit(&self, message: Message);

    /// An existing link from this node to `name`, when one is already
    /// established. Bypass requests that name a third node resolve it here.
    fn link_to_node(&self, name: NodeName) -> Option<Arc<dyn NodeLink>>;

    /// The shared memory pool for this link.
    fn memory(&self) -> &dyn NodeLinkMemory;
}

/// The shared memory pool behind one node link.
pub trait NodeLinkMemory: Send + Sync {
    /// Atomically reserve `count` consecutive sublink ids, returning the
    /// first. Both ends allocate from the same space without collisions.
    fn allocate_sublink_ids(&self, count: u64) -> SublinkId;

    /// Allocate a fresh link-state fragment if capacity is available now.
    fn try_allocate_router_link_state(&self) -> Option<LinkStateFragment>;

    /// Allocate a link-state fragment, growing the pool if needed; the
    /// callback fires when the fragment is available (possibly
    /// reentrantly, on the calling thread).
    fn allocate_router_link_state(&self, callback: LinkStateCallback);

    /// Resolve a descriptor received on the wire against this pool.
    fn adopt_router_link_state(&self, descriptor: FragmentDescriptor)
        -> Option<LinkStateFragment>;
}
