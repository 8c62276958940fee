//! The concrete node link: sublink registry and inbound message dispatch.
//!
//! One `NodeLink` exists per connected remote node. Outbound it forwards
//! wire messages to the transport; inbound it resolves each message's
//! sublink to a router and invokes the matching entry point. Best-effort
//! validation applies: messages for unknown sublinks are tolerated (routes
//! race teardown), while malformed or impossible requests sever the link
//! and let disconnection propagate.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use weft_core::{LinkSide, LinkType, NodeName, SublinkId};
use weft_router::node_link::{NodeLink as NodeLinkApi, NodeLinkMemory};
use weft_router::{
    LinkStateFragment, Message, Parcel, ParcelObject, RemoteRouterLink, Router, RouterLink,
    WireObject,
};

use crate::memory::LinkMemory;
use crate::node::Node;
use crate::transport::MemoryTransport;

struct SublinkEntry {
    link: Arc<RemoteRouterLink>,
    receiver: Arc<Router>,
}

pub struct NodeLink {
    self_weak: Weak<NodeLink>,
    node: Arc<Node>,
    local_name: NodeName,
    remote_name: NodeName,
    transport: Arc<MemoryTransport>,
    memory: Arc<LinkMemory>,
    sublinks: Mutex<HashMap<SublinkId, SublinkEntry>>,
    active: AtomicBool,
}

impl NodeLink {
    pub(crate) fn new(
        node: Arc<Node>,
        local_name: NodeName,
        remote_name: NodeName,
        transport: Arc<MemoryTransport>,
        memory: Arc<LinkMemory>,
    ) -> Arc<NodeLink> {
        let link = Arc::new_cyclic(|self_weak| NodeLink {
            self_weak: self_weak.clone(),
            node,
            local_name,
            remote_name,
            transport,
            memory,
            sublinks: Mutex::new(HashMap::new()),
            active: AtomicBool::new(true),
        });
        link.transport.set_receiver(&link);
        link
    }

    fn self_dyn(&self) -> Arc<dyn NodeLinkApi> {
        match self.self_weak.upgrade() {
            Some(link) => link,
            // `&self` implies a live strong reference.
            None => unreachable!("node link borrowed without a strong reference"),
        }
    }

    /// Force transport failure, e.g. to simulate a dead peer in tests.
    pub fn sever(&self) {
        self.transport.sever();
    }

    /// The transport died. Drop every sublink and tell each bound router.
    pub(crate) fn on_transport_error(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(remote = %self.remote_name, "node link lost its transport");
        let entries: Vec<SublinkEntry> = {
            let mut sublinks = self.sublinks.lock();
            sublinks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            entry.receiver.notify_link_disconnected(&entry.link);
        }
        self.node.forget_link(self.remote_name);
    }

    /// Number of live sublinks; observability for tests and diagnostics.
    pub fn sublink_count(&self) -> usize {
        self.sublinks.lock().len()
    }

    fn adopt_fragment(
        &self,
        descriptor: weft_router::FragmentDescriptor,
    ) -> Option<LinkStateFragment> {
        self.memory.adopt_router_link_state(descriptor)
    }

    /// Dispatch one decoded message. Returns on success; severs the link
    /// when the message is invalid.
    pub(crate) fn deliver(&self, message: Message) {
        tracing::trace!(
            kind = message.kind(),
            from = %self.remote_name,
            "dispatching message"
        );
        let ok = match message {
            Message::AcceptParcel {
                sublink,
                sequence_number,
                data,
                objects,
            } => self.on_accept_parcel(sublink, sequence_number, data, objects),
            Message::RouteClosed {
                sublink,
                sequence_length,
            } => match self.lookup(sublink) {
                // Tolerated: the sublink may be gone if the local router
                // already closed.
                None => true,
                Some((link, router)) => {
                    router.accept_route_closure_from(link.link_type(), sequence_length)
                }
            },
            Message::RouteDisconnected { sublink } => match self.lookup(sublink) {
                None => true,
                Some((link, router)) => {
                    router.accept_route_disconnected_from(link.link_type())
                }
            },
            Message::BypassPeer {
                sublink,
                target_node,
                target_sublink,
            } => match self.lookup(sublink) {
                None => true,
                Some((link, router)) => router.bypass_peer(&link, target_node, target_sublink),
            },
            Message::AcceptBypassLink {
                proxy_node,
                proxy_sublink,
                new_sublink,
                link_state,
                inbound_sequence_length,
            } => {
                let Some(fragment) = self.adopt_fragment(link_state) else {
                    tracing::error!("bypass link names an unknown link-state fragment");
                    return self.fail_validation();
                };
                // The router being bypassed around is found through our
                // link to the proxy's node.
                let Some(proxy_link) = self.node.get_link(proxy_node) else {
                    tracing::debug!("ignoring bypass link for an unknown proxy node");
                    return;
                };
                match NodeLinkApi::get_router(&*proxy_link, proxy_sublink) {
                    None => true,
                    Some(router) => router.accept_bypass_link(
                        &self.self_dyn(),
                        new_sublink,
                        fragment,
                        inbound_sequence_length,
                    ),
                }
            }
            Message::StopProxying {
                sublink,
                inbound_sequence_length,
                outbound_sequence_length,
            } => match self.lookup(sublink) {
                None => true,
                Some((_, router)) => {
                    router.stop_proxying(inbound_sequence_length, outbound_sequence_length)
                }
            },
            Message::ProxyWillStop {
                sublink,
                inbound_sequence_length,
            } => match self.lookup(sublink) {
                None => true,
                Some((_, router)) => router.notify_proxy_will_stop(inbound_sequence_length),
            },
            Message::BypassPeerWithLink {
                sublink,
                new_sublink,
                link_state,
                inbound_sequence_length,
            } => {
                let Some(fragment) = self.adopt_fragment(link_state) else {
                    tracing::error!("bypass link names an unknown link-state fragment");
                    return self.fail_validation();
                };
                match self.lookup(sublink) {
                    None => true,
                    Some((_, router)) => router.accept_bypass_link(
                        &self.self_dyn(),
                        new_sublink,
                        fragment,
                        inbound_sequence_length,
                    ),
                }
            }
            Message::StopProxyingToLocalPeer {
                sublink,
                outbound_sequence_length,
            } => match self.lookup(sublink) {
                None => true,
                Some((_, router)) => {
                    router.stop_proxying_to_local_peer(outbound_sequence_length)
                }
            },
            Message::FlushRouter { sublink } => {
                if let Some((_, router)) = self.lookup(sublink) {
                    router.flush(weft_router::FlushBehavior::ForceBypassAttempt);
                }
                true
            }
            Message::NotifyDataConsumed { sublink } => {
                if let Some((_, router)) = self.lookup(sublink) {
                    router.notify_peer_consumed_data();
                }
                true
            }
        };

        if !ok {
            self.fail_validation();
        }
    }

    fn fail_validation(&self) {
        tracing::error!(remote = %self.remote_name, "message validation failed; severing link");
        self.transport.sever();
    }

    fn lookup(&self, sublink: SublinkId) -> Option<(Arc<RemoteRouterLink>, Arc<Router>)> {
        let sublinks = self.sublinks.lock();
        let entry = sublinks.get(&sublink)?;
        Some((entry.link.clone(), entry.receiver.clone()))
    }

    fn on_accept_parcel(
        &self,
        sublink: SublinkId,
        sequence_number: weft_core::SequenceNumber,
        data: bytes::Bytes,
        objects: Vec<WireObject>,
    ) -> bool {
        let Some((link, router)) = self.lookup(sublink) else {
            // Parcel racing link teardown; drop it.
            return true;
        };

        let mut parcel_objects = Vec::with_capacity(objects.len());
        for object in objects {
            match object {
                WireObject::Router(descriptor) => {
                    let Some(new_router) = Router::deserialize(&descriptor, &self.self_dyn())
                    else {
                        return false;
                    };
                    parcel_objects.push(ParcelObject::Portal(new_router));
                }
                WireObject::Blob(blob) => parcel_objects.push(ParcelObject::Blob(blob)),
            }
        }

        let mut parcel = Parcel::with_objects(data, parcel_objects);
        parcel.set_sequence_number(sequence_number);

        if link.link_type().is_outward() {
            router.accept_inbound_parcel(parcel)
        } else if link.link_type().is_peripheral_inward() {
            router.accept_outbound_parcel(parcel)
        } else {
            false
        }
    }
}

impl NodeLinkApi for NodeLink {
    fn local_node_name(&self) -> NodeName {
        self.local_name
    }

    fn remote_node_name(&self) -> NodeName {
        self.remote_name
    }

    fn add_remote_router_link(
        &self,
        sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
        link_type: LinkType,
        side: LinkSide,
        router: Arc<Router>,
    ) -> Option<Arc<RemoteRouterLink>> {
        if !self.active.load(Ordering::SeqCst) {
            return None;
        }
        let link = RemoteRouterLink::new(self.self_dyn(), sublink, link_state, link_type, side);
        let mut sublinks = self.sublinks.lock();
        match sublinks.entry(sublink) {
            Entry::Occupied(_) => {
                // Sublink reuse is a validation signal from the remote
                // node; the caller decides what to do about it.
                None
            }
            Entry::Vacant(slot) => {
                slot.insert(SublinkEntry {
                    link: link.clone(),
                    receiver: router,
                });
                Some(link)
            }
        }
    }

    fn remove_remote_router_link(&self, sublink: SublinkId) {
        self.sublinks.lock().remove(&sublink);
    }

    fn get_sublink(&self, sublink: SublinkId) -> Option<(Arc<RemoteRouterLink>, Arc<Router>)> {
        self.lookup(sublink)
    }

    fn transmit(&self, message: Message) {
        self.transport.transmit(&message);
    }

    fn link_to_node(&self, name: NodeName) -> Option<Arc<dyn NodeLinkApi>> {
        if name == self.remote_name {
            return Some(self.self_dyn());
        }
        self.node
            .get_link(name)
            .map(|link| link as Arc<dyn NodeLinkApi>)
    }

    fn memory(&self) -> &dyn NodeLinkMemory {
        self.memory.as_ref()
    }
}
