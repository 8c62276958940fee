//! Proxy bypass: removing a router from the middle of a route.
//!
//! A proxy with stable inward and outward links arranges for its two
//! neighbors to link directly, then drains both of its links across agreed
//! sequence-number boundaries until nothing remains in flight and the old
//! links deactivate. Three shapes exist, keyed by where the neighbors live
//! relative to the proxy; merged routes add bridge variants that retire two
//! proxies at once.

use std::sync::Arc;

use weft_core::{LinkType, NodeName, SequenceNumber, SublinkId};

use crate::link::{is_link, InitialStability, LocalRouterLink, RemoteRouterLink, RouterLink};
use crate::link_state::LinkStateFragment;
use crate::message::Message;
use crate::multi_lock::{lock_four, lock_three, lock_two};
use crate::node_link::NodeLink;
use crate::router::{FlushBehavior, Router};

fn node_links_equal(a: &Arc<dyn NodeLink>, b: &Arc<dyn NodeLink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl Router {
    /// If this router is a bypassable proxy, lock its outward link and start
    /// the bypass. Returns whether a bypass was initiated.
    pub(crate) fn maybe_start_self_bypass(&self) -> bool {
        let remote_inward_link: Arc<RemoteRouterLink>;
        let mut remote_outward_link: Option<Arc<RemoteRouterLink>> = None;
        let local_outward_peer: Option<Arc<Router>>;
        {
            let state = self.state.lock();
            let Some(inward) = state.inward_edge.as_ref() else {
                return false;
            };
            if !inward.is_stable() {
                // Only a proxy whose links are both stable can be bypassed.
                return false;
            }
            let Some(inward_primary) = inward.primary_link() else {
                return false;
            };
            let Some(outward_link) = state.outward_edge.primary_link() else {
                return false;
            };
            let Some(inward_remote) = inward_primary.as_remote() else {
                return false;
            };

            let inward_peer_name = inward_remote.node_link().remote_node_name();
            if !outward_link.try_lock_for_bypass(inward_peer_name) {
                tracing::debug!(
                    link = %outward_link.describe(),
                    "proxy bypass blocked by busy link"
                );
                return false;
            }

            remote_inward_link = inward_remote.clone_arc();
            local_outward_peer = outward_link.local_peer();
            if local_outward_peer.is_none() {
                remote_outward_link = outward_link.as_remote().map(RemoteRouterLink::clone_arc);
            }
        }

        if let Some(remote_outward) = remote_outward_link {
            // Both neighbors are remote: decay both links and ask the
            // inward peer to bypass us.
            {
                let mut state = self.state.lock();
                let has_inward_primary = state
                    .inward_edge
                    .as_ref()
                    .is_some_and(|edge| edge.primary_link().is_some());
                if !has_inward_primary || state.outward_edge.primary_link().is_none() {
                    // Disconnected in the meantime.
                    return false;
                }
                state.outward_edge.begin_primary_link_decay();
                if let Some(inward) = state.inward_edge.as_mut() {
                    inward.begin_primary_link_decay();
                }
            }

            tracing::debug!(
                inward = %remote_inward_link.describe(),
                outward = %remote_outward.describe(),
                "proxy requesting its own bypass"
            );
            remote_inward_link.bypass_peer(
                remote_outward.node_link().remote_node_name(),
                remote_outward.sublink(),
            );
            return true;
        }

        let Some(local_outward_peer) = local_outward_peer else {
            return false;
        };

        // The outward peer shares our node: build the replacement link here
        // and hand it to the remote inward peer.
        let link_state = remote_inward_link
            .node_link()
            .memory()
            .try_allocate_router_link_state();
        self.start_self_bypass_to_local_peer(&local_outward_peer, &remote_inward_link, link_state)
    }

    /// Bypass this proxy when its outward peer is local: create a new
    /// central remote link whose near end is the local peer, send it to the
    /// remote inward peer, and decay everything in between.
    pub(crate) fn start_self_bypass_to_local_peer(
        &self,
        local_outward_peer: &Arc<Router>,
        inward_link: &Arc<RemoteRouterLink>,
        link_state: Option<LinkStateFragment>,
    ) -> bool {
        let Some(link_state) = link_state else {
            // Park the bypass on the allocation; it resumes here.
            let router = self.self_arc();
            let peer = local_outward_peer.clone();
            let inward = inward_link.clone();
            inward_link.node_link().memory().allocate_router_link_state(
                Box::new(move |link_state| {
                    if let Some(link_state) = link_state {
                        router.start_self_bypass_to_local_peer(&peer, &inward, Some(link_state));
                    }
                }),
            );
            return true;
        };

        let new_sublink = inward_link.node_link().memory().allocate_sublink_ids(1);
        let new_link;
        let length_from_outward_peer;
        {
            let (mut us, mut peer) = lock_two(&self.state, &local_outward_peer.state);
            if us.outward_edge.primary_link().is_none()
                || peer.outward_edge.primary_link().is_none()
                || us.is_disconnected
                || peer.is_disconnected
            {
                tracing::debug!("proxy bypass blocked by closure or disconnection");
                return false;
            }

            tracing::debug!(
                inward = %inward_link.describe(),
                "proxy requesting bypass to local outward peer"
            );

            // Decay both of our links and the local peer's link to us.
            length_from_outward_peer = peer.outbound_parcels.current_sequence_number();
            peer.outward_edge.begin_primary_link_decay();
            peer.outward_edge
                .set_length_to_decaying_link(length_from_outward_peer);
            us.outward_edge.begin_primary_link_decay();
            us.outward_edge
                .set_length_from_decaying_link(length_from_outward_peer);
            if let Some(inward) = us.inward_edge.as_mut() {
                inward.begin_primary_link_decay();
                inward.set_length_to_decaying_link(length_from_outward_peer);
            }

            new_link = inward_link.node_link().add_remote_router_link(
                new_sublink,
                Some(link_state.clone()),
                LinkType::Central,
                weft_core::LinkSide::A,
                local_outward_peer.clone(),
            );
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return false;
        };

        // Tell the inward peer it can bypass us over the new link. Only
        // after that message is on the wire may the local peer adopt the
        // link, or it could race it with traffic the remote side cannot
        // route yet.
        inward_link.bypass_peer_with_link(new_sublink, link_state, length_from_outward_peer);
        local_outward_peer.set_outward_link(new_link);
        true
    }

    /// Handle a `bypass_peer` request from our outward neighbor's proxy,
    /// asking us to link directly to `bypass_target_node` /
    /// `bypass_target_sublink`.
    pub fn bypass_peer(
        &self,
        requestor: &Arc<RemoteRouterLink>,
        bypass_target_node: NodeName,
        bypass_target_sublink: SublinkId,
    ) -> bool {
        let from_node_link = requestor.node_link().clone();

        // The request must come from our current outward peer.
        {
            let state = self.state.lock();
            let Some(outward_link) = state.outward_edge.primary_link() else {
                // Already disconnected along the route; not the requestor's
                // fault.
                return true;
            };
            if !is_link(outward_link, requestor) {
                tracing::error!(
                    requestor = %requestor.describe(),
                    "rejecting bypass request from a link that is not our outward peer"
                );
                return false;
            }
        }

        if bypass_target_node != from_node_link.local_node_name() {
            // The proxy's outward peer lives on a third node.
            let Some(link_to_target) = from_node_link.link_to_node(bypass_target_node) else {
                tracing::error!(
                    target = %bypass_target_node,
                    "no link to bypass target node; disconnecting"
                );
                self.accept_route_disconnected_from(LinkType::PeripheralOutward);
                return true;
            };
            let link_state = link_to_target.memory().try_allocate_router_link_state();
            return self.bypass_peer_with_new_remote_link(
                requestor,
                &link_to_target,
                bypass_target_sublink,
                link_state,
            );
        }

        // The proxy's outward peer lives on this node.
        self.bypass_peer_with_new_local_link(requestor, bypass_target_sublink)
    }

    /// Carry out a bypass toward a remote target: allocate a new central
    /// link on `node_link`, offer it to the target, and decay our link to
    /// the proxy.
    pub(crate) fn bypass_peer_with_new_remote_link(
        &self,
        requestor: &Arc<RemoteRouterLink>,
        node_link: &Arc<dyn NodeLink>,
        bypass_target_sublink: SublinkId,
        link_state: Option<LinkStateFragment>,
    ) -> bool {
        let Some(link_state) = link_state else {
            // Park on fragment allocation and resume here.
            let router = self.self_arc();
            let requestor = requestor.clone();
            let node_link = node_link.clone();
            node_link
                .clone()
                .memory()
                .allocate_router_link_state(Box::new(move |link_state| match link_state {
                    Some(link_state) => {
                        router.bypass_peer_with_new_remote_link(
                            &requestor,
                            &node_link,
                            bypass_target_sublink,
                            Some(link_state),
                        );
                    }
                    None => {
                        router.accept_route_disconnected_from(LinkType::Central);
                    }
                }));
            return true;
        };

        let new_sublink = node_link.memory().allocate_sublink_ids(1);
        let length_to_decaying_link;
        let new_link;
        {
            let mut state = self.state.lock();
            if state.outward_edge.primary_link().is_none() || state.is_disconnected {
                // Disconnected since the request arrived; not the
                // requestor's fault.
                return true;
            }

            if !state.outward_edge.begin_primary_link_decay() {
                tracing::error!("rejecting bypass: link decay already in progress");
                return false;
            }

            length_to_decaying_link = state.outbound_parcels.current_sequence_number();
            state
                .outward_edge
                .set_length_to_decaying_link(length_to_decaying_link);
            new_link = node_link.add_remote_router_link(
                new_sublink,
                Some(link_state.clone()),
                LinkType::Central,
                weft_core::LinkSide::A,
                self.self_arc(),
            );
        }

        let Some(new_link) = new_link else {
            // The node link died before the new link existed; again not the
            // requestor's fault.
            self.accept_route_disconnected_from(LinkType::Central);
            return true;
        };

        let proxy_node_name = requestor.node_link().remote_node_name();
        tracing::debug!(
            new_link = %new_link.describe(),
            proxy = %proxy_node_name,
            proxy_sublink = %bypass_target_sublink,
            "offering bypass link to the proxy's outward peer"
        );

        node_link.transmit(Message::AcceptBypassLink {
            proxy_node: proxy_node_name,
            proxy_sublink: bypass_target_sublink,
            new_sublink,
            link_state: link_state.descriptor(),
            inbound_sequence_length: length_to_decaying_link,
        });

        // Adopted only *after* the message above is queued: otherwise this
        // router could race traffic onto the new sublink before the remote
        // node can route it.
        self.set_outward_link(new_link);
        true
    }

    /// Carry out a bypass whose target router lives on this node: link the
    /// two of us with a fresh local pair and tell the proxy to wind down.
    pub(crate) fn bypass_peer_with_new_local_link(
        &self,
        requestor: &Arc<RemoteRouterLink>,
        bypass_target_sublink: SublinkId,
    ) -> bool {
        let from_node_link = requestor.node_link().clone();
        let Some(new_local_peer) = from_node_link.get_router(bypass_target_sublink) else {
            // The target may already be gone.
            self.accept_route_disconnected_from(LinkType::PeripheralOutward);
            return true;
        };

        let link_from_new_local_peer_to_proxy;
        let length_to_proxy_from_us;
        let length_from_proxy_to_us;
        {
            let (mut us, mut peer) = lock_two(&self.state, &new_local_peer.state);
            length_from_proxy_to_us = peer.outbound_parcels.current_sequence_number();
            length_to_proxy_from_us = us.outbound_parcels.current_sequence_number();

            tracing::debug!(
                to_proxy = %length_to_proxy_from_us,
                from_proxy = %length_from_proxy_to_us,
                "bypassing proxy with a new local peer"
            );

            link_from_new_local_peer_to_proxy = peer.outward_edge.primary_link().cloned();
            if us.outward_edge.primary_link().is_none()
                || link_from_new_local_peer_to_proxy.is_none()
                || us.is_disconnected
                || peer.is_disconnected
            {
                return true;
            }

            if !us.outward_edge.begin_primary_link_decay()
                || !peer.outward_edge.begin_primary_link_decay()
            {
                tracing::error!("rejecting bypass: link decay already in progress");
                return false;
            }
            us.outward_edge
                .set_length_to_decaying_link(length_to_proxy_from_us);
            us.outward_edge
                .set_length_from_decaying_link(length_from_proxy_to_us);
            peer.outward_edge
                .set_length_to_decaying_link(length_from_proxy_to_us);
            peer.outward_edge
                .set_length_from_decaying_link(length_to_proxy_from_us);

            // The new link stays unstable until the decaying proxy links
            // are gone on both sides.
            let (link_us, link_peer) = LocalRouterLink::create_pair(
                LinkType::Central,
                (self.self_arc(), new_local_peer.clone()),
                InitialStability::Unstable,
            );
            us.outward_edge.set_primary_link(link_us);
            peer.outward_edge.set_primary_link(link_peer);
        }

        if let Some(link) = link_from_new_local_peer_to_proxy {
            link.stop_proxying(length_from_proxy_to_us, length_to_proxy_from_us);
        }

        self.flush(FlushBehavior::Default);
        new_local_peer.flush(FlushBehavior::Default);
        true
    }

    /// Accept a replacement central link offered during a bypass of the
    /// proxy on the far side of our current outward link.
    pub fn accept_bypass_link(
        &self,
        new_node_link: &Arc<dyn NodeLink>,
        new_sublink: SublinkId,
        link_state: LinkStateFragment,
        inbound_sequence_length_from_bypassed_link: SequenceNumber,
    ) -> bool {
        let length_to_proxy_from_us;
        let old_link: Arc<RemoteRouterLink>;
        let new_link;
        {
            let mut state = self.state.lock();
            if state.is_disconnected || state.outward_edge.primary_link().is_none() {
                // The proxy already vanished; the route is dysfunctional
                // and no new links should be made.
                tracing::debug!("discarding bypass link after peer disconnection");
                return true;
            }

            let old_remote = state
                .outward_edge
                .primary_link()
                .and_then(|link| link.as_remote())
                .map(RemoteRouterLink::clone_arc);
            let Some(old_remote) = old_remote else {
                // Only a router with a remote outward link can receive
                // this.
                tracing::debug!("rejecting bypass link on non-remote outward edge");
                return false;
            };
            old_link = old_remote;

            if !node_links_equal(old_link.node_link(), new_node_link)
                && !old_link.can_node_request_bypass(new_node_link.remote_node_name())
            {
                // The new link must either stay on the proxy's node link or
                // come from the node the proxy authorized.
                tracing::error!("rejecting unauthorized bypass link");
                return false;
            }

            length_to_proxy_from_us = state.outbound_parcels.current_sequence_number();
            if !state.outward_edge.begin_primary_link_decay() {
                tracing::error!("rejecting bypass link: decay already in progress");
                return false;
            }

            // The bypass initiator took side A, so we take side B.
            new_link = new_node_link.add_remote_router_link(
                new_sublink,
                Some(link_state),
                LinkType::Central,
                weft_core::LinkSide::B,
                self.self_arc(),
            );

            if let Some(link) = new_link.as_ref() {
                tracing::debug!(
                    old = %old_link.describe(),
                    new = %link.describe(),
                    to_proxy = %length_to_proxy_from_us,
                    from_proxy = %inbound_sequence_length_from_bypassed_link,
                    "bypassing proxy behind outward link"
                );
                state
                    .outward_edge
                    .set_length_to_decaying_link(length_to_proxy_from_us);
                state
                    .outward_edge
                    .set_length_from_decaying_link(inbound_sequence_length_from_bypassed_link);
                state.outward_edge.set_primary_link(link.clone());
            }
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return true;
        };

        if node_links_equal(new_link.node_link(), old_link.node_link()) {
            // Same node on both ends: the proxy already conspired with its
            // local outward peer, so it only needs to stop.
            old_link.stop_proxying_to_local_peer(length_to_proxy_from_us);
        } else {
            old_link.stop_proxying(
                length_to_proxy_from_us,
                inbound_sequence_length_from_bypassed_link,
            );
            new_link.proxy_will_stop(length_to_proxy_from_us);
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// The bypassed proxy learns its final sequence lengths in both
    /// directions and finishes arming its decay boundaries.
    pub fn stop_proxying(
        &self,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    ) -> bool {
        let mut bridge_peer: Option<Arc<Router>> = None;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.outward_edge.is_stable() {
                // Proxies decay their links before asking to be bypassed
                // and never adopt new ones after; a stable edge means the
                // request is bogus.
                tracing::error!("rejecting stop-proxying on a non-proxying router");
                return false;
            }

            if let Some(bridge) = state.bridge.as_ref() {
                // The router on the other side of the bridge needs the same
                // boundaries.
                bridge_peer = bridge.decaying_local_peer();
                if bridge_peer.is_none() {
                    return false;
                }
            } else {
                let Some(inward) = state.inward_edge.as_mut() else {
                    return false;
                };
                if inward.is_stable() {
                    return false;
                }
                inward.set_length_to_decaying_link(inbound_sequence_length);
                inward.set_length_from_decaying_link(outbound_sequence_length);
                state
                    .outward_edge
                    .set_length_to_decaying_link(outbound_sequence_length);
                state
                    .outward_edge
                    .set_length_from_decaying_link(inbound_sequence_length);
            }
        }

        if let Some(peer) = bridge_peer.as_ref() {
            let (mut us, mut other) = lock_two(&self.state, &peer.state);
            let us_decaying = us.bridge.as_ref().is_some_and(|bridge| !bridge.is_stable());
            let other_decaying = other
                .bridge
                .as_ref()
                .is_some_and(|bridge| !bridge.is_stable());
            if !us_decaying || !other_decaying {
                // The bridge is already torn down; nothing to arm.
                return true;
            }

            if let Some(bridge) = us.bridge.as_mut() {
                bridge.set_length_to_decaying_link(inbound_sequence_length);
                bridge.set_length_from_decaying_link(outbound_sequence_length);
            }
            us.outward_edge
                .set_length_to_decaying_link(outbound_sequence_length);
            us.outward_edge
                .set_length_from_decaying_link(inbound_sequence_length);
            if let Some(bridge) = other.bridge.as_mut() {
                bridge.set_length_to_decaying_link(outbound_sequence_length);
                bridge.set_length_from_decaying_link(inbound_sequence_length);
            }
            other
                .outward_edge
                .set_length_to_decaying_link(inbound_sequence_length);
            other
                .outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
        }

        self.flush(FlushBehavior::Default);
        if let Some(peer) = bridge_peer {
            peer.flush(FlushBehavior::Default);
        }
        true
    }

    /// The proxy feeding this router announces the final length it will
    /// forward.
    pub fn notify_proxy_will_stop(&self, inbound_sequence_length: SequenceNumber) -> bool {
        {
            let mut state = self.state.lock();
            if state.outward_edge.is_stable() {
                // Either an invalid request, or we lost every link to
                // disconnection. Only the latter is tolerable.
                return state.is_disconnected;
            }

            tracing::debug!(
                length = %inbound_sequence_length,
                "bypassed proxy will stop forwarding"
            );
            state
                .outward_edge
                .set_length_from_decaying_link(inbound_sequence_length);
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// This proxy's bypass ran through its local outward peer; the remote
    /// initiator reports how much it sent toward us.
    pub fn stop_proxying_to_local_peer(&self, outbound_sequence_length: SequenceNumber) -> bool {
        let mut local_peer: Option<Arc<Router>> = None;
        let mut bridge_peer: Option<Arc<Router>> = None;
        {
            let state = self.state.lock();
            if let Some(bridge) = state.bridge.as_ref() {
                bridge_peer = bridge.decaying_local_peer();
            } else if let Some(decaying) = state.outward_edge.decaying_link() {
                local_peer = decaying.local_peer();
            } else {
                // Tolerable only if we were disconnected in the meantime.
                return state.is_disconnected;
            }
        }

        if bridge_peer.is_none() {
            let Some(peer) = local_peer.clone() else {
                tracing::error!("rejecting stop-proxying-to-local-peer with no local peer");
                return false;
            };

            {
                let (mut us, mut other) = lock_two(&self.state, &peer.state);
                let us = &mut *us;
                let our_link = us.outward_edge.decaying_link().cloned();
                let peer_link = other.outward_edge.decaying_link().cloned();
                let (Some(our_link), Some(peer_link)) = (our_link, peer_link) else {
                    // Either router may have been disconnected; ignore.
                    return true;
                };

                let reciprocal = our_link
                    .local_peer()
                    .is_some_and(|p| Arc::ptr_eq(&p, &peer))
                    && peer_link
                        .local_peer()
                        .is_some_and(|p| Arc::ptr_eq(&p, &self.self_arc()));
                let Some(inward) = us.inward_edge.as_mut() else {
                    tracing::error!("rejecting stop-proxying-to-local-peer at a terminal router");
                    return false;
                };
                if !reciprocal {
                    tracing::error!("rejecting stop-proxying-to-local-peer at an invalid proxy");
                    return false;
                }

                tracing::debug!(
                    length = %outbound_sequence_length,
                    "proxy stopping toward local peer"
                );
                other
                    .outward_edge
                    .set_length_from_decaying_link(outbound_sequence_length);
                us.outward_edge
                    .set_length_to_decaying_link(outbound_sequence_length);
                inward.set_length_from_decaying_link(outbound_sequence_length);
            }

            self.flush(FlushBehavior::Default);
            peer.flush(FlushBehavior::Default);
            return true;
        }

        // With a bridge, three local routers are involved: this router, its
        // outward peer, and its bridge peer. Both bridge routers are being
        // bypassed together.
        let Some(bridge_peer) = bridge_peer else {
            return false;
        };
        {
            let state = bridge_peer.state.lock();
            if state.outward_edge.is_stable() {
                return false;
            }
            local_peer = state.outward_edge.decaying_local_peer();
        }
        let Some(peer) = local_peer else {
            return false;
        };

        {
            let (mut us, mut peer_state, mut other) =
                lock_three(&self.state, &peer.state, &bridge_peer.state);
            let us = &mut *us;
            let other = &mut *other;
            if us.outward_edge.is_stable()
                || peer_state.outward_edge.is_stable()
                || other.outward_edge.is_stable()
            {
                return false;
            }

            peer_state
                .outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
            us.outward_edge
                .set_length_from_decaying_link(outbound_sequence_length);
            if let Some(bridge) = us.bridge.as_mut() {
                bridge.set_length_to_decaying_link(outbound_sequence_length);
            }
            other
                .outward_edge
                .set_length_to_decaying_link(outbound_sequence_length);
            if let Some(bridge) = other.bridge.as_mut() {
                bridge.set_length_from_decaying_link(outbound_sequence_length);
            }
        }

        self.flush(FlushBehavior::Default);
        peer.flush(FlushBehavior::Default);
        bridge_peer.flush(FlushBehavior::Default);
        true
    }

    /// If this router and its bridge peer both have outward peers, try to
    /// retire the whole bridge.
    pub(crate) fn maybe_start_bridge_bypass(&self) {
        let second_bridge: Arc<Router>;
        {
            let state = self.state.lock();
            let Some(bridge) = state.bridge.as_ref() else {
                return;
            };
            if !bridge.is_stable() {
                return;
            }
            let Some(peer) = bridge.local_peer() else {
                return;
            };
            second_bridge = peer;
        }

        let first_local_peer: Option<Arc<Router>>;
        let second_local_peer: Option<Arc<Router>>;
        let first_remote_link: Option<Arc<RemoteRouterLink>>;
        let second_remote_link: Option<Arc<RemoteRouterLink>>;
        {
            let (first, second) = lock_two(&self.state, &second_bridge.state);
            let Some(link_to_first_peer) = first.outward_edge.primary_link() else {
                return;
            };
            let Some(link_to_second_peer) = second.outward_edge.primary_link() else {
                return;
            };

            first_local_peer = link_to_first_peer.local_peer();
            first_remote_link = link_to_first_peer
                .as_remote()
                .map(RemoteRouterLink::clone_arc);
            let first_peer_node_name = first_remote_link
                .as_ref()
                .map(|link| link.node_link().remote_node_name())
                .unwrap_or_default();

            second_local_peer = link_to_second_peer.local_peer();
            second_remote_link = link_to_second_peer
                .as_remote()
                .map(RemoteRouterLink::clone_arc);
            let second_peer_node_name = second_remote_link
                .as_ref()
                .map(|link| link.node_link().remote_node_name())
                .unwrap_or_default();

            if !link_to_first_peer.try_lock_for_bypass(second_peer_node_name) {
                return;
            }
            if !link_to_second_peer.try_lock_for_bypass(first_peer_node_name) {
                // Roll back the first lock; the other side can retry later.
                link_to_first_peer.unlock();
                return;
            }
        }

        // Both outward links are now locked. Three shapes remain, keyed by
        // where the outward peers live.

        if first_local_peer.is_none() && second_local_peer.is_none() {
            // Neither peer is local: decay all four edges and ask our peer
            // to bypass both bridge routers toward the other peer.
            let (Some(first_remote), Some(second_remote)) =
                (first_remote_link, second_remote_link)
            else {
                return;
            };
            {
                let (mut first, mut second) = lock_two(&self.state, &second_bridge.state);
                first.outward_edge.begin_primary_link_decay();
                second.outward_edge.begin_primary_link_decay();
                if let Some(bridge) = first.bridge.as_mut() {
                    bridge.begin_primary_link_decay();
                }
                if let Some(bridge) = second.bridge.as_mut() {
                    bridge.begin_primary_link_decay();
                }
            }
            second_remote.bypass_peer(
                first_remote.node_link().remote_node_name(),
                first_remote.sublink(),
            );
            return;
        }

        if second_local_peer.is_none() {
            if let Some(second_remote) = second_remote_link {
                let link_state = second_remote
                    .node_link()
                    .memory()
                    .try_allocate_router_link_state();
                self.start_bridge_bypass_from_local_peer(link_state);
            }
            return;
        }
        if first_local_peer.is_none() {
            if let Some(first_remote) = first_remote_link {
                let link_state = first_remote
                    .node_link()
                    .memory()
                    .try_allocate_router_link_state();
                second_bridge.start_bridge_bypass_from_local_peer(link_state);
            }
            return;
        }

        // Every router involved is local: compose the bypass in one
        // critical section.
        let (Some(first_peer), Some(second_peer)) = (first_local_peer, second_local_peer) else {
            return;
        };
        {
            let (mut first, mut second, mut first_peer_state, mut second_peer_state) = lock_four(
                &self.state,
                &second_bridge.state,
                &first_peer.state,
                &second_peer.state,
            );
            let length_from_first_peer =
                first_peer_state.outbound_parcels.current_sequence_number();
            let length_from_second_peer =
                second_peer_state.outbound_parcels.current_sequence_number();

            let first_peer_edge = &mut first_peer_state.outward_edge;
            first_peer_edge.begin_primary_link_decay();
            first_peer_edge.set_length_to_decaying_link(length_from_first_peer);
            first_peer_edge.set_length_from_decaying_link(length_from_second_peer);

            let second_peer_edge = &mut second_peer_state.outward_edge;
            second_peer_edge.begin_primary_link_decay();
            second_peer_edge.set_length_to_decaying_link(length_from_second_peer);
            second_peer_edge.set_length_from_decaying_link(length_from_first_peer);

            first.outward_edge.begin_primary_link_decay();
            first
                .outward_edge
                .set_length_to_decaying_link(length_from_second_peer);
            first
                .outward_edge
                .set_length_from_decaying_link(length_from_first_peer);

            second.outward_edge.begin_primary_link_decay();
            second
                .outward_edge
                .set_length_to_decaying_link(length_from_first_peer);
            second
                .outward_edge
                .set_length_from_decaying_link(length_from_second_peer);

            if let Some(bridge) = first.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_first_peer);
                bridge.set_length_from_decaying_link(length_from_second_peer);
            }
            if let Some(bridge) = second.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_second_peer);
                bridge.set_length_from_decaying_link(length_from_first_peer);
            }

            let (link_first, link_second) = LocalRouterLink::create_pair(
                LinkType::Central,
                (first_peer.clone(), second_peer.clone()),
                InitialStability::Unstable,
            );
            first_peer_state.outward_edge.set_primary_link(link_first);
            second_peer_state.outward_edge.set_primary_link(link_second);
        }

        self.flush(FlushBehavior::Default);
        second_bridge.flush(FlushBehavior::Default);
        first_peer.flush(FlushBehavior::Default);
        second_peer.flush(FlushBehavior::Default);
    }

    /// Bridge bypass where this bridge router's outward peer is local and
    /// the other bridge router's outward peer is remote.
    pub(crate) fn start_bridge_bypass_from_local_peer(
        &self,
        link_state: Option<LinkStateFragment>,
    ) {
        let local_peer: Arc<Router>;
        let other_bridge: Arc<Router>;
        {
            let state = self.state.lock();
            let Some(bridge) = state.bridge.as_ref() else {
                return;
            };
            if !bridge.is_stable() {
                return;
            }
            let (Some(peer), Some(other)) = (state.outward_edge.local_peer(), bridge.local_peer())
            else {
                return;
            };
            local_peer = peer;
            other_bridge = other;
        }

        let remote_link: Arc<RemoteRouterLink>;
        {
            let state = other_bridge.state.lock();
            let link = state
                .outward_edge
                .primary_link()
                .and_then(|link| link.as_remote())
                .map(RemoteRouterLink::clone_arc);
            let Some(link) = link else {
                return;
            };
            remote_link = link;
        }

        let Some(link_state) = link_state else {
            // Wait for a fragment, then resume from the top.
            let router = self.self_arc();
            remote_link
                .node_link()
                .memory()
                .allocate_router_link_state(Box::new(move |link_state| {
                    if link_state.is_some() {
                        router.start_bridge_bypass_from_local_peer(link_state);
                    }
                }));
            return;
        };

        // We now hold all three local routers and a remote link to the
        // other bridge router's outward peer; that suffices to initiate.
        let node_link_to_peer = remote_link.node_link().clone();
        let bypass_sublink = node_link_to_peer.memory().allocate_sublink_ids(1);
        let new_link = node_link_to_peer.add_remote_router_link(
            bypass_sublink,
            Some(link_state.clone()),
            LinkType::Central,
            weft_core::LinkSide::A,
            local_peer.clone(),
        );
        let length_from_local_peer;
        {
            let (mut us, mut other, mut peer) =
                lock_three(&self.state, &other_bridge.state, &local_peer.state);

            length_from_local_peer = peer.outbound_parcels.current_sequence_number();

            peer.outward_edge.begin_primary_link_decay();
            peer.outward_edge
                .set_length_to_decaying_link(length_from_local_peer);

            other.outward_edge.begin_primary_link_decay();
            other
                .outward_edge
                .set_length_to_decaying_link(length_from_local_peer);

            if let Some(bridge) = us.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_to_decaying_link(length_from_local_peer);
            }

            us.outward_edge.begin_primary_link_decay();
            us.outward_edge
                .set_length_from_decaying_link(length_from_local_peer);

            if let Some(bridge) = other.bridge.as_mut() {
                bridge.begin_primary_link_decay();
                bridge.set_length_from_decaying_link(length_from_local_peer);
            }
        }

        let Some(new_link) = new_link else {
            self.accept_route_disconnected_from(LinkType::Central);
            return;
        };

        remote_link.bypass_peer_with_link(bypass_sublink, link_state, length_from_local_peer);
        local_peer.set_outward_link(new_link);
        self.flush(FlushBehavior::Default);
        other_bridge.flush(FlushBehavior::Default);
        local_peer.flush(FlushBehavior::Default);
    }
}
