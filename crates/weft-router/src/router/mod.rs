//! The per-endpoint router state machine.
//!
//! A [`Router`] represents one portal, or one proxy hop left behind when a
//! portal moved to another node. It owns the two parcel queues for its
//! position on the route, an outward edge (always), an inward edge (only
//! while proxying), an optional bridge edge (only on merged routes), and the
//! portal's trap set.
//!
//! Locking discipline: one mutex guards all of a router's mutable state, and
//! it is **never** held across a call into a link's `accept_*` operations,
//! because a local link would re-enter this router. Every externally triggered
//! mutation ends with [`Router::flush`], the single reconciliation step that
//! gathers decisions under the lock and acts on them after release.

mod bypass;
mod flush;

use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;

use weft_core::{ApiError, ApiResult, LinkType, SequenceNumber};

use crate::edge::RouteEdge;
use crate::link::{InitialStability, LocalRouterLink, RemoteRouterLink, RouterLink};
use crate::link_state::QueueState;
use crate::message::RouterDescriptor;
use crate::multi_lock::lock_two;
use crate::node_link::NodeLink;
use crate::parcel::{Parcel, ParcelObject};
use crate::parcel_queue::ParcelQueue;
use crate::trap::{
    PortalStatus, TrapConditions, TrapEventDispatcher, TrapHandler, TrapSet, UpdateReason,
    STATUS_DEAD, STATUS_PEER_CLOSED,
};

/// How [`Router::flush`] decides whether to attempt a proxy bypass when no
/// decaying link was dropped during the pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushBehavior {
    Default,
    /// Attempt bypass even without a state change; used right after a route
    /// is extended or a new link is adopted.
    ForceBypassAttempt,
}

/// Rejection payload for [`Router::trap`] when a condition is already met.
#[derive(Debug, Clone, Copy)]
pub struct TrapRejected {
    pub error: ApiError,
    /// The conditions that were already satisfied at installation time.
    pub satisfied_flags: u32,
    pub status: PortalStatus,
}

#[derive(Default)]
pub(crate) struct RouterState {
    pub(crate) outward_edge: RouteEdge,
    /// Present only while this router is a proxy.
    pub(crate) inward_edge: Option<RouteEdge>,
    /// Present only on a merged route.
    pub(crate) bridge: Option<RouteEdge>,
    pub(crate) outbound_parcels: ParcelQueue,
    pub(crate) inbound_parcels: ParcelQueue,
    pub(crate) status: PortalStatus,
    pub(crate) traps: TrapSet,
    pub(crate) is_disconnected: bool,
}

pub struct Router {
    self_weak: Weak<Router>,
    pub(crate) state: Mutex<RouterState>,
}

impl Router {
    /// A fresh terminal router with no links.
    pub fn new() -> Arc<Router> {
        Arc::new_cyclic(|weak| Router {
            self_weak: weak.clone(),
            state: Mutex::new(RouterState::default()),
        })
    }

    /// A connected pair of terminal routers joined by a stable local central
    /// link: the starting point of every route.
    pub fn new_pair() -> (Arc<Router>, Arc<Router>) {
        let a = Router::new();
        let b = Router::new();
        let (link_a, link_b) = LocalRouterLink::create_pair(
            LinkType::Central,
            (a.clone(), b.clone()),
            InitialStability::Stable,
        );
        a.set_outward_link(link_a);
        b.set_outward_link(link_b);
        (a, b)
    }

    pub(crate) fn self_arc(&self) -> Arc<Router> {
        match self.self_weak.upgrade() {
            Some(router) => router,
            // `&self` implies a live strong reference.
            None => unreachable!("router method invoked without a strong reference"),
        }
    }

    // ------------------------------------------------------------------ //
    // Status queries
    // ------------------------------------------------------------------ //

    pub fn is_peer_closed(&self) -> bool {
        self.state.lock().status.is_peer_closed()
    }

    pub fn is_route_dead(&self) -> bool {
        self.state.lock().status.is_dead()
    }

    pub fn query_status(&self) -> PortalStatus {
        self.state.lock().status
    }

    /// Whether `other` is directly linked to this router by a local central
    /// link.
    pub fn has_local_peer(&self, other: &Arc<Router>) -> bool {
        self.state
            .lock()
            .outward_edge
            .local_peer()
            .is_some_and(|peer| Arc::ptr_eq(&peer, other))
    }

    // ------------------------------------------------------------------ //
    // Outbound path
    // ------------------------------------------------------------------ //

    /// Assign the next outbound sequence number to `parcel` and send it.
    ///
    /// Fails with `NotFound` once the inbound sequence is finalized, since
    /// a finalized inbound sequence means the peer is gone.
    pub fn send_outbound_parcel(&self, parcel: Parcel) -> ApiResult<()> {
        let mut parcel = parcel;
        let mut direct: Option<(Arc<dyn RouterLink>, Parcel)> = None;
        {
            let mut state = self.state.lock();
            // A finalized inbound sequence means the peer is gone; a
            // finalized outbound sequence means this end already closed.
            if state.inbound_parcels.final_sequence_length().is_some()
                || state.outbound_parcels.final_sequence_length().is_some()
            {
                return Err(ApiError::NotFound);
            }

            let sequence_number = state.outbound_parcels.current_sequence_length();
            parcel.set_sequence_number(sequence_number);
            // With an active outward link and no unsent parcels ahead of
            // this one, transmit without staging. That is the common case.
            if state.outward_edge.primary_link().is_some()
                && state.outbound_parcels.maybe_skip_sequence_number(sequence_number)
            {
                if let Some(link) = state.outward_edge.primary_link() {
                    direct = Some((link.clone(), parcel));
                }
            } else {
                tracing::trace!(parcel = %parcel.describe(), "queueing outbound parcel");
                let pushed = state.outbound_parcels.push(sequence_number, parcel);
                debug_assert!(pushed.is_ok());
            }
        }

        match direct {
            Some((link, parcel)) => link.accept_parcel(parcel),
            None => self.flush(FlushBehavior::Default),
        }
        Ok(())
    }

    /// Finalize the outbound sequence at its current length and clear traps.
    /// Subsequent sends fail with `NotFound` once the closure has propagated.
    pub fn close_route(&self) {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            let length = state.outbound_parcels.current_sequence_length();
            if !state.outbound_parcels.set_final_sequence_length(length) {
                tracing::trace!("route already closing");
            }
            let status = state.status;
            state.traps.remove_all(&status, &mut dispatcher);
        }
        self.flush(FlushBehavior::Default);
    }

    /// Adopt `link` as the outward primary link.
    pub fn set_outward_link(&self, link: Arc<dyn RouterLink>) {
        let mut rejected = None;
        {
            let mut state = self.state.lock();

            // With a stable inward edge (or none) and a stable outward
            // edge, the new central link can be marked stable from our side
            // right away.
            if link.link_type().is_central()
                && state.outward_edge.is_stable()
                && state
                    .inward_edge
                    .as_ref()
                    .map_or(true, RouteEdge::is_stable)
            {
                link.mark_side_stable();
            }

            if state.is_disconnected {
                rejected = Some(link);
            } else {
                state.outward_edge.set_primary_link(link);
            }
        }

        if let Some(link) = rejected {
            // This router was already disconnected; the link is dead on
            // arrival.
            link.accept_route_disconnected();
            link.deactivate();
            return;
        }

        self.flush(FlushBehavior::ForceBypassAttempt);
    }

    // ------------------------------------------------------------------ //
    // Link-driven entry points
    // ------------------------------------------------------------------ //

    /// Accept a parcel moving toward this side's terminal.
    pub fn accept_inbound_parcel(&self, parcel: Parcel) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let sequence_number = parcel.sequence_number();
            if state.inbound_parcels.push(sequence_number, parcel).is_err() {
                // Unexpected disconnection can cut a sequence short; late
                // or duplicate parcels past the cut are not a validation
                // failure.
                return true;
            }

            if state.inward_edge.is_none() {
                state.status.num_local_parcels =
                    state.inbound_parcels.num_available() as u64;
                state.status.num_local_bytes =
                    state.inbound_parcels.total_available_bytes() as u64;
                state.traps.update_portal_status(
                    &state.status,
                    UpdateReason::NewLocalParcel,
                    &mut dispatcher,
                );

                if let Some(outward) = state.outward_edge.primary_link() {
                    if outward.link_type().is_central() {
                        outward.update_inbound_queue_state(QueueState {
                            num_parcels: state.status.num_local_parcels,
                            num_bytes: state.status.num_local_bytes,
                        });
                    }
                }
            }
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// Accept a parcel moving away from this side's terminal. Only
    /// meaningful on a proxy, which stages it to preserve sequence
    /// continuity while forwarding.
    pub fn accept_outbound_parcel(&self, parcel: Parcel) -> bool {
        {
            let mut state = self.state.lock();
            let sequence_number = parcel.sequence_number();
            if state.outbound_parcels.push(sequence_number, parcel).is_err() {
                return true;
            }
        }
        self.flush(FlushBehavior::Default);
        true
    }

    /// Accept notice that the route was closed at `sequence_length` by the
    /// terminal on the far side of a link of type `link_type`.
    pub fn accept_route_closure_from(
        &self,
        link_type: LinkType,
        sequence_length: SequenceNumber,
    ) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if link_type.is_outward() {
                if !state.inbound_parcels.set_final_sequence_length(sequence_length) {
                    // Tolerate a repeat at or above the recorded length;
                    // only a shortening repeat is a validation failure.
                    tracing::trace!("discarding inbound route closure notification");
                    return state
                        .inbound_parcels
                        .final_sequence_length()
                        .is_some_and(|length| length <= sequence_length);
                }

                if state.inward_edge.is_none() && state.bridge.is_none() {
                    state.status.flags |= STATUS_PEER_CLOSED;
                    if state.inbound_parcels.is_sequence_fully_consumed() {
                        state.status.flags |= STATUS_DEAD;
                    }
                    state.traps.update_portal_status(
                        &state.status,
                        UpdateReason::PeerClosed,
                        &mut dispatcher,
                    );
                }
            } else if link_type.is_peripheral_inward() {
                if !state.outbound_parcels.set_final_sequence_length(sequence_length) {
                    tracing::trace!("discarding outbound route closure notification");
                    return state
                        .outbound_parcels
                        .final_sequence_length()
                        .is_some_and(|length| length <= sequence_length);
                }
            } else if link_type.is_bridge() {
                if !state.outbound_parcels.set_final_sequence_length(sequence_length) {
                    return false;
                }
                state.bridge = None;
            }
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// Accept notice that a participant on the far side of a `link_type`
    /// link is gone without closure. Terminates the affected direction,
    /// releases every remaining link, and forwards the disconnection over
    /// each of them.
    pub fn accept_route_disconnected_from(&self, link_type: LinkType) -> bool {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut forwarding_links: Vec<Arc<dyn RouterLink>> = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;

            tracing::debug!(%link_type, "router disconnected");

            state.is_disconnected = true;
            if link_type.is_peripheral_inward() {
                state.outbound_parcels.force_terminate_sequence();
            } else {
                state.inbound_parcels.force_terminate_sequence();
            }

            forwarding_links.extend(state.outward_edge.release_primary_link());
            forwarding_links.extend(state.outward_edge.release_decaying_link());
            if let Some(inward) = state.inward_edge.as_mut() {
                forwarding_links.extend(inward.release_primary_link());
                forwarding_links.extend(inward.release_decaying_link());
            } else if let Some(bridge) = state.bridge.as_mut() {
                forwarding_links.extend(bridge.release_primary_link());
                forwarding_links.extend(bridge.release_decaying_link());
            } else {
                // Terminal router: surface the loss as peer closure.
                state.status.flags |= STATUS_PEER_CLOSED;
                if state.inbound_parcels.is_sequence_fully_consumed() {
                    state.status.flags |= STATUS_DEAD;
                }
                state.traps.update_portal_status(
                    &state.status,
                    UpdateReason::PeerClosed,
                    &mut dispatcher,
                );
            }
        }

        for link in forwarding_links {
            tracing::debug!(link = %link.describe(), "forwarding disconnection");
            link.accept_route_disconnected();
            link.deactivate();
        }

        self.flush(FlushBehavior::Default);
        true
    }

    /// Re-read the peer's published queue state and run remote-activity
    /// traps against it.
    pub fn notify_peer_consumed_data(&self) {
        let mut dispatcher = TrapEventDispatcher::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let Some(outward) = state.outward_edge.primary_link() else {
                return;
            };
            if !outward.link_type().is_central() || state.inward_edge.is_some() {
                return;
            }

            let peer_state = outward.peer_queue_state();
            state.status.num_remote_parcels = peer_state.num_parcels;
            state.status.num_remote_bytes = peer_state.num_bytes;
            state.traps.update_portal_status(
                &state.status,
                UpdateReason::RemoteActivity,
                &mut dispatcher,
            );

            if !state.traps.need_remote_state() {
                outward.enable_peer_monitoring(false);
            }
        }
    }

    /// A remote link lost its transport. Clear the matching slot and enter
    /// the disconnection path.
    pub fn notify_link_disconnected(&self, link: &RemoteRouterLink) {
        use crate::link::is_link;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state
                .outward_edge
                .primary_link()
                .is_some_and(|l| is_link(l, link))
            {
                state.outward_edge.release_primary_link();
            } else if state
                .outward_edge
                .decaying_link()
                .is_some_and(|l| is_link(l, link))
            {
                state.outward_edge.release_decaying_link();
            } else if let Some(inward) = state.inward_edge.as_mut() {
                if inward.primary_link().is_some_and(|l| is_link(l, link)) {
                    inward.release_primary_link();
                } else if inward.decaying_link().is_some_and(|l| is_link(l, link)) {
                    inward.release_decaying_link();
                }
            }
        }

        if link.link_type().is_outward() {
            self.accept_route_disconnected_from(LinkType::PeripheralOutward);
        } else {
            self.accept_route_disconnected_from(LinkType::PeripheralInward);
        }
    }

    // ------------------------------------------------------------------ //
    // Inbound retrieval
    // ------------------------------------------------------------------ //

    /// Retrieve (a portion of) the next inbound parcel. Valid only on
    /// terminal routers.
    ///
    /// Without `allow_partial`, the capacities must cover the whole parcel
    /// or the call fails with `ResourceExhausted`. With it, up to the
    /// capacities is consumed and the remainder stays queued.
    pub fn get_next_inbound_parcel(
        &self,
        data_capacity: usize,
        object_capacity: usize,
        allow_partial: bool,
    ) -> ApiResult<(Bytes, Vec<ParcelObject>)> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut link_to_notify: Option<Arc<dyn RouterLink>> = None;
        let result;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.inbound_parcels.is_sequence_fully_consumed() {
                return Err(ApiError::NotFound);
            }
            let Some(parcel) = state.inbound_parcels.next_element() else {
                return Err(ApiError::Unavailable);
            };

            let data_size = if allow_partial {
                parcel.data_len().min(data_capacity)
            } else {
                parcel.data_len()
            };
            let object_count = if allow_partial {
                parcel.num_objects().min(object_capacity)
            } else {
                parcel.num_objects()
            };

            let consuming_whole_parcel =
                data_capacity >= data_size && object_capacity >= object_count;
            if !consuming_whole_parcel && !allow_partial {
                return Err(ApiError::ResourceExhausted);
            }

            let data = parcel.data().slice(..data_size);
            let Some((objects, _)) = state.inbound_parcels.consume(data_size, object_count)
            else {
                return Err(ApiError::Unavailable);
            };
            result = (data, objects);

            self.did_consume_inbound(state, &mut dispatcher, &mut link_to_notify);
        }

        if let Some(link) = link_to_notify {
            link.notify_data_consumed();
        }
        Ok(result)
    }

    /// First half of the two-phase zero-copy get: expose the next parcel's
    /// data and object count without consuming anything.
    pub fn begin_get_next_inbound_parcel(&self) -> ApiResult<(Bytes, usize)> {
        let state = self.state.lock();
        if state.inward_edge.is_some() {
            return Err(ApiError::InvalidArgument);
        }
        if state.inbound_parcels.is_sequence_fully_consumed() {
            return Err(ApiError::NotFound);
        }
        let Some(parcel) = state.inbound_parcels.next_element() else {
            return Err(ApiError::Unavailable);
        };
        Ok((parcel.data().clone(), parcel.num_objects()))
    }

    /// Second half of the two-phase get: consume what the caller actually
    /// used.
    pub fn commit_get_next_inbound_parcel(
        &self,
        num_data_bytes_consumed: usize,
        num_objects: usize,
    ) -> ApiResult<Vec<ParcelObject>> {
        let mut dispatcher = TrapEventDispatcher::new();
        let mut link_to_notify: Option<Arc<dyn RouterLink>> = None;
        let objects;
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if state.inward_edge.is_some() {
                return Err(ApiError::InvalidArgument);
            }
            let Some(parcel) = state.inbound_parcels.next_element() else {
                return Err(ApiError::InvalidArgument);
            };
            if num_data_bytes_consumed > parcel.data_len()
                || num_objects > parcel.num_objects()
            {
                return Err(ApiError::OutOfRange);
            }

            let Some((taken, _)) = state
                .inbound_parcels
                .consume(num_data_bytes_consumed, num_objects)
            else {
                return Err(ApiError::InvalidArgument);
            };
            objects = taken;

            self.did_consume_inbound(state, &mut dispatcher, &mut link_to_notify);
        }

        if let Some(link) = link_to_notify {
            link.notify_data_consumed();
        }
        Ok(objects)
    }

    /// Shared bookkeeping after inbound consumption: refresh counts, surface
    /// death, fire traps, and pick up the peer-notification duty.
    fn did_consume_inbound(
        &self,
        state: &mut RouterState,
        dispatcher: &mut TrapEventDispatcher,
        link_to_notify: &mut Option<Arc<dyn RouterLink>>,
    ) {
        state.status.num_local_parcels = state.inbound_parcels.num_available() as u64;
        state.status.num_local_bytes = state.inbound_parcels.total_available_bytes() as u64;
        if state.inbound_parcels.is_sequence_fully_consumed() {
            state.status.flags |= STATUS_DEAD;
        }
        state.traps.update_portal_status(
            &state.status,
            UpdateReason::LocalParcelConsumed,
            dispatcher,
        );

        if let Some(outward) = state.outward_edge.primary_link() {
            if outward.link_type().is_central()
                && outward.update_inbound_queue_state(QueueState {
                    num_parcels: state.status.num_local_parcels,
                    num_bytes: state.status.num_local_bytes,
                })
            {
                *link_to_notify = Some(outward.clone());
            }
        }
    }

    // ------------------------------------------------------------------ //
    // Traps
    // ------------------------------------------------------------------ //

    /// Install a trap. If any condition is already satisfied the trap is not
    /// installed and the satisfied flags come back in the rejection.
    pub fn trap(
        &self,
        conditions: TrapConditions,
        handler: TrapHandler,
        context: u64,
    ) -> Result<(), TrapRejected> {
        let need_remote_state = conditions.need_remote_state();
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            if need_remote_state {
                state.status.num_remote_parcels =
                    state.outbound_parcels.num_available() as u64;
                state.status.num_remote_bytes =
                    state.outbound_parcels.total_available_bytes() as u64;

                if let Some(outward) = state.outward_edge.primary_link() {
                    if outward.link_type().is_central() {
                        let peer_state = outward.peer_queue_state();
                        state.status.num_remote_parcels = state
                            .status
                            .num_remote_parcels
                            .saturating_add(peer_state.num_parcels);
                        state.status.num_remote_bytes = state
                            .status
                            .num_remote_bytes
                            .saturating_add(peer_state.num_bytes);
                    }
                }
            }

            let satisfied = TrapSet::probe(&conditions, &state.status);
            if satisfied != 0 {
                return Err(TrapRejected {
                    error: ApiError::FailedPrecondition,
                    satisfied_flags: satisfied,
                    status: state.status,
                });
            }

            let already_monitoring = state.traps.need_remote_state();
            let status = state.status;
            if state
                .traps
                .add(conditions, handler, context, &status)
                .is_err()
            {
                // Unreached: the probe above already vetted the conditions.
                return Err(TrapRejected {
                    error: ApiError::FailedPrecondition,
                    satisfied_flags: satisfied,
                    status,
                });
            }

            if need_remote_state && !already_monitoring {
                if let Some(outward) = state.outward_edge.primary_link() {
                    outward.enable_peer_monitoring(true);
                }
            }
        }

        if need_remote_state {
            // Close the race between enabling monitoring and a state change
            // the peer made just before it.
            self.notify_peer_consumed_data();
        }
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Route merging
    // ------------------------------------------------------------------ //

    /// Fuse this terminal router's route with `other`'s, so their outward
    /// peers talk to each other. Only legal on pristine terminal routers.
    pub fn merge_route(&self, other: &Arc<Router>) -> ApiResult<()> {
        let self_arc = self.self_arc();
        if Arc::ptr_eq(&self_arc, other) || self.has_local_peer(other) {
            return Err(ApiError::InvalidArgument);
        }

        {
            let (mut a, mut b) = lock_two(&self.state, &other.state);
            if a.inward_edge.is_some()
                || b.inward_edge.is_some()
                || a.bridge.is_some()
                || b.bridge.is_some()
            {
                return Err(ApiError::InvalidArgument);
            }

            if a.inbound_parcels.current_sequence_number() > SequenceNumber::ZERO
                || a.outbound_parcels.current_sequence_length() > SequenceNumber::ZERO
                || b.inbound_parcels.current_sequence_number() > SequenceNumber::ZERO
                || b.outbound_parcels.current_sequence_length() > SequenceNumber::ZERO
            {
                // Routers that already moved traffic cannot merge.
                return Err(ApiError::FailedPrecondition);
            }

            let (link_a, link_b) = LocalRouterLink::create_pair(
                LinkType::Bridge,
                (self_arc, other.clone()),
                InitialStability::Unstable,
            );
            let mut bridge_a = RouteEdge::new();
            bridge_a.set_primary_link(link_a);
            a.bridge = Some(bridge_a);
            let mut bridge_b = RouteEdge::new();
            bridge_b.set_primary_link(link_b);
            b.bridge = Some(bridge_b);
        }

        self.flush(FlushBehavior::Default);
        Ok(())
    }

    // ------------------------------------------------------------------ //
    // Serialization (endpoint transfer)
    // ------------------------------------------------------------------ //

    /// Prepare this router for transfer over `to_node_link`: reserve a
    /// sublink, clear traps, snapshot sequence positions, and become a
    /// proxy-in-waiting by installing an empty inward edge.
    pub fn serialize_new_router(&self, to_node_link: &Arc<dyn NodeLink>) -> RouterDescriptor {
        let mut dispatcher = TrapEventDispatcher::new();
        let new_sublink = to_node_link.memory().allocate_sublink_ids(1);
        let mut descriptor = RouterDescriptor {
            new_sublink,
            next_outgoing_sequence_number: SequenceNumber::ZERO,
            next_incoming_sequence_number: SequenceNumber::ZERO,
            peer_closed: false,
            closed_peer_sequence_length: None,
        };
        {
            let mut state = self.state.lock();
            let state = &mut *state;
            let status = state.status;
            state.traps.remove_all(&status, &mut dispatcher);

            descriptor.next_outgoing_sequence_number =
                state.outbound_parcels.current_sequence_length();
            descriptor.next_incoming_sequence_number =
                state.inbound_parcels.current_sequence_number();

            // From here on this router must not look terminal, even though
            // the inward edge has no link until the descriptor has been
            // transmitted.
            let mut inward_edge = RouteEdge::new();

            if state.status.is_peer_closed() {
                descriptor.peer_closed = true;
                let final_length = state.inbound_parcels.final_sequence_length();
                descriptor.closed_peer_sequence_length = final_length;

                // The new inward link will never carry anything useful;
                // arrange for it to decay the moment it exists.
                if let Some(final_length) = final_length {
                    inward_edge.begin_primary_link_decay();
                    inward_edge.set_length_to_decaying_link(final_length);
                    inward_edge.set_length_from_decaying_link(
                        state.outbound_parcels.current_sequence_number(),
                    );
                }
            }
            state.inward_edge = Some(inward_edge);

            // Register the sublink now so that messages from the new router
            // arriving before we adopt the link still find us. We take no
            // reference yet: nothing may be transmitted on the sublink until
            // the descriptor itself is on the wire.
            let new_link = to_node_link.add_remote_router_link(
                new_sublink,
                None,
                LinkType::PeripheralInward,
                weft_core::LinkSide::A,
                self.self_arc(),
            );
            if let Some(link) = new_link {
                tracing::debug!(link = %link.describe(), "extending route with tentative link");
            }
        }
        descriptor
    }

    /// Reconstruct a terminal router from `descriptor` on the receiving
    /// node. Returns `None` on a malformed descriptor.
    pub fn deserialize(
        descriptor: &RouterDescriptor,
        from_node_link: &Arc<dyn NodeLink>,
    ) -> Option<Arc<Router>> {
        let router = Router::new();
        let mut disconnected = false;
        {
            let mut state = router.state.lock();
            let state = &mut *state;
            state
                .outbound_parcels
                .reset_initial_sequence_number(descriptor.next_outgoing_sequence_number);
            state
                .inbound_parcels
                .reset_initial_sequence_number(descriptor.next_incoming_sequence_number);
            if descriptor.peer_closed {
                state.status.flags |= STATUS_PEER_CLOSED;
                let final_length = descriptor.closed_peer_sequence_length?;
                if !state.inbound_parcels.set_final_sequence_length(final_length) {
                    return None;
                }
                if state.inbound_parcels.is_sequence_fully_consumed() {
                    state.status.flags |= STATUS_DEAD;
                }
            }

            let new_link = from_node_link.add_remote_router_link(
                descriptor.new_sublink,
                None,
                LinkType::PeripheralOutward,
                weft_core::LinkSide::B,
                router.clone(),
            );
            match new_link {
                Some(link) => {
                    tracing::debug!(
                        link = %link.describe(),
                        "route extended to deserialized router"
                    );
                    state.outward_edge.set_primary_link(link);
                }
                None if !descriptor.peer_closed => {
                    // Dead on arrival: the node link is defunct or the
                    // sublink was reused. Harmless to continue as a
                    // disconnected router.
                    disconnected = true;
                }
                None => {}
            }
        }

        if disconnected {
            tracing::debug!("deserialized router disconnected immediately");
            router.accept_route_disconnected_from(LinkType::PeripheralOutward);
        }
        router.flush(FlushBehavior::ForceBypassAttempt);
        Some(router)
    }

    /// Attach the link reserved by [`Router::serialize_new_router`] as the
    /// inward edge's primary link, then flush with a forced bypass attempt.
    /// Called only after the descriptor has been transmitted.
    pub fn begin_proxying_to_new_router(
        &self,
        to_node_link: &Arc<dyn NodeLink>,
        descriptor: &RouterDescriptor,
    ) {
        if let Some((new_router_link, _)) = to_node_link.get_sublink(descriptor.new_sublink) {
            let mut unadopted: Option<Arc<RemoteRouterLink>> = Some(new_router_link);
            {
                let mut state = self.state.lock();
                let state = &mut *state;
                debug_assert!(state.inward_edge.is_some());

                // A closed or disconnected route has no use for the new
                // link.
                let adopt = state.outbound_parcels.final_sequence_length().is_none()
                    && !state.is_disconnected
                    && state.inward_edge.is_some();
                if adopt {
                    if let (Some(link), Some(inward)) =
                        (unadopted.take(), state.inward_edge.as_mut())
                    {
                        tracing::debug!(link = %link.describe(), "proxying to new router");
                        inward.set_primary_link(link);
                    }

                    let inward_stable = state
                        .inward_edge
                        .as_ref()
                        .is_some_and(RouteEdge::is_stable);
                    if let Some(outward) = state.outward_edge.primary_link() {
                        if state.outward_edge.is_stable() && inward_stable {
                            outward.mark_side_stable();
                        }
                    }
                }
            }

            if let Some(link) = unadopted {
                tracing::debug!(link = %link.describe(), "dropping link to new router");
                link.accept_route_disconnected();
                link.deactivate();
                return;
            }
        }

        // Queued inbound parcels may now be forwarded to the new router.
        self.flush(FlushBehavior::ForceBypassAttempt);
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        // Closure and serialization both clear the trap set first.
        debug_assert!(self.state.lock().traps.is_empty());
    }
}
