//! The universal reconciliation step.
//!
//! Every externally triggered change to a router ends in a flush: decide
//! everything under the mutex, then transmit, deactivate, close, and bypass
//! strictly after releasing it.

use std::sync::Arc;

use weft_core::SequenceNumber;

use crate::edge::RouteEdge;
use crate::link::RouterLink;
use crate::parcel::Parcel;
use crate::parcel_queue::ParcelQueue;
use crate::router::{FlushBehavior, Router};

/// Parcels popped for transmission, paired with the link each must use.
type ParcelsToFlush = Vec<(Arc<dyn RouterLink>, Parcel)>;

/// Pop elements from `queue` for transmission along `edge` until the queue
/// runs dry or the next parcel's required link is not yet known.
fn collect_parcels_to_flush(
    queue: &mut ParcelQueue,
    edge: &RouteEdge,
    parcels: &mut ParcelsToFlush,
) {
    while queue.has_next_element() {
        let n = queue.current_sequence_number();
        let link = if edge.should_transmit_on_decaying(n) {
            edge.decaying_link().cloned()
        } else {
            edge.primary_link().cloned()
        };
        let Some(link) = link else {
            // Retention: nothing can carry this parcel yet.
            return;
        };
        let Some(parcel) = queue.pop() else {
            return;
        };
        parcels.push((link, parcel));
    }
}

impl Router {
    /// Reconcile this router's state after a mutation.
    ///
    /// Under the mutex this only *decides*: it drains transmittable
    /// parcels into a scratch list, completes finished decays, and works
    /// out which links died. All link calls happen after release, because a
    /// local link (or a synchronous transport) re-enters the peer router.
    pub fn flush(&self, behavior: FlushBehavior) {
        let outward_link;
        let inward_link;
        let mut bridge_link;
        let decaying_outward_link;
        let decaying_inward_link;
        let mut dead_inward_link = None;
        let mut dead_outward_link = None;
        let mut dead_bridge_link = None;
        let mut final_inward_sequence_length: Option<SequenceNumber> = None;
        let mut final_outward_sequence_length: Option<SequenceNumber> = None;
        let on_central_link;
        let mut inward_link_decayed = false;
        let mut outward_link_decayed = false;
        let mut dropped_last_decaying_link = false;
        let mut parcels_to_flush: ParcelsToFlush = Vec::new();
        {
            let mut state = self.state.lock();
            let state = &mut *state;

            outward_link = state.outward_edge.primary_link().cloned();
            inward_link = state
                .inward_edge
                .as_ref()
                .and_then(|edge| edge.primary_link().cloned());
            decaying_outward_link = state.outward_edge.decaying_link().cloned();
            decaying_inward_link = state
                .inward_edge
                .as_ref()
                .and_then(|edge| edge.decaying_link().cloned());
            on_central_link = outward_link
                .as_ref()
                .is_some_and(|link| link.link_type().is_central());
            // A bridge edge holds either a primary or a decaying link,
            // never both.
            bridge_link = state.bridge.as_ref().and_then(|bridge| {
                bridge
                    .primary_link()
                    .or_else(|| bridge.decaying_link())
                    .cloned()
            });

            collect_parcels_to_flush(
                &mut state.outbound_parcels,
                &state.outward_edge,
                &mut parcels_to_flush,
            );
            let outbound_sequence_length_sent =
                state.outbound_parcels.current_sequence_number();
            let inbound_sequence_length_received =
                state.inbound_parcels.current_sequence_length();
            if state.outward_edge.maybe_finish_decay(
                outbound_sequence_length_sent,
                inbound_sequence_length_received,
            ) {
                tracing::debug!(
                    sent = %outbound_sequence_length_sent,
                    received = %inbound_sequence_length_received,
                    "outward link fully decayed"
                );
                outward_link_decayed = true;
            }

            if let Some(inward) = state.inward_edge.as_mut() {
                collect_parcels_to_flush(
                    &mut state.inbound_parcels,
                    inward,
                    &mut parcels_to_flush,
                );
                let inbound_sequence_length_sent =
                    state.inbound_parcels.current_sequence_number();
                let outbound_sequence_length_received =
                    state.outbound_parcels.current_sequence_length();
                if inward.maybe_finish_decay(
                    inbound_sequence_length_sent,
                    outbound_sequence_length_received,
                ) {
                    tracing::debug!(
                        sent = %inbound_sequence_length_sent,
                        received = %outbound_sequence_length_received,
                        "inward link fully decayed"
                    );
                    inward_link_decayed = true;
                }
            } else if bridge_link.is_some() {
                if let Some(bridge) = state.bridge.as_ref() {
                    collect_parcels_to_flush(
                        &mut state.inbound_parcels,
                        bridge,
                        &mut parcels_to_flush,
                    );
                }
            }

            if let Some(bridge) = state.bridge.as_mut() {
                if bridge.maybe_finish_decay(
                    state.inbound_parcels.current_sequence_number(),
                    state.outbound_parcels.current_sequence_number(),
                ) {
                    state.bridge = None;
                }
            }

            // Dropping the last decaying link may make the outward link
            // stable, unblocking bypass on the other side.
            let inward_edge_stable = decaying_inward_link.is_none() || inward_link_decayed;
            let outward_edge_stable = outward_link.is_some()
                && (decaying_outward_link.is_none() || outward_link_decayed);
            let both_edges_stable = inward_edge_stable && outward_edge_stable;
            let either_link_decayed = inward_link_decayed || outward_link_decayed;
            if on_central_link && either_link_decayed && both_edges_stable {
                if let Some(outward) = outward_link.as_ref() {
                    tracing::debug!(
                        link = %outward.describe(),
                        "all decaying links dropped; router may be bypassable"
                    );
                    outward.mark_side_stable();
                }
                dropped_last_decaying_link = true;
            }

            if on_central_link
                && state.outbound_parcels.is_sequence_fully_consumed()
                && outward_link
                    .as_ref()
                    .is_some_and(|link| link.try_lock_for_closure())
            {
                // This end is finished: notify the other end (after release)
                // and drop the outward link. No further outbound parcels can
                // exist, and forwarded inbound parcels have no destination.
                final_outward_sequence_length =
                    state.outbound_parcels.final_sequence_length();
                dead_outward_link = state.outward_edge.release_primary_link();
            } else if !state.inbound_parcels.expects_more_elements() {
                // The other end is gone and everything it sent has arrived.
                dead_outward_link = state.outward_edge.release_primary_link();
            }

            if state.inbound_parcels.is_sequence_fully_consumed() {
                // Nothing more will come from the peer, and any forwarding
                // duty is complete. Propagate closure inward.
                final_inward_sequence_length =
                    state.inbound_parcels.final_sequence_length();
                if let Some(inward) = state.inward_edge.as_mut() {
                    dead_inward_link = inward.release_primary_link();
                } else {
                    dead_bridge_link = bridge_link.take();
                    state.bridge = None;
                }
            }
        }

        for (link, parcel) in parcels_to_flush {
            link.accept_parcel(parcel);
        }

        if outward_link_decayed {
            if let Some(link) = decaying_outward_link.as_ref() {
                link.deactivate();
            }
        }
        if inward_link_decayed {
            if let Some(link) = decaying_inward_link.as_ref() {
                link.deactivate();
            }
        }

        if bridge_link.is_some()
            && outward_link.is_some()
            && inward_link.is_none()
            && decaying_inward_link.is_none()
            && decaying_outward_link.is_none()
        {
            self.maybe_start_bridge_bypass();
        }

        if let Some(link) = dead_outward_link.as_ref() {
            if let Some(length) = final_outward_sequence_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }

        if let Some(link) = dead_inward_link {
            if let Some(length) = final_inward_sequence_length {
                link.accept_route_closure(length);
            }
            link.deactivate();
        }

        if let Some(link) = dead_bridge_link {
            if let Some(length) = final_inward_sequence_length {
                link.accept_route_closure(length);
            }
        }

        if dead_outward_link.is_some() || !on_central_link {
            // Off a central link there are no bypass opportunities.
            return;
        }

        if !dropped_last_decaying_link && behavior != FlushBehavior::ForceBypassAttempt {
            // No relevant state change, so no new bypass opportunity.
            return;
        }

        if inward_link.is_some() && self.maybe_start_self_bypass() {
            return;
        }

        if let Some(link) = outward_link {
            link.flush_other_side_if_waiting();
        }
    }
}
