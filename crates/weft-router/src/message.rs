//! Wire messages exchanged between routers on different nodes.
//!
//! Every message is scoped to a sublink on the node link that carries it,
//! except [`Message::AcceptBypassLink`], which names the link it replaces by
//! (proxy node, proxy sublink) because it arrives on a *different* node link
//! than the one being bypassed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use weft_core::{NodeName, SequenceNumber, SublinkId};

use crate::link_state::FragmentDescriptor;

/// Serialized form of a router being transferred to another node.
///
/// The receiving node reconstructs a terminal router from this and attaches
/// it to `new_sublink`; the sending router becomes a proxy on the same
/// sublink.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RouterDescriptor {
    pub new_sublink: SublinkId,
    /// Where the transferred router's outbound sequence continues.
    pub next_outgoing_sequence_number: SequenceNumber,
    /// Where the transferred router's inbound sequence continues.
    pub next_incoming_sequence_number: SequenceNumber,
    /// Whether the peer had already closed before the transfer.
    pub peer_closed: bool,
    /// Final inbound length, present iff `peer_closed`.
    pub closed_peer_sequence_length: Option<SequenceNumber>,
}

/// An object attached to a parcel, in wire form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireObject {
    /// A portal in transit; the receiver deserializes a new router from it.
    Router(RouterDescriptor),
    /// An opaque boxed driver object.
    Blob(Bytes),
}

/// A message addressed to a router (or the node-link layer) at the far end
/// of a node link.
#[derive(Debug, Serialize, Deserialize)]
pub enum Message {
    /// An in-sequence parcel for the router bound to `sublink`.
    AcceptParcel {
        sublink: SublinkId,
        sequence_number: SequenceNumber,
        data: Bytes,
        objects: Vec<WireObject>,
    },
    /// The sending side's terminal closed; its outbound sequence ends at
    /// `sequence_length`.
    RouteClosed {
        sublink: SublinkId,
        sequence_length: SequenceNumber,
    },
    /// A route participant was lost without closure.
    RouteDisconnected { sublink: SublinkId },
    /// Ask the receiving router to bypass the sender's router by linking
    /// directly to `target_node` via `target_sublink`.
    BypassPeer {
        sublink: SublinkId,
        target_node: NodeName,
        target_sublink: SublinkId,
    },
    /// Offer the receiver a new central link (on the carrying node link)
    /// replacing its link to the proxy at `proxy_node`/`proxy_sublink`.
    AcceptBypassLink {
        proxy_node: NodeName,
        proxy_sublink: SublinkId,
        new_sublink: SublinkId,
        link_state: FragmentDescriptor,
        inbound_sequence_length: SequenceNumber,
    },
    /// Fix the bypassed proxy's final sequence lengths in both directions.
    StopProxying {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
        outbound_sequence_length: SequenceNumber,
    },
    /// The proxy feeding the receiver will stop after
    /// `inbound_sequence_length`.
    ProxyWillStop {
        sublink: SublinkId,
        inbound_sequence_length: SequenceNumber,
    },
    /// Hand the receiver a ready-made replacement central link whose far end
    /// is the proxy's local outward peer.
    BypassPeerWithLink {
        sublink: SublinkId,
        new_sublink: SublinkId,
        link_state: FragmentDescriptor,
        inbound_sequence_length: SequenceNumber,
    },
    /// Tell the proxy to stop forwarding to its local outward peer after
    /// `outbound_sequence_length`.
    StopProxyingToLocalPeer {
        sublink: SublinkId,
        outbound_sequence_length: SequenceNumber,
    },
    /// Wake the router bound to `sublink` for a flush; sent when its side
    /// parked on a waiting bit.
    FlushRouter { sublink: SublinkId },
    /// The sender consumed inbound parcels the receiver was monitoring.
    NotifyDataConsumed { sublink: SublinkId },
}

impl Message {
    /// Short message-kind tag for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AcceptParcel { .. } => "accept-parcel",
            Message::RouteClosed { .. } => "route-closed",
            Message::RouteDisconnected { .. } => "route-disconnected",
            Message::BypassPeer { .. } => "bypass-peer",
            Message::AcceptBypassLink { .. } => "accept-bypass-link",
            Message::StopProxying { .. } => "stop-proxying",
            Message::ProxyWillStop { .. } => "proxy-will-stop",
            Message::BypassPeerWithLink { .. } => "bypass-peer-with-link",
            Message::StopProxyingToLocalPeer { .. } => "stop-proxying-to-local-peer",
            Message::FlushRouter { .. } => "flush-router",
            Message::NotifyDataConsumed { .. } => "notify-data-consumed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct_tags() {
        let closed = Message::RouteClosed {
            sublink: SublinkId(1),
            sequence_length: SequenceNumber(2),
        };
        let flush = Message::FlushRouter {
            sublink: SublinkId(1),
        };
        assert_eq!(closed.kind(), "route-closed");
        assert_eq!(flush.kind(), "flush-router");
    }

    #[test]
    fn descriptor_defaults_round_trip_fields() {
        let descriptor = RouterDescriptor {
            new_sublink: SublinkId(9),
            next_outgoing_sequence_number: SequenceNumber(4),
            next_incoming_sequence_number: SequenceNumber(2),
            peer_closed: true,
            closed_peer_sequence_length: Some(SequenceNumber(6)),
        };
        let copy = descriptor;
        assert_eq!(copy.new_sublink, SublinkId(9));
        assert_eq!(copy.closed_peer_sequence_length, Some(SequenceNumber(6)));
    }
}
